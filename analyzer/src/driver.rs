//! Subprocess execution and artifact archiving shared by every
//! tool-backed analyzer.

use std::{path::Path, process::Stdio, time::Duration};

use tokio::{fs, process::Command, time};
use tracing::debug;

use crate::Error;

/// What a finished subprocess left behind, decoded for classification.
#[derive(Clone, Debug, Default)]
pub struct Captured {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,

    /// Stdout, decoded as UTF-8 with replacement.
    pub stdout: String,

    /// Stderr, decoded as UTF-8 with replacement.
    pub stderr: String,

    /// Whether a non-empty extraction directory was archived.
    pub archived: bool,
}

impl Captured {
    /// Stdout and stderr, concatenated; some tools interleave their
    /// meaningful output across both.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

impl From<std::process::Output> for Captured {
    fn from(output: std::process::Output) -> Self {
        Captured {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            archived: false,
        }
    }
}

/// Run a command to completion under a budget.
///
/// The child runs with `cwd` as its working directory and no stdin. A child
/// that outlives the budget is killed and reported as [`Error::Timeout`].
pub async fn run_command(
    argv: &[String],
    cwd: &Path,
    budget: Duration,
) -> Result<std::process::Output, Error> {
    debug!(?argv, cwd = %cwd.display(), "running analyzer command");
    let child = Command::new(&argv[0])
        .args(&argv[1..])
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    match time::timeout(budget, child.wait_with_output()).await {
        Ok(done) => Ok(done?),
        // Dropping the timed-out future drops the child, which kills it.
        Err(_) => Err(Error::Timeout(budget)),
    }
}

/// Package a non-empty extraction directory as `<analyzer>.7z` next to it,
/// then remove the directory. Returns whether an archive was produced.
pub async fn archive_extracted(
    analyzer: &str,
    extraction_dir: &Path,
    budget: Duration,
) -> Result<bool, Error> {
    if !dir_has_entries(extraction_dir).await? {
        return Ok(false);
    }

    // 7z expands the `*` itself; no shell involved.
    let argv = vec![
        "7z".to_string(),
        "a".to_string(),
        format!("../{analyzer}.7z"),
        "*".to_string(),
    ];
    run_command(&argv, extraction_dir, budget).await?;
    fs::remove_dir_all(extraction_dir).await?;
    Ok(true)
}

async fn dir_has_entries(dir: &Path) -> Result<bool, Error> {
    match fs::read_dir(dir).await {
        Ok(mut entries) => Ok(entries.next_entry().await?.is_some()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}
