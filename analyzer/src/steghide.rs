//! The steghide adapter.
//!
//! steghide won't extract without knowing the embedded filename, so the
//! adapter runs in two phases: `steghide info` to probe for the embedded
//! file, then `steghide extract` aimed at the extraction directory. The
//! probe's stdout and the extractor's stderr each carry one success
//! marker; an outcome with neither is an error.

use async_trait::async_trait;
use lazy_regex::regex_captures;
use report::{Fragment, Output};
use tokio::fs;

use crate::{
    driver::{archive_extracted, run_command, Captured},
    Analyze, Error, Subject,
};

const NAME: &str = "steghide";
const EXTRACTED_MARKER: &str = "wrote extracted data to \"";
const FORMAT_ERROR: &str = "The file format of the file is not supported (JPEG or BMP only).";

/// Probe-then-extract adapter for steghide.
#[derive(Clone, Debug, Default)]
pub struct Steghide {}

impl Steghide {
    /// The filename steghide reports as embedded, when the probe found one.
    fn embedded_name(stdout: &str) -> Option<String> {
        regex_captures!(r#"embedded file "([^"]+)""#, stdout)
            .map(|(_, name)| name.to_string())
    }

    fn classify_error(captured: &Captured) -> String {
        if captured.stderr.contains("the file format of the file")
            && captured.stderr.contains("not supported")
        {
            return FORMAT_ERROR.to_string();
        }
        captured
            .stderr
            .lines()
            .filter(|line| !line.is_empty() && !line.starts_with(EXTRACTED_MARKER))
            .map(|line| format!("{line}\n"))
            .collect()
    }
}

#[async_trait]
impl Analyze for Steghide {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn analyze(&self, subject: &Subject) -> Result<Fragment, Error> {
        let password = subject.password().unwrap_or_default().to_string();

        // Phase one: probe for the embedded filename.
        let probe_argv = vec![
            "steghide".to_string(),
            "info".to_string(),
            subject.image_ref(),
            "-p".to_string(),
            password.clone(),
        ];
        let probe = match run_command(&probe_argv, subject.result_dir(), subject.timeout()).await {
            Ok(output) => Captured::from(output),
            Err(Error::Timeout(after)) => {
                return Ok(Fragment::error(format!(
                    "{NAME} timed out after {}s",
                    after.as_secs()
                )))
            }
            Err(err) => return Err(err),
        };

        let embedded = Self::embedded_name(&probe.stdout);
        let probe_failed = probe.code.map_or(true, |code| code != 0) || embedded.is_none();
        let Some(embedded) = embedded.filter(|_| !probe_failed) else {
            return Ok(Fragment::error(Self::classify_error(&probe)));
        };

        // Phase two: extract into the archive directory.
        let extraction_dir = subject.extraction_dir(NAME);
        fs::create_dir_all(&extraction_dir).await?;
        let target = extraction_dir.join(&embedded);
        let extract_argv = vec![
            "steghide".to_string(),
            "extract".to_string(),
            "-sf".to_string(),
            subject.image_ref(),
            "-xf".to_string(),
            target.to_string_lossy().to_string(),
            "-p".to_string(),
            password,
        ];
        let mut extract =
            match run_command(&extract_argv, subject.result_dir(), subject.timeout()).await {
                Ok(output) => Captured::from(output),
                Err(Error::Timeout(after)) => {
                    return Ok(Fragment::error(format!(
                        "{NAME} timed out after {}s",
                        after.as_secs()
                    )))
                }
                Err(err) => return Err(err),
            };
        extract.archived = archive_extracted(NAME, &extraction_dir, subject.timeout()).await?;

        // Success means one of the two markers showed up.
        let succeeded = probe.stdout.contains("embedded file")
            || extract.stderr.contains("wrote extracted data");
        if !succeeded {
            return Ok(Fragment::error(Self::classify_error(&extract)));
        }

        let wrote: Vec<String> = extract
            .stderr
            .lines()
            .filter(|line| line.starts_with(EXTRACTED_MARKER))
            .map(|line| line.to_string())
            .collect();
        let mut fragment = Fragment::ok(Output::Lines(wrote));
        if extract.archived {
            fragment = fragment.with_download(subject.download_link(NAME));
        }
        Ok(fragment)
    }
}
