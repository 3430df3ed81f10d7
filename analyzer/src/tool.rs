//! The record-driven shape of a subprocess analyzer.
//!
//! A [`Tool`] is a configuration record plus a function vector. The driver
//! part of [`Tool::analyze`] is identical for every tool: precreate the
//! extraction directory when asked, run the command inside the result
//! directory under the budget, archive whatever the tool extracted,
//! classify the outcome, and shape the fragment. Everything idiosyncratic
//! lives in the record's functions.

use std::path::PathBuf;

use async_trait::async_trait;
use report::{Fragment, Output};
use tokio::fs;
use typed_builder::TypedBuilder;

use crate::{
    driver::{archive_extracted, run_command, Captured},
    Analyze, Error, Subject,
};

/// Builds the command vector for one run.
pub type CommandFn = fn(&Subject) -> Vec<String>;

/// Where the tool extracts files, when it deviates from the default
/// `<result_dir>/<name>` layout.
pub type ExtractionDirFn = fn(&Subject) -> PathBuf;

/// Decides whether a captured outcome is an error.
pub type ClassifyFn = fn(&Captured) -> bool;

/// Shapes the success output.
pub type RenderFn = fn(&Captured) -> Output;

/// Shapes the classified error text.
pub type ErrorFn = fn(&Captured) -> String;

/// Extracts an optional remark from the captured outcome.
pub type NoteFn = fn(&Captured) -> Option<String>;

/// One subprocess-backed analyzer, fully described as data.
#[derive(Clone, TypedBuilder)]
pub struct Tool {
    /// Analyzer name: fragment key, archive stem, extraction dir name.
    name: &'static str,

    /// Builds the command vector.
    command: CommandFn,

    /// Whether the tool emits a directory of artifacts worth archiving.
    #[builder(default = false)]
    has_archive: bool,

    /// Whether the driver precreates the extraction directory; tools that
    /// insist on creating their own get `false`.
    #[builder(default = true)]
    make_folder: bool,

    /// Override for the extraction directory location.
    #[builder(default, setter(strip_option))]
    extraction_dir: Option<ExtractionDirFn>,

    /// Error classification; the default treats any stderr as an error.
    #[builder(default = classify::stderr_nonempty)]
    is_error: ClassifyFn,

    /// Success output shaping; the default is the non-empty stdout lines.
    #[builder(default = render::stdout_lines)]
    output: RenderFn,

    /// Error text shaping; the default is stderr verbatim.
    #[builder(default = render::stderr_text)]
    error: ErrorFn,

    /// Optional remark; the default emits none.
    #[builder(default = render::no_note)]
    note: NoteFn,
}

impl Tool {
    fn extraction_dir(&self, subject: &Subject) -> PathBuf {
        match self.extraction_dir {
            Some(custom) => custom(subject),
            None => subject.extraction_dir(self.name),
        }
    }
}

#[cfg(test)]
impl Tool {
    pub(crate) fn is_error_fn(&self) -> ClassifyFn {
        self.is_error
    }

    pub(crate) fn command_fn(&self) -> CommandFn {
        self.command
    }
}

#[async_trait]
impl Analyze for Tool {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn analyze(&self, subject: &Subject) -> Result<Fragment, Error> {
        let extraction = self.has_archive.then(|| self.extraction_dir(subject));
        if let Some(dir) = &extraction {
            if self.make_folder {
                fs::create_dir_all(dir).await?;
            }
        }

        let argv = (self.command)(subject);
        let output = match run_command(&argv, subject.result_dir(), subject.timeout()).await {
            Ok(output) => output,
            Err(Error::Timeout(after)) => {
                return Ok(Fragment::error(format!(
                    "{} timed out after {}s",
                    self.name,
                    after.as_secs()
                )))
            }
            Err(err) => return Err(err),
        };

        let mut captured = Captured::from(output);
        if let Some(dir) = &extraction {
            captured.archived = archive_extracted(self.name, dir, subject.timeout()).await?;
        }

        if (self.is_error)(&captured) {
            return Ok(Fragment::error((self.error)(&captured)));
        }

        let mut fragment = Fragment::ok((self.output)(&captured));
        if let Some(note) = (self.note)(&captured) {
            fragment = fragment.with_note(note);
        }
        if captured.archived {
            fragment = fragment.with_download(subject.download_link(self.name));
        }
        Ok(fragment)
    }
}

/// Stock error classifiers.
pub mod classify {
    use super::Captured;

    /// Any stderr at all means the tool complained.
    pub fn stderr_nonempty(captured: &Captured) -> bool {
        !captured.stderr.is_empty()
    }
}

/// Stock output shapers.
pub mod render {
    use report::Output;

    use super::Captured;

    /// The non-empty lines of stdout.
    pub fn stdout_lines(captured: &Captured) -> Output {
        Output::Lines(non_empty_lines(&captured.stdout))
    }

    /// Stdout as one opaque string.
    pub fn stdout_text(captured: &Captured) -> Output {
        Output::Text(captured.stdout.clone())
    }

    /// Stderr verbatim as the error text.
    pub fn stderr_text(captured: &Captured) -> String {
        captured.stderr.clone()
    }

    /// No remark.
    pub fn no_note(_: &Captured) -> Option<String> {
        None
    }

    /// Lines whose trimmed form is non-empty, in order.
    pub fn non_empty_lines(raw: &str) -> Vec<String> {
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.to_string())
            .collect()
    }
}
