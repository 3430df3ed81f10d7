//! The openstego adapter.
//!
//! openstego's random-LSB extraction is tried with AES128 first and AES256
//! on failure; the second attempt's outcome stands. Success is judged by
//! what landed in the extraction directory (or the "Extracted file:"
//! marker), not by the exit code: openstego exits zero while printing its
//! usage banner.

use std::path::Path;

use async_trait::async_trait;
use report::{Fragment, Output};
use tokio::fs;

use crate::{
    driver::{archive_extracted, run_command, Captured},
    Analyze, Error, Subject,
};

const NAME: &str = "openstego";
const EXTRACTED_MARKER: &str = "Extracted file: ";
const USAGE_BANNER: &str = "OpenStego is a steganography application";

/// Retry-across-algorithms adapter for openstego.
#[derive(Clone, Debug, Default)]
pub struct OpenStego {}

impl OpenStego {
    async fn attempt(&self, subject: &Subject, algorithm: &str) -> Result<Fragment, Error> {
        let extraction_dir = subject.extraction_dir(NAME);
        fs::create_dir_all(&extraction_dir).await?;

        let argv = vec![
            "openstego".to_string(),
            "extract".to_string(),
            "-a".to_string(),
            "randomlsb".to_string(),
            "--cryptalgo".to_string(),
            algorithm.to_string(),
            "-sf".to_string(),
            subject.image_ref(),
            "-xd".to_string(),
            extraction_dir.to_string_lossy().to_string(),
            "-p".to_string(),
            subject.password().unwrap_or_default().to_string(),
        ];
        let captured = match run_command(&argv, subject.result_dir(), subject.timeout()).await {
            Ok(output) => Captured::from(output),
            Err(Error::Timeout(after)) => {
                return Ok(Fragment::error(format!(
                    "{NAME} timed out after {}s",
                    after.as_secs()
                )))
            }
            Err(err) => return Err(err),
        };

        let extracted = dir_has_entries(&extraction_dir).await?;
        if !extracted && !captured.stderr.contains(EXTRACTED_MARKER) {
            return Ok(Fragment::error(Self::classify_error(&captured)));
        }

        let archived = archive_extracted(NAME, &extraction_dir, subject.timeout()).await?;
        let mut fragment = Fragment::ok(Output::Text(captured.stderr));
        if archived {
            fragment = fragment.with_download(subject.download_link(NAME));
        }
        Ok(fragment)
    }

    fn classify_error(captured: &Captured) -> String {
        if captured.stderr.contains(USAGE_BANNER) {
            return "OpenStego needs a password to work.".to_string();
        }
        captured.stderr.clone()
    }
}

#[async_trait]
impl Analyze for OpenStego {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn analyze(&self, subject: &Subject) -> Result<Fragment, Error> {
        let first = self.attempt(subject, "AES128").await?;
        if !first.is_error() {
            return Ok(first);
        }
        self.attempt(subject, "AES256").await
    }
}

async fn dir_has_entries(dir: &Path) -> Result<bool, Error> {
    match fs::read_dir(dir).await {
        Ok(mut entries) => Ok(entries.next_entry().await?.is_some()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_banner_means_a_password_is_needed() {
        let captured = Captured {
            code: Some(0),
            stdout: String::new(),
            stderr: format!("{USAGE_BANNER} that can hide data in images.\nUsage: ..."),
            archived: false,
        };
        assert_eq!(
            OpenStego::classify_error(&captured),
            "OpenStego needs a password to work."
        );
    }

    #[test]
    fn other_stderr_is_passed_through() {
        let captured = Captured {
            code: Some(1),
            stdout: String::new(),
            stderr: "Invalid password".to_string(),
            archived: false,
        };
        assert_eq!(OpenStego::classify_error(&captured), "Invalid password");
    }
}
