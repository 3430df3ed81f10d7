//! The forensic analyzer set and the driver that runs it.
//!
//! Every analyzer implements [`Analyze`]: given a [`Subject`] (one image,
//! one result directory, an optional password), it produces exactly one
//! [`report::Fragment`]. Most analyzers shell out to an external tool and
//! are described as [`Tool`] records: a configuration record plus a small
//! function vector for command construction, error classification, and
//! output shaping. Records are driven uniformly by the driver; a few
//! analyzers need more than a record:
//!
//! - `steghide` probes for an embedded filename before extracting.
//! - `openstego` retries with a second crypto algorithm on failure.
//! - `decomposer`, `color_remapping`, `pcrt`, and `image_resize` do their
//!   work in-process on the image bytes rather than via a subprocess.
//!
//! Analyzer failures are values, not panics: a tool error becomes an error
//! fragment, and the worker's task boundary converts anything that still
//! escapes into one, so sibling analyzers always proceed.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

use std::{io, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use pngfix::IhdrIndex;
use report::Fragment;
use thiserror::Error;
use typed_builder::TypedBuilder;

mod decompose;
mod driver;
mod openstego;
mod pcrt;
mod remap;
mod resize;
mod steghide;
mod tool;
mod tools;

pub use decompose::Decomposer;
pub use driver::{archive_extracted, run_command, Captured};
pub use openstego::OpenStego;
pub use pcrt::Pcrt;
pub use remap::ColorRemap;
pub use resize::Resize;
pub use steghide::Steghide;
pub use tool::Tool;

/// Errors that may escape an analyzer.
///
/// These are internal failures (taxonomy: analyzer-internal exception);
/// tool-level failures are classified into error fragments instead and
/// never show up here.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A generic IO error occurred.
    #[error("i/o error: {0}")]
    IO(#[from] io::Error),

    /// The image could not be decoded for in-process analysis.
    #[error("decode image: {0}")]
    Image(#[from] image::ImageError),

    /// The PNG engine failed outside its classified error paths.
    #[error("png engine: {0}")]
    Png(#[from] pngfix::Error),

    /// A blocking task was cancelled or panicked.
    #[error("background task: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// The subprocess exceeded its budget. The driver converts this into
    /// an error fragment before it can escape the analyzer.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// One image under analysis, bound to its submission's result directory.
///
/// Commands run with the result directory as their working directory, so
/// tools reference the image as `../<blob file name>` and anything they
/// drop lands inside the submission's own tree.
#[derive(Clone, Debug, TypedBuilder)]
pub struct Subject {
    /// Path to the canonical image blob.
    #[builder(setter(into))]
    image: PathBuf,

    /// The submission's result directory (also the subprocess cwd).
    #[builder(setter(into))]
    result_dir: PathBuf,

    /// Password forwarded to extraction tools that take one.
    #[builder(default)]
    password: Option<String>,

    /// Budget for one subprocess run.
    #[builder(default = Duration::from_secs(600))]
    timeout: Duration,
}

impl Subject {
    /// Path to the image blob.
    pub fn image(&self) -> &PathBuf {
        &self.image
    }

    /// The result directory.
    pub fn result_dir(&self) -> &PathBuf {
        &self.result_dir
    }

    /// The password, when the submission carries one.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// The subprocess budget.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// How a tool running inside the result directory refers to the image.
    pub fn image_ref(&self) -> String {
        let name = self
            .image
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        format!("../{name}")
    }

    /// The submission fingerprint, as named by the result directory.
    pub fn submission_name(&self) -> String {
        self.result_dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Where an analyzer extracts files before they are archived.
    pub fn extraction_dir(&self, analyzer: &str) -> PathBuf {
        self.result_dir.join(analyzer)
    }

    /// The download link advertised for an analyzer's archive.
    pub fn download_link(&self, analyzer: &str) -> String {
        format!("/download/{}/{analyzer}", self.submission_name())
    }

    /// The link advertised for a generated image in the result directory.
    pub fn image_link(&self, file_name: &str) -> String {
        format!("/image/{}/{file_name}", self.submission_name())
    }
}

/// One forensic analyzer.
#[async_trait]
pub trait Analyze: Send + Sync {
    /// The analyzer name; used as the fragment key, the archive stem, and
    /// the extraction directory name.
    fn name(&self) -> &'static str;

    /// Analyze the subject, producing this analyzer's fragment.
    async fn analyze(&self, subject: &Subject) -> Result<Fragment, Error>;
}

/// The full analyzer set for one submission.
///
/// `deep` adds the slower tools (outguess) that are only worth running on
/// explicit request.
pub fn set(deep: bool, index: Arc<IhdrIndex>) -> Vec<Box<dyn Analyze>> {
    let mut analyzers: Vec<Box<dyn Analyze>> = vec![
        Box::new(tools::file()),
        Box::new(tools::identify()),
        Box::new(tools::strings()),
        Box::new(tools::exiftool()),
        Box::new(tools::pngcheck()),
        Box::new(tools::binwalk()),
        Box::new(tools::foremost()),
        Box::new(Steghide::default()),
        Box::new(OpenStego::default()),
        Box::new(tools::jpseek()),
        Box::new(tools::jsteg()),
        Box::new(tools::zsteg()),
        Box::new(Decomposer::default()),
        Box::new(ColorRemap::default()),
        Box::new(Pcrt::new(Arc::clone(&index))),
        Box::new(Resize::new(index)),
    ];
    if deep {
        analyzers.push(Box::new(tools::outguess()));
    }
    analyzers
}
