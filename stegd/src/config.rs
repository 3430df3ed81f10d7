//! Provides service configuration structures.

use std::{fs, net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use stable_eyre::{
    eyre::{ensure, Context},
    Result,
};

/// Image extensions accepted at upload and served back by `/image`.
pub const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "gif", "bmp", "webp", "tiff"];

/// Analyzers whose archives may be downloaded.
pub const ARCHIVE_ANALYZERS: [&str; 9] = [
    "binwalk",
    "foremost",
    "steghide",
    "openstego",
    "outguess",
    "jpseek",
    "zsteg",
    "image_resize",
    "pcrt",
];

/// Configures the service. Every knob is also an environment variable so
/// containers can run the binary bare.
#[derive(Parser, Clone, Debug)]
pub struct Settings {
    /// Root directory for per-image result trees.
    #[clap(long, env = "RESULT_FOLDER", default_value = "./results")]
    result_root: PathBuf,

    /// Where removed images are quarantined.
    #[clap(long, env = "REMOVED_IMAGES_FOLDER", default_value = "./removed_images")]
    removed_root: PathBuf,

    /// Path of the records database.
    #[clap(long, env = "DB_PATH", default_value = "./stegd.db")]
    registry_db: PathBuf,

    /// Path of the precomputed IHDR CRC index (see the init-index command).
    #[clap(long, env = "IHDR_DB_PATH", default_value = "./ihdr_crcs.db")]
    ihdr_db: PathBuf,

    /// Seconds before an in-flight submission is considered abandoned;
    /// also the per-analyzer subprocess budget.
    #[clap(long, env = "MAX_PENDING_TIME", default_value_t = 600)]
    max_pending_time: u64,

    /// Seconds an image is stored after its last upload.
    #[clap(long, env = "MAX_STORE_TIME", default_value_t = 259_200)]
    max_store_time: u64,

    /// Largest accepted upload, in bytes.
    #[clap(long, env = "MAX_CONTENT_LENGTH", default_value_t = 1024 * 1024)]
    max_content_length: usize,

    /// Minimum submission age before user-initiated removal is allowed.
    #[clap(long, env = "REMOVAL_MIN_AGE_SECONDS", default_value_t = 300)]
    removal_min_age_seconds: u64,

    /// Seconds one queued submission may occupy the worker.
    #[clap(long, env = "JOB_TIMEOUT", default_value_t = 300)]
    job_timeout: u64,

    /// Wipe all stored results and records at startup.
    #[clap(long, env = "CLEAR_AT_RESTART")]
    clear_at_restart: bool,

    /// Address the HTTP surface binds to.
    #[clap(long, env = "BIND_ADDR", default_value = "0.0.0.0:5000")]
    bind: SocketAddr,
}

impl Settings {
    /// Validates that self is correctly formed and pins the storage roots
    /// to absolute paths (analyzer subprocesses run with other working
    /// directories).
    pub fn validate(self) -> Result<Self> {
        ensure!(self.max_content_length > 0, "max content length must be positive");
        ensure!(self.max_pending_time > 0, "max pending time must be positive");

        fs::create_dir_all(&self.result_root).context("create result root")?;
        let result_root = self
            .result_root
            .canonicalize()
            .context("canonicalize result root")?;
        fs::create_dir_all(&self.removed_root).context("create removed-images root")?;
        let removed_root = self
            .removed_root
            .canonicalize()
            .context("canonicalize removed-images root")?;

        Ok(Self {
            result_root,
            removed_root,
            ..self
        })
    }

    /// Root directory for per-image result trees.
    pub fn result_root(&self) -> &PathBuf {
        &self.result_root
    }

    /// Where removed images are quarantined.
    pub fn removed_root(&self) -> &PathBuf {
        &self.removed_root
    }

    /// Path of the records database.
    pub fn registry_db(&self) -> &PathBuf {
        &self.registry_db
    }

    /// Path of the precomputed IHDR CRC index.
    pub fn ihdr_db(&self) -> &PathBuf {
        &self.ihdr_db
    }

    /// Abandonment threshold and per-analyzer subprocess budget.
    pub fn max_pending_time(&self) -> Duration {
        Duration::from_secs(self.max_pending_time)
    }

    /// Same threshold as unix seconds, for retention math.
    pub fn max_pending_secs(&self) -> i64 {
        self.max_pending_time as i64
    }

    /// Image retention after the last upload, as unix seconds.
    pub fn max_store_secs(&self) -> i64 {
        self.max_store_time as i64
    }

    /// Largest accepted upload, in bytes.
    pub fn max_content_length(&self) -> usize {
        self.max_content_length
    }

    /// Minimum submission age before removal, as unix seconds.
    pub fn removal_min_age_secs(&self) -> i64 {
        self.removal_min_age_seconds as i64
    }

    /// Per-job worker budget.
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout)
    }

    /// Whether to wipe stored results and records at startup.
    pub fn clear_at_restart(&self) -> bool {
        self.clear_at_restart
    }

    /// Address the HTTP surface binds to.
    pub fn bind(&self) -> SocketAddr {
        self.bind
    }

    /// A settings value for tests, rooted inside `base`.
    #[cfg(test)]
    pub(crate) fn for_tests(base: &std::path::Path) -> Self {
        Self {
            result_root: base.join("results"),
            removed_root: base.join("removed_images"),
            registry_db: base.join("stegd.db"),
            ihdr_db: base.join("ihdr_crcs.db"),
            max_pending_time: 600,
            max_store_time: 259_200,
            max_content_length: 1024 * 1024,
            removal_min_age_seconds: 300,
            job_timeout: 300,
            clear_at_restart: false,
            bind: "127.0.0.1:0".parse().expect("fixed test address"),
        }
    }
}

/// The lowercased extension of an uploaded filename, when it is in the
/// accepted set.
pub fn allowed_extension(filename: &str) -> Option<String> {
    let (_, extension) = filename.rsplit_once('.')?;
    let extension = extension.to_lowercase();
    IMAGE_EXTENSIONS
        .contains(&extension.as_str())
        .then_some(extension)
}
