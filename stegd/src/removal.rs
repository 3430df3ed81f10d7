//! User-initiated removal, gated by age and uploader uniqueness.
//!
//! Both operations share the same two gates: the submission must be old
//! enough that removal can't be used to dodge an in-progress analysis,
//! and every upload of the target must have come from a single source IP;
//! otherwise one uploader could erase evidence others rely on. The IP
//! set comes from the append-only upload log, which removal never touches.

use std::fs;

use fingerprint::Fingerprint;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::info;

use crate::Runtime;

/// Why a removal request was refused (or failed).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No such submission.
    #[error("Submission not found")]
    NotFound,

    /// The age gate failed.
    #[error("Must be at least {minimum} seconds old. Current age: {age}s")]
    TooYoung {
        /// Current submission age in seconds.
        age: i64,
        /// The configured minimum age.
        minimum: i64,
    },

    /// The single-uploader gate failed.
    #[error("Uploaded from multiple IP addresses. Removal is not allowed.")]
    MultipleUploaders {
        /// How many distinct IPs have uploaded the target.
        ip_count: usize,
    },

    /// Password removal was requested for a submission without one.
    #[error("No password to remove")]
    NoPassword,

    /// The registry failed.
    #[error(transparent)]
    Registry(#[from] registry::Error),

    /// The artifact store failed.
    #[error("i/o error: {0}")]
    IO(#[from] std::io::Error),
}

impl Error {
    /// Whether this is a policy refusal (403 material) rather than an
    /// internal failure.
    pub fn is_refusal(&self) -> bool {
        matches!(self, Error::TooYoung { .. } | Error::MultipleUploaders { .. })
    }
}

/// Remove a submission's results and, when it was the image's last
/// submission, the image and its blob. The original blob is quarantined
/// first.
pub fn remove_image(
    runtime: &Runtime,
    print: &Fingerprint<fingerprint::Submission>,
    now: i64,
) -> Result<(), Error> {
    let submission = runtime.registry().submission(print)?.ok_or(Error::NotFound)?;
    let image = runtime
        .registry()
        .image(submission.image())?
        .ok_or(Error::NotFound)?;

    check_age(submission.created(), now, runtime)?;
    let ips = runtime.registry().uploader_ips_for_image(image.fingerprint())?;
    if ips.len() > 1 {
        return Err(Error::MultipleUploaders { ip_count: ips.len() });
    }

    // Quarantine the original blob before anything is destroyed.
    if image.path().exists() {
        fs::create_dir_all(runtime.store().removed_root())?;
        let extension = image
            .path()
            .extension()
            .map(|ext| ext.to_string_lossy().to_string())
            .unwrap_or_else(|| "bin".to_string());
        let quarantine = runtime.store().quarantine_path(
            image.fingerprint(),
            print,
            &extension,
            OffsetDateTime::from_unix_timestamp(now).unwrap_or_else(|_| OffsetDateTime::now_utc()),
        );
        fs::copy(image.path(), quarantine)?;
    }

    runtime
        .store()
        .remove_tree(&runtime.store().submission_dir(image.fingerprint(), print))?;

    let was_last = runtime
        .registry()
        .submissions_of(image.fingerprint())?
        .len()
        <= 1;
    runtime.registry().delete_submission(print)?;

    if was_last {
        runtime
            .store()
            .remove_tree(&runtime.store().image_dir(image.fingerprint()))?;
        runtime.registry().delete_image(image.fingerprint())?;
    }

    info!(submission = %print, image = %image.fingerprint(), was_last, "image removal granted");
    Ok(())
}

/// Clear the stored password of a submission.
pub fn remove_password(
    runtime: &Runtime,
    print: &Fingerprint<fingerprint::Submission>,
    now: i64,
) -> Result<(), Error> {
    let submission = runtime.registry().submission(print)?.ok_or(Error::NotFound)?;
    if submission.password().is_none() {
        return Err(Error::NoPassword);
    }

    check_age(submission.created(), now, runtime)?;
    let ips = runtime.registry().uploader_ips_for_submission(print)?;
    if ips.len() > 1 {
        return Err(Error::MultipleUploaders { ip_count: ips.len() });
    }

    runtime.registry().set_password(print, None)?;
    info!(submission = %print, "password removal granted");
    Ok(())
}

fn check_age(created: &i64, now: i64, runtime: &Runtime) -> Result<(), Error> {
    let age = now - created;
    let minimum = runtime.settings().removal_min_age_secs();
    if age < minimum {
        return Err(Error::TooYoung { age, minimum });
    }
    Ok(())
}
