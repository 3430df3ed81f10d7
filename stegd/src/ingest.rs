//! Ingestion and content-addressed deduplication.
//!
//! The upload path is idempotent end to end: identical (bytes, filename,
//! password, deep) tuples map to one submission fingerprint, one record,
//! and one directory, no matter how many times they arrive. The upload
//! log is the exception: every attempt appends a row, because it is the
//! audit trail the removal policy's IP gate is built on.
//!
//! Ingestion also self-heals: a blob or record missing from a previous
//! partial failure is recreated rather than trusted to exist.

use thiserror::Error;
use tracing::{debug, warn};

use crate::{config, now, sweep, Runtime};

/// One upload attempt, as received by the HTTP surface.
#[derive(Clone, Debug)]
pub struct Upload<'a> {
    /// The raw image bytes.
    pub bytes: &'a [u8],

    /// The filename as submitted.
    pub filename: &'a str,

    /// Optional extraction password.
    pub password: Option<&'a str>,

    /// Whether deep analysis was requested.
    pub deep: bool,

    /// Uploader address, already resolved through any proxy headers.
    pub client_ip: &'a str,

    /// Uploader user agent.
    pub user_agent: Option<&'a str>,
}

/// Errors that may be encountered during ingestion.
///
/// The first three are input-validation failures and map to 4xx at the
/// HTTP surface; the rest are internal.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The upload carried no image bytes or no filename.
    #[error("No image provided")]
    Empty,

    /// The filename's extension is not an accepted image type.
    #[error("Unsupported file type")]
    UnsupportedType,

    /// The upload exceeds the configured size limit.
    #[error("Image size exceeded")]
    TooLarge,

    /// The registry failed.
    #[error(transparent)]
    Registry(#[from] registry::Error),

    /// The artifact store failed.
    #[error("i/o error: {0}")]
    IO(#[from] std::io::Error),

    /// The queue refused the submission.
    #[error("enqueue: {0}")]
    Enqueue(String),
}

/// Ingest one upload: validate, fingerprint, record, store, enqueue.
/// Returns the submission fingerprint the client polls.
pub async fn ingest(
    runtime: &Runtime,
    upload: Upload<'_>,
) -> Result<fingerprint::Fingerprint<fingerprint::Submission>, Error> {
    // Retention first, as on every upload; a sweep failure shouldn't
    // block the upload itself.
    if let Err(err) = sweep::run(runtime, now()) {
        warn!(error = %err, "retention sweep failed, continuing with ingest");
    }

    if upload.bytes.is_empty() || upload.filename.is_empty() {
        return Err(Error::Empty);
    }
    let extension = config::allowed_extension(upload.filename).ok_or(Error::UnsupportedType)?;
    if upload.bytes.len() > runtime.settings().max_content_length() {
        return Err(Error::TooLarge);
    }

    let image_print = fingerprint::image(upload.bytes);
    let submission_print =
        fingerprint::submission(upload.bytes, upload.filename, upload.password, upload.deep);

    // Best-effort audit row; it must survive downstream failures, so it
    // goes in before anything can go wrong.
    if let Err(err) = runtime.registry().log_upload(
        upload.client_ip,
        upload.user_agent,
        &image_print,
        Some(&submission_print),
        Some(upload.filename),
        now(),
    ) {
        warn!(error = %err, "failed to append upload log row");
    }

    // Idempotent re-upload: both the directory and the record exist.
    let submission_dir = runtime.store().submission_dir(&image_print, &submission_print);
    if submission_dir.exists() && runtime.registry().submission(&submission_print)?.is_some() {
        debug!(submission = %submission_print, "duplicate upload, reusing submission");
        return Ok(submission_print);
    }

    // Self-heal the blob: the record may exist while the file is gone.
    let blob_path = runtime.store().blob_path(&image_print, &extension);
    if !blob_path.exists() {
        tokio::fs::create_dir_all(runtime.store().image_dir(&image_print)).await?;
        tokio::fs::write(&blob_path, upload.bytes).await?;
    }

    runtime.registry().upsert_image(
        &image_print,
        &blob_path,
        upload.bytes.len() as u64,
        now(),
    )?;

    tokio::fs::create_dir_all(&submission_dir).await?;
    runtime.registry().upsert_submission(
        &submission_print,
        &image_print,
        upload.filename,
        upload.password,
        upload.deep,
        now(),
    )?;

    runtime
        .queue()
        .enqueue(submission_print)
        .await
        .map_err(|err| Error::Enqueue(err.to_string()))?;
    Ok(submission_print)
}
