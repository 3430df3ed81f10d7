//! Durable records for images, submissions, and upload activity.
//!
//! The registry is the system of record behind the content-addressed
//! store: an [`ImageRecord`] per unique blob, a [`SubmissionRecord`] per
//! analysis request, and an append-only upload log used for the removal
//! policy's IP gate. Everything is keyed by fingerprint, which doubles as
//! the on-disk directory name.
//!
//! Transactions are short and per-operation; long-running analyzer work
//! never holds the registry open. Timestamps are unix seconds and are
//! always passed in by the caller, which keeps retention policies
//! deterministic under test.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Mutex, MutexGuard, PoisonError},
};

use derive_getters::Getters;
use fingerprint::Fingerprint;
use rusqlite::{Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::debug;

/// Errors that may be encountered while reading or writing records.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The underlying database failed.
    #[error("registry: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored fingerprint column failed to parse. Indicates external
    /// modification of the database.
    #[error("malformed fingerprint in registry: {0}")]
    Fingerprint(#[from] fingerprint::Error),

    /// A stored status column failed to parse. Indicates external
    /// modification of the database.
    #[error("unknown submission status: {0}")]
    Status(String),
}

/// Lifecycle of a submission.
///
/// Created as `Pending` at upload; the worker moves it to `Running`, then
/// `Completed` or `Error`. Per-analyzer failures do not make a submission
/// `Error`; only worker-level failures do.
#[derive(Clone, Copy, Eq, PartialEq, Debug, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Status {
    /// Queued, not yet picked up by a worker.
    Pending,

    /// A worker is fanning out analyzers for it.
    Running,

    /// The worker joined every analyzer task.
    Completed,

    /// The worker itself failed.
    Error,
}

impl Status {
    /// Whether the submission still occupies a worker (or a queue slot).
    pub fn in_flight(&self) -> bool {
        matches!(self, Status::Pending | Status::Running)
    }
}

/// Canonical record for a content-addressed image blob.
#[derive(Clone, Eq, PartialEq, Debug, Getters)]
pub struct ImageRecord {
    /// Content fingerprint; primary key and directory name.
    fingerprint: Fingerprint<fingerprint::Image>,

    /// Where the blob lives on disk.
    path: PathBuf,

    /// Blob size in bytes.
    size: u64,

    /// Unix seconds of the first upload.
    first_seen: i64,

    /// Unix seconds of the most recent upload.
    last_seen: i64,

    /// How many uploads have referenced this blob.
    upload_count: u64,
}

/// One analysis run for a specific (image, filename, password, deep) tuple.
#[derive(Clone, Eq, PartialEq, Debug, Getters)]
pub struct SubmissionRecord {
    /// Submission fingerprint; primary key and directory name.
    fingerprint: Fingerprint<fingerprint::Submission>,

    /// The owning image.
    image: Fingerprint<fingerprint::Image>,

    /// Filename as submitted.
    filename: String,

    /// Optional password handed to the extraction tools.
    password: Option<String>,

    /// Whether the slower deep-analysis tools were requested.
    deep_analysis: bool,

    /// Lifecycle state.
    status: Status,

    /// Unix seconds of creation.
    created: i64,
}

/// One row of the append-only upload log.
///
/// Rows are never mutated and survive image/submission deletion for audit.
#[derive(Clone, Eq, PartialEq, Debug, Getters)]
pub struct UploadRecord {
    /// Source IP as reported by the front end.
    ip_address: String,

    /// User agent, when one was sent.
    user_agent: Option<String>,

    /// Unix seconds of the upload attempt.
    upload_time: i64,

    /// Fingerprint of the uploaded bytes.
    image: Fingerprint<fingerprint::Image>,

    /// Fingerprint of the resulting submission.
    submission: Option<Fingerprint<fingerprint::Submission>>,

    /// Original filename.
    filename: Option<String>,
}

/// Handle over the records database.
///
/// The connection is mutex-wrapped so one handle can be shared across the
/// HTTP surface and the worker; every operation takes the lock briefly.
pub struct Registry {
    conn: Mutex<Connection>,
}

impl Registry {
    /// Open (creating if needed) the registry at `path`.
    pub fn open(path: &Path) -> Result<Self, Error> {
        Self::from_connection(Connection::open(path)?)
    }

    /// An in-memory registry; meant for tests.
    pub fn in_memory() -> Result<Self, Error> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, Error> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS images (
                fingerprint TEXT PRIMARY KEY NOT NULL,
                path TEXT NOT NULL,
                size INTEGER NOT NULL,
                first_seen INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                upload_count INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS submissions (
                fingerprint TEXT PRIMARY KEY NOT NULL,
                image_fingerprint TEXT NOT NULL,
                filename TEXT NOT NULL,
                password TEXT,
                deep_analysis INTEGER NOT NULL,
                status TEXT NOT NULL,
                created INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_submissions_image
                ON submissions (image_fingerprint);
            CREATE TABLE IF NOT EXISTS upload_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ip_address TEXT NOT NULL,
                user_agent TEXT,
                upload_time INTEGER NOT NULL,
                image_fingerprint TEXT NOT NULL,
                submission_fingerprint TEXT,
                filename TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_upload_log_image
                ON upload_log (image_fingerprint);
            CREATE INDEX IF NOT EXISTS idx_upload_log_submission
                ON upload_log (submission_fingerprint);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert the image if unseen, then bump its upload count and
    /// last-seen time. Returns the record after the update.
    pub fn upsert_image(
        &self,
        print: &Fingerprint<fingerprint::Image>,
        path: &Path,
        size: u64,
        now: i64,
    ) -> Result<ImageRecord, Error> {
        {
            let conn = self.lock();
            conn.execute(
                "INSERT INTO images (fingerprint, path, size, first_seen, last_seen, upload_count)
                 VALUES (?, ?, ?, ?, ?, 1)
                 ON CONFLICT (fingerprint) DO UPDATE
                 SET upload_count = upload_count + 1, last_seen = excluded.last_seen",
                (
                    print.to_string(),
                    path.to_string_lossy().to_string(),
                    size as i64,
                    now,
                    now,
                ),
            )?;
        }
        self.image(print)?.ok_or_else(|| {
            Error::Database(rusqlite::Error::QueryReturnedNoRows)
        })
    }

    /// Look up one image.
    pub fn image(
        &self,
        print: &Fingerprint<fingerprint::Image>,
    ) -> Result<Option<ImageRecord>, Error> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT fingerprint, path, size, first_seen, last_seen, upload_count
                 FROM images WHERE fingerprint = ?",
                [print.to_string()],
                raw_image,
            )
            .optional()?;
        drop(conn);
        row.map(ImageRecord::try_from).transpose()
    }

    /// All images, oldest last-seen first.
    pub fn images(&self) -> Result<Vec<ImageRecord>, Error> {
        let conn = self.lock();
        let mut statement = conn.prepare_cached(
            "SELECT fingerprint, path, size, first_seen, last_seen, upload_count
             FROM images ORDER BY last_seen ASC",
        )?;
        let raw: Vec<RawImage> = statement
            .query_map([], raw_image)?
            .collect::<Result<_, _>>()?;
        drop(statement);
        drop(conn);
        raw.into_iter().map(ImageRecord::try_from).collect()
    }

    /// Delete one image record. The caller owns blob/directory removal.
    pub fn delete_image(&self, print: &Fingerprint<fingerprint::Image>) -> Result<(), Error> {
        let conn = self.lock();
        conn.execute("DELETE FROM images WHERE fingerprint = ?", [print.to_string()])?;
        debug!(image = %print, "deleted image record");
        Ok(())
    }

    /// Insert the submission as `pending` if unseen; an existing record is
    /// reset to `pending` for re-analysis. Returns the record after the
    /// update.
    pub fn upsert_submission(
        &self,
        print: &Fingerprint<fingerprint::Submission>,
        image: &Fingerprint<fingerprint::Image>,
        filename: &str,
        password: Option<&str>,
        deep_analysis: bool,
        now: i64,
    ) -> Result<SubmissionRecord, Error> {
        {
            let conn = self.lock();
            conn.execute(
                "INSERT INTO submissions
                 (fingerprint, image_fingerprint, filename, password, deep_analysis, status, created)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (fingerprint) DO UPDATE SET status = excluded.status",
                (
                    print.to_string(),
                    image.to_string(),
                    filename,
                    password,
                    deep_analysis,
                    Status::Pending.to_string(),
                    now,
                ),
            )?;
        }
        self.submission(print)?.ok_or_else(|| {
            Error::Database(rusqlite::Error::QueryReturnedNoRows)
        })
    }

    /// Look up one submission.
    pub fn submission(
        &self,
        print: &Fingerprint<fingerprint::Submission>,
    ) -> Result<Option<SubmissionRecord>, Error> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT fingerprint, image_fingerprint, filename, password, deep_analysis, status, created
                 FROM submissions WHERE fingerprint = ?",
                [print.to_string()],
                raw_submission,
            )
            .optional()?;
        drop(conn);
        row.map(SubmissionRecord::try_from).transpose()
    }

    /// All submissions owned by an image.
    pub fn submissions_of(
        &self,
        image: &Fingerprint<fingerprint::Image>,
    ) -> Result<Vec<SubmissionRecord>, Error> {
        let conn = self.lock();
        let mut statement = conn.prepare_cached(
            "SELECT fingerprint, image_fingerprint, filename, password, deep_analysis, status, created
             FROM submissions WHERE image_fingerprint = ? ORDER BY created ASC",
        )?;
        let raw: Vec<RawSubmission> = statement
            .query_map([image.to_string()], raw_submission)?
            .collect::<Result<_, _>>()?;
        drop(statement);
        drop(conn);
        raw.into_iter().map(SubmissionRecord::try_from).collect()
    }

    /// All submissions.
    pub fn submissions(&self) -> Result<Vec<SubmissionRecord>, Error> {
        let conn = self.lock();
        let mut statement = conn.prepare_cached(
            "SELECT fingerprint, image_fingerprint, filename, password, deep_analysis, status, created
             FROM submissions ORDER BY created ASC",
        )?;
        let raw: Vec<RawSubmission> = statement
            .query_map([], raw_submission)?
            .collect::<Result<_, _>>()?;
        drop(statement);
        drop(conn);
        raw.into_iter().map(SubmissionRecord::try_from).collect()
    }

    /// Move a submission through its lifecycle.
    pub fn set_status(
        &self,
        print: &Fingerprint<fingerprint::Submission>,
        status: Status,
    ) -> Result<(), Error> {
        let conn = self.lock();
        conn.execute(
            "UPDATE submissions SET status = ? WHERE fingerprint = ?",
            (status.to_string(), print.to_string()),
        )?;
        Ok(())
    }

    /// Overwrite a submission's password (pass `None` to clear it).
    pub fn set_password(
        &self,
        print: &Fingerprint<fingerprint::Submission>,
        password: Option<&str>,
    ) -> Result<(), Error> {
        let conn = self.lock();
        conn.execute(
            "UPDATE submissions SET password = ? WHERE fingerprint = ?",
            (password, print.to_string()),
        )?;
        Ok(())
    }

    /// Delete one submission record.
    pub fn delete_submission(
        &self,
        print: &Fingerprint<fingerprint::Submission>,
    ) -> Result<(), Error> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM submissions WHERE fingerprint = ?",
            [print.to_string()],
        )?;
        debug!(submission = %print, "deleted submission record");
        Ok(())
    }

    /// Append one upload attempt to the log. Never mutated afterwards.
    #[allow(clippy::too_many_arguments)]
    pub fn log_upload(
        &self,
        ip_address: &str,
        user_agent: Option<&str>,
        image: &Fingerprint<fingerprint::Image>,
        submission: Option<&Fingerprint<fingerprint::Submission>>,
        filename: Option<&str>,
        now: i64,
    ) -> Result<(), Error> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO upload_log
             (ip_address, user_agent, upload_time, image_fingerprint, submission_fingerprint, filename)
             VALUES (?, ?, ?, ?, ?, ?)",
            (
                ip_address,
                user_agent,
                now,
                image.to_string(),
                submission.map(|s| s.to_string()),
                filename,
            ),
        )?;
        Ok(())
    }

    /// Distinct source IPs that have uploaded this image.
    pub fn uploader_ips_for_image(
        &self,
        image: &Fingerprint<fingerprint::Image>,
    ) -> Result<HashSet<String>, Error> {
        let conn = self.lock();
        let mut statement = conn.prepare_cached(
            "SELECT DISTINCT ip_address FROM upload_log WHERE image_fingerprint = ?",
        )?;
        let ips = statement
            .query_map([image.to_string()], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(ips)
    }

    /// Distinct source IPs that have uploaded this exact submission.
    pub fn uploader_ips_for_submission(
        &self,
        submission: &Fingerprint<fingerprint::Submission>,
    ) -> Result<HashSet<String>, Error> {
        let conn = self.lock();
        let mut statement = conn.prepare_cached(
            "SELECT DISTINCT ip_address FROM upload_log WHERE submission_fingerprint = ?",
        )?;
        let ips = statement
            .query_map([submission.to_string()], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(ips)
    }

    /// Number of upload log rows (audit retention means this only grows).
    pub fn upload_count(&self) -> Result<usize, Error> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM upload_log", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Drop every image and submission record. The upload log is kept for
    /// audit. Used by the clear-at-restart switch.
    pub fn clear(&self) -> Result<(), Error> {
        let conn = self.lock();
        conn.execute_batch("DELETE FROM submissions; DELETE FROM images;")?;
        Ok(())
    }
}

// Raw row tuples: fingerprint and status parsing happens outside the
// rusqlite row closure so errors surface as registry errors.

type RawImage = (String, String, i64, i64, i64, i64);

fn raw_image(row: &Row<'_>) -> rusqlite::Result<RawImage> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

impl TryFrom<RawImage> for ImageRecord {
    type Error = Error;

    fn try_from(raw: RawImage) -> Result<Self, Error> {
        let (fingerprint, path, size, first_seen, last_seen, upload_count) = raw;
        Ok(ImageRecord {
            fingerprint: fingerprint.parse()?,
            path: PathBuf::from(path),
            size: size as u64,
            first_seen,
            last_seen,
            upload_count: upload_count as u64,
        })
    }
}

type RawSubmission = (String, String, String, Option<String>, bool, String, i64);

fn raw_submission(row: &Row<'_>) -> rusqlite::Result<RawSubmission> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

impl TryFrom<RawSubmission> for SubmissionRecord {
    type Error = Error;

    fn try_from(raw: RawSubmission) -> Result<Self, Error> {
        let (fingerprint, image, filename, password, deep_analysis, status, created) = raw;
        Ok(SubmissionRecord {
            fingerprint: fingerprint.parse()?,
            image: image.parse()?,
            filename,
            password,
            deep_analysis,
            status: Status::from_str(&status).map_err(|_| Error::Status(status))?,
            created,
        })
    }
}

#[cfg(test)]
mod tests;
