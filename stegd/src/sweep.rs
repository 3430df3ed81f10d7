//! The retention sweeper.
//!
//! Runs before every ingest (and on demand via the `sweep` subcommand).
//! Four policies, applied in order:
//!
//! 1. In-flight submissions older than the pending budget were abandoned
//!    by a killed or stuck worker; delete the record so the slot clears.
//! 2. Completed submissions whose result document is missing are buggy;
//!    delete the record and the directory.
//! 3. Images past the storage window go entirely: submissions, result
//!    tree, record.
//! 4. Images with no submissions left (and old enough to not be mid
//!    ingest) are orphans; remove tree and record.
//!
//! The upload log is never swept.

use thiserror::Error;
use tracing::{debug, info};

use crate::Runtime;

/// Errors that may be encountered while sweeping.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The registry failed.
    #[error(transparent)]
    Registry(#[from] registry::Error),

    /// The artifact store failed.
    #[error("i/o error: {0}")]
    IO(#[from] std::io::Error),
}

/// What one sweep pass removed.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct Report {
    /// Submissions deleted for exceeding the pending budget.
    pub stalled_submissions: usize,

    /// Completed submissions deleted for missing result documents.
    pub broken_submissions: usize,

    /// Images (with their submissions) deleted for exceeding retention.
    pub expired_images: usize,

    /// Orphaned images deleted.
    pub orphaned_images: usize,
}

impl Report {
    fn is_empty(&self) -> bool {
        *self == Report::default()
    }
}

/// Run one sweep pass against the clock value `now` (unix seconds).
pub fn run(runtime: &Runtime, now: i64) -> Result<Report, Error> {
    let registry = runtime.registry();
    let store = runtime.store();
    let max_pending = runtime.settings().max_pending_secs();
    let max_store = runtime.settings().max_store_secs();
    let mut report = Report::default();

    for submission in registry.submissions()? {
        let age = now - submission.created();
        if submission.status().in_flight() && age > max_pending {
            debug!(submission = %submission.fingerprint(), age, "sweeping stalled submission");
            registry.delete_submission(submission.fingerprint())?;
            report.stalled_submissions += 1;
        } else if *submission.status() == registry::Status::Completed {
            let document = store.results_path(submission.image(), submission.fingerprint());
            if !document.exists() {
                debug!(submission = %submission.fingerprint(), "sweeping submission with missing results");
                store.remove_tree(&store.submission_dir(submission.image(), submission.fingerprint()))?;
                registry.delete_submission(submission.fingerprint())?;
                report.broken_submissions += 1;
            }
        }
    }

    for image in registry.images()? {
        let age = now - image.last_seen();
        if age > max_store {
            debug!(image = %image.fingerprint(), age, "sweeping expired image");
            for submission in registry.submissions_of(image.fingerprint())? {
                registry.delete_submission(submission.fingerprint())?;
            }
            store.remove_tree(&store.image_dir(image.fingerprint()))?;
            registry.delete_image(image.fingerprint())?;
            report.expired_images += 1;
        } else if registry.submissions_of(image.fingerprint())?.is_empty() && age > max_pending {
            debug!(image = %image.fingerprint(), age, "sweeping orphaned image");
            store.remove_tree(&store.image_dir(image.fingerprint()))?;
            registry.delete_image(image.fingerprint())?;
            report.orphaned_images += 1;
        }
    }

    if !report.is_empty() {
        info!(?report, "retention sweep removed entries");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use registry::{Registry, Status};

    use super::*;
    use crate::{config::Settings, queue::Devnull, store::Store};

    fn runtime(dir: &std::path::Path) -> Runtime {
        let settings = Settings::for_tests(dir);
        let store = Store::new(
            settings.result_root().clone(),
            settings.removed_root().clone(),
        );
        Runtime::new(
            settings,
            Arc::new(Registry::in_memory().expect("must open")),
            store,
            Arc::new(Devnull::default()),
        )
    }

    fn seed_submission(
        runtime: &Runtime,
        bytes: &[u8],
        created: i64,
        status: Status,
        with_results: bool,
    ) -> (
        fingerprint::Fingerprint<fingerprint::Image>,
        fingerprint::Fingerprint<fingerprint::Submission>,
    ) {
        let image = fingerprint::image(bytes);
        let submission = fingerprint::submission(bytes, "a.png", None, false);
        let blob = runtime.store().blob_path(&image, "png");

        std::fs::create_dir_all(runtime.store().image_dir(&image)).expect("must create");
        std::fs::write(&blob, bytes).expect("must write");
        runtime
            .registry()
            .upsert_image(&image, &blob, bytes.len() as u64, created)
            .expect("must upsert");
        runtime
            .registry()
            .upsert_submission(&submission, &image, "a.png", None, false, created)
            .expect("must upsert");
        runtime
            .registry()
            .set_status(&submission, status)
            .expect("must update");

        let dir = runtime.store().submission_dir(&image, &submission);
        std::fs::create_dir_all(&dir).expect("must create");
        if with_results {
            std::fs::write(dir.join(report::DOCUMENT), b"{}").expect("must write");
        }
        (image, submission)
    }

    #[test]
    fn stalled_submissions_are_reclaimed() {
        let dir = tempfile::tempdir().expect("must create tempdir");
        let runtime = runtime(dir.path());
        let now = 10_000;
        // Stalled: pending, created 601 seconds before now.
        seed_submission(&runtime, b"stalled", now - 601, Status::Pending, false);
        // Fresh: running, created 10 seconds before now.
        seed_submission(&runtime, b"fresh", now - 10, Status::Running, false);

        let report = run(&runtime, now).expect("must sweep");
        assert_eq!(report.stalled_submissions, 1);
        assert_eq!(
            runtime.registry().submissions().expect("must list").len(),
            1,
            "the fresh one survives"
        );
    }

    #[test]
    fn completed_submission_missing_results_is_deleted() {
        let dir = tempfile::tempdir().expect("must create tempdir");
        let runtime = runtime(dir.path());
        let now = 10_000;
        let (_, broken) = seed_submission(&runtime, b"broken", now - 10, Status::Completed, false);
        seed_submission(&runtime, b"whole", now - 10, Status::Completed, true);

        let report = run(&runtime, now).expect("must sweep");
        assert_eq!(report.broken_submissions, 1);
        assert!(runtime
            .registry()
            .submission(&broken)
            .expect("must query")
            .is_none());
    }

    #[test]
    fn expired_images_lose_everything() {
        let dir = tempfile::tempdir().expect("must create tempdir");
        let runtime = runtime(dir.path());
        let now = 1_000_000;
        let (image, submission) =
            seed_submission(&runtime, b"ancient", now - 259_201, Status::Completed, true);

        let report = run(&runtime, now).expect("must sweep");
        assert_eq!(report.expired_images, 1);
        assert!(runtime.registry().image(&image).expect("must query").is_none());
        assert!(runtime
            .registry()
            .submission(&submission)
            .expect("must query")
            .is_none());
        assert!(!runtime.store().image_dir(&image).exists());
    }

    #[test]
    fn orphaned_images_are_pruned_after_the_pending_window() {
        let dir = tempfile::tempdir().expect("must create tempdir");
        let runtime = runtime(dir.path());
        let now = 10_000;

        let image = fingerprint::image(b"orphan");
        let blob = runtime.store().blob_path(&image, "png");
        std::fs::create_dir_all(runtime.store().image_dir(&image)).expect("must create");
        std::fs::write(&blob, b"orphan").expect("must write");
        runtime
            .registry()
            .upsert_image(&image, &blob, 6, now - 601)
            .expect("must upsert");

        let report = run(&runtime, now).expect("must sweep");
        assert_eq!(report.orphaned_images, 1);
        assert!(runtime.registry().image(&image).expect("must query").is_none());
        assert!(!runtime.store().image_dir(&image).exists());
    }

    #[test]
    fn fresh_entries_are_untouched() {
        let dir = tempfile::tempdir().expect("must create tempdir");
        let runtime = runtime(dir.path());
        let now = 10_000;
        seed_submission(&runtime, b"fine", now - 10, Status::Completed, true);

        let report = run(&runtime, now).expect("must sweep");
        assert_eq!(report, Report::default());
    }
}
