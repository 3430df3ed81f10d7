//! The submission fan-out worker.
//!
//! One submission becomes ~16 concurrent analyzer tasks. Each task is
//! wrapped in a boundary that turns any error (including a panic) into
//! an error fragment under that analyzer's key, so a single misbehaving
//! tool can never starve its siblings or lose its slot in the result
//! document. The submission itself only fails on worker-level problems
//! (missing records, registry unavailable); a submission whose analyzers
//! all errored still completes.

use std::{sync::Arc, time::Duration};

use analyzer::{Analyze, Subject};
use fingerprint::Fingerprint;
use pngfix::IhdrIndex;
use registry::{Registry, Status};
use report::Fragment;
use stable_eyre::{eyre::Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::store::Store;

/// Processes queued submissions.
pub struct Worker {
    registry: Arc<Registry>,
    store: Store,
    index: Arc<IhdrIndex>,
    analyzer_timeout: Duration,
    job_timeout: Duration,
}

impl Worker {
    /// Assemble a worker.
    pub fn new(
        registry: Arc<Registry>,
        store: Store,
        index: Arc<IhdrIndex>,
        analyzer_timeout: Duration,
        job_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            index,
            analyzer_timeout,
            job_timeout,
        }
    }

    /// The per-job budget the queue should enforce.
    pub fn job_timeout(&self) -> Duration {
        self.job_timeout
    }

    /// Process one queued submission end to end.
    pub async fn process(&self, print: &Fingerprint<fingerprint::Submission>) -> Result<()> {
        let Some(submission) = self.registry.submission(print)? else {
            warn!(submission = %print, "queued submission has no record, skipping");
            return Ok(());
        };
        let Some(image) = self.registry.image(submission.image())? else {
            warn!(submission = %print, "submission's image has no record, skipping");
            return Ok(());
        };

        self.registry.set_status(print, Status::Running)?;
        info!(submission = %print, deep = submission.deep_analysis(), "analysis started");

        let outcome: Result<()> = async {
            let result_dir = self.store.submission_dir(submission.image(), print);
            tokio::fs::create_dir_all(&result_dir)
                .await
                .context("create result directory")?;

            let subject = Subject::builder()
                .image(image.path().clone())
                .result_dir(result_dir)
                .password(submission.password().clone())
                .timeout(self.analyzer_timeout)
                .build();
            let analyzers = analyzer::set(*submission.deep_analysis(), Arc::clone(&self.index));
            fan_out(&subject, analyzers).await;
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                self.registry.set_status(print, Status::Completed)?;
                info!(submission = %print, "analysis completed");
                Ok(())
            }
            Err(err) => {
                error!(submission = %print, error = %err, "analysis failed");
                self.registry.set_status(print, Status::Error)?;
                Err(err)
            }
        }
    }
}

/// Run every analyzer concurrently against the subject, merging exactly
/// one fragment per analyzer. Joins all tasks; never returns early.
pub async fn fan_out(subject: &Subject, analyzers: Vec<Box<dyn Analyze>>) {
    let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::with_capacity(analyzers.len());

    for analyzer in analyzers {
        let subject = subject.clone();
        let name = analyzer.name();
        tasks.push((
            name,
            tokio::spawn(async move {
                let fragment = match analyzer.analyze(&subject).await {
                    Ok(fragment) => fragment,
                    Err(err) => {
                        error!(analyzer = name, error = %err, "analyzer failed");
                        Fragment::error(err.to_string())
                    }
                };
                if let Err(err) = report::merge(subject.result_dir(), name, &fragment) {
                    error!(analyzer = name, error = %err, "failed to merge fragment");
                }
            }),
        ));
    }

    for (name, task) in tasks {
        if task.await.is_err() {
            // The task itself died (panic or abort); its key must still
            // appear in the document.
            error!(analyzer = name, "analyzer task panicked");
            let fragment = Fragment::error(format!("{name} crashed during analysis"));
            if let Err(err) = report::merge(subject.result_dir(), name, &fragment) {
                error!(analyzer = name, error = %err, "failed to merge crash fragment");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use report::Output;

    use super::*;

    struct Fixed {
        name: &'static str,
        fragment: Fragment,
    }

    #[async_trait]
    impl Analyze for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn analyze(&self, _: &Subject) -> Result<Fragment, analyzer::Error> {
            Ok(self.fragment.clone())
        }
    }

    struct Exploding {
        name: &'static str,
    }

    #[async_trait]
    impl Analyze for Exploding {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn analyze(&self, _: &Subject) -> Result<Fragment, analyzer::Error> {
            panic!("analyzer blew up");
        }
    }

    struct Failing {
        name: &'static str,
    }

    #[async_trait]
    impl Analyze for Failing {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn analyze(&self, _: &Subject) -> Result<Fragment, analyzer::Error> {
            Err(analyzer::Error::IO(std::io::Error::new(
                std::io::ErrorKind::Other,
                "tool is missing",
            )))
        }
    }

    fn subject(dir: &std::path::Path) -> Subject {
        Subject::builder()
            .image(dir.join("input.png"))
            .result_dir(dir.join("sub"))
            .build()
    }

    #[tokio::test]
    async fn process_completes_even_when_tools_are_missing() {
        // End to end over a synthetic PNG with whatever tools this host
        // happens to have: absent binaries become error fragments, but the
        // submission still completes with every analyzer keyed.
        let dir = tempfile::tempdir().expect("must create tempdir");
        let settings = crate::config::Settings::for_tests(dir.path());
        let store = Store::new(
            settings.result_root().clone(),
            settings.removed_root().clone(),
        );
        let registry = Arc::new(Registry::in_memory().expect("must open"));
        let index = Arc::new(IhdrIndex::in_memory().expect("must populate"));

        let png = {
            let ihdr = pngfix::Ihdr::new(4, 4, 8, 0, 0);
            let mut raw = Vec::new();
            raw.extend_from_slice(&pngfix::PNG_HEADER);
            raw.extend_from_slice(&[0, 0, 0, 13]);
            raw.extend_from_slice(b"IHDR");
            raw.extend_from_slice(&ihdr.data());
            raw.extend_from_slice(&ihdr.crc().to_be_bytes());
            let idat = [0x78, 0x9C, 0x62, 0x00, 0x00];
            raw.extend_from_slice(&(idat.len() as u32).to_be_bytes());
            raw.extend_from_slice(b"IDAT");
            raw.extend_from_slice(&idat);
            raw.extend_from_slice(&pngfix::chunk_crc(b"IDAT", &idat).to_be_bytes());
            raw.extend_from_slice(&pngfix::CANONICAL_IEND);
            raw
        };

        let image = fingerprint::image(&png);
        let submission = fingerprint::submission(&png, "a.png", None, false);
        let blob = store.blob_path(&image, "png");
        std::fs::create_dir_all(store.image_dir(&image)).expect("must create");
        std::fs::write(&blob, &png).expect("must write");
        registry
            .upsert_image(&image, &blob, png.len() as u64, 100)
            .expect("must upsert");
        registry
            .upsert_submission(&submission, &image, "a.png", None, false, 100)
            .expect("must upsert");

        let worker = Worker::new(
            Arc::clone(&registry),
            store.clone(),
            index,
            settings.max_pending_time(),
            settings.job_timeout(),
        );
        worker.process(&submission).await.expect("must process");

        let record = registry
            .submission(&submission)
            .expect("must query")
            .expect("must exist");
        assert_eq!(*record.status(), Status::Completed);

        let document = report::load(&store.submission_dir(&image, &submission))
            .expect("must load")
            .expect("must exist");
        let entries = document.as_object().expect("must be an object");
        for analyzer in [
            "file",
            "identify",
            "strings",
            "exiftool",
            "pngcheck",
            "binwalk",
            "foremost",
            "steghide",
            "openstego",
            "jpseek",
            "jsteg",
            "zsteg",
            "decomposer",
            "color_remapping",
            "pcrt",
            "image_resize",
        ] {
            let entry = entries
                .get(analyzer)
                .unwrap_or_else(|| panic!("missing key {analyzer}"));
            let status = entry["status"].as_str().expect("status is a string");
            assert!(
                status == "ok" || status == "error",
                "unexpected status {status} for {analyzer}"
            );
        }
        assert!(
            !entries.contains_key("outguess"),
            "deep-only tools stay out of a shallow run"
        );
    }

    #[tokio::test]
    async fn every_analyzer_gets_a_key_even_when_failing() {
        let dir = tempfile::tempdir().expect("must create tempdir");
        std::fs::create_dir(dir.path().join("sub")).expect("must create");
        let subject = subject(dir.path());

        let analyzers: Vec<Box<dyn Analyze>> = vec![
            Box::new(Fixed {
                name: "strings",
                fragment: Fragment::ok(Output::Lines(vec!["hello".into()])),
            }),
            Box::new(Failing { name: "zsteg" }),
            Box::new(Exploding { name: "binwalk" }),
        ];
        fan_out(&subject, analyzers).await;

        let document = report::load(subject.result_dir())
            .expect("must load")
            .expect("must exist");
        let entries = document.as_object().expect("must be an object");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries["strings"]["status"], "ok");
        assert_eq!(entries["zsteg"]["status"], "error");
        assert_eq!(entries["binwalk"]["status"], "error");
    }

    #[tokio::test]
    async fn sibling_analyzers_proceed_past_failures() {
        let dir = tempfile::tempdir().expect("must create tempdir");
        std::fs::create_dir(dir.path().join("sub")).expect("must create");
        let subject = subject(dir.path());

        // Sixteen healthy analyzers around one that panics.
        let mut analyzers: Vec<Box<dyn Analyze>> = Vec::new();
        analyzers.push(Box::new(Exploding { name: "faulty" }));
        let names = [
            "a0", "a1", "a2", "a3", "a4", "a5", "a6", "a7", "a8", "a9", "a10", "a11", "a12",
            "a13", "a14", "a15",
        ];
        for name in names {
            analyzers.push(Box::new(Fixed {
                name,
                fragment: Fragment::ok(Output::Text("fine".into())),
            }));
        }
        fan_out(&subject, analyzers).await;

        let document = report::load(subject.result_dir())
            .expect("must load")
            .expect("must exist");
        let entries = document.as_object().expect("must be an object");
        assert_eq!(entries.len(), 17);
        for name in names {
            assert_eq!(entries[name]["status"], "ok", "sibling {name} unaffected");
        }
    }
}
