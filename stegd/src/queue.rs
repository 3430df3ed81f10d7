//! The seam between ingestion and the worker.
//!
//! The broker behind this trait is a deployment concern; the contract the
//! core relies on is small: enqueued submissions are processed serially
//! per worker, each job gets a bounded budget, and a job that blows its
//! budget is simply abandoned; the retention sweeper reclaims the
//! submission through its pending-timeout rule.

use std::sync::Mutex;

use async_trait::async_trait;
use fingerprint::Fingerprint;
use stable_eyre::Result;
use tokio::{sync::mpsc, task::JoinHandle, time};
use tracing::{error, warn};

use crate::worker::Worker;

/// Accepts submissions for background analysis.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueue one submission for processing.
    async fn enqueue(&self, submission: Fingerprint<fingerprint::Submission>) -> Result<()>;
}

/// An in-process queue: one background task drains submissions serially
/// through the worker, each under the configured job budget.
pub struct InProcess {
    tx: mpsc::UnboundedSender<Fingerprint<fingerprint::Submission>>,
}

impl InProcess {
    /// Start the drain task. The returned handle finishes when the queue
    /// is dropped and drained.
    pub fn start(worker: Worker) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Fingerprint<fingerprint::Submission>>();
        let handle = tokio::spawn(async move {
            while let Some(submission) = rx.recv().await {
                let budget = worker.job_timeout();
                match time::timeout(budget, worker.process(&submission)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        error!(submission = %submission, error = %err, "worker failed");
                    }
                    Err(_) => {
                        // Left in `running`; the sweeper's pending-timeout
                        // rule reclaims it.
                        warn!(
                            submission = %submission,
                            budget_secs = budget.as_secs(),
                            "job exceeded its budget, abandoning"
                        );
                    }
                }
            }
        });
        (Self { tx }, handle)
    }
}

#[async_trait]
impl Queue for InProcess {
    async fn enqueue(&self, submission: Fingerprint<fingerprint::Submission>) -> Result<()> {
        self.tx
            .send(submission)
            .map_err(|_| stable_eyre::eyre::eyre!("queue drain task is gone"))
    }
}

/// Records enqueued submissions and drops them. Meant for tests and dry
/// runs of the ingestion path.
#[derive(Default)]
pub struct Devnull {
    enqueued: Mutex<Vec<Fingerprint<fingerprint::Submission>>>,
}

impl Devnull {
    /// Everything enqueued so far, in order.
    pub fn drained(&self) -> Vec<Fingerprint<fingerprint::Submission>> {
        self.enqueued
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Queue for Devnull {
    async fn enqueue(&self, submission: Fingerprint<fingerprint::Submission>) -> Result<()> {
        self.enqueued
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(submission);
        Ok(())
    }
}
