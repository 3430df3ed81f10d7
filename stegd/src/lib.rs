//! The library portion of the analysis service.
//!
//! The overall flow for one upload:
//!
//! 1. The HTTP surface receives the image and hands it to ingestion.
//! 2. Ingestion fingerprints the bytes and the request tuple, records the
//!    upload, writes the blob into the content-addressed store (first
//!    upload only), and enqueues the submission fingerprint.
//! 3. The worker dequeues, marks the submission running, and fans the
//!    analyzer set out concurrently; every analyzer merges one fragment
//!    into the submission's result document.
//! 4. Clients poll `/status` and fetch `/result` once the document exists.
//!
//! Independent of request traffic, the retention sweeper prunes expired
//! records (it also runs before every ingest), and the removal policy
//! gates user-initiated deletion behind an age and single-uploader check.
//!
//! There are no module-level singletons: everything an operation needs
//! travels in a [`Runtime`] built once at startup.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

use std::sync::Arc;

use registry::Registry;

pub mod config;
pub mod http;
pub mod ingest;
pub mod queue;
pub mod removal;
pub mod store;
pub mod sweep;
pub mod worker;

/// Everything the request path needs, built once at startup.
pub struct Runtime {
    settings: config::Settings,
    registry: Arc<Registry>,
    store: store::Store,
    queue: Arc<dyn queue::Queue>,
}

impl Runtime {
    /// Assemble a runtime from its parts.
    pub fn new(
        settings: config::Settings,
        registry: Arc<Registry>,
        store: store::Store,
        queue: Arc<dyn queue::Queue>,
    ) -> Self {
        Self {
            settings,
            registry,
            store,
            queue,
        }
    }

    /// Service settings.
    pub fn settings(&self) -> &config::Settings {
        &self.settings
    }

    /// The record registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The artifact store layout.
    pub fn store(&self) -> &store::Store {
        &self.store
    }

    /// The submission queue.
    pub fn queue(&self) -> &dyn queue::Queue {
        self.queue.as_ref()
    }
}

/// Current time as unix seconds; the only clock the service uses.
pub fn now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
