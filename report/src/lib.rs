//! The consolidated result document for one submission.
//!
//! Every analyzer contributes exactly one [`Fragment`], keyed by the analyzer
//! name, to a single `results.json` in the submission's result directory.
//! Analyzers run concurrently, potentially from different OS processes
//! sharing one filesystem, so [`merge`] must be atomic with respect to any
//! reader and any concurrent writer: a reader sees the document before or
//! after a given merge, never partial JSON.
//!
//! The protocol is lock-then-rename:
//!
//! 1. Take a process-wide mutex (synchronizes threads).
//! 2. Take an exclusive advisory lock on the sibling `results.json.lock`
//!    (synchronizes processes).
//! 3. Read the current document; a document that fails to parse is treated
//!    as empty. Writes are atomic-rename, so a torn document can only mean
//!    external tampering, and reset is the recovery.
//! 4. Replace the fragment under the analyzer's key (last write wins; other
//!    keys are preserved).
//! 5. Serialize to the sibling `results.json.tmp`, then rename over the
//!    document.
//!
//! A failed temp-file write leaves the prior document intact; a failed
//! rename is surfaced to the caller.

use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use fs2::FileExt;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

/// File name of the consolidated result document inside a result directory.
pub const DOCUMENT: &str = "results.json";

/// Synchronizes merges across threads of this process.
/// The advisory file lock below synchronizes across processes.
static PROCESS_LOCK: Mutex<()> = Mutex::new(());

/// Errors that may be encountered while merging or loading a document.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A generic IO error occurred while reading or writing the document.
    #[error("i/o error: {0}")]
    IO(#[from] io::Error),

    /// The fragment could not be encoded. Indicates a program bug.
    #[error("encode result document: {0}")]
    Serialize(#[source] serde_json::Error),

    /// The document on disk could not be parsed when loading.
    #[error("parse result document: {0}")]
    Parse(#[source] serde_json::Error),
}

/// What an analyzer produced, in the shape the result page consumes.
///
/// Most tools emit their stdout as lines; `file` emits one string, and
/// `exiftool` emits an ordered key/value mapping.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Output {
    /// A single opaque string.
    Text(String),

    /// A list of lines.
    Lines(Vec<String>),

    /// An ordered mapping, e.g. parsed metadata fields.
    Table(IndexMap<String, String>),
}

/// One analyzer's contribution to the result document.
///
/// The serialized form hides the discriminant behind a `status` field, so a
/// fragment reads as `{"status": "ok", ...}` or `{"status": "error", ...}`.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Fragment {
    /// The analyzer ran to completion.
    Ok {
        /// Post-processed tool output, when the tool produced any.
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Output>,

        /// A human-readable remark, e.g. a lossy conversion that was applied.
        #[serde(skip_serializing_if = "Option::is_none")]
        note: Option<String>,

        /// Generated images, grouped by section label.
        #[serde(skip_serializing_if = "Option::is_none")]
        images: Option<IndexMap<String, Vec<String>>>,

        /// Reconstructed PNG files.
        #[serde(skip_serializing_if = "Option::is_none")]
        png_images: Option<Vec<String>>,

        /// Where to download the analyzer's extracted-file archive.
        #[serde(skip_serializing_if = "Option::is_none")]
        download: Option<String>,
    },

    /// The analyzer failed; sibling analyzers are unaffected.
    Error {
        /// The classified error text.
        error: String,

        /// Partial output captured before the failure, when meaningful.
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Output>,
    },
}

impl Fragment {
    /// A success fragment with the given output.
    pub fn ok(output: Output) -> Self {
        Fragment::Ok {
            output: Some(output),
            note: None,
            images: None,
            png_images: None,
            download: None,
        }
    }

    /// A success fragment with no output (e.g. "nothing to do" plus a note).
    pub fn ok_empty() -> Self {
        Fragment::Ok {
            output: None,
            note: None,
            images: None,
            png_images: None,
            download: None,
        }
    }

    /// An error fragment with the given classified error text.
    pub fn error(error: impl Into<String>) -> Self {
        Fragment::Error {
            error: error.into(),
            output: None,
        }
    }

    /// Attach a note. No-op on error fragments.
    pub fn with_note(mut self, text: impl Into<String>) -> Self {
        if let Fragment::Ok { note, .. } = &mut self {
            *note = Some(text.into());
        }
        self
    }

    /// Attach grouped images. No-op on error fragments.
    pub fn with_images(mut self, groups: IndexMap<String, Vec<String>>) -> Self {
        if let Fragment::Ok { images, .. } = &mut self {
            *images = Some(groups);
        }
        self
    }

    /// Attach reconstructed PNG links. No-op on error fragments.
    pub fn with_png_images(mut self, links: Vec<String>) -> Self {
        if let Fragment::Ok { png_images, .. } = &mut self {
            *png_images = Some(links);
        }
        self
    }

    /// Attach a download link. No-op on error fragments.
    pub fn with_download(mut self, link: impl Into<String>) -> Self {
        if let Fragment::Ok { download, .. } = &mut self {
            *download = Some(link.into());
        }
        self
    }

    /// Attach captured output to either variant.
    pub fn with_output(mut self, captured: Output) -> Self {
        match &mut self {
            Fragment::Ok { output, .. } => *output = Some(captured),
            Fragment::Error { output, .. } => *output = Some(captured),
        }
        self
    }

    /// Whether this fragment reports an error.
    pub fn is_error(&self) -> bool {
        matches!(self, Fragment::Error { .. })
    }
}

/// Merge one analyzer's fragment into the result document in `result_dir`.
///
/// Replacement semantics: the fragment replaces any prior value under the
/// analyzer's key; all other keys are preserved.
pub fn merge(result_dir: &Path, analyzer: &str, fragment: &Fragment) -> Result<(), Error> {
    let paths = DocumentPaths::new(result_dir);
    fs::create_dir_all(result_dir)?;

    // Mutex poisoning only means another merge panicked mid-update; the
    // document itself is still consistent thanks to the rename protocol.
    let _threads = PROCESS_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

    let lock = File::create(&paths.lock)?;
    lock.lock_exclusive()?;
    let outcome = merge_locked(&paths, analyzer, fragment);
    FileExt::unlock(&lock)?;
    outcome
}

/// Load the current result document, or `None` if no fragment has been
/// merged yet.
///
/// Readers don't need the lock: writes are atomic renames, so any read of
/// the document observes a complete snapshot.
pub fn load(result_dir: &Path) -> Result<Option<Value>, Error> {
    let document = result_dir.join(DOCUMENT);
    let raw = match fs::read(&document) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    serde_json::from_slice(&raw).map(Some).map_err(Error::Parse)
}

struct DocumentPaths {
    document: PathBuf,
    lock: PathBuf,
    temp: PathBuf,
}

impl DocumentPaths {
    fn new(result_dir: &Path) -> Self {
        let document = result_dir.join(DOCUMENT);
        Self {
            lock: document.with_extension("json.lock"),
            temp: document.with_extension("json.tmp"),
            document,
        }
    }
}

fn merge_locked(paths: &DocumentPaths, analyzer: &str, fragment: &Fragment) -> Result<(), Error> {
    let mut entries = read_current(&paths.document)?;
    let encoded = serde_json::to_value(fragment).map_err(Error::Serialize)?;
    entries.insert(analyzer.to_owned(), encoded);

    let raw = serde_json::to_vec(&entries).map_err(Error::Serialize)?;
    fs::write(&paths.temp, raw)?;
    fs::rename(&paths.temp, &paths.document)?;
    Ok(())
}

fn read_current(document: &Path) -> Result<Map<String, Value>, Error> {
    let raw = match fs::read(document) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(err) => return Err(err.into()),
    };
    match serde_json::from_slice(&raw) {
        Ok(Value::Object(entries)) => Ok(entries),
        // Anything else on disk means external tampering; reset.
        Ok(_) | Err(_) => {
            warn!(document = %document.display(), "result document unreadable, resetting");
            Ok(Map::new())
        }
    }
}
