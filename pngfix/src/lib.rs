//! Structural repair and dimension recovery for PNG files.
//!
//! Three pieces live here:
//!
//! - [`Ihdr`]: the PNG header chunk as a value, with its canonical 13-byte
//!   encoding and CRC.
//! - [`IhdrIndex`]: a precomputed SQLite mapping from IHDR CRC32 to header
//!   parameters, used to recover tampered dimensions without brute force.
//!   The index is materialized once by an init command; workers open a
//!   read-only view. Many parameter sets may share one CRC across 32 bits,
//!   so callers always re-verify candidates.
//! - [`repair`] and [`recover`]: the two forensic algorithms. `repair`
//!   rebuilds a possibly-corrupt PNG chunk by chunk; `recover` proposes
//!   corrected dimensions for a PNG whose stored IHDR CRC no longer matches
//!   its declared width and height.
//!
//! Both algorithms are pure with respect to the filesystem: they take bytes
//! and return bytes plus a step log, and the calling analyzer decides what
//! to materialize.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

use std::io;

use thiserror::Error;

mod ihdr;
mod index;
mod recover;
mod repair;

pub use ihdr::*;
pub use index::*;
pub use recover::*;
pub use repair::*;

/// Errors that may be encountered while building or querying the index,
/// or while recovering dimensions.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The CRC index could not be opened, created, or queried.
    #[error("ihdr index: {0}")]
    Database(#[from] rusqlite::Error),

    /// A generic IO error occurred.
    #[error("i/o error: {0}")]
    IO(#[from] io::Error),

    /// The input does not start with a PNG header followed immediately by
    /// an IHDR chunk, so there are no declared dimensions to recover.
    #[error("the IHDR chunk is not the first chunk, or the PNG structure is invalid")]
    Structure,
}

/// CRC32 over a chunk's type tag and data, the quantity PNG stores in each
/// chunk's trailing 4 bytes.
pub fn chunk_crc(chunk_type: &[u8], data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(chunk_type);
    hasher.update(data);
    hasher.finalize()
}

/// Find `needle` in `haystack` at or after `from`.
pub(crate) fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|at| at + from)
}
