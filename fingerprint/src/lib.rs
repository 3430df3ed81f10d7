//! A fingerprint is a deterministic identifier for uploaded content.
//!
//! Fingerprints come in two kinds. An [`Image`] fingerprint identifies the raw
//! bytes of an uploaded image; a [`Submission`] fingerprint identifies one
//! analysis request, which is the image bytes plus the submitted filename,
//! the optional password, and the deep-analysis flag.
//!
//! Fingerprint kinds MUST maintain exact implementation compatibility: the
//! hex rendering of a fingerprint is used as a database primary key and as an
//! on-disk directory name, so a change to how either kind is computed orphans
//! every stored result. If a change is needed, that has to be a new kind.
//!
//! The digest is MD5. This is a deduplication key, not an integrity check:
//! two uploads of the same bytes must land in the same directory across
//! deployments, and nothing security-relevant hangs off collision resistance.

use std::{fmt::Display, marker::PhantomData, str::FromStr};

use md5::{Digest, Md5};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Appended to the submission digest when deep analysis is requested.
const DEEP_MARKER: &[u8] = b"deep_analysis";

/// Errors that may be encountered while parsing a fingerprint from text.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The input was not the hex rendering of a 128 bit digest.
    #[error("fingerprint must be 32 hexadecimal characters, got {0} characters")]
    Length(usize),

    /// The input was the right length but was not valid hex.
    #[error("fingerprint is not valid hex: {0}")]
    Encoding(#[from] hex::FromHexError),
}

/// All valid fingerprint kinds implement this trait.
///
/// This trait is sealed, indicating nothing outside this module may implement it.
pub trait Kind: private::Sealed {}

/// Identifies the raw bytes of an image: `md5(bytes)`.
///
/// This kind names the canonical blob and the per-image result directory,
/// so all submissions of the same bytes share storage.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Hash)]
pub struct Image;

impl private::Sealed for Image {}
impl Kind for Image {}

/// Identifies one analysis request:
/// `md5(bytes ∥ filename ∥ password? ∥ "deep_analysis"?)`.
///
/// Uploading the same image under a different filename, password, or
/// analysis depth is a distinct submission; repeating an identical upload
/// is not.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Hash)]
pub struct Submission;

impl private::Sealed for Submission {}
impl Kind for Submission {}

/// The raw bytes of a fingerprint digest.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Default)]
pub struct Blob([u8; 16]);

impl Blob {
    fn from_digest(digest: Md5) -> Blob {
        Blob(digest.finalize().into())
    }

    /// Reference the digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// An opaque, deterministic value for some content.
/// If two fingerprints of the same [`Kind`] are equal, the inputs used to
/// create them are the same.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct Fingerprint<K: Kind> {
    kind: PhantomData<K>,
    content: Blob,
}

impl<K: Kind> Fingerprint<K> {
    fn new(content: Blob) -> Self {
        Self {
            content,
            kind: PhantomData,
        }
    }

    fn from_digest(digest: Md5) -> Self {
        Fingerprint::new(Blob::from_digest(digest))
    }

    /// Reference the digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.content.as_bytes()
    }
}

impl<K: Kind> Display for Fingerprint<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.content.0))
    }
}

impl<K: Kind> FromStr for Fingerprint<K> {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(Error::Length(s.len()));
        }
        let raw = hex::decode(s)?;
        let mut content = [0u8; 16];
        content.copy_from_slice(&raw);
        Ok(Fingerprint::new(Blob(content)))
    }
}

impl<K: Kind> Serialize for Fingerprint<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de, K: Kind> Deserialize<'de> for Fingerprint<K> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

/// Fingerprint the raw bytes of an image.
pub fn image(bytes: &[u8]) -> Fingerprint<Image> {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    Fingerprint::from_digest(hasher)
}

/// Fingerprint one analysis request.
///
/// The digest covers the image bytes, then the filename as UTF-8, then the
/// password as UTF-8 when present, then a fixed marker when deep analysis is
/// requested. Absent fields contribute no bytes, so "no password" and "empty
/// password" are the same submission.
pub fn submission(
    bytes: &[u8],
    filename: &str,
    password: Option<&str>,
    deep: bool,
) -> Fingerprint<Submission> {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    hasher.update(filename.as_bytes());
    if let Some(password) = password {
        hasher.update(password.as_bytes());
    }
    if deep {
        hasher.update(DEEP_MARKER);
    }
    Fingerprint::from_digest(hasher)
}

mod private {
    pub trait Sealed {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_known_vector() {
        // md5("abc"), straight from RFC 1321's test suite.
        let print = image(b"abc");
        assert_eq!(print.to_string(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn image_empty_vector() {
        let print = image(b"");
        assert_eq!(print.to_string(), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn submission_is_deterministic() {
        let a = submission(b"bytes", "cat.png", Some("hunter2"), true);
        let b = submission(b"bytes", "cat.png", Some("hunter2"), true);
        assert_eq!(a, b);
    }

    #[test]
    fn submission_matches_concatenated_image_digest() {
        let print = submission(b"bytes", "cat.png", Some("pw"), true);
        let concatenated = image(b"bytescat.pngpwdeep_analysis");
        assert_eq!(print.to_string(), concatenated.to_string());
    }

    #[test]
    fn submission_distinguishes_inputs() {
        let base = submission(b"bytes", "cat.png", None, false);
        assert_ne!(base, submission(b"bytes", "dog.png", None, false));
        assert_ne!(base, submission(b"bytes", "cat.png", Some("pw"), false));
        assert_ne!(base, submission(b"bytes", "cat.png", None, true));
        assert_ne!(base, submission(b"other", "cat.png", None, false));
    }

    #[test]
    fn parse_round_trip() {
        let print = image(b"round trip");
        let parsed: Fingerprint<Image> = print.to_string().parse().expect("must parse");
        assert_eq!(print, parsed);
    }

    #[test]
    fn parse_rejects_bad_length() {
        let result = "abc123".parse::<Fingerprint<Image>>();
        assert!(matches!(result, Err(Error::Length(6))));
    }

    #[test]
    fn parse_rejects_non_hex() {
        let result = "zz150983cd24fb0d6963f7d28e17f72!".parse::<Fingerprint<Image>>();
        assert!(matches!(result, Err(Error::Encoding(_))));
    }

    #[test]
    fn serde_round_trip() {
        let print = submission(b"bytes", "cat.png", None, false);
        let encoded = serde_json::to_string(&print).expect("must serialize");
        let decoded: Fingerprint<Submission> =
            serde_json::from_str(&encoded).expect("must deserialize");
        assert_eq!(print, decoded);
    }
}
