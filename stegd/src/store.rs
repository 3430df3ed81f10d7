//! Layout of the content-addressed artifact store.
//!
//! One directory per image fingerprint holds the canonical blob plus one
//! subdirectory per submission fingerprint:
//!
//! ```not_rust
//! <result_root>/<image_fp>/<image_fp>.<ext>      # canonical blob
//! <result_root>/<image_fp>/<submission_fp>/
//!     results.json                               # aggregate document
//!     <analyzer>.7z                              # per-analyzer archives
//!     <generated>.png                            # derived images
//! <removed_root>/<image_fp>_<sub_fp>_<iso>.<ext> # quarantined removals
//! ```
//!
//! Ownership is partitioned by fingerprint, so concurrent writers never
//! collide on paths: the only shared file is the result document, which
//! has its own locking.

use std::{io, path::PathBuf};

use fingerprint::Fingerprint;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Path layout over the result and quarantine roots.
#[derive(Clone, Debug)]
pub struct Store {
    result_root: PathBuf,
    removed_root: PathBuf,
}

impl Store {
    /// Build a layout over the given roots.
    pub fn new(result_root: PathBuf, removed_root: PathBuf) -> Self {
        Self {
            result_root,
            removed_root,
        }
    }

    /// The directory owned by one image.
    pub fn image_dir(&self, image: &Fingerprint<fingerprint::Image>) -> PathBuf {
        self.result_root.join(image.to_string())
    }

    /// The canonical blob path for an image with the given extension.
    pub fn blob_path(&self, image: &Fingerprint<fingerprint::Image>, extension: &str) -> PathBuf {
        self.image_dir(image).join(format!("{image}.{extension}"))
    }

    /// The directory owned by one submission.
    pub fn submission_dir(
        &self,
        image: &Fingerprint<fingerprint::Image>,
        submission: &Fingerprint<fingerprint::Submission>,
    ) -> PathBuf {
        self.image_dir(image).join(submission.to_string())
    }

    /// The consolidated result document of one submission.
    pub fn results_path(
        &self,
        image: &Fingerprint<fingerprint::Image>,
        submission: &Fingerprint<fingerprint::Submission>,
    ) -> PathBuf {
        self.submission_dir(image, submission).join(report::DOCUMENT)
    }

    /// One analyzer's downloadable archive.
    pub fn archive_path(
        &self,
        image: &Fingerprint<fingerprint::Image>,
        submission: &Fingerprint<fingerprint::Submission>,
        analyzer: &str,
    ) -> PathBuf {
        self.submission_dir(image, submission)
            .join(format!("{analyzer}.7z"))
    }

    /// Where a removed image's blob is quarantined.
    pub fn quarantine_path(
        &self,
        image: &Fingerprint<fingerprint::Image>,
        submission: &Fingerprint<fingerprint::Submission>,
        extension: &str,
        when: OffsetDateTime,
    ) -> PathBuf {
        let stamp = when
            .format(&Rfc3339)
            .unwrap_or_else(|_| when.unix_timestamp().to_string());
        self.removed_root
            .join(format!("{image}_{submission}_{stamp}.{extension}"))
    }

    /// The quarantine root (created lazily at first removal).
    pub fn removed_root(&self) -> &PathBuf {
        &self.removed_root
    }

    /// Remove a directory tree, treating "already gone" as done.
    pub fn remove_tree(&self, path: &PathBuf) -> io::Result<()> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Remove every image directory under the result root. Used by the
    /// clear-at-restart switch.
    pub fn clear(&self) -> io::Result<()> {
        let entries = match std::fs::read_dir(&self.result_root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(entry.path())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::new(PathBuf::from("/results"), PathBuf::from("/removed"))
    }

    #[test]
    fn layout_is_partitioned_by_fingerprint() {
        let image = fingerprint::image(b"blob");
        let submission = fingerprint::submission(b"blob", "a.png", None, false);
        let store = store();

        assert_eq!(
            store.blob_path(&image, "png"),
            PathBuf::from(format!("/results/{image}/{image}.png"))
        );
        assert_eq!(
            store.results_path(&image, &submission),
            PathBuf::from(format!("/results/{image}/{submission}/results.json"))
        );
        assert_eq!(
            store.archive_path(&image, &submission, "binwalk"),
            PathBuf::from(format!("/results/{image}/{submission}/binwalk.7z"))
        );
    }

    #[test]
    fn quarantine_path_is_timestamped() {
        let image = fingerprint::image(b"blob");
        let submission = fingerprint::submission(b"blob", "a.png", None, false);
        let when = OffsetDateTime::from_unix_timestamp(1_700_000_000).expect("fixed timestamp");

        let path = store().quarantine_path(&image, &submission, "png", when);
        let name = path.file_name().expect("has a name").to_string_lossy();
        assert!(name.starts_with(&format!("{image}_{submission}_2023-11-14")));
        assert!(name.ends_with(".png"));
    }
}
