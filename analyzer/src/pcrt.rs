//! The PNG check-and-repair adapter.
//!
//! Runs the repair engine over the raw bytes, materializes the
//! reconstruction as a downloadable PNG when anything changed, and
//! preserves any bytes found after IEND as an archived artifact; trailing
//! data is the classic place to hide a second file.

use std::sync::Arc;

use async_trait::async_trait;
use pngfix::IhdrIndex;
use report::{Fragment, Output};
use tokio::{fs, task};

use crate::{driver::archive_extracted, Analyze, Error, Subject};

const NAME: &str = "pcrt";

/// Repair-engine adapter.
pub struct Pcrt {
    index: Arc<IhdrIndex>,
}

impl Pcrt {
    /// Build with a read view of the IHDR CRC index.
    pub fn new(index: Arc<IhdrIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl Analyze for Pcrt {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn analyze(&self, subject: &Subject) -> Result<Fragment, Error> {
        let index = Arc::clone(&self.index);
        let image = subject.image().clone();
        // The engine may fall back to a CRC sweep; keep it off the runtime.
        let outcome = task::spawn_blocking(move || {
            let raw = std::fs::read(image)?;
            Ok::<_, Error>(pngfix::repair(&raw, Some(&index)))
        })
        .await??;

        if !outcome.errors().is_empty() {
            return Ok(Fragment::error(outcome.errors().join("\n"))
                .with_output(Output::Lines(outcome.log().clone())));
        }

        let log = if outcome.log().is_empty() {
            vec!["PNG appears valid, no repairs needed".to_string()]
        } else {
            outcome.log().clone()
        };
        let mut fragment = Fragment::ok(Output::Lines(log));
        let mut notes: Vec<&str> = Vec::new();

        if outcome.fixed() && !outcome.data().is_empty() {
            let stem = subject
                .image()
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .unwrap_or_default();
            let file_name = format!("pcrt_recovered_{stem}.png");
            fs::write(subject.result_dir().join(&file_name), outcome.data()).await?;
            fragment = fragment.with_png_images(vec![subject.image_link(&file_name)]);
            notes.push("PNG was repaired and saved");
        }

        if let Some(extra) = outcome.extra() {
            let extraction_dir = subject.extraction_dir(NAME);
            fs::create_dir_all(&extraction_dir).await?;
            fs::write(extraction_dir.join("extra_data.bin"), extra).await?;
            if archive_extracted(NAME, &extraction_dir, subject.timeout()).await? {
                fragment = fragment.with_download(subject.download_link(NAME));
            }
            notes.push("Extra data found after IEND");
        }

        if !notes.is_empty() {
            fragment = fragment.with_note(notes.join(" | "));
        }
        Ok(fragment)
    }
}
