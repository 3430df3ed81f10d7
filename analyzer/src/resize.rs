//! The dimension recovery adapter.
//!
//! Wraps [`pngfix::recover`]: when the stored IHDR CRC disagrees with the
//! declared dimensions, every verified candidate is written out as
//! `recovered_<w>x<h>.png` for the result page to display.

use std::sync::Arc;

use async_trait::async_trait;
use pngfix::{IhdrIndex, Recovered};
use report::{Fragment, Output};
use tokio::task;

use crate::{Analyze, Error, Subject};

const NAME: &str = "image_resize";

/// Dimension-recovery adapter.
pub struct Resize {
    index: Arc<IhdrIndex>,
}

impl Resize {
    /// Build with a read view of the IHDR CRC index.
    pub fn new(index: Arc<IhdrIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl Analyze for Resize {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn analyze(&self, subject: &Subject) -> Result<Fragment, Error> {
        let index = Arc::clone(&self.index);
        let subject = subject.clone();
        // The height scan is CPU-bound; keep it off the runtime.
        task::spawn_blocking(move || recover(&subject, &index)).await?
    }
}

fn recover(subject: &Subject, index: &IhdrIndex) -> Result<Fragment, Error> {
    let raw = std::fs::read(subject.image())?;

    let recovered = match pngfix::recover(&raw, index) {
        Ok(recovered) => recovered,
        Err(pngfix::Error::Structure) => {
            return Ok(Fragment::error(
                "IHDR chunk is not the first chunk, or PNG has invalid structure.",
            ))
        }
        Err(err) => return Err(err.into()),
    };

    match recovered {
        Recovered::AlreadyValid { width, height, crc } => Ok(Fragment::ok_empty().with_note(
            format!("PNG is already valid with dimensions {width}x{height} and crc {crc:#010x}."),
        )),
        Recovered::Candidates(candidates) if candidates.is_empty() => {
            Ok(Fragment::error("Failure: No matching dimensions found."))
        }
        Recovered::Candidates(candidates) => {
            let stored = u32::from_be_bytes([raw[29], raw[30], raw[31], raw[32]]);
            let mut log = vec![format!("Target CRC found: {stored:#010x}")];
            let mut links = Vec::with_capacity(candidates.len());

            for candidate in candidates {
                let file_name = format!("recovered_{}x{}.png", candidate.width(), candidate.height());
                std::fs::write(subject.result_dir().join(&file_name), candidate.data())?;
                log.push(format!("Image saved: {file_name}"));
                links.push(subject.image_link(&file_name));
            }

            Ok(Fragment::ok(Output::Lines(log)).with_png_images(links))
        }
    }
}
