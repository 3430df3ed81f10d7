//! The color remapping analyzer.
//!
//! Eight rounds of pushing every RGB sample through a random byte table.
//! Remapping does not need to be a bijection: the point is to break up
//! near-uniform regions so content hidden in slight color differences
//! becomes visible. Alpha is carried through untouched.

use async_trait::async_trait;
use image::{Rgb, RgbImage, Rgba, RgbaImage};
use indexmap::IndexMap;
use rand::Rng;
use report::Fragment;
use tokio::task;

use crate::{decompose::is_indexed_png, Analyze, Error, Subject};

const NAME: &str = "color_remapping";
const ROUNDS: usize = 8;

/// Pure-image analyzer producing randomized color remaps.
#[derive(Clone, Debug, Default)]
pub struct ColorRemap {}

#[async_trait]
impl Analyze for ColorRemap {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn analyze(&self, subject: &Subject) -> Result<Fragment, Error> {
        let subject = subject.clone();
        task::spawn_blocking(move || remap(&subject)).await?
    }
}

fn remap(subject: &Subject) -> Result<Fragment, Error> {
    let raw = std::fs::read(subject.image())?;
    let indexed = is_indexed_png(&raw);
    let decoded = image::load_from_memory(&raw)?;

    let mut links = Vec::with_capacity(ROUNDS);
    let mut rng = rand::thread_rng();

    for round in 0..ROUNDS {
        let table: [u8; 256] = std::array::from_fn(|_| rng.gen());
        let file_name = format!("color_remapping_{round:02}.png");

        if decoded.color().has_alpha() {
            let rgba = decoded.to_rgba8();
            let remapped = RgbaImage::from_fn(rgba.width(), rgba.height(), |x, y| {
                let [r, g, b, a] = rgba.get_pixel(x, y).0;
                Rgba([table[r as usize], table[g as usize], table[b as usize], a])
            });
            remapped.save(subject.result_dir().join(&file_name))?;
        } else {
            let rgb = decoded.to_rgb8();
            let remapped = RgbImage::from_fn(rgb.width(), rgb.height(), |x, y| {
                let [r, g, b] = rgb.get_pixel(x, y).0;
                Rgb([table[r as usize], table[g as usize], table[b as usize]])
            });
            remapped.save(subject.result_dir().join(&file_name))?;
        }

        links.push(subject.image_link(&file_name));
    }

    let mut groups = IndexMap::new();
    groups.insert("Color Remapping".to_string(), links);
    let mut fragment = Fragment::ok_empty().with_images(groups);
    if indexed {
        fragment = fragment
            .with_note("Image contains a color palette and was converted to RGB for processing.");
    }
    Ok(fragment)
}

#[cfg(test)]
mod tests {
    use image::GrayImage;

    use super::*;

    #[tokio::test]
    async fn eight_remaps_are_generated() {
        let dir = tempfile::tempdir().expect("must create tempdir");
        std::fs::create_dir(dir.path().join("sub")).expect("must create");
        GrayImage::from_fn(4, 4, |x, y| image::Luma([(x + y) as u8]))
            .save(dir.path().join("input.png"))
            .expect("must save fixture");

        let subject = Subject::builder()
            .image(dir.path().join("input.png"))
            .result_dir(dir.path().join("sub"))
            .build();
        let fragment = ColorRemap::default()
            .analyze(&subject)
            .await
            .expect("must analyze");

        let Fragment::Ok { images: Some(groups), .. } = fragment else {
            panic!("expected an ok fragment with images");
        };
        assert_eq!(groups["Color Remapping"].len(), ROUNDS);
        for round in 0..ROUNDS {
            assert!(dir
                .path()
                .join(format!("sub/color_remapping_{round:02}.png"))
                .exists());
        }
    }

    #[tokio::test]
    async fn alpha_channel_is_preserved() {
        let dir = tempfile::tempdir().expect("must create tempdir");
        std::fs::create_dir(dir.path().join("sub")).expect("must create");
        RgbaImage::from_fn(2, 2, |_, _| Rgba([10, 20, 30, 42]))
            .save(dir.path().join("input.png"))
            .expect("must save fixture");

        let subject = Subject::builder()
            .image(dir.path().join("input.png"))
            .result_dir(dir.path().join("sub"))
            .build();
        ColorRemap::default()
            .analyze(&subject)
            .await
            .expect("must analyze");

        let remapped = image::open(dir.path().join("sub/color_remapping_00.png"))
            .expect("must reopen")
            .to_rgba8();
        assert!(remapped.pixels().all(|pixel| pixel.0[3] == 42));
    }
}
