//! The LSB decomposer.
//!
//! For every 8-bit channel of the image, emit eight monochrome PNGs, one
//! per bit position, where each pixel is that bit of the channel scaled to
//! full white. Color images additionally get eight superimposed RGB
//! bit-plane images, which make cross-channel LSB patterns jump out.
//! Palette-indexed PNGs are decoded to RGB first and the conversion is
//! noted on the fragment.

use async_trait::async_trait;
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use indexmap::IndexMap;
use report::Fragment;
use tokio::task;

use crate::{Analyze, Error, Subject};

const NAME: &str = "decomposer";

/// Pure-image analyzer producing per-bit channel planes.
#[derive(Clone, Debug, Default)]
pub struct Decomposer {}

#[async_trait]
impl Analyze for Decomposer {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn analyze(&self, subject: &Subject) -> Result<Fragment, Error> {
        let subject = subject.clone();
        task::spawn_blocking(move || decompose(&subject)).await?
    }
}

fn decompose(subject: &Subject) -> Result<Fragment, Error> {
    let raw = std::fs::read(subject.image())?;
    let indexed = is_indexed_png(&raw);
    let decoded = image::load_from_memory(&raw)?;

    let mut groups: IndexMap<String, Vec<String>> = IndexMap::new();

    match decoded {
        DynamicImage::ImageLuma8(gray) => {
            let planes = channel_planes(subject, "Grayscale", gray.width(), gray.height(), |x, y| {
                gray.get_pixel(x, y).0[0]
            })?;
            groups.insert("Grayscale".to_string(), planes);
        }
        other if other.color().has_alpha() => {
            let rgba = other.to_rgba8();
            let (width, height) = (rgba.width(), rgba.height());
            groups.insert(
                "Superimposed".to_string(),
                superimposed_planes(subject, width, height, |x, y, c| rgba.get_pixel(x, y).0[c])?,
            );
            for (channel, label) in ["Red", "Green", "Blue", "Alpha"].into_iter().enumerate() {
                let planes = channel_planes(subject, label, width, height, |x, y| {
                    rgba.get_pixel(x, y).0[channel]
                })?;
                groups.insert(label.to_string(), planes);
            }
        }
        other => {
            let rgb = other.to_rgb8();
            let (width, height) = (rgb.width(), rgb.height());
            groups.insert(
                "Superimposed".to_string(),
                superimposed_planes(subject, width, height, |x, y, c| rgb.get_pixel(x, y).0[c])?,
            );
            for (channel, label) in ["Red", "Green", "Blue"].into_iter().enumerate() {
                let planes = channel_planes(subject, label, width, height, |x, y| {
                    rgb.get_pixel(x, y).0[channel]
                })?;
                groups.insert(label.to_string(), planes);
            }
        }
    }

    let mut fragment = Fragment::ok_empty().with_images(groups);
    if indexed {
        fragment = fragment
            .with_note("Image contains a color palette and was converted to RGB for processing.");
    }
    Ok(fragment)
}

/// Eight monochrome bit planes for one channel.
fn channel_planes(
    subject: &Subject,
    label: &str,
    width: u32,
    height: u32,
    sample: impl Fn(u32, u32) -> u8,
) -> Result<Vec<String>, Error> {
    let mut links = Vec::with_capacity(8);
    for bit in 0..8 {
        let plane = GrayImage::from_fn(width, height, |x, y| {
            Luma([((sample(x, y) >> bit) & 1) * 255])
        });
        let file_name = format!("{label}_bit_{bit}.png");
        plane.save(subject.result_dir().join(&file_name))?;
        links.push(subject.image_link(&file_name));
    }
    Ok(links)
}

/// Eight RGB bit planes with all three color channels superimposed.
fn superimposed_planes(
    subject: &Subject,
    width: u32,
    height: u32,
    sample: impl Fn(u32, u32, usize) -> u8,
) -> Result<Vec<String>, Error> {
    let mut links = Vec::with_capacity(8);
    for bit in 0..8 {
        let plane = RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                ((sample(x, y, 0) >> bit) & 1) * 255,
                ((sample(x, y, 1) >> bit) & 1) * 255,
                ((sample(x, y, 2) >> bit) & 1) * 255,
            ])
        });
        let file_name = format!("superimposed_bit_{bit}.png");
        plane.save(subject.result_dir().join(&file_name))?;
        links.push(subject.image_link(&file_name));
    }
    Ok(links)
}

/// Whether the raw bytes are a PNG with a palette-indexed color type.
pub(crate) fn is_indexed_png(raw: &[u8]) -> bool {
    raw.len() > 25
        && raw[..8] == pngfix::PNG_HEADER
        && &raw[12..16] == b"IHDR"
        && raw[25] == 3
}

#[cfg(test)]
mod tests {
    use image::RgbaImage;

    use super::*;

    fn subject_in(dir: &std::path::Path, image_name: &str) -> Subject {
        Subject::builder()
            .image(dir.join(image_name))
            .result_dir(dir.join("sub"))
            .build()
    }

    #[tokio::test]
    async fn grayscale_image_yields_one_channel() {
        let dir = tempfile::tempdir().expect("must create tempdir");
        std::fs::create_dir(dir.path().join("sub")).expect("must create");
        GrayImage::from_fn(4, 4, |x, _| Luma([(x * 60) as u8]))
            .save(dir.path().join("input.png"))
            .expect("must save fixture");

        let fragment = Decomposer::default()
            .analyze(&subject_in(dir.path(), "input.png"))
            .await
            .expect("must analyze");

        let Fragment::Ok { images: Some(groups), .. } = fragment else {
            panic!("expected an ok fragment with images");
        };
        assert_eq!(groups.keys().collect::<Vec<_>>(), ["Grayscale"]);
        assert_eq!(groups["Grayscale"].len(), 8);
        assert!(dir.path().join("sub/Grayscale_bit_0.png").exists());
    }

    #[tokio::test]
    async fn rgba_image_yields_superimposed_plus_four_channels() {
        let dir = tempfile::tempdir().expect("must create tempdir");
        std::fs::create_dir(dir.path().join("sub")).expect("must create");
        RgbaImage::from_fn(3, 3, |x, y| image::Rgba([x as u8, y as u8, 7, 255]))
            .save(dir.path().join("input.png"))
            .expect("must save fixture");

        let fragment = Decomposer::default()
            .analyze(&subject_in(dir.path(), "input.png"))
            .await
            .expect("must analyze");

        let Fragment::Ok { images: Some(groups), .. } = fragment else {
            panic!("expected an ok fragment with images");
        };
        assert_eq!(
            groups.keys().collect::<Vec<_>>(),
            ["Superimposed", "Red", "Green", "Blue", "Alpha"]
        );
        for planes in groups.values() {
            assert_eq!(planes.len(), 8);
        }
        assert!(dir.path().join("sub/superimposed_bit_7.png").exists());
    }

    #[test]
    fn bit_plane_math_scales_to_full_white() {
        // 0b0000_0101: bits 0 and 2 set.
        let sample = 0b0000_0101u8;
        assert_eq!(((sample >> 0) & 1) * 255, 255);
        assert_eq!(((sample >> 1) & 1) * 255, 0);
        assert_eq!(((sample >> 2) & 1) * 255, 255);
    }

    #[test]
    fn indexed_png_detection_reads_the_color_type() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&pngfix::PNG_HEADER);
        raw.extend_from_slice(&[0, 0, 0, 13]);
        raw.extend_from_slice(b"IHDR");
        raw.extend_from_slice(&pngfix::Ihdr::new(4, 4, 8, 3, 0).data());
        assert!(is_indexed_png(&raw));

        let mut truecolor = raw.clone();
        truecolor[25] = 2;
        assert!(!is_indexed_png(&truecolor));
        assert!(!is_indexed_png(b"JFIF not a png"));
    }
}
