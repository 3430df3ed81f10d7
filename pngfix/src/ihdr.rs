//! The IHDR chunk as a value.

use byteorder::{BigEndian, ByteOrder};
use getset::CopyGetters;

use crate::chunk_crc;

/// Length of the IHDR chunk data in bytes.
pub const IHDR_DATA_LEN: usize = 13;

/// The parameters a PNG declares in its IHDR chunk.
///
/// Compression and filter methods are always zero per the PNG spec, so they
/// are not stored; the encoding writes them as literal zeroes.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct Ihdr {
    /// Image width in pixels.
    width: u32,

    /// Image height in pixels.
    height: u32,

    /// Bits per sample or palette index.
    bit_depth: u8,

    /// PNG color type (0 grayscale, 2 truecolor, 3 indexed, 4 gray+alpha, 6 truecolor+alpha).
    color_type: u8,

    /// Interlace method (0 none, 1 Adam7).
    interlace: u8,
}

impl Ihdr {
    /// Construct from explicit parameters.
    pub fn new(width: u32, height: u32, bit_depth: u8, color_type: u8, interlace: u8) -> Self {
        Self {
            width,
            height,
            bit_depth,
            color_type,
            interlace,
        }
    }

    /// Parse from the 13 data bytes of an IHDR chunk.
    ///
    /// Returns `None` when the slice is not exactly 13 bytes.
    pub fn from_data(data: &[u8]) -> Option<Self> {
        if data.len() != IHDR_DATA_LEN {
            return None;
        }
        Some(Self {
            width: BigEndian::read_u32(&data[0..4]),
            height: BigEndian::read_u32(&data[4..8]),
            bit_depth: data[8],
            color_type: data[9],
            interlace: data[12],
        })
    }

    /// The canonical 13-byte chunk data.
    pub fn data(&self) -> [u8; IHDR_DATA_LEN] {
        let mut data = [0u8; IHDR_DATA_LEN];
        BigEndian::write_u32(&mut data[0..4], self.width);
        BigEndian::write_u32(&mut data[4..8], self.height);
        data[8] = self.bit_depth;
        data[9] = self.color_type;
        data[12] = self.interlace;
        data
    }

    /// The CRC32 a well-formed PNG stores for this chunk.
    pub fn crc(&self) -> u32 {
        chunk_crc(b"IHDR", &self.data())
    }
}

/// The valid (bit depth, color type) combinations from the PNG spec.
pub fn valid_depth_color_pairs() -> impl Iterator<Item = (u8, u8)> {
    const PAIRS: [(u8, &[u8]); 5] = [
        (0, &[1, 2, 4, 8, 16]),
        (2, &[8, 16]),
        (3, &[1, 2, 4, 8]),
        (4, &[8, 16]),
        (6, &[8, 16]),
    ];
    PAIRS
        .into_iter()
        .flat_map(|(color, depths)| depths.iter().map(move |&depth| (depth, color)))
}

/// The curated (width, height) set the CRC index is built from.
///
/// Base widths cover the common display, photography, and paper sizes from
/// 16px through 8K plus a 10000px upper bound; each is combined with the
/// usual aspect ratios in both orientations. Heights are constrained to
/// [1, 10000].
pub fn resolutions() -> Vec<(u32, u32)> {
    let base_widths = (16..=256)
        .step_by(16)
        .chain((320..=1024).step_by(32))
        .chain((1280..=2560).step_by(64))
        .chain((3000..=4096).step_by(128))
        .chain((5120..=8192).step_by(256))
        .chain([10000u32]);

    let aspect_ratios: [(u32, u32); 14] = [
        // Screens / digital
        (1, 1),
        (4, 3),
        (3, 2),
        (16, 10),
        (16, 9),
        (21, 9),
        (2, 1), // panorama
        // Photography / print
        (5, 4),  // 8x10
        (7, 5),  // 5x7
        (2, 3),  // poster
        // Paper standards
        (1414, 1000), // ISO A-series
        (11, 85),     // US Letter
        (14, 85),     // Legal
        (17, 11),     // Tabloid
    ];

    let mut set = std::collections::BTreeSet::new();
    for width in base_widths {
        for (ar_w, ar_h) in aspect_ratios {
            let height = (f64::from(width) * f64::from(ar_h) / f64::from(ar_w)).round() as u32;
            if (1..=10000).contains(&height) {
                set.insert((width, height));
                set.insert((height, width));
            }
        }
    }
    set.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_parse_round_trip() {
        let ihdr = Ihdr::new(640, 480, 8, 2, 0);
        let parsed = Ihdr::from_data(&ihdr.data()).expect("must parse");
        assert_eq!(ihdr, parsed);
    }

    #[test]
    fn data_layout_is_big_endian_with_zero_methods() {
        let ihdr = Ihdr::new(0x01020304, 0x0A0B0C0D, 16, 6, 1);
        let data = ihdr.data();
        assert_eq!(&data[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&data[4..8], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&data[8..], &[16, 6, 0, 0, 1]);
    }

    #[test]
    fn crc_matches_reference_chunk() {
        // IHDR of a plain 1x1 grayscale-8 PNG; reference value 3A 7E 9B 55
        // cross-checked against zlib's crc32.
        let ihdr = Ihdr::new(1, 1, 8, 0, 0);
        assert_eq!(ihdr.crc(), 0x3A7E_9B55);
    }

    #[test]
    fn depth_color_pairs_follow_the_png_spec() {
        let pairs: Vec<_> = valid_depth_color_pairs().collect();
        assert_eq!(pairs.len(), 15);
        assert!(pairs.contains(&(8, 0)));
        assert!(pairs.contains(&(8, 6)));
        assert!(!pairs.contains(&(16, 3)), "indexed color caps at 8 bits");
    }

    #[test]
    fn resolutions_include_the_common_squares_and_panoramas() {
        let all = resolutions();
        assert!(all.contains(&(64, 64)));
        assert!(all.contains(&(256, 128)));
        assert!(all.contains(&(128, 256)), "both orientations present");
        assert!(all.contains(&(1920, 1080)));
        assert!(all.iter().all(|&(_, h)| (1..=10000).contains(&h)));
    }
}
