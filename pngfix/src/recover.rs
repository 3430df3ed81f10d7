//! Dimension recovery for PNGs whose IHDR CRC no longer matches the
//! declared width and height.
//!
//! CTF-style images are often "hidden" by shrinking the declared height so
//! viewers render a crop. The stored CRC still commits to the original
//! parameters, so candidates can be recovered by finding parameter sets
//! that hash to the stored CRC: the precomputed index first, then a height
//! scan at the declared width.

use byteorder::{BigEndian, ByteOrder};
use getset::{CopyGetters, Getters};

use crate::{find, Error, Ihdr, IhdrIndex, IHDR_DATA_LEN, PNG_HEADER};

/// Inclusive height range scanned when the index has no candidate.
const HEIGHT_SCAN: std::ops::RangeInclusive<u32> = 100..=3500;

/// One plausible corrected PNG.
#[derive(Debug, Getters, CopyGetters)]
pub struct Candidate {
    /// Recovered width in pixels.
    #[getset(get_copy = "pub")]
    width: u32,

    /// Recovered height in pixels.
    #[getset(get_copy = "pub")]
    height: u32,

    /// The input with only the two dimension fields replaced.
    #[getset(get = "pub")]
    data: Vec<u8>,
}

/// The outcome of a [`recover`] run.
#[derive(Debug)]
pub enum Recovered {
    /// The stored CRC already matches the declared parameters; there is
    /// nothing to recover.
    AlreadyValid {
        /// Declared width.
        width: u32,
        /// Declared height.
        height: u32,
        /// The (valid) stored CRC.
        crc: u32,
    },

    /// Candidate reconstructions, possibly empty when nothing matched.
    Candidates(Vec<Candidate>),
}

/// Propose corrected dimensions for `input`.
///
/// The input must start with the PNG header immediately followed by a
/// 13-byte IHDR chunk; anything else is [`Error::Structure`].
pub fn recover(input: &[u8], index: &IhdrIndex) -> Result<Recovered, Error> {
    let declared = parse_leading_ihdr(input).ok_or(Error::Structure)?;
    let stored = BigEndian::read_u32(&input[29..33]);

    if declared.crc() == stored {
        return Ok(Recovered::AlreadyValid {
            width: declared.width(),
            height: declared.height(),
            crc: stored,
        });
    }

    // Primary strategy: the precomputed index. Each hit is re-verified
    // because distinct parameter sets can collide on one CRC.
    let mut matches: Vec<Ihdr> = index
        .lookup(stored)?
        .into_iter()
        .filter(|candidate| candidate.crc() == stored)
        .collect();

    // Fallback: scan heights at the declared width and parameters.
    if matches.is_empty() {
        for height in HEIGHT_SCAN {
            let candidate = Ihdr::new(
                declared.width(),
                height,
                declared.bit_depth(),
                declared.color_type(),
                declared.interlace(),
            );
            if candidate.crc() == stored {
                matches.push(candidate);
            }
        }
    }

    let candidates = matches
        .into_iter()
        .map(|ihdr| Candidate {
            width: ihdr.width(),
            height: ihdr.height(),
            data: patch_dimensions(input, ihdr.width(), ihdr.height()),
        })
        .collect();
    Ok(Recovered::Candidates(candidates))
}

/// Replace the width and height fields of a PNG whose IHDR is the first
/// chunk, leaving every other byte untouched.
pub fn patch_dimensions(input: &[u8], width: u32, height: u32) -> Vec<u8> {
    let mut patched = Vec::with_capacity(input.len());
    patched.extend_from_slice(&input[..16]);
    let mut field = [0u8; 4];
    BigEndian::write_u32(&mut field, width);
    patched.extend_from_slice(&field);
    BigEndian::write_u32(&mut field, height);
    patched.extend_from_slice(&field);
    patched.extend_from_slice(&input[24..]);
    patched
}

/// Parse the IHDR when it is the first chunk after the header.
fn parse_leading_ihdr(input: &[u8]) -> Option<Ihdr> {
    if input.len() < 33 || input[..8] != PNG_HEADER {
        return None;
    }
    if find(input, b"IHDR", 0) != Some(12) {
        return None;
    }
    if BigEndian::read_u32(&input[8..12]) as usize != IHDR_DATA_LEN {
        return None;
    }
    Ihdr::from_data(&input[16..29])
}
