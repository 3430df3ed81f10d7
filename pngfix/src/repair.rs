//! Chunk-by-chunk reconstruction of a possibly-corrupt PNG.
//!
//! The engine walks the input in PNG order (header, IHDR, critical
//! ancillary chunks, IDAT chunks, IEND), validating each piece and
//! rebuilding it into a fresh buffer. Every decision is appended to a
//! human-readable step log; unrecoverable conditions land in an error list
//! instead. Bytes trailing the IEND chunk are not part of a PNG at all and
//! are handed back separately for the caller to preserve as an artifact.
//!
//! Repair is idempotent: feeding the reconstruction back through the engine
//! reproduces it byte for byte with nothing left to fix.

use byteorder::{BigEndian, ByteOrder};
use getset::{CopyGetters, Getters};
use itertools::Itertools;
use tracing::debug;

use crate::{chunk_crc, find, Ihdr, IhdrIndex, IHDR_DATA_LEN};

/// The 8-byte PNG file header.
pub const PNG_HEADER: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// The canonical 12-byte IEND chunk (zero length, type, CRC).
pub const CANONICAL_IEND: [u8; 12] = [
    0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

/// Ancillary chunk types that are critical to rendering and worth carrying
/// into the reconstruction. Anything else between IHDR and IDAT is dropped.
const CRITICAL_ANCILLARY: [&[u8; 4]; 11] = [
    b"PLTE", b"tRNS", b"cHRM", b"gAMA", b"iCCP", b"sBIT", b"sRGB", b"bKGD", b"hIST", b"pHYs",
    b"sPLT",
];

/// Exclusive upper bound for the width/height brute-force search used when
/// the CRC index has no candidate for a broken IHDR.
const DIMENSION_SEARCH_LIMIT: u32 = 5000;

/// Upper bound on CRC attempts for the IDAT line-ending repair. The search
/// space is C(newline positions, missing bytes) and grows combinatorially.
const DOS2UNIX_ATTEMPT_CAP: usize = 200_000;

/// The outcome of a [`repair`] run.
#[derive(Debug, Getters, CopyGetters)]
pub struct Repair {
    /// Whether any step changed bytes relative to the input.
    #[getset(get_copy = "pub")]
    fixed: bool,

    /// The reconstructed PNG. Empty when the input failed the format gate.
    #[getset(get = "pub")]
    data: Vec<u8>,

    /// Human-readable log of every step taken.
    #[getset(get = "pub")]
    log: Vec<String>,

    /// Unrecoverable conditions. Non-empty means the reconstruction is not
    /// trustworthy and the caller should report failure.
    #[getset(get = "pub")]
    errors: Vec<String>,

    /// Bytes found after the IEND chunk, verbatim.
    #[getset(get = "pub")]
    extra: Option<Vec<u8>>,
}

/// Rebuild `input` into a structurally valid PNG.
///
/// `index` is the CRC lookup used for IHDR dimension recovery; pass `None`
/// to fall straight through to the brute-force search.
pub fn repair(input: &[u8], index: Option<&IhdrIndex>) -> Repair {
    let mut engine = Engine {
        input,
        index,
        out: Vec::with_capacity(input.len()),
        log: Vec::new(),
        errors: Vec::new(),
        fixed: false,
    };

    // Sanity gate: a buffer with none of the structural tags is not worth
    // walking chunk by chunk.
    let all_tags = [&b"IHDR"[..], b"IDAT", b"IEND"]
        .iter()
        .all(|tag| find(input, tag, 0).is_some());
    if !all_tags {
        engine.errors.push("File may not be a PNG image".into());
        return engine.finish(None);
    }

    engine.check_header();
    engine.check_ihdr();
    engine.check_ancillary();
    engine.check_idat();
    let extra = engine.check_iend();
    engine.finish(extra)
}

struct Engine<'a> {
    input: &'a [u8],
    index: Option<&'a IhdrIndex>,
    out: Vec<u8>,
    log: Vec<String>,
    errors: Vec<String>,
    fixed: bool,
}

impl<'a> Engine<'a> {
    fn finish(self, extra: Option<Vec<u8>>) -> Repair {
        Repair {
            fixed: self.fixed,
            data: self.out,
            log: self.log,
            errors: self.errors,
            extra,
        }
    }

    fn log(&mut self, message: impl Into<String>) {
        self.log.push(message.into());
    }

    fn check_header(&mut self) {
        let header = self.input.get(..8).unwrap_or_default();
        if header == PNG_HEADER {
            self.log("Correct PNG header");
        } else {
            let shown = hex_upper(header);
            self.log(format!("Wrong PNG header: {shown}"));
            self.log("Fixed header to: 89504E470D0A1A0A");
            self.fixed = true;
        }
        self.out.extend_from_slice(&PNG_HEADER);
    }

    fn check_ihdr(&mut self) {
        let Some(pos) = find(self.input, b"IHDR", 0) else {
            self.errors.push("Lost IHDR chunk".into());
            return;
        };
        let Some(chunk) = parse_chunk_at(self.input, pos) else {
            self.errors.push("Lost IHDR chunk".into());
            return;
        };

        let mut data = chunk.data.to_vec();
        let stored = chunk.stored_crc;
        let computed = chunk_crc(b"IHDR", &data);

        if computed == stored {
            self.log(format!(
                "Correct IHDR CRC at offset {:#X}",
                chunk.crc_offset()
            ));
        } else {
            self.log(format!(
                "Error IHDR CRC found at offset {:#X}",
                chunk.crc_offset()
            ));
            self.log(format!(
                "Chunk crc: {stored:08X}, Correct crc: {computed:08X}"
            ));
            match self.recover_ihdr(&data, stored) {
                Some(recovered) => {
                    data = recovered.data().to_vec();
                    self.log(format!(
                        "Recovered IHDR: {}x{}, bit_depth={}, color_type={}, interlace={}",
                        recovered.width(),
                        recovered.height(),
                        recovered.bit_depth(),
                        recovered.color_type(),
                        recovered.interlace(),
                    ));
                    self.fixed = true;
                }
                None => self.errors.push("Could not recover IHDR dimensions".into()),
            }
        }

        self.push_chunk(b"IHDR", &data, stored);
        self.log(format!(
            "IHDR chunk check complete at offset {:#X}",
            chunk.start
        ));
    }

    /// Find IHDR parameters whose CRC equals the stored value: first the
    /// precomputed index, then a row-major width/height sweep keeping the
    /// declared depth, color type, and interlace.
    fn recover_ihdr(&mut self, declared: &[u8], stored: u32) -> Option<Ihdr> {
        if let Some(index) = self.index {
            self.log("Looking up CRC in index...");
            match index.lookup(stored) {
                Ok(candidates) => {
                    for candidate in candidates {
                        if candidate.crc() == stored {
                            self.log("Found matching IHDR configuration in index");
                            return Some(candidate);
                        }
                    }
                }
                Err(err) => self.log(format!("Index lookup failed: {err}")),
            }
        }

        if declared.len() != IHDR_DATA_LEN {
            return None;
        }
        self.log("No index match found, falling back to exhaustive search...");
        let bit_depth = declared[8];
        let color_type = declared[9];
        let interlace = declared[12];
        for width in 1..DIMENSION_SEARCH_LIMIT {
            for height in 1..DIMENSION_SEARCH_LIMIT {
                let candidate = Ihdr::new(width, height, bit_depth, color_type, interlace);
                if candidate.crc() == stored {
                    self.log(format!(
                        "Found correct dimensions via exhaustive search: {width}x{height}"
                    ));
                    return Some(candidate);
                }
            }
        }
        None
    }

    /// Carry the critical ancillary chunks between IHDR and the first IDAT
    /// into the reconstruction, in order of appearance, each with a
    /// validated CRC.
    fn check_ancillary(&mut self) {
        let input = self.input;
        let Some(ihdr_pos) = find(input, b"IHDR", 0) else {
            return;
        };
        let Some(idat_pos) = find(input, b"IDAT", 0) else {
            return;
        };
        let Some(ihdr_length) = length_before_tag(input, ihdr_pos) else {
            return;
        };
        let search_start = ihdr_pos + 4 + ihdr_length + 4;

        let mut found: Vec<(usize, &'static [u8; 4])> = Vec::new();
        for chunk_type in CRITICAL_ANCILLARY {
            let mut at = search_start;
            while at < idat_pos {
                let Some(pos) = find(input, chunk_type, at) else {
                    break;
                };
                if pos >= idat_pos {
                    break;
                }
                found.push((pos, chunk_type));
                at = pos + 4;
            }
        }
        found.sort_by_key(|&(pos, _)| pos);

        for (pos, chunk_type) in found {
            let Some(chunk) = parse_chunk_at(input, pos) else {
                continue;
            };
            let computed = chunk_crc(chunk_type, chunk.data);
            if computed != chunk.stored_crc {
                self.log(format!(
                    "Error {} CRC at offset {:#X}, fixed to {computed:08X}",
                    String::from_utf8_lossy(chunk_type),
                    chunk.crc_offset(),
                ));
                self.fixed = true;
            } else {
                self.log(format!(
                    "Copied {} chunk ({} bytes)",
                    String::from_utf8_lossy(chunk_type),
                    chunk.data.len(),
                ));
            }
            self.push_chunk(chunk_type, chunk.data, computed);
        }
    }

    fn check_idat(&mut self) {
        let input = self.input;
        let Some(first) = find(input, b"IDAT", 0) else {
            self.errors.push("Lost all IDAT chunks".into());
            return;
        };
        let iend_pos = find(input, b"IEND", 0);

        // Tag positions of every IDAT chunk before IEND. Chunk boundaries
        // are derived from neighboring tags rather than the length fields,
        // since the length fields are exactly what may be corrupt.
        let mut tags = Vec::new();
        let mut at = first;
        while let Some(pos) = find(input, b"IDAT", at) {
            if iend_pos.is_some_and(|end| pos >= end) {
                break;
            }
            if pos >= 4 {
                tags.push(pos);
            }
            at = pos + 4;
        }

        for (i, &pos) in tags.iter().enumerate() {
            let chunk_start = pos - 4;
            let chunk_end = match tags.get(i + 1) {
                Some(&next) => next - 4,
                None => iend_pos.map(|end| end - 4).unwrap_or(input.len()),
            };
            if chunk_end <= chunk_start {
                continue;
            }
            let chunk = &input[chunk_start..chunk_end];
            if chunk.len() < 12 {
                self.log(format!("Skipping truncated IDAT at offset {chunk_start:#X}"));
                continue;
            }

            let length = BigEndian::read_u32(&chunk[0..4]) as usize;
            let data = &chunk[8..chunk.len() - 4];
            let stored = BigEndian::read_u32(&chunk[chunk.len() - 4..]);

            if length != data.len() {
                self.log(format!(
                    "Error IDAT chunk data length at offset {chunk_start:#X}"
                ));
                self.log(format!("Length: {:#X}, Actual: {:#X}", length, data.len()));
                let missing = length.abs_diff(data.len());
                match fix_dos2unix(data, stored, missing) {
                    Some(restored) => {
                        self.log("Successfully recovered IDAT chunk data (DOS->Unix fix)");
                        self.push_chunk(b"IDAT", &restored, stored);
                        self.fixed = true;
                    }
                    None => {
                        self.log("Failed to fix IDAT chunk, using original");
                        self.out.extend_from_slice(chunk);
                    }
                }
            } else {
                let computed = chunk_crc(b"IDAT", data);
                if computed != stored {
                    self.log(format!(
                        "Error IDAT CRC at offset {:#X}",
                        chunk_start + 8 + length
                    ));
                    self.log(format!("Chunk crc: {stored:08X}, Correct: {computed:08X}"));
                    self.log("Successfully fixed CRC");
                    self.fixed = true;
                }
                self.push_chunk(b"IDAT", data, computed);
            }
        }

        self.log(format!(
            "IDAT chunk check complete at offset {:#X}",
            first - 4
        ));
    }

    fn check_iend(&mut self) -> Option<Vec<u8>> {
        let input = self.input;
        let mut extra = None;
        match find(input, b"IEND", 0) {
            None => {
                self.log("Lost IEND chunk, adding standard IEND");
                self.fixed = true;
            }
            Some(pos) => {
                let start = pos.saturating_sub(4);
                let stored = input.get(start..pos + 8).unwrap_or_default();
                if stored == CANONICAL_IEND {
                    self.log("Correct IEND chunk");
                } else {
                    self.log("Error IEND chunk, fixing...");
                    self.fixed = true;
                }
                let trailing = &input[(pos + 8).min(input.len())..];
                if !trailing.is_empty() {
                    let head = hex_upper(&trailing[..trailing.len().min(20)]);
                    self.log(format!("Found {} bytes after IEND: {head}", trailing.len()));
                    extra = Some(trailing.to_vec());
                }
            }
        }
        self.out.extend_from_slice(&CANONICAL_IEND);
        self.log("IEND chunk check complete");
        extra
    }

    /// Append a chunk as `[length][type][data][crc]`.
    fn push_chunk(&mut self, chunk_type: &[u8; 4], data: &[u8], crc: u32) {
        let mut length = [0u8; 4];
        BigEndian::write_u32(&mut length, data.len() as u32);
        self.out.extend_from_slice(&length);
        self.out.extend_from_slice(chunk_type);
        self.out.extend_from_slice(data);
        let mut trailer = [0u8; 4];
        BigEndian::write_u32(&mut trailer, crc);
        self.out.extend_from_slice(&trailer);
    }
}

struct Chunk<'a> {
    start: usize,
    length: usize,
    data: &'a [u8],
    stored_crc: u32,
}

impl Chunk<'_> {
    fn crc_offset(&self) -> usize {
        self.start + 8 + self.length
    }
}

fn length_before_tag(input: &[u8], tag_pos: usize) -> Option<usize> {
    let start = tag_pos.checked_sub(4)?;
    let raw = input.get(start..tag_pos)?;
    Some(BigEndian::read_u32(raw) as usize)
}

/// Parse the chunk whose type tag sits at `tag_pos`, trusting its length
/// field for the data extent.
fn parse_chunk_at(input: &[u8], tag_pos: usize) -> Option<Chunk<'_>> {
    let start = tag_pos.checked_sub(4)?;
    let length = length_before_tag(input, tag_pos)?;
    let data = input.get(tag_pos + 4..tag_pos + 4 + length)?;
    let raw_crc = input.get(tag_pos + 4 + length..tag_pos + 8 + length)?;
    Some(Chunk {
        start,
        length,
        data,
        stored_crc: BigEndian::read_u32(raw_crc),
    })
}

/// Undo a DOS→Unix line-ending conversion applied to chunk data: find the
/// combination of `missing` newline positions where re-inserting `0x0D`
/// before each produces data whose CRC matches the stored value.
///
/// Combinations are tried in lexicographic order and the first match wins.
/// The search is capped; a cap hit is treated as no match.
fn fix_dos2unix(data: &[u8], stored_crc: u32, missing: usize) -> Option<Vec<u8>> {
    if missing == 0 {
        return None;
    }
    let newlines: Vec<usize> = data
        .iter()
        .enumerate()
        .filter(|(_, &byte)| byte == 0x0A)
        .map(|(at, _)| at)
        .collect();
    if newlines.len() < missing {
        return None;
    }

    let mut attempts = 0usize;
    for combo in newlines.iter().combinations(missing) {
        attempts += 1;
        if attempts > DOS2UNIX_ATTEMPT_CAP {
            debug!(cap = DOS2UNIX_ATTEMPT_CAP, "dos2unix search cap reached");
            return None;
        }

        let mut restored = Vec::with_capacity(data.len() + missing);
        let mut last = 0usize;
        for &&at in &combo {
            restored.extend_from_slice(&data[last..at]);
            restored.push(0x0D);
            last = at;
        }
        restored.extend_from_slice(&data[last..]);

        if chunk_crc(b"IDAT", &restored) == stored_crc {
            return Some(restored);
        }
    }
    None
}

fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02X}")).collect()
}

#[cfg(test)]
mod tests;
