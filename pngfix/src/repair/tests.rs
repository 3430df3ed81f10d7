//! Tests for the repair engine.
//!
//! Fixtures are synthesized byte by byte: the engine only cares about
//! structure, so IDAT payloads don't need to inflate to real pixels.

use byteorder::{BigEndian, ByteOrder};

use super::*;
use crate::{patch_dimensions, IhdrIndex};

fn chunk(chunk_type: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut field = [0u8; 4];
    BigEndian::write_u32(&mut field, data.len() as u32);
    out.extend_from_slice(&field);
    out.extend_from_slice(chunk_type);
    out.extend_from_slice(data);
    BigEndian::write_u32(&mut field, chunk_crc(chunk_type, data));
    out.extend_from_slice(&field);
    out
}

/// Header + IHDR + one IDAT + IEND, all CRC-consistent.
fn minimal_png(ihdr: Ihdr) -> Vec<u8> {
    let mut png = Vec::new();
    png.extend_from_slice(&PNG_HEADER);
    png.extend_from_slice(&chunk(b"IHDR", &ihdr.data()));
    png.extend_from_slice(&chunk(b"IDAT", &[0x78, 0x9C, 0x62, 0x00, 0x00]));
    png.extend_from_slice(&CANONICAL_IEND);
    png
}

#[test]
fn valid_png_passes_through_unchanged() {
    let png = minimal_png(Ihdr::new(64, 64, 8, 0, 0));
    let outcome = repair(&png, None);

    assert!(!outcome.fixed());
    assert!(outcome.errors().is_empty());
    assert!(outcome.extra().is_none());
    assert_eq!(outcome.data(), &png);
}

#[test]
fn repair_is_idempotent() {
    let mut png = minimal_png(Ihdr::new(64, 64, 8, 0, 0));
    png[0] = 0x00; // break the header
    let first = repair(&png, None);
    assert!(first.fixed());

    let second = repair(first.data(), None);
    assert!(!second.fixed(), "second pass must find nothing to fix");
    assert_eq!(second.data(), first.data());
}

#[test]
fn format_gate_rejects_non_png() {
    let outcome = repair(b"MZ\x90\x00 this is not a png at all", None);
    assert!(!outcome.fixed());
    assert!(outcome
        .errors()
        .iter()
        .any(|e| e == "File may not be a PNG image"));
    assert!(outcome.data().is_empty());
}

#[test]
fn wrong_header_is_replaced() {
    let mut png = minimal_png(Ihdr::new(64, 64, 8, 0, 0));
    png[..8].copy_from_slice(b"GARBAGE!");

    let outcome = repair(&png, None);
    assert!(outcome.fixed());
    assert_eq!(&outcome.data()[..8], &PNG_HEADER);
    assert_eq!(outcome.data()[8..], png[8..]);
}

#[test]
fn tampered_width_is_recovered_from_index() {
    // Scenario: a 64x64 grayscale-8 PNG whose width field was overwritten
    // without touching the IHDR CRC.
    let index = IhdrIndex::in_memory().expect("must populate");
    let original = minimal_png(Ihdr::new(64, 64, 8, 0, 0));
    let tampered = patch_dimensions(&original, 31337, 64);

    let outcome = repair(&tampered, Some(&index));
    assert!(outcome.fixed());
    assert!(outcome.errors().is_empty());
    assert_eq!(outcome.data(), &original);

    let recovered = Ihdr::from_data(&outcome.data()[16..29]).expect("must parse");
    assert_eq!(
        (recovered.width(), recovered.height()),
        (64, 64),
        "dimensions restored"
    );
    assert_eq!(recovered.bit_depth(), 8);
    assert_eq!(recovered.color_type(), 0);
    assert_eq!(recovered.interlace(), 0);
    assert_eq!(recovered.crc(), Ihdr::new(64, 64, 8, 0, 0).crc());
}

#[test]
fn tampered_width_falls_back_to_exhaustive_search() {
    // 3x5 is nowhere near the curated resolution set, so only the sweep
    // can find it. The sweep visits small widths first, keeping this fast.
    let original = minimal_png(Ihdr::new(3, 5, 8, 0, 0));
    let tampered = patch_dimensions(&original, 100, 5);

    let outcome = repair(&tampered, None);
    assert!(outcome.fixed());
    assert_eq!(outcome.data(), &original);
}

#[test]
fn unrecoverable_ihdr_is_reported() {
    // A truncated IHDR (12 data bytes instead of 13) with a broken CRC:
    // there are no declared parameters to sweep from, so recovery is
    // exhausted immediately.
    let mut png = Vec::new();
    png.extend_from_slice(&PNG_HEADER);
    png.extend_from_slice(&chunk(b"IHDR", &Ihdr::new(3, 5, 8, 0, 0).data()[..12]));
    let crc_at = png.len() - 4;
    png[crc_at..].copy_from_slice(&[0x00, 0x00, 0x00, 0x01]);
    png.extend_from_slice(&chunk(b"IDAT", &[0x78, 0x9C, 0x62, 0x00, 0x00]));
    png.extend_from_slice(&CANONICAL_IEND);

    let outcome = repair(&png, None);
    assert!(outcome
        .errors()
        .iter()
        .any(|e| e == "Could not recover IHDR dimensions"));
}

#[test]
fn critical_ancillary_chunk_crc_is_fixed_and_order_kept() {
    let ihdr = Ihdr::new(16, 16, 8, 2, 0);
    let mut png = Vec::new();
    png.extend_from_slice(&PNG_HEADER);
    png.extend_from_slice(&chunk(b"IHDR", &ihdr.data()));

    // gAMA then PLTE, gAMA's CRC broken.
    let mut gama = chunk(b"gAMA", &[0x00, 0x00, 0xB1, 0x8F]);
    let at = gama.len() - 1;
    gama[at] ^= 0xFF;
    png.extend_from_slice(&gama);
    png.extend_from_slice(&chunk(b"PLTE", &[1, 2, 3, 4, 5, 6]));

    let idat = chunk(b"IDAT", &[0x78, 0x9C, 0x62, 0x00, 0x00]);
    png.extend_from_slice(&idat);
    png.extend_from_slice(&CANONICAL_IEND);

    let outcome = repair(&png, None);
    assert!(outcome.fixed());
    assert!(outcome.errors().is_empty());

    let gama_at = find(outcome.data(), b"gAMA", 0).expect("gAMA kept");
    let plte_at = find(outcome.data(), b"PLTE", 0).expect("PLTE kept");
    assert!(gama_at < plte_at, "appearance order preserved");

    // The repaired gAMA CRC must validate.
    let data = &outcome.data()[gama_at + 4..gama_at + 8];
    let stored = BigEndian::read_u32(&outcome.data()[gama_at + 8..gama_at + 12]);
    assert_eq!(chunk_crc(b"gAMA", data), stored);
}

#[test]
fn non_critical_chunks_are_dropped() {
    let ihdr = Ihdr::new(16, 16, 8, 0, 0);
    let mut png = Vec::new();
    png.extend_from_slice(&PNG_HEADER);
    png.extend_from_slice(&chunk(b"IHDR", &ihdr.data()));
    png.extend_from_slice(&chunk(b"tEXt", b"Comment\x00hidden"));
    png.extend_from_slice(&chunk(b"IDAT", &[0x78, 0x9C, 0x62, 0x00, 0x00]));
    png.extend_from_slice(&CANONICAL_IEND);

    let outcome = repair(&png, None);
    assert!(find(outcome.data(), b"tEXt", 0).is_none());
}

#[test]
fn idat_crc_is_replaced_when_wrong() {
    let mut png = minimal_png(Ihdr::new(16, 16, 8, 0, 0));
    let idat_at = find(&png, b"IDAT", 0).expect("fixture has IDAT");
    let crc_at = idat_at + 4 + 5; // tag + 5 data bytes
    png[crc_at] ^= 0xFF;

    let outcome = repair(&png, None);
    assert!(outcome.fixed());

    let repaired_at = find(outcome.data(), b"IDAT", 0).expect("IDAT kept");
    let data = &outcome.data()[repaired_at + 4..repaired_at + 9];
    let stored = BigEndian::read_u32(&outcome.data()[repaired_at + 9..repaired_at + 13]);
    assert_eq!(chunk_crc(b"IDAT", data), stored);
}

#[test]
fn idat_dos2unix_damage_is_restored() {
    // Original IDAT payload contains a CRLF pair; simulate a DOS->Unix
    // conversion by deleting the 0x0D while keeping the declared length
    // and CRC of the original payload.
    let payload = [0x78, 0x0D, 0x0A, 0x62, 0x0A, 0x00];
    let damaged: Vec<u8> = payload.iter().copied().filter(|&b| b != 0x0D).collect();

    let ihdr = Ihdr::new(16, 16, 8, 0, 0);
    let mut png = Vec::new();
    png.extend_from_slice(&PNG_HEADER);
    png.extend_from_slice(&chunk(b"IHDR", &ihdr.data()));

    let mut field = [0u8; 4];
    BigEndian::write_u32(&mut field, payload.len() as u32); // declared length: original
    png.extend_from_slice(&field);
    png.extend_from_slice(b"IDAT");
    png.extend_from_slice(&damaged); // actual data: one byte short
    BigEndian::write_u32(&mut field, chunk_crc(b"IDAT", &payload));
    png.extend_from_slice(&field);
    png.extend_from_slice(&CANONICAL_IEND);

    let outcome = repair(&png, None);
    assert!(outcome.fixed());

    let at = find(outcome.data(), b"IDAT", 0).expect("IDAT kept");
    let restored = &outcome.data()[at + 4..at + 4 + payload.len()];
    assert_eq!(restored, payload);
}

#[test]
fn trailing_bytes_are_surfaced() {
    let mut png = minimal_png(Ihdr::new(16, 16, 8, 0, 0));
    png.extend_from_slice(b"PK\x03\x04 hidden zip");

    let outcome = repair(&png, None);
    assert!(!outcome.fixed(), "trailing bytes alone are not a fix");
    assert_eq!(
        outcome.extra().as_deref(),
        Some(&b"PK\x03\x04 hidden zip"[..])
    );
    assert!(outcome
        .log()
        .iter()
        .any(|line| line.contains("bytes after IEND")));
}

#[test]
fn broken_iend_is_replaced_with_canonical() {
    let mut png = minimal_png(Ihdr::new(16, 16, 8, 0, 0));
    let len = png.len();
    png[len - 1] ^= 0xFF; // break the IEND CRC

    let outcome = repair(&png, None);
    assert!(outcome.fixed());
    let data_len = outcome.data().len();
    assert_eq!(&outcome.data()[data_len - 12..], &CANONICAL_IEND);
}
