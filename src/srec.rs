//! Motorola S-record reader and writer for DSP56800 images.
//!
//! The DSP is word addressed, S-records are byte addressed: the byte address of a word is twice
//! its word address, and each word is stored low byte first.  Data memory is mapped above program
//! memory, starting at byte address 0x20000 (word 0x10000).
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

use log::debug;

use crate::error::{Error, Result};
use crate::image::{ImageRecord, MemoryImage};
use crate::once::Space;

/// Byte address where data (X) memory starts.
pub const X_BASE: u32 = 0x2_0000;

/// Words per S3 record written by `write`.
pub const WORDS_PER_RECORD: usize = 16;

fn syntax(line: usize, reason: impl Into<String>) -> Error {
    Error::ImageSyntax {
        line,
        reason: reason.into(),
    }
}

fn hex_bytes(text: &str, line: usize) -> Result<Vec<u8>> {
    if text.len() % 2 != 0 {
        return Err(syntax(line, "odd number of hex digits"));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            text.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| syntax(line, "invalid hex digit"))
        })
        .collect()
}

/// Split a byte address into the memory space and word address it denotes.
pub fn word_address(byte_address: u32) -> (Space, u32) {
    if byte_address >= X_BASE {
        (Space::X, (byte_address - X_BASE) / 2)
    } else {
        (Space::P, byte_address / 2)
    }
}

/// Parse one record.  Returns `None` for records without data.
fn parse_line(text: &str, line: usize) -> Result<Option<ImageRecord>> {
    let mut chars = text.chars();
    if chars.next() != Some('S') {
        return Err(syntax(line, "record does not start with 'S'"));
    }
    let kind = chars.next().ok_or_else(|| syntax(line, "missing record type"))?;
    let bytes = hex_bytes(chars.as_str(), line)?;

    let (&count, rest) = bytes.split_first().ok_or_else(|| syntax(line, "missing byte count"))?;
    if usize::from(count) != rest.len() {
        return Err(syntax(
            line,
            format!("byte count {} does not match record length {}", count, rest.len()),
        ));
    }
    let sum = bytes[..bytes.len() - 1]
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    let checksum_ok = !sum == bytes[bytes.len() - 1];

    let address_len = match kind {
        '0' | '1' | '5' | '9' => 2,
        '2' | '6' | '8' => 3,
        '3' | '7' => 4,
        other => return Err(syntax(line, format!("unknown record type S{}", other))),
    };
    // address and checksum at least
    if rest.len() < address_len + 1 {
        return Err(syntax(line, "record too short"));
    }
    if !matches!(kind, '1' | '2' | '3') {
        debug!("line {}: skipping S{} record", line, kind);
        return Ok(None);
    }

    let byte_address = rest[..address_len]
        .iter()
        .fold(0u32, |acc, &b| acc << 8 | u32::from(b));
    let data = &rest[address_len..rest.len() - 1];
    if byte_address % 2 != 0 || data.len() % 2 != 0 {
        return Err(syntax(line, "data is not aligned to 16-bit words"));
    }

    let (space, address) = word_address(byte_address);
    let words = data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok(Some(ImageRecord {
        space,
        address,
        words,
        checksum_ok,
        line,
    }))
}

/// Parse a whole S-record file.  Checksums are recorded per record, not checked here.
pub fn parse(text: &str) -> Result<MemoryImage> {
    let mut image = MemoryImage::new();
    for (i, raw) in text.lines().enumerate() {
        let record = raw.trim();
        if record.is_empty() {
            continue;
        }
        if let Some(record) = parse_line(record, i + 1)? {
            image.push(record);
        }
    }
    Ok(image)
}

fn write_record(out: &mut String, kind: char, address: &[u8], data: &[u8]) {
    let count = (address.len() + data.len() + 1) as u8;
    let mut sum = count;
    let _ = write!(out, "S{}{:02X}", kind, count);
    for &b in address.iter().chain(data) {
        sum = sum.wrapping_add(b);
        let _ = write!(out, "{:02X}", b);
    }
    let _ = writeln!(out, "{:02X}", !sum);
}

/// Format `words`, read from `space` starting at word address `start`, as an S-record file with
/// an S0 header, S3 data records and an S7 terminator.
pub fn write(space: Space, start: u16, words: &[u16], header: &str) -> String {
    let mut out = String::new();
    write_record(&mut out, '0', &[0, 0], header.as_bytes());

    let base = match space {
        Space::P => 0,
        Space::X => X_BASE,
    };
    for (i, chunk) in words.chunks(WORDS_PER_RECORD).enumerate() {
        let address = base + (u32::from(start) + (i * WORDS_PER_RECORD) as u32) * 2;
        let data: Vec<u8> = chunk.iter().flat_map(|w| w.to_le_bytes()).collect();
        write_record(&mut out, '3', &address.to_be_bytes(), &data);
    }

    write_record(&mut out, '7', &[0, 0, 0, 0], &[]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn program_and_data_records() {
        let image = parse("S00600004844521B\nS1050020341294\r\n\nS206020200CDAB7D\nS9030000FC\n").unwrap();
        assert_eq!(image.records().len(), 2);

        let p = &image.records()[0];
        assert_eq!((p.space, p.address, p.line), (Space::P, 0x10, 2));
        assert_eq!(p.words, [0x1234]);
        assert!(p.checksum_ok);

        let x = &image.records()[1];
        assert_eq!((x.space, x.address, x.line), (Space::X, 0x100, 4));
        assert_eq!(x.words, [0xabcd]);
    }

    #[test]
    fn bad_checksum_is_recorded() {
        let image = parse("S1050020341295").unwrap();
        assert!(!image.records()[0].checksum_ok);
    }

    #[test]
    fn malformed_records() {
        for (text, reason) in [
            ("X1050020341294", "record does not start"),
            ("S1050020341G94", "invalid hex"),
            ("S106002034129", "odd number"),
            ("S1060020341294", "byte count"),
            ("S4050020341294", "unknown record type"),
            ("S1050021341293", "aligned"),
        ] {
            match parse(text) {
                Err(Error::ImageSyntax { line: 1, reason: r }) => assert!(r.contains(reason), "{}: {}", text, r),
                other => panic!("{}: expected a syntax error, got {:?}", text, other),
            }
        }
    }

    #[test]
    fn writer_layout() {
        let words: Vec<u16> = (0..17).collect();
        let text = write(Space::P, 0x0010, &words[..1], "");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, ["S0030000FC", "S307000000200000D8", "S70500000000FA"]);

        let text = write(Space::X, 0x0100, &words, "dump");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("S3250002020000000100"));
        assert!(lines[2].starts_with("S30700020220"));

        let back = parse(&text).unwrap();
        assert_eq!(back.records()[0].space, Space::X);
        assert_eq!(back.records()[0].address, 0x100);
        assert_eq!(back.records()[1].address, 0x110);
        assert_eq!(back.records()[1].words, [16]);
        assert!(back.records().iter().all(|r| r.checksum_ok));
    }

    #[test]
    fn address_split() {
        assert_eq!(word_address(0x0001_fffe), (Space::P, 0xffff));
        assert_eq!(word_address(0x0002_0000), (Space::X, 0));
        assert_eq!(word_address(0x0002_2000), (Space::X, 0x1000));
    }
}
