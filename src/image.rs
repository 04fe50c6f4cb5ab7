//! A memory image as loaded from one or more input files, and its merge into the flash units.
use alloc::vec::Vec;

use log::warn;

use crate::error::{Error, Result};
use crate::once::Space;
use crate::unit::FlashLayout;

/// How records with a bad checksum are treated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChecksumPolicy {
    /// Fail the merge.
    #[default]
    Strict,
    /// Log a warning and use the record anyway.
    Ignore,
}

/// A run of consecutive words from one input record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRecord {
    pub space: Space,
    /// Word address of the first word.
    pub address: u32,
    pub words: Vec<u16>,
    pub checksum_ok: bool,
    /// Line of the input file the record came from, for error messages.
    pub line: usize,
}

/// Records in input order.  Where records overlap, the later one wins.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryImage {
    records: Vec<ImageRecord>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: ImageRecord) {
        self.records.push(record);
    }

    /// Append every record of `other`, so it overrides this image where they overlap.
    pub fn extend(&mut self, other: MemoryImage) {
        self.records.extend(other.records);
    }

    pub fn records(&self) -> &[ImageRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn word_count(&self) -> usize {
        self.records.iter().map(|r| r.words.len()).sum()
    }

    /// Copy every word into the unit holding its address.  Returns the number of words merged.
    pub fn merge_into(&self, layout: &mut FlashLayout, policy: ChecksumPolicy) -> Result<usize> {
        let mut merged = 0;
        for record in &self.records {
            if !record.checksum_ok {
                match policy {
                    ChecksumPolicy::Strict => return Err(Error::Checksum { line: record.line }),
                    ChecksumPolicy::Ignore => {
                        warn!("checksum error in line {} ignored", record.line)
                    }
                }
            }
            for (i, &word) in record.words.iter().enumerate() {
                layout.write(record.space, record.address + i as u32, word)?;
            }
            merged += record.words.len();
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::tests::unit;
    use crate::unit::PageFlags;

    use pretty_assertions::assert_eq;

    fn record(space: Space, address: u32, words: &[u16], line: usize) -> ImageRecord {
        ImageRecord {
            space,
            address,
            words: words.to_vec(),
            checksum_ok: true,
            line,
        }
    }

    fn layout() -> FlashLayout {
        FlashLayout::new(&[
            unit(Space::P, 0x0000, 0x1fff, 0x1380, false),
            unit(Space::P, 0x2000, 0x3fff, 0x1380, true),
            unit(Space::X, 0x1000, 0x1fff, 0x0f60, false),
        ])
        .unwrap()
    }

    #[test]
    fn later_records_win() {
        let mut image = MemoryImage::new();
        image.push(record(Space::P, 0x0010, &[1, 2, 3], 1));
        image.push(record(Space::P, 0x0011, &[9], 2));
        image.push(record(Space::X, 0x1000, &[7], 3));

        let mut layout = layout();
        assert_eq!(image.merge_into(&mut layout, ChecksumPolicy::Strict).unwrap(), 5);
        assert_eq!(layout.units()[0].pending(), &[1, 9, 3]);
        assert_eq!(layout.units()[2].pending(), &[7]);
        assert!(layout.units()[1].pending().is_empty());
    }

    #[test]
    fn words_go_to_their_unit() {
        let mut image = MemoryImage::new();
        image.push(record(Space::P, 0x0010, &[0x1234], 1));
        image.push(record(Space::P, 0x2010, &[0x5678], 2));
        let mut layout = layout();
        image.merge_into(&mut layout, ChecksumPolicy::Strict).unwrap();
        assert_eq!(layout.units()[0].start_addr(), 0x0010);
        assert_eq!(layout.units()[1].start_addr(), 0x2010);
        assert_eq!(layout.units()[1].pending(), &[0x5678]);
        // both land on the first page of the shared map
        assert_eq!(layout.page_flags(0, 0), PageFlags::REFERENCED);
    }

    #[test]
    fn checksum_policy() {
        let mut image = MemoryImage::new();
        let mut bad = record(Space::P, 0x0100, &[0xaaaa], 4);
        bad.checksum_ok = false;
        image.push(bad);

        let mut layout = layout();
        assert!(matches!(
            image.merge_into(&mut layout, ChecksumPolicy::Strict),
            Err(Error::Checksum { line: 4 })
        ));
        assert_eq!(image.merge_into(&mut layout, ChecksumPolicy::Ignore).unwrap(), 1);
        assert_eq!(layout.units()[0].pending(), &[0xaaaa]);
    }

    #[test]
    fn out_of_range_is_fatal_under_any_policy() {
        let mut image = MemoryImage::new();
        image.push(record(Space::X, 0x0200, &[1], 1));
        for policy in [ChecksumPolicy::Strict, ChecksumPolicy::Ignore] {
            assert!(matches!(
                image.merge_into(&mut layout(), policy),
                Err(Error::AddressOutOfRange { space: Space::X, address: 0x200 })
            ));
        }
    }

    #[test]
    fn extend_appends() {
        let mut a = MemoryImage::new();
        a.push(record(Space::P, 0, &[1, 2], 1));
        let mut b = MemoryImage::new();
        b.push(record(Space::P, 1, &[5], 1));
        a.extend(b);
        assert_eq!(a.word_count(), 3);
        let mut layout = layout();
        a.merge_into(&mut layout, ChecksumPolicy::Strict).unwrap();
        assert_eq!(layout.units()[0].pending(), &[1, 5]);
    }
}
