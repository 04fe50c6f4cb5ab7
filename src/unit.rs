//! Flash units: the configured geometry of each flash block, the image words to be programmed
//! into it, and the per page erase bookkeeping.
use alloc::format;
use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::once::Space;

/// Words per erase page.
pub const PAGE_WORDS: u16 = 256;

/// Most flash units a layout may hold.
pub const MAX_UNITS: usize = 8;

/// Values for the nine timing registers of a flash interface unit, in register order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(serde::Deserialize))]
pub struct FlashTiming {
    pub clk_divisor: u16,
    pub terasel: u16,
    pub tmel: u16,
    pub tnvsl: u16,
    pub tpgsl: u16,
    pub tprogl: u16,
    pub tnvhl: u16,
    pub tnvh1l: u16,
    pub trcvl: u16,
}

impl FlashTiming {
    pub fn registers(&self) -> [u16; 9] {
        [
            self.clk_divisor,
            self.terasel,
            self.tmel,
            self.tnvsl,
            self.tpgsl,
            self.tprogl,
            self.tnvhl,
            self.tnvh1l,
            self.trcvl,
        ]
    }
}

bitflags! {
    /// Erase state of one page.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// Erased during this session.
        const ERASED = 1;
        /// Holds image data, so it must be erased before programming.
        const REFERENCED = 2;
    }
}

/// One flash unit as read from the configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(serde::Deserialize))]
pub struct UnitConfig {
    #[cfg_attr(feature = "std", serde(rename = "memory"))]
    pub space: Space,
    #[cfg_attr(feature = "std", serde(rename = "start"))]
    pub flash_start: u16,
    #[cfg_attr(feature = "std", serde(rename = "end"))]
    pub flash_end: u16,
    pub interface: u16,
    /// Shares its cells with an earlier unit, so it is never mass erased.
    #[cfg_attr(feature = "std", serde(default))]
    pub duplicate: bool,
    #[cfg_attr(feature = "std", serde(flatten))]
    pub timing: FlashTiming,
}

#[derive(Clone, Debug)]
pub struct FlashUnit {
    pub space: Space,
    pub flash_start: u16,
    pub flash_end: u16,
    pub interface: u16,
    pub timing: FlashTiming,
    pub duplicate: bool,
    data: Vec<u16>,
    // lowest and highest address written by the image
    written: Option<(u16, u16)>,
    erase_map: usize,
}

impl FlashUnit {
    fn new(config: &UnitConfig, erase_map: usize) -> Self {
        let words = usize::from(config.flash_end - config.flash_start) + 1;
        FlashUnit {
            space: config.space,
            flash_start: config.flash_start,
            flash_end: config.flash_end,
            interface: config.interface,
            timing: config.timing,
            duplicate: config.duplicate,
            data: vec![0xffff; words],
            written: None,
            erase_map,
        }
    }

    pub fn contains(&self, space: Space, addr: u32) -> bool {
        self.space == space
            && addr >= u32::from(self.flash_start)
            && addr <= u32::from(self.flash_end)
    }

    /// Number of erase pages the unit spans.
    pub fn pages(&self) -> usize {
        usize::from(self.flash_end - self.flash_start) / usize::from(PAGE_WORDS) + 1
    }

    /// First address to program: the lowest written one, or the unit start if nothing was.
    pub fn start_addr(&self) -> u16 {
        self.written.map_or(self.flash_start, |(lo, _)| lo)
    }

    /// Number of words from `start_addr` through the highest written address.
    pub fn data_count(&self) -> usize {
        self.written.map_or(0, |(lo, hi)| usize::from(hi - lo) + 1)
    }

    /// The words to program, starting at `start_addr`.  Gaps inside the written range hold 0xFFFF.
    pub fn pending(&self) -> &[u16] {
        let offset = usize::from(self.start_addr() - self.flash_start);
        &self.data[offset..offset + self.data_count()]
    }

    /// The whole buffer, starting at `flash_start`.
    pub fn data(&self) -> &[u16] {
        &self.data
    }

    fn store(&mut self, addr: u16, value: u16) -> usize {
        let offset = usize::from(addr - self.flash_start);
        self.data[offset] = value;
        self.written = Some(match self.written {
            None => (addr, addr),
            Some((lo, hi)) => (lo.min(addr), hi.max(addr)),
        });
        offset / usize::from(PAGE_WORDS)
    }
}

/// The configured flash units and their shared erase bookkeeping.
#[derive(Clone, Debug)]
pub struct FlashLayout {
    units: Vec<FlashUnit>,
    erase_maps: Vec<Vec<PageFlags>>,
}

impl FlashLayout {
    /// Build the layout.  A duplicate unit shares the erase map of the most recent earlier
    /// non-duplicate unit with the same interface, or failing that of the most recent earlier
    /// non-duplicate unit.
    pub fn new(configs: &[UnitConfig]) -> Result<Self> {
        if configs.is_empty() {
            return Err(Error::Config("no flash units configured".into()));
        }
        if configs.len() > MAX_UNITS {
            return Err(Error::Config(format!(
                "{} flash units configured, at most {} are supported",
                configs.len(),
                MAX_UNITS
            )));
        }

        let mut units: Vec<FlashUnit> = Vec::with_capacity(configs.len());
        let mut erase_maps = Vec::new();
        for (i, config) in configs.iter().enumerate() {
            if config.flash_end < config.flash_start {
                return Err(Error::Config(format!(
                    "flash unit {}: end {:#06x} is below start {:#06x}",
                    i, config.flash_end, config.flash_start
                )));
            }

            let map = if config.duplicate {
                let owner = units
                    .iter()
                    .rev()
                    .find(|u| !u.duplicate && u.interface == config.interface)
                    .or_else(|| units.iter().rev().find(|u| !u.duplicate))
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "flash unit {} is a duplicate but no earlier unit owns its cells",
                            i
                        ))
                    })?;
                owner.erase_map
            } else {
                erase_maps.push(Vec::new());
                erase_maps.len() - 1
            };

            let unit = FlashUnit::new(config, map);
            let pages = unit.pages();
            let erase_map: &mut Vec<PageFlags> = &mut erase_maps[map];
            if config.duplicate && pages > erase_map.len() {
                return Err(Error::Config(format!(
                    "duplicate flash unit {} spans {} pages, the unit it shares cells with only {}",
                    i,
                    pages,
                    erase_map.len()
                )));
            }
            if erase_map.is_empty() {
                erase_map.resize(pages, PageFlags::empty());
            }
            units.push(unit);
        }

        Ok(FlashLayout { units, erase_maps })
    }

    pub fn units(&self) -> &[FlashUnit] {
        &self.units
    }

    pub fn unit(&self, idx: usize) -> Option<&FlashUnit> {
        self.units.get(idx)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Index of the first unit holding `addr`.
    pub fn find(&self, space: Space, addr: u32) -> Option<usize> {
        self.units.iter().position(|u| u.contains(space, addr))
    }

    /// Store one image word and mark its page for erasing.
    pub fn write(&mut self, space: Space, addr: u32, value: u16) -> Result<()> {
        let idx = self.find(space, addr).ok_or(Error::AddressOutOfRange { space, address: addr })?;
        let unit = &mut self.units[idx];
        // `find` guarantees addr fits in u16
        let page = unit.store(addr as u16, value);
        self.erase_maps[unit.erase_map][page] |= PageFlags::REFERENCED;
        Ok(())
    }

    /// Erase flags of page `page` (relative to the unit start) of unit `idx`.
    pub fn page_flags(&self, idx: usize, page: usize) -> PageFlags {
        self.units
            .get(idx)
            .and_then(|u| self.erase_maps[u.erase_map].get(page))
            .copied()
            .unwrap_or_default()
    }

    pub(crate) fn mark_erased(&mut self, idx: usize, page: usize) {
        let map = self.units[idx].erase_map;
        if let Some(flags) = self.erase_maps[map].get_mut(page) {
            flags.insert(PageFlags::ERASED);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn unit(space: Space, start: u16, end: u16, interface: u16, duplicate: bool) -> UnitConfig {
        UnitConfig {
            space,
            flash_start: start,
            flash_end: end,
            interface,
            duplicate,
            timing: FlashTiming::default(),
        }
    }

    #[test]
    fn buffers_start_erased() {
        let layout = FlashLayout::new(&[unit(Space::P, 0x0000, 0x01ff, 0x0f40, false)]).unwrap();
        let u = &layout.units()[0];
        assert_eq!(u.data().len(), 0x200);
        assert!(u.data().iter().all(|&w| w == 0xffff));
        assert_eq!(u.pages(), 2);
        assert_eq!(u.data_count(), 0);
        assert_eq!(u.start_addr(), 0x0000);
        assert!(u.pending().is_empty());
    }

    #[test]
    fn written_range_tracks_extremes() {
        let mut layout = FlashLayout::new(&[unit(Space::P, 0x1000, 0x1fff, 0x0f40, false)]).unwrap();
        layout.write(Space::P, 0x1210, 0x1111).unwrap();
        layout.write(Space::P, 0x1100, 0x2222).unwrap();
        layout.write(Space::P, 0x1104, 0x3333).unwrap();
        let u = &layout.units()[0];
        assert_eq!(u.start_addr(), 0x1100);
        assert_eq!(u.data_count(), 0x111);
        assert_eq!(u.pending()[0], 0x2222);
        assert_eq!(u.pending()[1], 0xffff);
        assert_eq!(u.pending()[0x110], 0x1111);

        assert_eq!(layout.page_flags(0, 0), PageFlags::empty());
        assert_eq!(layout.page_flags(0, 1), PageFlags::REFERENCED);
        assert_eq!(layout.page_flags(0, 2), PageFlags::REFERENCED);
    }

    #[test]
    fn out_of_range_words_are_rejected() {
        let mut layout = FlashLayout::new(&[unit(Space::P, 0x0000, 0x00ff, 0x0f40, false)]).unwrap();
        assert!(matches!(
            layout.write(Space::P, 0x0100, 0),
            Err(Error::AddressOutOfRange { space: Space::P, address: 0x100 })
        ));
        assert!(matches!(layout.write(Space::X, 0x0010, 0), Err(Error::AddressOutOfRange { .. })));
        assert!(matches!(layout.write(Space::P, 0x1_0010, 0), Err(Error::AddressOutOfRange { .. })));
    }

    #[test]
    fn duplicates_share_erase_map() {
        let layout = FlashLayout::new(&[
            unit(Space::P, 0x0000, 0x1fff, 0x1380, false),
            unit(Space::X, 0x1000, 0x1fff, 0x0f60, false),
            unit(Space::P, 0x2000, 0x3fff, 0x1380, true),
            unit(Space::P, 0x4000, 0x40ff, 0x1400, true),
        ])
        .unwrap();
        assert_eq!(layout.erase_maps.len(), 2);
        // same interface wins over recency
        assert_eq!(layout.units[2].erase_map, layout.units[0].erase_map);
        // otherwise the most recent owner
        assert_eq!(layout.units[3].erase_map, layout.units[1].erase_map);
    }

    #[test]
    fn page_marks_are_shared() {
        let mut layout = FlashLayout::new(&[
            unit(Space::P, 0x0000, 0x1fff, 0x1380, false),
            unit(Space::P, 0x2000, 0x3fff, 0x1380, true),
        ])
        .unwrap();
        layout.write(Space::P, 0x2010, 0x5678).unwrap();
        assert_eq!(layout.page_flags(0, 0), PageFlags::REFERENCED);
        layout.mark_erased(1, 0);
        assert_eq!(layout.page_flags(0, 0), PageFlags::REFERENCED | PageFlags::ERASED);
    }

    #[test]
    fn bad_layouts() {
        assert!(matches!(FlashLayout::new(&[]), Err(Error::Config(_))));
        assert!(matches!(
            FlashLayout::new(&[unit(Space::P, 0x2000, 0x1000, 0x0f40, false)]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            FlashLayout::new(&[unit(Space::P, 0x0000, 0x00ff, 0x0f40, true)]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            FlashLayout::new(&[
                unit(Space::P, 0x0000, 0x00ff, 0x0f40, false),
                unit(Space::P, 0x1000, 0x1fff, 0x0f40, true),
            ]),
            Err(Error::Config(_))
        ));
        let many = vec![unit(Space::P, 0, 0xff, 0x0f40, false); MAX_UNITS + 1];
        assert!(matches!(FlashLayout::new(&many), Err(Error::Config(_))));
    }
}
