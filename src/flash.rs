//! Erase, program, verify and read the on-chip flash through the OnCE port.
//!
//! Each flash block is driven by a flash interface unit (FIU) whose registers live in X memory at
//! the unit's interface address:
//!
//! | offset | register |
//! |--------|----------|
//! | +0     | CNTL: BUSY (bit 15), IFREN (bit 6), page erase (bit 2), mass erase (bit 1) |
//! | +1     | PE: program enable and row number |
//! | +2     | EE: erase enable and page number |
//! | +8..16 | timing registers, see [`FlashTiming::registers`](crate::unit::FlashTiming::registers) |
//!
//! The core does all the work: the host loads pointers and data into core registers and lets the
//! core move them, reading status back through the gateway.
use alloc::boxed::Box;
use alloc::vec::Vec;

use log::{debug, info, warn};

use crate::cable::Cable;
use crate::error::{Error, Result};
use crate::once::{DataReg, Once, Ptr, Reg, Space};
use crate::poll::{wait_until, Cancel};
use crate::unit::{FlashLayout, FlashUnit, PageFlags, PAGE_WORDS};

pub const FIU_CNTL: u16 = 0;
pub const FIU_PE: u16 = 1;
pub const FIU_EE: u16 = 2;
pub const FIU_TIMING: u16 = 8;

pub const CNTL_BUSY: u16 = 0x8000;
pub const CNTL_IFREN: u16 = 0x0040;
pub const CNTL_PAGE_ERASE: u16 = 0x0004;
pub const CNTL_MASS_ERASE: u16 = 0x0002;

/// Enable bit shared by the PE and EE registers.
pub const FIU_ENABLE: u16 = 0x4000;

/// The boot flash interface of the DSP56F807.  Its mass erase is started by a write to $F800
/// rather than to the flash start, with extra bits set in EE (user's manual, page 5-18).
pub const BOOT_FLASH_807: u16 = 0x1380;
const BOOT_FLASH_807_ERASE_ADDR: u16 = 0xf800;
const BOOT_FLASH_807_MASS_EE: u16 = 0x4078;

// PE must be reloaded with the row number at every row boundary
const ROW_WORDS: u16 = 32;
const ROW_MASK: u16 = 0x03ff;
const PAGE_MASK: u16 = 0x007f;

/// Progress events are emitted every this many words.
pub const PROGRESS_STEP: usize = 512;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EraseMode {
    /// Erase whole units before programming.
    #[default]
    Mass,
    /// Erase only the pages the image touches.
    Page,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Block {
    #[default]
    Main,
    /// The information block, selected with IFREN.
    Info,
}

/// Reported to the progress callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Erase of a unit finished; `pages` is `None` for a mass erase.
    Erased { interface: u16, pages: Option<usize> },
    Programmed { interface: u16, done: usize, total: usize },
    Verified { interface: u16, done: usize, total: usize },
    Read { done: usize, total: usize },
}

fn due(done: usize, total: usize) -> bool {
    done % PROGRESS_STEP == 0 || done == total
}

pub struct Flasher<'a, C> {
    once: &'a mut Once<C>,
    erase: EraseMode,
    block: Block,
    cancel: &'a dyn Cancel,
    progress: Option<Box<dyn FnMut(Progress) + 'a>>,
}

impl<'a, C: Cable> Flasher<'a, C> {
    /// `once` must talk to a core in debug mode.
    pub fn new(once: &'a mut Once<C>, erase: EraseMode, block: Block, cancel: &'a dyn Cancel) -> Self {
        Self {
            once,
            erase,
            block,
            cancel,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: impl FnMut(Progress) + 'a) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    fn report(&mut self, event: Progress) {
        if let Some(progress) = self.progress.as_mut() {
            progress(event);
        }
    }

    fn ifren(&self) -> u16 {
        match self.block {
            Block::Main => 0,
            Block::Info => CNTL_IFREN,
        }
    }

    /// Read the CNTL register of the unit at `base` through R1.
    fn read_cntl(&mut self, base: u16) -> Result<u16> {
        self.once.load_imm(Reg::R1, base)?;
        self.once.read_mem(Space::X, Ptr::R1, true)
    }

    /// Wait for an erase to finish.
    fn wait_erase(&mut self, base: u16) -> Result<()> {
        let once = &mut *self.once;
        wait_until(
            self.cancel,
            || {
                once.load_imm(Reg::R1, base)?;
                once.nop()?;
                once.read_mem(Space::X, Ptr::R1, true)
            },
            |cntl| cntl & CNTL_BUSY == 0,
        )?;
        Ok(())
    }

    /// Wait for the previous program step, with R3 pointing at CNTL.
    fn wait_program(&mut self) -> Result<()> {
        let once = &mut *self.once;
        wait_until(
            self.cancel,
            || once.read_mem(Space::X, Ptr::R3, false),
            |cntl| cntl & CNTL_BUSY == 0,
        )?;
        Ok(())
    }

    /// Clear CNTL and EE of the unit at `base`, keeping IFREN.
    fn release(&mut self, base: u16) -> Result<()> {
        let ifren = self.ifren();
        self.once.load_imm(Reg::R1, base + FIU_EE)?;
        self.once.load_imm(Reg::R0, base + FIU_CNTL)?;
        self.once.load_imm(Reg::Y0, ifren)?;
        self.once.store(DataReg::Y0, Space::X, Ptr::R0, true)?;
        self.once.store(DataReg::Y0, Space::X, Ptr::R1, true)
    }

    /// Clear the control registers of the unit, check it is idle and load its timing registers.
    pub fn init_interface(&mut self, unit: &FlashUnit) -> Result<()> {
        let base = unit.interface;
        let ifren = self.ifren();
        info!("Initialising FIU at address: {:#x}", base);

        self.once.load_imm(Reg::R2, base + FIU_CNTL)?;
        self.once.load_imm(Reg::Y0, ifren)?;
        self.once.store(DataReg::Y0, Space::X, Ptr::R2, true)?;
        if self.block == Block::Info {
            self.once.load_imm(Reg::Y0, 0)?;
        }
        // PE, then EE
        self.once.store(DataReg::Y0, Space::X, Ptr::R2, true)?;
        self.once.store(DataReg::Y0, Space::X, Ptr::R2, true)?;

        self.once.load_imm(Reg::R0, base + FIU_TIMING)?;
        if self.read_cntl(base)? & CNTL_BUSY != 0 {
            return Err(Error::InterfaceBusy { interface: base });
        }
        for value in unit.timing.registers() {
            self.once.write_mem(Space::X, Ptr::R0, value, true)?;
        }

        info!("FIU ({:#x}) initialisation done.", base);
        Ok(())
    }

    /// Erase the whole unit.  Duplicate units are skipped: the unit they share cells with has
    /// already erased them.
    pub fn mass_erase(&mut self, unit: &FlashUnit) -> Result<()> {
        let base = unit.interface;
        let ifren = self.ifren();
        if unit.duplicate {
            info!("Mass erase skipped.");
            return Ok(());
        }

        let (target, ee) = if base == BOOT_FLASH_807 {
            (BOOT_FLASH_807_ERASE_ADDR, BOOT_FLASH_807_MASS_EE)
        } else {
            (unit.flash_start, FIU_ENABLE)
        };

        self.once.load_imm(Reg::R0, target)?;
        if self.read_cntl(base)? & CNTL_BUSY != 0 {
            return Err(Error::EraseBusy { interface: base });
        }

        self.once.load_imm(Reg::R1, base + FIU_EE)?;
        self.once.write_mem(Space::X, Ptr::R1, ee, true)?;
        self.once.load_imm(Reg::R1, base + FIU_CNTL)?;
        self.once.write_mem(Space::X, Ptr::R1, CNTL_MASS_ERASE | ifren, true)?;
        // Any write into the block starts the erase
        self.once.store(DataReg::Y0, unit.space, Ptr::R0, true)?;
        self.wait_erase(base)?;
        self.release(base)?;

        info!("Flash ({:#x}) mass erase done.", base);
        self.report(Progress::Erased { interface: base, pages: None });
        Ok(())
    }

    /// Erase every page of unit `idx` that holds image data and was not yet erased during this
    /// session.  Returns the number of pages erased.
    pub fn page_erase(&mut self, layout: &mut FlashLayout, idx: usize) -> Result<usize> {
        let unit = layout
            .unit(idx)
            .ok_or_else(|| Error::Parameter(alloc::format!("no flash unit {}", idx)))?;
        let (base, space, start, pages) = (unit.interface, unit.space, unit.flash_start, unit.pages());
        let ifren = self.ifren();

        self.once.load_imm(Reg::R1, base + FIU_CNTL)?;
        self.once.write_mem(Space::X, Ptr::R1, CNTL_PAGE_ERASE | ifren, true)?;

        let mut count = 0;
        for page in 0..pages {
            self.cancel.check()?;
            let flags = layout.page_flags(idx, page);
            let addr = start.wrapping_add(page as u16 * PAGE_WORDS);
            let number = addr / PAGE_WORDS;

            if !flags.contains(PageFlags::REFERENCED) || flags.contains(PageFlags::ERASED) {
                if !flags.is_empty() {
                    warn!("Page erase of page #{} skipped (flash {:#x})", number, base);
                }
                continue;
            }

            self.once.load_imm(Reg::R0, addr)?;
            if self.read_cntl(base)? & CNTL_BUSY != 0 {
                return Err(Error::EraseBusy { interface: base });
            }
            self.once.load_imm(Reg::R1, base + FIU_EE)?;
            self.once.write_mem(Space::X, Ptr::R1, FIU_ENABLE | (number & PAGE_MASK), true)?;
            self.once.store(DataReg::Y0, space, Ptr::R0, true)?;
            self.wait_erase(base)?;
            layout.mark_erased(idx, page);
            count += 1;
            debug!("page #{} of flash {:#x} erased", number, base);
        }
        self.release(base)?;

        info!("Flash ({:#x}) page erase done, {} page(s) erased.", base, count);
        self.report(Progress::Erased { interface: base, pages: Some(count) });
        Ok(count)
    }

    /// Load PE with the row of `addr` once the previous write has finished.
    fn select_row(&mut self, addr: u16) -> Result<()> {
        self.wait_program()?;
        self.once.load_imm(Reg::Y0, FIU_ENABLE + ((addr >> 5) & ROW_MASK))?;
        self.once.store(DataReg::Y0, Space::X, Ptr::R1, false)
    }

    fn write_words(&mut self, unit: &FlashUnit) -> Result<()> {
        let base = unit.interface;
        let start = unit.start_addr();
        let words = unit.pending();
        let total = words.len();

        // R0 writes, R2 verifies, R1 addresses PE and R3 CNTL
        self.once.load_imm(Reg::R0, start)?;
        self.once.load_imm(Reg::R1, base + FIU_PE)?;
        self.once.load_imm(Reg::R2, start)?;
        self.once.load_imm(Reg::R3, base + FIU_CNTL)?;
        self.select_row(start)?;

        for (i, &word) in words.iter().enumerate() {
            self.cancel.check()?;
            let addr = start.wrapping_add(i as u16);
            if i != 0 && addr % ROW_WORDS == 0 {
                self.select_row(addr)?;
            }
            self.once.load_imm(Reg::Y1, word)?;
            self.wait_program()?;
            self.once.store(DataReg::Y1, unit.space, Ptr::R0, true)?;

            if due(i + 1, total) {
                self.report(Progress::Programmed { interface: base, done: i + 1, total });
            }
        }

        self.wait_program()?;
        self.once.load_imm(Reg::Y0, 0)?;
        self.once.store(DataReg::Y0, Space::X, Ptr::R1, false)
    }

    /// Read back every word written by `program`, with R2 pointing at the first one.  The first
    /// mismatch ends verification.
    fn verify_words(&mut self, unit: &FlashUnit) -> Result<()> {
        let base = unit.interface;
        let words = unit.pending();
        let total = words.len();

        for (i, &expected) in words.iter().enumerate() {
            self.cancel.check()?;
            let actual = self.once.read_mem(unit.space, Ptr::R2, true)?;
            if actual != expected {
                // R2 already points past the bad word
                let address = self.once.read_reg(Reg::R2)?.wrapping_sub(1);
                return Err(Error::Verify { address, expected, actual });
            }
            if due(i + 1, total) {
                self.report(Progress::Verified { interface: base, done: i + 1, total });
            }
        }
        Ok(())
    }

    /// Compare the target against the image words of `unit`, independently of programming it.
    pub fn verify(&mut self, unit: &FlashUnit) -> Result<()> {
        self.once.load_imm(Reg::R2, unit.start_addr())?;
        self.verify_words(unit)
    }

    /// Initialise, erase, program and verify unit `idx`.
    pub fn program(&mut self, layout: &mut FlashLayout, idx: usize) -> Result<()> {
        let unit = layout
            .unit(idx)
            .ok_or_else(|| Error::Parameter(alloc::format!("no flash unit {}", idx)))?
            .clone();

        self.init_interface(&unit)?;
        match self.erase {
            EraseMode::Mass => self.mass_erase(&unit)?,
            EraseMode::Page => {
                self.page_erase(layout, idx)?;
            }
        }

        self.write_words(&unit)?;
        self.verify_words(&unit)?;
        info!(
            "Flash ({:#x}) programming done. {:#x} words written.",
            unit.interface,
            unit.data_count()
        );
        Ok(())
    }

    /// Program every unit of the layout in configuration order, stopping at the first error.
    pub fn program_all(&mut self, layout: &mut FlashLayout) -> Result<()> {
        for idx in 0..layout.len() {
            self.program(layout, idx)?;
        }
        Ok(())
    }

    /// Read `start..=end` of `space`.  In information block mode IFREN is set in every unit of
    /// `layout` first.
    pub fn read_range(&mut self, space: Space, start: u16, end: u16, layout: &FlashLayout) -> Result<Vec<u16>> {
        if end < start {
            return Err(Error::Parameter(alloc::format!(
                "address range {:#06x}:{:#06x} is reversed",
                start, end
            )));
        }

        if self.block == Block::Info {
            self.once.load_imm(Reg::Y0, CNTL_IFREN)?;
            for unit in layout.units() {
                self.once.load_imm(Reg::R2, unit.interface + FIU_CNTL)?;
                self.once.store(DataReg::Y0, Space::X, Ptr::R2, true)?;
            }
        }

        let total = usize::from(end - start) + 1;
        let mut words = Vec::with_capacity(total);
        self.once.load_imm(Reg::R2, start)?;
        for i in 0..total {
            self.cancel.check()?;
            words.push(self.once.read_mem(space, Ptr::R2, true)?);
            if due(i + 1, total) {
                self.report(Progress::Read { done: i + 1, total });
            }
        }

        info!("Reading memory done, {:#x} word(s) read.", total);
        Ok(words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cable::fake::{Erase, FakeCable};
    use crate::poll::NeverCancel;
    use crate::statemachine::{JtagSM, JtagState};
    use crate::taps::{ChainPosition, Taps, ENABLE_ONCE};
    use crate::unit::tests::unit;
    use crate::unit::{FlashTiming, UnitConfig};

    use alloc::vec;
    use pretty_assertions::assert_eq;

    fn debug_once(cable: FakeCable) -> Once<FakeCable> {
        let mut sm = JtagSM::new(cable);
        sm.mode_reset().unwrap();
        sm.change_mode(JtagState::SelectDR).unwrap();
        let mut taps = Taps::new(sm, ChainPosition::default());
        taps.sm.cable.force_debug();
        taps.shift_ir(ENABLE_ONCE).unwrap();
        Once::new(taps)
    }

    fn cable(flash: &[(u16, Space, u16, u16)]) -> FakeCable {
        let mut cable = FakeCable::new();
        cable.clear_flash();
        for &(interface, space, start, end) in flash {
            cable.add_flash(interface, space, start..=end);
        }
        cable
    }

    fn timed(mut config: UnitConfig) -> UnitConfig {
        config.timing = FlashTiming {
            clk_divisor: 0x28,
            terasel: 0x0f,
            tmel: 0x3a,
            tnvsl: 0x3f,
            tpgsl: 0x7f,
            tprogl: 0xff,
            tnvhl: 0x1d7,
            tnvh1l: 0x2710,
            trcvl: 0x4,
        };
        config
    }

    #[test]
    fn interface_timing_registers() {
        let mut once = debug_once(cable(&[(0x0f40, Space::P, 0, 0x7dff)]));
        let layout = FlashLayout::new(&[timed(unit(Space::P, 0, 0x7dff, 0x0f40, false))]).unwrap();
        let mut flasher = Flasher::new(&mut once, EraseMode::Mass, Block::Info, &NeverCancel);
        flasher.init_interface(&layout.units()[0]).unwrap();
        drop(flasher);

        let fake = &once.taps.sm.cable;
        assert_eq!(fake.memory(Space::X, 0x0f40), CNTL_IFREN);
        assert_eq!(fake.memory(Space::X, 0x0f41), 0);
        assert_eq!(fake.memory(Space::X, 0x0f42), 0);
        let timing: Vec<u16> = (0..9).map(|i| fake.memory(Space::X, 0x0f48 + i)).collect();
        assert_eq!(timing, layout.units()[0].timing.registers().to_vec());
    }

    #[test]
    fn busy_interface_is_fatal() {
        let layout = FlashLayout::new(&[unit(Space::P, 0, 0x7dff, 0x0f40, false)]).unwrap();
        // a program step still running when the session starts
        let mut once = debug_once(cable(&[(0x0f40, Space::P, 0, 0x7dff)]));
        once.taps.sm.cable.set_busy_cycles(1000);
        once.load_imm(Reg::R0, 0x0f41).unwrap();
        once.write_mem(Space::X, Ptr::R0, FIU_ENABLE, false).unwrap();
        once.load_imm(Reg::R0, 0x0010).unwrap();
        once.write_mem(Space::P, Ptr::R0, 0, false).unwrap();
        let mut flasher = Flasher::new(&mut once, EraseMode::Mass, Block::Main, &NeverCancel);
        assert!(matches!(
            flasher.init_interface(&layout.units()[0]),
            Err(Error::InterfaceBusy { interface: 0x0f40 })
        ));
    }

    #[test]
    fn duplicate_is_never_mass_erased() {
        let mut once = debug_once(cable(&[(0x1380, Space::P, 0, 0x3fff)]));
        let mut layout = FlashLayout::new(&[
            unit(Space::P, 0x0000, 0x1fff, 0x1380, false),
            unit(Space::P, 0x2000, 0x3fff, 0x1380, true),
        ])
        .unwrap();
        let mut flasher = Flasher::new(&mut once, EraseMode::Mass, Block::Main, &NeverCancel);
        flasher.program(&mut layout, 1).unwrap();
        drop(flasher);
        assert!(once.taps.sm.cable.erase_log().is_empty());
        assert_eq!(once.taps.sm.cable.busy_reads(), 0);

        let mut flasher = Flasher::new(&mut once, EraseMode::Mass, Block::Main, &NeverCancel);
        flasher.program(&mut layout, 0).unwrap();
        drop(flasher);
        assert_eq!(once.taps.sm.cable.erase_log(), &[Erase::Mass { interface: 0x1380 }]);
    }

    #[test]
    fn boot_flash_mass_erase() {
        let mut once = debug_once(cable(&[(0x1380, Space::P, 0, 0x1fff)]));
        let layout = FlashLayout::new(&[unit(Space::P, 0x0000, 0x1fff, 0x1380, false)]).unwrap();
        let mut flasher = Flasher::new(&mut once, EraseMode::Mass, Block::Main, &NeverCancel);
        flasher.mass_erase(&layout.units()[0]).unwrap();
        drop(flasher);
        let fake = &once.taps.sm.cable;
        assert_eq!(fake.erase_log(), &[Erase::Mass { interface: 0x1380 }]);
        assert_eq!(fake.memory(Space::P, 0x0000), 0xffff);
        assert_eq!(fake.memory(Space::P, 0x1fff), 0xffff);
        // CNTL and EE are released afterwards
        assert_eq!(fake.memory(Space::X, 0x1380), 0);
        assert_eq!(fake.memory(Space::X, 0x1382), 0);
    }

    #[test]
    fn pages_are_erased_at_most_once() {
        let mut once = debug_once(cable(&[(0x0f40, Space::P, 0, 0x7dff)]));
        let mut layout = FlashLayout::new(&[unit(Space::P, 0x0000, 0x7dff, 0x0f40, false)]).unwrap();
        // two records touching the same page, one touching another
        layout.write(Space::P, 0x0105, 1).unwrap();
        layout.write(Space::P, 0x01f0, 2).unwrap();
        layout.write(Space::P, 0x0420, 3).unwrap();

        let mut flasher = Flasher::new(&mut once, EraseMode::Page, Block::Main, &NeverCancel);
        assert_eq!(flasher.page_erase(&mut layout, 0).unwrap(), 2);
        assert_eq!(flasher.page_erase(&mut layout, 0).unwrap(), 0);
        drop(flasher);
        assert_eq!(
            once.taps.sm.cable.erase_log(),
            &[
                Erase::Page { interface: 0x0f40, address: 0x0100 },
                Erase::Page { interface: 0x0f40, address: 0x0400 },
            ]
        );
        assert_eq!(layout.page_flags(0, 1), PageFlags::REFERENCED | PageFlags::ERASED);
        assert_eq!(layout.page_flags(0, 0), PageFlags::empty());
    }

    #[test]
    fn busy_page_erase_leaves_page_unmarked() {
        let mut once = debug_once(cable(&[(0x0f40, Space::P, 0, 0x7dff)]));
        once.taps.sm.cable.set_busy_cycles(1000);
        once.load_imm(Reg::R0, 0x0f41).unwrap();
        once.write_mem(Space::X, Ptr::R0, FIU_ENABLE, false).unwrap();
        once.load_imm(Reg::R0, 0x0010).unwrap();
        once.write_mem(Space::P, Ptr::R0, 0, false).unwrap();

        let mut layout = FlashLayout::new(&[unit(Space::P, 0x0000, 0x7dff, 0x0f40, false)]).unwrap();
        layout.write(Space::P, 0x0105, 1).unwrap();
        let mut flasher = Flasher::new(&mut once, EraseMode::Page, Block::Main, &NeverCancel);
        assert!(matches!(
            flasher.page_erase(&mut layout, 0),
            Err(Error::EraseBusy { interface: 0x0f40 })
        ));
        drop(flasher);
        assert_eq!(layout.page_flags(0, 1), PageFlags::REFERENCED);
        assert!(once.taps.sm.cable.erase_log().is_empty());
    }

    #[test]
    fn program_then_read_back() {
        let mut once = debug_once(cable(&[(0x0f60, Space::X, 0x1000, 0x1fff)]));
        let mut layout = FlashLayout::new(&[unit(Space::X, 0x1000, 0x1fff, 0x0f60, false)]).unwrap();
        let image: Vec<u16> = (0..700u16).map(|i| i.wrapping_mul(0x9e37)).collect();
        for (i, &w) in image.iter().enumerate() {
            layout.write(Space::X, 0x1010 + i as u32, w).unwrap();
        }

        let mut events = vec![];
        let mut flasher = Flasher::new(&mut once, EraseMode::Page, Block::Main, &NeverCancel)
            .with_progress(|p| events.push(p));
        flasher.program(&mut layout, 0).unwrap();
        let back = flasher.read_range(Space::X, 0x1010, 0x1010 + 699, &layout).unwrap();
        drop(flasher);
        assert_eq!(back, image);

        assert!(events.contains(&Progress::Programmed { interface: 0x0f60, done: 512, total: 700 }));
        assert!(events.contains(&Progress::Verified { interface: 0x0f60, done: 700, total: 700 }));
        assert!(events.contains(&Progress::Read { done: 700, total: 700 }));
    }

    #[test]
    fn row_number_follows_address() {
        let mut once = debug_once(cable(&[(0x0f40, Space::P, 0, 0x7dff)]));
        let mut flasher = Flasher::new(&mut once, EraseMode::Mass, Block::Main, &NeverCancel);
        flasher.once.load_imm(Reg::R1, 0x0f40 + FIU_PE).unwrap();
        flasher.once.load_imm(Reg::R3, 0x0f40 + FIU_CNTL).unwrap();
        flasher.select_row(0x0123).unwrap();
        drop(flasher);
        assert_eq!(once.taps.sm.cable.memory(Space::X, 0x0f41), FIU_ENABLE | 0x0009);
    }

    #[test]
    fn read_range_uses_one_gateway_read_per_word() {
        let mut once = debug_once(FakeCable::new());
        let layout = FlashLayout::new(&[unit(Space::P, 0, 0x7dff, 0x0f40, false)]).unwrap();
        once.taps.sm.cable.reset_counters();
        let mut flasher = Flasher::new(&mut once, EraseMode::Mass, Block::Main, &NeverCancel);
        let words = flasher.read_range(Space::X, 0x0100, 0x0107, &layout).unwrap();
        drop(flasher);
        assert_eq!(words, vec![0; 8]);
        assert_eq!(once.taps.sm.cable.gateway_reads(), 8);
    }

    #[test]
    fn reversed_range_is_rejected() {
        let mut once = debug_once(FakeCable::new());
        let layout = FlashLayout::new(&[unit(Space::P, 0, 0x7dff, 0x0f40, false)]).unwrap();
        let mut flasher = Flasher::new(&mut once, EraseMode::Mass, Block::Main, &NeverCancel);
        assert!(matches!(
            flasher.read_range(Space::P, 0x0200, 0x0100, &layout),
            Err(Error::Parameter(_))
        ));
    }

    #[test]
    fn info_block_read_sets_ifren_everywhere() {
        let mut once = debug_once(FakeCable::new());
        let layout = FlashLayout::new(&[
            unit(Space::P, 0, 0x7dff, 0x0f40, false),
            unit(Space::X, 0x1000, 0x1fff, 0x0f60, false),
        ])
        .unwrap();
        let mut flasher = Flasher::new(&mut once, EraseMode::Mass, Block::Info, &NeverCancel);
        flasher.read_range(Space::P, 0, 0, &layout).unwrap();
        drop(flasher);
        assert_eq!(once.taps.sm.cable.memory(Space::X, 0x0f40), CNTL_IFREN);
        assert_eq!(once.taps.sm.cable.memory(Space::X, 0x0f60), CNTL_IFREN);
    }

    #[test]
    fn verify_reports_first_mismatch() {
        // duplicate of a unit on another interface: its cells are never erased
        let mut fake = cable(&[(0x0f40, Space::P, 0, 0x0fff), (0x1400, Space::P, 0x2000, 0x2fff)]);
        fake.fill(Space::P, 0x2000..=0x2fff, 0);
        let mut once = debug_once(fake);
        let mut layout = FlashLayout::new(&[
            unit(Space::P, 0x0000, 0x0fff, 0x0f40, false),
            unit(Space::P, 0x2000, 0x2fff, 0x1400, true),
        ])
        .unwrap();
        layout.write(Space::P, 0x2010, 0x0000).unwrap();
        layout.write(Space::P, 0x2012, 0x5678).unwrap();

        let mut flasher = Flasher::new(&mut once, EraseMode::Mass, Block::Main, &NeverCancel);
        match flasher.program(&mut layout, 1) {
            Err(Error::Verify { address, expected, actual }) => {
                // 0x2011 is a gap word, expected erased
                assert_eq!((address, expected, actual), (0x2011, 0xffff, 0x0000));
            }
            other => panic!("expected a verify error, got {:?}", other),
        }
    }

    #[test]
    fn cancelled_poll_stops() {
        let mut once = debug_once(cable(&[(0x0f40, Space::P, 0, 0x7dff)]));
        once.taps.sm.cable.set_busy_cycles(u32::MAX);
        let layout = FlashLayout::new(&[unit(Space::P, 0, 0x7dff, 0x0f40, false)]).unwrap();
        let stop = core::sync::atomic::AtomicBool::new(false);
        let mut flasher = Flasher::new(&mut once, EraseMode::Mass, Block::Main, &stop);
        flasher.init_interface(&layout.units()[0]).unwrap();
        flasher.once.load_imm(Reg::R0, 0).unwrap();
        flasher.once.load_imm(Reg::R1, 0x0f42).unwrap();
        flasher.once.write_mem(Space::X, Ptr::R1, FIU_ENABLE, true).unwrap();
        flasher.once.load_imm(Reg::R1, 0x0f40).unwrap();
        flasher.once.write_mem(Space::X, Ptr::R1, CNTL_MASS_ERASE, true).unwrap();
        flasher.once.store(DataReg::Y0, Space::P, Ptr::R0, true).unwrap();
        for _ in 0..3 {
            assert_eq!(flasher.read_cntl(0x0f40).unwrap() & CNTL_BUSY, CNTL_BUSY);
        }
        stop.store(true, core::sync::atomic::Ordering::Relaxed);
        assert!(matches!(flasher.wait_erase(0x0f40), Err(Error::Cancelled)));
    }
}
