//! A cable with a simulated scan chain behind it, used by the tests and for dry runs.
//!
//! The chain holds one DSP with its TAP, OnCE port, core registers, X and P memory and flash
//! interface units, plus any number of other devices that only ever act as BYPASS.  Everything is
//! simulated at the pin level: TMS is sampled on rising TCK edges, TDO changes on falling ones.
use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::RangeInclusive;

use log::{debug, trace};

use crate::cable::{Cable, Signal};
use crate::error::LinkError;
use crate::flash::{CNTL_BUSY, CNTL_MASS_ERASE, CNTL_PAGE_ERASE, FIU_EE, FIU_ENABLE, FIU_PE};
use crate::once::{Instr, Reg, Space, CMD_EXIT, CMD_GO, CMD_READ, GATEWAY, REG_MASK, REG_OPDBR, REG_OPGDBR};
use crate::statemachine::JtagState;
use crate::taps::{DEBUG_REQUEST, ENABLE_ONCE, IDCODE, IR_LEN};
use crate::unit::PAGE_WORDS;

/// JTAG ID reported by the simulated DSP.
pub const FAKE_IDCODE: u32 = 0x1f2d_401d;

const MEMORY_WORDS: usize = 0x1_0000;

// Registers of one flash interface unit, timing registers included
const FIU_REGISTERS: u16 = 17;

/// An erase the simulated flash performed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Erase {
    Mass { interface: u16 },
    Page { interface: u16, address: u16 },
}

/// One simulated flash interface unit and the cells it controls.
#[derive(Clone, Debug)]
pub struct FakeFlash {
    pub interface: u16,
    pub space: Space,
    pub ranges: Vec<RangeInclusive<u16>>,
    busy: u32,
}

impl FakeFlash {
    fn contains(&self, addr: u16) -> bool {
        self.ranges.iter().any(|r| r.contains(&addr))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Core {
    Running,
    Debug,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OncePhase {
    Command,
    Read,
    Write(u8),
}

struct Dsp {
    ir: u8,
    core: Core,
    // set by DEBUG_REQUEST, honoured when the core leaves reset
    debug_pending: bool,
    // ENABLE_ONCE attempts that still see the core in reset
    refusals: usize,
    held: bool,
    power_on_reset: bool,
    unpowered: usize,
    once: OncePhase,
    opcode: Option<u16>,
    dr_width: usize,
    regs: [u16; 8],
    pc: u16,
    gateway: u16,
    x: Vec<u16>,
    p: Vec<u16>,
    flash: Vec<FakeFlash>,
    busy_cycles: u32,
    erase_log: Vec<Erase>,
    gateway_reads: usize,
    busy_reads: usize,
    // every word written to OPDBR, in wire order
    opdbr_words: Vec<u16>,
}

impl Dsp {
    fn new() -> Self {
        Dsp {
            ir: IDCODE,
            core: Core::Running,
            debug_pending: false,
            refusals: 0,
            held: false,
            power_on_reset: false,
            unpowered: 0,
            once: OncePhase::Command,
            opcode: None,
            dr_width: 1,
            regs: [0; 8],
            pc: 0,
            gateway: 0,
            x: vec![0; MEMORY_WORDS],
            p: vec![0; MEMORY_WORDS],
            flash: Vec::new(),
            busy_cycles: 2,
            erase_log: Vec::new(),
            gateway_reads: 0,
            busy_reads: 0,
            opdbr_words: Vec::new(),
        }
    }

    fn status(&self, reset_line: bool) -> u8 {
        if self.unpowered > 0 {
            0x0
        } else if !reset_line || self.held || self.power_on_reset {
            0x9
        } else {
            match self.core {
                Core::Running => 0x1,
                Core::Debug => 0xd,
            }
        }
    }

    fn leave_reset(&mut self) {
        if !self.debug_pending {
            self.core = Core::Running;
            self.pc = 0;
        } else if self.refusals > 0 {
            self.held = true;
        } else {
            self.core = Core::Debug;
            self.debug_pending = false;
        }
    }

    fn update_ir(&mut self, code: u8, reset_line: bool) {
        self.ir = code;
        match code {
            DEBUG_REQUEST if self.unpowered > 0 => {
                self.unpowered -= 1;
                if self.unpowered == 0 {
                    debug!("fake target powered up");
                    self.power_on_reset = true;
                }
            }
            DEBUG_REQUEST => {
                self.debug_pending = true;
                if self.power_on_reset {
                    self.power_on_reset = false;
                    self.leave_reset();
                } else if reset_line && !self.held {
                    self.core = Core::Debug;
                    self.debug_pending = false;
                }
            }
            ENABLE_ONCE => {
                self.once = OncePhase::Command;
                self.opcode = None;
                if self.held {
                    self.refusals = self.refusals.saturating_sub(1);
                    if self.refusals == 0 {
                        self.held = false;
                        self.leave_reset();
                    }
                }
            }
            _ => {}
        }
    }

    fn capture_dr(&mut self) -> u32 {
        if self.unpowered > 0 {
            self.dr_width = 1;
            return 0;
        }
        match self.ir {
            IDCODE => {
                self.dr_width = 32;
                FAKE_IDCODE
            }
            ENABLE_ONCE => match self.once {
                OncePhase::Command => {
                    self.dr_width = 8;
                    0
                }
                OncePhase::Read => {
                    self.dr_width = 16;
                    u32::from(self.gateway)
                }
                OncePhase::Write(_) => {
                    self.dr_width = 16;
                    0
                }
            },
            _ => {
                self.dr_width = 1;
                0
            }
        }
    }

    fn update_dr(&mut self, value: u32) {
        if self.ir != ENABLE_ONCE || self.unpowered > 0 {
            return;
        }
        self.once = match self.once {
            OncePhase::Command => {
                let cmd = value as u8;
                if cmd & CMD_READ != 0 {
                    if cmd & REG_MASK == REG_OPGDBR {
                        self.gateway_reads += 1;
                    }
                    OncePhase::Read
                } else {
                    OncePhase::Write(cmd)
                }
            }
            OncePhase::Read => OncePhase::Command,
            OncePhase::Write(cmd) => {
                self.write_once(cmd, value as u16);
                OncePhase::Command
            }
        };
    }

    fn write_once(&mut self, cmd: u8, word: u16) {
        if cmd & REG_MASK != REG_OPDBR {
            trace!("ignoring write of {:#06x} to OnCE register {:#x}", word, cmd & REG_MASK);
            return;
        }
        self.opdbr_words.push(word);
        if cmd & CMD_GO == 0 {
            self.opcode = Some(word);
            return;
        }
        let instr = match self.opcode.take() {
            Some(opcode) => Instr::decode(opcode, Some(word)),
            None => Instr::decode(word, None),
        };
        match instr {
            Some(instr) if self.core == Core::Debug => {
                trace!("fake target executes {}", instr);
                self.execute(instr);
                if cmd & CMD_EXIT != 0 {
                    self.core = Core::Running;
                }
            }
            Some(instr) => debug!("core not in debug mode, dropping {}", instr),
            None => debug!("undecodable instruction word {:#06x}", word),
        }
    }

    fn execute(&mut self, instr: Instr) {
        match instr {
            Instr::Nop => {}
            Instr::MoveImm { dst, value } => self.regs[dst as usize] = value,
            Instr::MoveReg { dst, src } => self.regs[dst as usize] = self.regs[src as usize],
            Instr::Store { src, space, ptr, post_inc } => {
                let addr = self.regs[ptr as usize];
                self.write(space, addr, self.regs[src.reg() as usize]);
                if post_inc {
                    self.regs[ptr as usize] = addr.wrapping_add(1);
                }
            }
            Instr::Load { space, ptr, post_inc } => {
                let addr = self.regs[ptr as usize];
                self.regs[Reg::Y0 as usize] = self.read(space, addr);
                if post_inc {
                    self.regs[ptr as usize] = addr.wrapping_add(1);
                }
            }
            Instr::StoreAbs { addr } => self.write(Space::X, addr, self.regs[Reg::Y0 as usize]),
            Instr::Jmp { addr } => self.pc = addr,
        }
    }

    fn mem(&mut self, space: Space) -> &mut [u16] {
        match space {
            Space::X => &mut self.x,
            Space::P => &mut self.p,
        }
    }

    fn read(&mut self, space: Space, addr: u16) -> u16 {
        let value = self.mem(space)[usize::from(addr)];
        if space == Space::X {
            if let Some(fiu) = self.flash.iter_mut().find(|f| f.interface == addr) {
                if fiu.busy > 0 {
                    fiu.busy -= 1;
                    self.busy_reads += 1;
                    return value | CNTL_BUSY;
                }
                return value & !CNTL_BUSY;
            }
        }
        value
    }

    fn write(&mut self, space: Space, addr: u16, value: u16) {
        let register = space == Space::X
            && (addr == GATEWAY
                || self
                    .flash
                    .iter()
                    .any(|f| addr.wrapping_sub(f.interface) < FIU_REGISTERS));
        if register {
            if addr == GATEWAY {
                self.gateway = value;
            }
            self.x[usize::from(addr)] = value;
            return;
        }

        for i in 0..self.flash.len() {
            if self.flash[i].space != space {
                continue;
            }
            let base = usize::from(self.flash[i].interface);
            let cntl = self.x[base];
            let pe = self.x[base + usize::from(FIU_PE)];
            let ee = self.x[base + usize::from(FIU_EE)];
            let interface = self.flash[i].interface;

            if cntl & CNTL_MASS_ERASE != 0 && ee & FIU_ENABLE != 0 {
                for range in self.flash[i].ranges.clone() {
                    for a in range {
                        self.mem(space)[usize::from(a)] = 0xffff;
                    }
                }
                debug!("fake flash {:#06x} mass erased", interface);
                self.erase_log.push(Erase::Mass { interface });
            } else if !self.flash[i].contains(addr) {
                continue;
            } else if cntl & CNTL_PAGE_ERASE != 0 && ee & FIU_ENABLE != 0 {
                let page = addr & !(PAGE_WORDS - 1);
                for a in page..=page.saturating_add(PAGE_WORDS - 1) {
                    if self.flash[i].contains(a) {
                        self.mem(space)[usize::from(a)] = 0xffff;
                    }
                }
                debug!("fake flash {:#06x} erased page {:#06x}", interface, page);
                self.erase_log.push(Erase::Page { interface, address: page });
            } else if pe & FIU_ENABLE != 0 {
                self.mem(space)[usize::from(addr)] &= value;
            } else {
                trace!("plain write to flash cell {}:{:#06x} ignored", space, addr);
                return;
            }
            self.flash[i].busy = self.busy_cycles;
            return;
        }

        self.mem(space)[usize::from(addr)] = value;
    }
}

/// IEEE 1149.1 TAP controller transitions, kept apart from `JtagState::next`.
fn tap_step(state: JtagState, tms: bool) -> JtagState {
    use JtagState::*;
    match (state, tms) {
        (Reset, true) | (SelectIR, true) => Reset,
        (Reset, false) | (Idle, false) | (UpdateDR, false) | (UpdateIR, false) => Idle,
        (Idle, true) | (UpdateDR, true) | (UpdateIR, true) => SelectDR,
        (SelectDR, false) => CaptureDR,
        (SelectDR, true) => SelectIR,
        (CaptureDR, false) | (ShiftDR, false) | (Exit2DR, false) => ShiftDR,
        (CaptureDR, true) | (ShiftDR, true) => Exit1DR,
        (Exit1DR, false) | (PauseDR, false) => PauseDR,
        (PauseDR, true) => Exit2DR,
        (Exit1DR, true) | (Exit2DR, true) => UpdateDR,
        (SelectIR, false) => CaptureIR,
        (CaptureIR, false) | (ShiftIR, false) | (Exit2IR, false) => ShiftIR,
        (CaptureIR, true) | (ShiftIR, true) => Exit1IR,
        (Exit1IR, false) | (PauseIR, false) => PauseIR,
        (PauseIR, true) => Exit2IR,
        (Exit1IR, true) | (Exit2IR, true) => UpdateIR,
    }
}

pub struct FakeCable {
    tck: bool,
    tms: bool,
    tdi: bool,
    reset: bool,
    trst: bool,
    tdo: bool,
    stuck: Option<bool>,
    state: JtagState,
    // scan path contents, TDO end first
    chain: VecDeque<bool>,
    // instruction register lengths of the BYPASS devices on the TDI and TDO side of the DSP
    before: Vec<usize>,
    after: Vec<usize>,
    dsp: Dsp,
    ir_clocks: usize,
    dr_clocks: usize,
}

impl Default for FakeCable {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCable {
    /// A chain holding only the DSP, with program flash at P:$0000-$7DFF, data flash at
    /// X:$1000-$1FFF and boot flash at P:$8000-$87FF.
    pub fn new() -> Self {
        Self::with_chain(&[], &[])
    }

    /// A chain with BYPASS-only devices around the DSP.  Each entry is the instruction register
    /// length of one device; `before` lists the devices between TDI and the DSP.
    pub fn with_chain(before: &[usize], after: &[usize]) -> Self {
        let mut cable = FakeCable {
            tck: false,
            tms: true,
            tdi: false,
            reset: true,
            trst: true,
            tdo: false,
            stuck: None,
            state: JtagState::Reset,
            chain: VecDeque::new(),
            before: before.to_vec(),
            after: after.to_vec(),
            dsp: Dsp::new(),
            ir_clocks: 0,
            dr_clocks: 0,
        };
        cable.add_flash(0x0f40, Space::P, 0x0000..=0x7dff);
        cable.add_flash(0x0f60, Space::X, 0x1000..=0x1fff);
        cable.add_flash(0x0f80, Space::P, 0x8000..=0x87ff);
        cable
    }

    /// Remove every flash unit.
    pub fn clear_flash(&mut self) -> &mut Self {
        self.dsp.flash.clear();
        self
    }

    /// Add cells in `range` to the flash controlled by the interface unit at X:`interface`,
    /// creating the unit if needed.
    pub fn add_flash(&mut self, interface: u16, space: Space, range: RangeInclusive<u16>) -> &mut Self {
        match self.dsp.flash.iter_mut().find(|f| f.interface == interface) {
            Some(fiu) => fiu.ranges.push(range),
            None => self.dsp.flash.push(FakeFlash {
                interface,
                space,
                ranges: vec![range],
                busy: 0,
            }),
        }
        self
    }

    /// Number of status reads each erase or program step reports BUSY for.
    pub fn set_busy_cycles(&mut self, cycles: u32) -> &mut Self {
        self.dsp.busy_cycles = cycles;
        self
    }

    /// Fill memory, flash cells included.
    pub fn fill(&mut self, space: Space, range: RangeInclusive<u16>, value: u16) -> &mut Self {
        for addr in range {
            self.dsp.mem(space)[usize::from(addr)] = value;
        }
        self
    }

    /// Keep the core in reset for `attempts` ENABLE_ONCE instructions after a debug request.
    pub fn refuse_debug(&mut self, attempts: usize) -> &mut Self {
        self.dsp.refusals = attempts;
        self
    }

    /// Leave the target unpowered until it has seen `requests` debug requests.
    pub fn power_up_after(&mut self, requests: usize) -> &mut Self {
        self.dsp.unpowered = requests;
        self
    }

    /// Hold TDO at a fixed level, as with nothing connected.
    pub fn stick_tdo(&mut self, level: bool) -> &mut Self {
        self.stuck = Some(level);
        self
    }

    /// Put the core straight into debug mode.
    pub fn force_debug(&mut self) -> &mut Self {
        self.dsp.core = Core::Debug;
        self.dsp.held = false;
        self.dsp.debug_pending = false;
        self
    }

    pub fn reset_counters(&mut self) {
        self.ir_clocks = 0;
        self.dr_clocks = 0;
        self.dsp.gateway_reads = 0;
        self.dsp.busy_reads = 0;
        self.dsp.erase_log.clear();
        self.dsp.opdbr_words.clear();
    }

    /// Clocks spent in Shift-IR and Shift-DR.
    pub fn shift_clocks(&self) -> (usize, usize) {
        (self.ir_clocks, self.dr_clocks)
    }

    pub fn gateway_reads(&self) -> usize {
        self.dsp.gateway_reads
    }

    /// Flash status reads that returned BUSY.
    pub fn busy_reads(&self) -> usize {
        self.dsp.busy_reads
    }

    /// Instruction and operand words written to OPDBR since the last `reset_counters`.
    pub fn instruction_words(&self) -> &[u16] {
        &self.dsp.opdbr_words
    }

    pub fn erase_log(&self) -> &[Erase] {
        &self.dsp.erase_log
    }

    pub fn idcode(&self) -> u32 {
        FAKE_IDCODE
    }

    pub fn memory(&self, space: Space, addr: u16) -> u16 {
        match space {
            Space::X => self.dsp.x[usize::from(addr)],
            Space::P => self.dsp.p[usize::from(addr)],
        }
    }

    pub fn core_reg(&self, reg: Reg) -> u16 {
        self.dsp.regs[reg as usize]
    }

    pub fn pc(&self) -> u16 {
        self.dsp.pc
    }

    pub fn is_running(&self) -> bool {
        self.dsp.core == Core::Running && self.reset && !self.dsp.held
    }

    pub fn in_debug(&self) -> bool {
        self.dsp.core == Core::Debug && self.reset && !self.dsp.held
    }

    /// Levels of the /RESET and /TRST lines.
    pub fn reset_lines(&self) -> (bool, bool) {
        (self.reset, self.trst)
    }

    fn push_bits(&mut self, value: u32, width: usize) {
        for i in 0..width {
            self.chain.push_back(i < 32 && (value >> i) & 1 != 0);
        }
    }

    fn take_bits(&self, offset: usize, width: usize) -> u32 {
        (0..width.min(32)).fold(0, |acc, i| {
            acc | (u32::from(self.chain.get(offset + i).copied().unwrap_or(false)) << i)
        })
    }

    fn capture_ir(&mut self) {
        let status = self.dsp.status(self.reset);
        self.chain.clear();
        for len in self.after.clone().into_iter().rev() {
            self.push_bits(1, len);
        }
        self.push_bits(u32::from(status), IR_LEN);
        for len in self.before.clone().into_iter().rev() {
            self.push_bits(1, len);
        }
    }

    fn update_ir(&mut self) {
        let offset = self.after.iter().sum();
        let code = self.take_bits(offset, IR_LEN) as u8;
        self.dsp.update_ir(code, self.reset);
    }

    fn capture_dr(&mut self) {
        let value = self.dsp.capture_dr();
        self.chain.clear();
        self.push_bits(0, self.after.len());
        self.push_bits(value, self.dsp.dr_width);
        self.push_bits(0, self.before.len());
    }

    fn update_dr(&mut self) {
        let value = self.take_bits(self.after.len(), self.dsp.dr_width);
        self.dsp.update_dr(value);
    }

    fn test_logic_reset(&mut self) {
        self.state = JtagState::Reset;
        self.dsp.ir = IDCODE;
        self.dsp.once = OncePhase::Command;
    }

    fn rising_edge(&mut self) {
        if !self.trst {
            return;
        }
        match self.state {
            JtagState::ShiftIR | JtagState::ShiftDR => {
                self.chain.pop_front();
                self.chain.push_back(self.tdi);
                if self.state == JtagState::ShiftIR {
                    self.ir_clocks += 1;
                } else {
                    self.dr_clocks += 1;
                }
            }
            _ => {}
        }

        let next = tap_step(self.state, self.tms);
        match next {
            JtagState::Reset => self.test_logic_reset(),
            JtagState::CaptureIR => self.capture_ir(),
            JtagState::CaptureDR => self.capture_dr(),
            JtagState::UpdateIR => self.update_ir(),
            JtagState::UpdateDR => self.update_dr(),
            _ => {}
        }
        self.state = next;
    }

    fn falling_edge(&mut self) {
        if matches!(self.state, JtagState::ShiftIR | JtagState::ShiftDR) {
            self.tdo = self.chain.front().copied().unwrap_or(false);
        }
    }
}

impl Cable for FakeCable {
    fn set_signal(&mut self, signal: Signal, high: bool) -> Result<(), LinkError> {
        match signal {
            Signal::Tck => {
                if high && !self.tck {
                    self.tck = true;
                    self.rising_edge();
                } else if !high && self.tck {
                    self.tck = false;
                    self.falling_edge();
                }
            }
            Signal::Tms => self.tms = high,
            Signal::Tdi => self.tdi = high,
            Signal::Reset => {
                let released = high && !self.reset;
                self.reset = high;
                if released && self.dsp.unpowered == 0 {
                    self.dsp.leave_reset();
                }
            }
            Signal::Trst => {
                self.trst = high;
                if !high {
                    self.test_logic_reset();
                }
            }
        }
        Ok(())
    }

    fn read_tdo(&mut self) -> Result<bool, LinkError> {
        if let Some(level) = self.stuck {
            return Ok(level);
        }
        if self.dsp.unpowered > 0 {
            return Ok(false);
        }
        Ok(self.tdo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(cable: &mut FakeCable, tms: bool) {
        cable.clock(tms, false).unwrap();
    }

    #[test]
    fn tms_walks_the_tap() {
        let mut cable = FakeCable::new();
        for _ in 0..5 {
            clock(&mut cable, true);
        }
        assert_eq!(cable.state, JtagState::Reset);
        clock(&mut cable, false);
        clock(&mut cable, true);
        assert_eq!(cable.state, JtagState::SelectDR);
        clock(&mut cable, true);
        assert_eq!(cable.state, JtagState::SelectIR);
    }

    #[test]
    fn tap_matches_state_machine() {
        for state in JtagState::ALL {
            for tms in [false, true] {
                assert_eq!(tap_step(state, tms), state.next(tms), "{:?} with TMS {}", state, tms);
            }
        }
    }

    #[test]
    fn update_ir_returns_to_select_dr() {
        let mut cable = FakeCable::new();
        // Reset -> Idle -> SelectDR -> SelectIR -> CaptureIR -> Exit1IR -> UpdateIR -> SelectDR
        cable.change_mode(&[false, true, true, false, true, true, true], false).unwrap();
        assert_eq!(cable.state, JtagState::SelectDR);
    }

    #[test]
    fn trst_forces_reset() {
        let mut cable = FakeCable::new();
        cable.change_mode(&[false, true, false, false], false).unwrap();
        assert_eq!(cable.state, JtagState::ShiftDR);
        cable.set_signal(Signal::Trst, false).unwrap();
        clock(&mut cable, false);
        assert_eq!(cable.state, JtagState::Reset);
        cable.set_signal(Signal::Trst, true).unwrap();
        clock(&mut cable, false);
        assert_eq!(cable.state, JtagState::Idle);
    }

    #[test]
    fn idcode_after_reset() {
        let mut cable = FakeCable::new();
        // Reset -> Idle -> SelectDR -> CaptureDR -> ShiftDR
        cable.change_mode(&[false, true, false, false], false).unwrap();
        let mut id = 0u32;
        for i in 0..32 {
            if cable.clock_read(i == 31, false).unwrap() {
                id |= 1 << i;
            }
        }
        assert_eq!(id, FAKE_IDCODE);
    }

    #[test]
    fn flash_cells_need_the_interface() {
        let mut cable = FakeCable::new();
        cable.dsp.write(Space::P, 0x0010, 0x1234);
        assert_eq!(cable.memory(Space::P, 0x0010), 0);

        cable.dsp.write(Space::X, 0x0f40 + FIU_PE, FIU_ENABLE);
        cable.fill(Space::P, 0x0010..=0x0010, 0xffff);
        cable.dsp.write(Space::P, 0x0010, 0x1234);
        assert_eq!(cable.memory(Space::P, 0x0010), 0x1234);
        assert_eq!(cable.dsp.read(Space::X, 0x0f40) & CNTL_BUSY, CNTL_BUSY);
        assert_eq!(cable.busy_reads(), 1);
    }
}
