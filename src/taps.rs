//! A wrapper for scan chains where the DSP shares the port with other devices.  `Taps` lets the
//! client talk to the DSP as if it were the only TAP in the chain: the other devices' instruction
//! registers are filled with ones (BYPASS) and their bypass bits are padded around every data
//! shift.
//!
//! Every primitive starts and ends in Select-DR-Scan.
use log::debug;

use crate::cable::{Cable, Signal};
use crate::error::{Error, Result};
use crate::statemachine::{JtagSM, JtagState, Register};

/// Longest scan path `measure` will probe before giving up.
pub const MAX_PATH: usize = 256;

/// Width of the DSP's instruction register.
pub const IR_LEN: usize = 4;

pub const IDCODE: u8 = 0x2;
pub const ENABLE_ONCE: u8 = 0x6;
pub const DEBUG_REQUEST: u8 = 0x7;
pub const BYPASS: u8 = 0xf;

// Hold times, in settle periods of ~100ns
const RESET_SETUP: usize = 4;
const RESET_RECOVERY: usize = 50;

/// Number of instruction and data register bits that sit between TDI and the DSP.  Zero means the
/// DSP is the first device after TDI.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChainPosition {
    pub instruction: usize,
    pub data: usize,
}

/// Total length of both scan paths, with every device in BYPASS for the data path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathLengths {
    pub instruction: usize,
    pub data: usize,
}

/// Core state reported in the bits captured by every instruction shift.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TapStatus {
    NoPower,
    Running,
    WaitOrStop,
    InReset,
    Debug,
    Unknown(u8),
}

impl From<u8> for TapStatus {
    fn from(bits: u8) -> Self {
        match bits & 0xf {
            0x0 | 0xf => TapStatus::NoPower,
            0x1 => TapStatus::Running,
            0x5 => TapStatus::WaitOrStop,
            0x9 => TapStatus::InReset,
            0xd => TapStatus::Debug,
            other => TapStatus::Unknown(other),
        }
    }
}

impl core::fmt::Display for TapStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TapStatus::NoPower => write!(f, "no power?"),
            TapStatus::Running => write!(f, "DSP running"),
            TapStatus::WaitOrStop => write!(f, "DSP in wait or stop"),
            TapStatus::InReset => write!(f, "DSP in reset"),
            TapStatus::Debug => write!(f, "DSP in debug mode"),
            TapStatus::Unknown(bits) => write!(f, "unknown status {:#x}", bits),
        }
    }
}

pub struct Taps<C> {
    pub sm: JtagSM<C>,
    position: ChainPosition,
    lengths: PathLengths,
}

impl<C: Cable> Taps<C> {
    /// Create an object using an existing `JtagSM` object.  Until `measure` is called the chain
    /// is assumed to end right after the DSP.
    pub fn new(sm: JtagSM<C>, position: ChainPosition) -> Self {
        let lengths = PathLengths {
            instruction: position.instruction + IR_LEN,
            data: position.data + 1,
        };
        Self { sm, position, lengths }
    }

    pub fn position(&self) -> ChainPosition {
        self.position
    }

    pub fn lengths(&self) -> PathLengths {
        self.lengths
    }

    /// Wait `periods` settle times with the lines unchanged.
    pub fn settle(&mut self, periods: usize) -> Result<()> {
        for _ in 0..periods {
            self.sm.cable.settle()?;
        }
        Ok(())
    }

    fn finish_probe(&mut self, reg: Register) -> Result<()> {
        self.sm.shift_ones(reg, 1, true)?;
        self.sm.change_mode(JtagState::SelectDR)?;
        Ok(())
    }

    /// Measure both scan paths by flushing them with ones and counting the clocks a single zero
    /// needs to reach TDO.  Every instruction register is left holding BYPASS.
    pub fn measure(&mut self) -> Result<PathLengths> {
        self.sm.change_mode(JtagState::SelectDR)?;
        let instruction = self.sm.walk_zero(Register::Instruction, MAX_PATH)?;
        self.finish_probe(Register::Instruction)?;
        let data = self.sm.walk_zero(Register::Data, MAX_PATH)?;
        self.finish_probe(Register::Data)?;
        debug!("measured IR path {} bits, DR path {} bits", instruction, data);

        if instruction >= MAX_PATH || data >= MAX_PATH {
            return Err(Error::ChainOverflow { instruction, data });
        }
        if instruction < self.position.instruction + IR_LEN || data < self.position.data + 1 {
            return Err(Error::ChainTooShort {
                instruction,
                data,
                position_ir: self.position.instruction,
                position_dr: self.position.data,
            });
        }

        self.lengths = PathLengths { instruction, data };
        Ok(self.lengths)
    }

    /// Shift `code` into the DSP's instruction register and return the 4 status bits captured
    /// from it.  Exactly one clock per instruction path bit is spent in Shift-IR.
    pub fn shift_ir(&mut self, code: u8) -> Result<u8> {
        let after = self.position.instruction;
        let before = self.lengths.instruction - after - IR_LEN;

        self.sm.change_mode(JtagState::SelectDR)?;
        self.sm.shift_ones(Register::Instruction, before, false)?;
        let status =
            self.sm
                .read_write_reg(Register::Instruction, u32::from(code), IR_LEN, after == 0)?;
        self.sm.shift_ones(Register::Instruction, after, true)?;
        self.sm.change_mode(JtagState::SelectDR)?;
        Ok(status as u8)
    }

    /// Shift the low `bits` bits of `value` into the DSP's data register and return the bits it
    /// held.  The other devices' bypass bits are padded with ones and their output discarded.
    pub fn shift_dr(&mut self, value: u32, bits: usize) -> Result<u32> {
        let after = self.position.data;
        let before = self.lengths.data - after - 1;

        self.sm.change_mode(JtagState::SelectDR)?;
        self.sm.shift_ones(Register::Data, before, false)?;
        let captured = self.sm.read_write_reg(Register::Data, value, bits, after == 0)?;
        self.sm.shift_ones(Register::Data, after, true)?;
        self.sm.change_mode(JtagState::SelectDR)?;
        Ok(captured)
    }

    /// Execute a JTAG instruction while the core is held in reset, then let it run again.  This
    /// works whether or not /RESET is actually wired to the core.
    pub fn execute_in_reset(&mut self, code: u8) -> Result<u8> {
        self.sm.cable.set_signal(Signal::Reset, false)?;
        self.settle(RESET_SETUP)?;
        let status = self.shift_ir(code)?;
        self.sm.cable.set_signal(Signal::Reset, true)?;
        self.settle(RESET_RECOVERY)?;
        Ok(status)
    }
}
