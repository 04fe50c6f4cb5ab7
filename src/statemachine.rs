//! This provides a higher-level interface than the `Cable` trait.  Specifically, it keeps track of
//! the state of the JTAG state machine, and allows setting the state to any desired state.
//! `JtagSM` will get to that state by the most efficient path, based on the current state.
use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;

use crate::cable::Cable;
use crate::error::LinkError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Register {
    Data,
    Instruction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JtagState {
    Reset = 0,
    Idle = 1,
    SelectDR = 2,
    CaptureDR = 3,
    ShiftDR = 4,
    Exit1DR = 5,
    PauseDR = 6,
    Exit2DR = 7,
    UpdateDR = 8,
    SelectIR = 9,
    CaptureIR = 10,
    ShiftIR = 11,
    Exit1IR = 12,
    PauseIR = 13,
    Exit2IR = 14,
    UpdateIR = 15,
}

impl JtagState {
    #[cfg(test)]
    pub(crate) const ALL: [JtagState; 16] = [
        JtagState::Reset,
        JtagState::Idle,
        JtagState::SelectDR,
        JtagState::CaptureDR,
        JtagState::ShiftDR,
        JtagState::Exit1DR,
        JtagState::PauseDR,
        JtagState::Exit2DR,
        JtagState::UpdateDR,
        JtagState::SelectIR,
        JtagState::CaptureIR,
        JtagState::ShiftIR,
        JtagState::Exit1IR,
        JtagState::PauseIR,
        JtagState::Exit2IR,
        JtagState::UpdateIR,
    ];

    /// The state reached from `self` by one TCK rising edge with the given TMS level.
    pub fn next(self, tms: bool) -> JtagState {
        use JtagState::*;
        // (TMS = 0, TMS = 1)
        let (low, high) = match self {
            Reset => (Idle, Reset),
            Idle => (Idle, SelectDR),
            SelectDR => (CaptureDR, SelectIR),
            CaptureDR => (ShiftDR, Exit1DR),
            ShiftDR => (ShiftDR, Exit1DR),
            Exit1DR => (PauseDR, UpdateDR),
            PauseDR => (PauseDR, Exit2DR),
            Exit2DR => (ShiftDR, UpdateDR),
            UpdateDR => (Idle, SelectDR),
            SelectIR => (CaptureIR, Reset),
            CaptureIR => (ShiftIR, Exit1IR),
            ShiftIR => (ShiftIR, Exit1IR),
            Exit1IR => (PauseIR, UpdateIR),
            PauseIR => (PauseIR, Exit2IR),
            Exit2IR => (ShiftIR, UpdateIR),
            UpdateIR => (Idle, SelectDR),
        };
        if tms {
            high
        } else {
            low
        }
    }
}

/// Shortest TMS sequence leading from `from` to `to`.
fn get_path(from: JtagState, to: JtagState) -> Vec<bool> {
    let mut prev: [Option<(JtagState, bool)>; 16] = [None; 16];
    let mut seen = [false; 16];
    let mut queue = VecDeque::new();
    seen[from as usize] = true;
    queue.push_back(from);

    while let Some(state) = queue.pop_front() {
        if state == to {
            break;
        }
        for tms in [false, true] {
            let next = state.next(tms);
            if !seen[next as usize] {
                seen[next as usize] = true;
                prev[next as usize] = Some((state, tms));
                queue.push_back(next);
            }
        }
    }

    let mut path = vec![];
    let mut state = to;
    while let Some((before, tms)) = prev[state as usize] {
        path.push(tms);
        state = before;
    }
    path.reverse();
    path
}

pub struct JtagSM<C> {
    pub cable: C,
    state: JtagState,
}

impl<C: Cable> JtagSM<C> {
    /// Create a JTAG state machine using an existing `Cable`.  The TAP state is unknown until
    /// `mode_reset` is called.
    pub fn new(cable: C) -> Self {
        Self {
            cable,
            state: JtagState::Reset,
        }
    }

    pub fn state(&self) -> JtagState {
        self.state
    }

    /// Reset the scan chain by driving TMS high for 10 clocks: five are required after power-up,
    /// five more bring the TAP to Test-Logic-Reset when /TRST is not wired.
    pub fn mode_reset(&mut self) -> Result<(), LinkError> {
        self.cable.change_mode(&[true; 10], false)?;
        self.state = JtagState::Reset;
        Ok(())
    }

    /// Record that the TAP was forced into `state` behind our back, e.g. by /TRST.
    pub fn assume(&mut self, state: JtagState) {
        self.state = state;
    }

    /// Use TMS to get into `state` by the most efficient path
    pub fn change_mode(&mut self, state: JtagState) -> Result<(), LinkError> {
        if self.state == state {
            return Ok(());
        }

        let path = get_path(self.state, state);
        self.cable.change_mode(&path, true)?;
        self.state = state;
        Ok(())
    }

    fn enter_shift(&mut self, reg: Register) -> Result<(), LinkError> {
        match reg {
            Register::Data => self.change_mode(JtagState::ShiftDR),
            Register::Instruction => self.change_mode(JtagState::ShiftIR),
        }
    }

    fn leave_shift(&mut self, reg: Register) {
        self.state = match reg {
            Register::Data => JtagState::Exit1DR,
            Register::Instruction => JtagState::Exit1IR,
        };
    }

    /// Shift `count` ones into either register.  If `exit` is set, TMS is raised on the last bit
    /// and the state machine ends in Exit1.
    pub fn shift_ones(&mut self, reg: Register, count: usize, exit: bool) -> Result<(), LinkError> {
        if count == 0 {
            return Ok(());
        }
        self.enter_shift(reg)?;
        for i in 0..count {
            self.cable.clock(exit && i == count - 1, true)?;
        }
        if exit {
            self.leave_shift(reg);
        }
        Ok(())
    }

    /// Shift the low `bits` bits of `value` LSB first into either register and return the bits
    /// shifted out, first one in bit 0.  If `exit` is set, TMS is raised on the last bit and the
    /// state machine ends in Exit1.
    pub fn read_write_reg(
        &mut self,
        reg: Register,
        value: u32,
        bits: usize,
        exit: bool,
    ) -> Result<u32, LinkError> {
        debug_assert!(bits <= 32);
        if bits == 0 {
            return Ok(0);
        }
        self.enter_shift(reg)?;
        let mut result = 0u32;
        for i in 0..bits {
            let tms = exit && i == bits - 1;
            if self.cable.clock_read(tms, (value >> i) & 1 != 0)? {
                result |= 1 << i;
            }
        }
        if exit {
            self.leave_shift(reg);
        }
        Ok(result)
    }

    /// Shift ones until a zero shifted in ahead of them appears at TDO, giving up after `max`
    /// clocks.  Returns the number of clocks that took, which is the register path length.
    pub fn walk_zero(&mut self, reg: Register, max: usize) -> Result<usize, LinkError> {
        self.enter_shift(reg)?;
        // Flush the path with ones, then push a single zero in
        for _ in 0..max {
            self.cable.clock(false, true)?;
        }
        let mut tdo = self.cable.clock_read(false, false)?;
        let mut count = 0;
        while tdo && count < max {
            tdo = self.cable.clock_read(false, true)?;
            count += 1;
        }
        Ok(count)
    }
}
