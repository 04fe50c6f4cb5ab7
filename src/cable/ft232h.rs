//! Implement the `Cable` trait for FTDI FT232H-based command converters driven in asynchronous
//! bit-bang mode.  Every pin change is one byte written to the adapter; TCK cycles are batched so
//! that a full cycle costs a single USB write.
use alloc::vec::Vec;

use libftd2xx::{BitMode, Ftdi, FtdiCommon};
use log::debug;

use crate::cable::{Cable, Signal};
use crate::error::LinkError;

// The adapter drives /RESET through an inverting transistor: setting the bit pulls the line low.
const PIN_RESET: u8 = 1;
const PIN_TMS: u8 = 1 << 1;
const PIN_TCK: u8 = 1 << 2;
const PIN_TDI: u8 = 1 << 3;
const PIN_TRST: u8 = 1 << 4;
const PIN_TDO: u8 = 1 << 5;
const OUTPUT_PINS: u8 = PIN_RESET | PIN_TMS | PIN_TCK | PIN_TDI | PIN_TRST;

pub struct Ft232h {
    ft: Ftdi,
    // Mirror of the output port
    pins: u8,
}

impl Ft232h {
    /// Open the first FTDI device found.
    pub fn open() -> Result<Self, LinkError> {
        let ft = Ftdi::new()?;
        Self::new(ft)
    }

    /// Open the adapter whose USB description matches `description`.
    pub fn with_description(description: &str) -> Result<Self, LinkError> {
        let ft = Ftdi::with_description(description)?;
        Self::new(ft)
    }

    pub fn new(mut ft: Ftdi) -> Result<Self, LinkError> {
        ft.set_bit_mode(OUTPUT_PINS, BitMode::AsyncBitbang)?;
        ft.purge_all()?;
        debug!("FT232H opened in bit-bang mode");

        Ok(Self { ft, pins: 0 })
    }

    fn mask(signal: Signal) -> u8 {
        match signal {
            Signal::Tck => PIN_TCK,
            Signal::Tms => PIN_TMS,
            Signal::Tdi => PIN_TDI,
            Signal::Reset => PIN_RESET,
            Signal::Trst => PIN_TRST,
        }
    }

    fn apply(pins: u8, signal: Signal, high: bool) -> u8 {
        // /RESET is inverted by the adapter hardware
        let set = if signal == Signal::Reset { !high } else { high };
        if set {
            pins | Self::mask(signal)
        } else {
            pins & !Self::mask(signal)
        }
    }

    fn cycle(&self, buf: &mut Vec<u8>, tms: bool, tdi: bool) -> u8 {
        let pins = Self::apply(self.pins, Signal::Tms, tms);
        let pins = Self::apply(pins, Signal::Tdi, tdi);
        buf.push(pins & !PIN_TCK);
        buf.push(pins | PIN_TCK);
        pins | PIN_TCK
    }

    fn send(&mut self, buf: &[u8]) -> Result<(), LinkError> {
        self.ft.write(buf)?;
        Ok(())
    }
}

impl Cable for Ft232h {
    fn set_signal(&mut self, signal: Signal, high: bool) -> Result<(), LinkError> {
        self.pins = Self::apply(self.pins, signal, high);
        let pins = self.pins;
        self.send(&[pins])
    }

    fn read_tdo(&mut self) -> Result<bool, LinkError> {
        let pins = self.ft.bit_mode()?;
        Ok(pins & PIN_TDO != 0)
    }

    fn settle(&mut self) -> Result<(), LinkError> {
        // One more USB write of the unchanged port takes well over 100ns
        let pins = self.pins;
        self.send(&[pins])
    }

    fn clock(&mut self, tms: bool, tdi: bool) -> Result<(), LinkError> {
        let mut buf = Vec::with_capacity(2);
        self.pins = self.cycle(&mut buf, tms, tdi);
        self.send(&buf)
    }

    fn change_mode(&mut self, tms: &[bool], tdi: bool) -> Result<(), LinkError> {
        let mut buf = Vec::with_capacity(tms.len() * 2);
        for &t in tms {
            self.pins = self.cycle(&mut buf, t, tdi);
        }
        self.send(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_line_is_inverted() {
        assert_eq!(Ft232h::apply(0, Signal::Reset, false), PIN_RESET);
        assert_eq!(Ft232h::apply(PIN_RESET, Signal::Reset, true), 0);
        assert_eq!(Ft232h::apply(0, Signal::Trst, true), PIN_TRST);
        assert_eq!(Ft232h::apply(PIN_TMS | PIN_TDI, Signal::Tdi, false), PIN_TMS);
    }
}
