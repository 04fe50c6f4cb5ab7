//! Implement the `Cable` trait for Altera USB Blaster and clones.  The blaster is driven in its
//! byte-bang mode: each byte sets all pins at once, and bit 6 requests a TDO sample.  It has no
//! reset outputs, so /RESET and /TRST requests are accepted and ignored.
use alloc::vec::Vec;

use libftd2xx::{Ftdi, FtdiCommon};
use log::debug;

use crate::cable::{Cable, Signal};
use crate::error::LinkError;

const PIN_TCK: u8 = 1;
const PIN_TMS: u8 = 1 << 1;
const PIN_N_CE: u8 = 1 << 2;
const PIN_N_CS: u8 = 1 << 3;
const PIN_TDI: u8 = 1 << 4;
const PIN_LED: u8 = 1 << 5;
const READ_CMD: u8 = 1 << 6;

// Always-on bits of every byte-bang command
const IDLE: u8 = PIN_N_CE | PIN_N_CS | PIN_LED;

pub struct UsbBlaster {
    ft: Ftdi,
    pins: u8,
}

impl UsbBlaster {
    /// Create a new UsbBlaster.
    pub fn new() -> Result<Self, LinkError> {
        libftd2xx::set_vid_pid(0x16c0, 0x06ad)?;
        let mut ft = Ftdi::with_description("USB-JTAG-IF")?;
        ft.purge_all()?;
        debug!("USB Blaster opened");

        Ok(Self { ft, pins: IDLE })
    }

    fn send(&mut self, buf: &[u8]) -> Result<(), LinkError> {
        self.ft.write(buf)?;
        Ok(())
    }

    fn with(&self, tms: bool, tdi: bool) -> u8 {
        let mut pins = self.pins & !(PIN_TMS | PIN_TDI);
        if tms {
            pins |= PIN_TMS;
        }
        if tdi {
            pins |= PIN_TDI;
        }
        pins
    }
}

impl Cable for UsbBlaster {
    fn set_signal(&mut self, signal: Signal, high: bool) -> Result<(), LinkError> {
        let mask = match signal {
            Signal::Tck => PIN_TCK,
            Signal::Tms => PIN_TMS,
            Signal::Tdi => PIN_TDI,
            Signal::Reset | Signal::Trst => {
                debug!("USB Blaster has no {:?} line, ignoring", signal);
                return Ok(());
            }
        };
        if high {
            self.pins |= mask;
        } else {
            self.pins &= !mask;
        }
        let pins = self.pins;
        self.send(&[pins])
    }

    fn read_tdo(&mut self) -> Result<bool, LinkError> {
        let pins = self.pins;
        self.send(&[pins | READ_CMD])?;
        let mut recv = [0u8; 1];
        self.ft.read(&mut recv)?;
        Ok(recv[0] & 1 != 0)
    }

    fn clock(&mut self, tms: bool, tdi: bool) -> Result<(), LinkError> {
        let pins = self.with(tms, tdi);
        self.pins = pins | PIN_TCK;
        self.send(&[pins & !PIN_TCK, pins | PIN_TCK])
    }

    fn change_mode(&mut self, tms: &[bool], tdi: bool) -> Result<(), LinkError> {
        let mut buf = Vec::with_capacity(tms.len() * 2);
        for &t in tms {
            let pins = self.with(t, tdi);
            buf.push(pins & !PIN_TCK);
            buf.push(pins | PIN_TCK);
            self.pins = pins | PIN_TCK;
        }
        self.send(&buf)
    }
}
