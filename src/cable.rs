//! Implementations for different JTAG hardware adapters live here.  Hardware adapters should
//! implement the `Cable` trait, which drives the individual JTAG lines of the adapter.  Everything
//! above this layer is built from single TCK cycles, so an adapter only has to know how to set a
//! line and sample TDO; adapters that can batch several edges into one USB transfer override the
//! provided methods.
use alloc::boxed::Box;

use crate::error::LinkError;

pub mod fake;
pub mod gpio;

#[cfg(feature = "std")]
pub mod ft232h;
#[cfg(feature = "std")]
pub mod jlink;
#[cfg(feature = "std")]
pub mod jtagkey;
#[cfg(feature = "std")]
pub mod usbblaster;

/// The output lines of the debug port.  `Reset` and `Trst` are the active-low /RESET and /TRST
/// lines, so driving them low asserts the reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Tck,
    Tms,
    Tdi,
    Reset,
    Trst,
}

pub trait Cable {
    /// Drive `signal` to the given electrical level.  The change must reach the hardware before
    /// this returns.
    fn set_signal(&mut self, signal: Signal, high: bool) -> Result<(), LinkError>;

    /// Sample the TDO line.
    fn read_tdo(&mut self) -> Result<bool, LinkError>;

    /// Hold the current line levels for at least 100ns.  Adapters whose transport latency already
    /// exceeds that can leave this empty.
    fn settle(&mut self) -> Result<(), LinkError> {
        Ok(())
    }

    /// Run one TCK cycle with the given TMS and TDI levels.  TCK is left high.
    fn clock(&mut self, tms: bool, tdi: bool) -> Result<(), LinkError> {
        self.set_signal(Signal::Tms, tms)?;
        self.set_signal(Signal::Tdi, tdi)?;
        self.set_signal(Signal::Tck, false)?;
        self.set_signal(Signal::Tck, true)
    }

    /// Run one TCK cycle and return the TDO level sampled after the rising edge, which is the bit
    /// shifted out by that edge.
    fn clock_read(&mut self, tms: bool, tdi: bool) -> Result<bool, LinkError> {
        self.clock(tms, tdi)?;
        self.read_tdo()
    }

    /// Clock out a series of TMS values to change the state of the JTAG chain.  `tdi` controls
    /// the state of the TDI line during the mode change.
    fn change_mode(&mut self, tms: &[bool], tdi: bool) -> Result<(), LinkError> {
        for &t in tms {
            self.clock(t, tdi)?;
        }
        Ok(())
    }
}

impl<C: Cable + ?Sized> Cable for Box<C> {
    fn set_signal(&mut self, signal: Signal, high: bool) -> Result<(), LinkError> {
        (**self).set_signal(signal, high)
    }

    fn read_tdo(&mut self) -> Result<bool, LinkError> {
        (**self).read_tdo()
    }

    fn settle(&mut self) -> Result<(), LinkError> {
        (**self).settle()
    }

    fn clock(&mut self, tms: bool, tdi: bool) -> Result<(), LinkError> {
        (**self).clock(tms, tdi)
    }

    fn clock_read(&mut self, tms: bool, tdi: bool) -> Result<bool, LinkError> {
        (**self).clock_read(tms, tdi)
    }

    fn change_mode(&mut self, tms: &[bool], tdi: bool) -> Result<(), LinkError> {
        (**self).change_mode(tms, tdi)
    }
}

impl<C: Cable + ?Sized> Cable for &mut C {
    fn set_signal(&mut self, signal: Signal, high: bool) -> Result<(), LinkError> {
        (**self).set_signal(signal, high)
    }

    fn read_tdo(&mut self) -> Result<bool, LinkError> {
        (**self).read_tdo()
    }

    fn settle(&mut self) -> Result<(), LinkError> {
        (**self).settle()
    }

    fn clock(&mut self, tms: bool, tdi: bool) -> Result<(), LinkError> {
        (**self).clock(tms, tdi)
    }

    fn clock_read(&mut self, tms: bool, tdi: bool) -> Result<bool, LinkError> {
        (**self).clock_read(tms, tdi)
    }

    fn change_mode(&mut self, tms: &[bool], tdi: bool) -> Result<(), LinkError> {
        (**self).change_mode(tms, tdi)
    }
}

/// Open an adapter by name.  Recognized names are "ft232h", "jtagkey", "usbblaster", "jlink" and
/// "fake", which simulates a single target with the default flash layout.
#[cfg(feature = "std")]
pub fn new_from_string(name: &str) -> Result<Box<dyn Cable>, LinkError> {
    use alloc::string::ToString;

    match name {
        "ft232h" => Ok(Box::new(ft232h::Ft232h::open()?)),
        "jtagkey" => Ok(Box::new(jtagkey::JtagKey::new(true)?)),
        "usbblaster" => Ok(Box::new(usbblaster::UsbBlaster::new()?)),
        "jlink" => Ok(Box::new(jlink::JLink::new()?)),
        "fake" => Ok(Box::new(fake::FakeCable::new())),
        _ => Err(LinkError::UnsupportedAdapter(name.to_string())),
    }
}
