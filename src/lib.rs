//! This crate programs, erases, verifies and reads the on-chip flash of DSP56F80x digital signal
//! processors through their JTAG port.  It is built in layers, each usable on its own.
//!
//! At the lowest level is the Cable trait, which drives the individual lines of a debug adapter:
//! TCK, TMS, TDI, /RESET and /TRST, and samples TDO.  FTDI based adapters, the USB-Blaster, the
//! J-Link and plain embedded-hal GPIO pins are supported, as well as a simulated target for tests
//! and dry runs.
//!
//! JtagSM keeps track of the TAP state and gets to any other state with the fewest clocks.  Taps
//! adds the DSP's position in a chain of several devices: it measures both scan paths and shifts
//! instructions and data into the DSP alone, padding the other devices' bits.
//!
//! Once talks to the core through the OnCE debug port.  It feeds the core single instructions
//! and reads values back through the OPGDBR gateway, which is enough to access every register
//! and both memory spaces.  On top of that, Flasher drives the flash interface units, and
//! Session handles power-up, debug mode entry and the release of the target at the end.
//!
//! # Example
//! ```
//! use once_flash::cable::fake::FakeCable;
//! use once_flash::once::Space;
//! use once_flash::session::{Session, SessionConfig};
//! use once_flash::unit::{FlashLayout, UnitConfig};
//!
//! let units = [UnitConfig {
//!     space: Space::P,
//!     flash_start: 0x0000,
//!     flash_end: 0x7dff,
//!     interface: 0x0f40,
//!     duplicate: false,
//!     timing: Default::default(),
//! }];
//! let layout = FlashLayout::new(&units).unwrap();
//!
//! let mut session = Session::new(FakeCable::new(), SessionConfig::default());
//! session.connect().unwrap();
//! let target = session.bring_up().unwrap();
//! println!("JTAG ID {:#x}", target.idcode);
//!
//! let words = session.flasher().unwrap().read_range(Space::X, 0x0100, 0x0107, &layout).unwrap();
//! assert_eq!(words.len(), 8);
//! session.disconnect().unwrap();
//! ```

#![no_std]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

pub mod cable;
#[cfg(feature = "std")]
pub mod config;
pub mod error;
pub mod flash;
pub mod image;
pub mod once;
pub mod poll;
pub mod session;
pub mod srec;
pub mod statemachine;
pub mod taps;
pub mod unit;

pub use error::{Error, LinkError, Result};
