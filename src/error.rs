//! Error types shared by every layer of the crate.  `LinkError` covers the cable, `Error` is what
//! the protocol, flash and session layers return.
use alloc::string::String;

use thiserror::Error;

use crate::once::Space;

/// Failures raised by a `Cable` implementation.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no debug adapter was found, check the USB connection")]
    AdapterNotFound,

    #[error("debug adapter is busy or access was denied")]
    AdapterBusy,

    #[error("adapter `{0}` is not supported")]
    UnsupportedAdapter(String),

    #[cfg(feature = "std")]
    #[error("FTDI transfer failed: {0}")]
    Ftdi(libftd2xx::FtStatus),

    #[error("adapter transfer failed: {0}")]
    Transfer(String),

    #[cfg(feature = "std")]
    #[error("USB transfer failed: {0}")]
    Usb(#[from] rusb::Error),

    #[error("GPIO pin access failed: {0:?}")]
    Pin(embedded_hal::digital::ErrorKind),
}

#[cfg(feature = "std")]
impl From<libftd2xx::FtStatus> for LinkError {
    fn from(status: libftd2xx::FtStatus) -> Self {
        match status {
            libftd2xx::FtStatus::DEVICE_NOT_FOUND => LinkError::AdapterNotFound,
            libftd2xx::FtStatus::DEVICE_NOT_OPENED => LinkError::AdapterBusy,
            other => LinkError::Ftdi(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("JTAG path measurement overflowed (IR {instruction}, DR {data}); is a target connected?")]
    ChainOverflow { instruction: usize, data: usize },

    #[error(
        "target position I={position_ir},D={position_dr} does not fit the measured chain \
        (IR length {instruction}, DR length {data})"
    )]
    ChainTooShort {
        instruction: usize,
        data: usize,
        position_ir: usize,
        position_dr: usize,
    },

    #[error("target chip refused to enter debug mode after {attempts} attempts (status {status:#x})")]
    DebugRefused { attempts: usize, status: u8 },

    #[error("flash interface {interface:#06x} initialisation failed, BUSY bit is set")]
    InterfaceBusy { interface: u16 },

    #[error("flash {interface:#06x} erase failed, BUSY bit is set")]
    EraseBusy { interface: u16 },

    #[error("verification error at {address:#06x}: wrote {expected:#06x}, read {actual:#06x}")]
    Verify { address: u16, expected: u16, actual: u16 },

    #[error("address {space}:{address:#06x} is outside every configured flash unit")]
    AddressOutOfRange { space: Space, address: u32 },

    #[error("checksum error in image record at line {line}")]
    Checksum { line: usize },

    #[error("malformed image record at line {line}: {reason}")]
    ImageSyntax { line: usize, reason: String },

    #[error("{path}: {reason}")]
    File { path: String, reason: String },

    #[error("flash configuration error: {0}")]
    Config(String),

    #[error("invalid parameter: {0}")]
    Parameter(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// The outcome classes a front end reports to its caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
    Success,
    Config,
    Image,
    Verify,
    Protocol,
    Parameter,
}

impl Error {
    pub fn category(&self) -> Category {
        match self {
            Error::Config(_) => Category::Config,
            Error::AddressOutOfRange { .. }
            | Error::Checksum { .. }
            | Error::ImageSyntax { .. }
            | Error::File { .. } => Category::Image,
            Error::Verify { .. } => Category::Verify,
            Error::Parameter(_) | Error::ChainTooShort { .. } => Category::Parameter,
            Error::Link(_)
            | Error::ChainOverflow { .. }
            | Error::DebugRefused { .. }
            | Error::InterfaceBusy { .. }
            | Error::EraseBusy { .. }
            | Error::Cancelled => Category::Protocol,
        }
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
