//! Implement the `Cable` trait for "jtagkey" compatible hardware adapters like the Bus Blaster.
//! Single lines are driven with the MPSSE GPIO commands, a TCK cycle is queued as two GPIO writes
//! in one command buffer.  Mode changes use the MPSSE TMS clocking command, seven bits at a time.
use alloc::format;

use ftdi_mpsse::ClockTMSOut;
use libftd2xx::{Ft2232h, Ftdi, FtdiMpsse, MpsseCmdBuilder, MpsseCmdExecutor};
use log::debug;

use crate::cable::{Cable, Signal};
use crate::error::LinkError;

// Lower pins
const PIN_TCK: u8 = 1;
const PIN_TDI: u8 = 1 << 1;
const PIN_TDO: u8 = 1 << 2;
const PIN_TMS: u8 = 1 << 3;
const PIN_N_OE: u8 = 1 << 4;
const LOWER_OUTPUT_PINS: u8 = PIN_TCK | PIN_TDI | PIN_TMS | PIN_N_OE;

// Upper pins
const PIN_N_TRST: u8 = 1;
const PIN_N_SRST: u8 = 1 << 1;
const PIN_N_TRST_OE: u8 = 1 << 2;
const PIN_N_SRST_OE: u8 = 1 << 3;
const UPPER_OUTPUT_PINS: u8 = PIN_N_TRST | PIN_N_SRST | PIN_N_TRST_OE | PIN_N_SRST_OE;

const TCK_HZ: u32 = 1_000_000;
// Longest TMS sequence a single MPSSE command can clock
const TMS_CHUNK: usize = 7;

fn transfer<E: core::fmt::Debug>(err: E) -> LinkError {
    LinkError::Transfer(format!("{:?}", err))
}

pub struct JtagKey {
    ft: Ft2232h,
    lower: u8,
    upper: u8,
}

impl JtagKey {
    /// Create a new JtagKey.  FT2232-based adapters like JtagKey have both an "A" interface and a
    /// "B" interface.  `primary` controls which to use.
    pub fn new(primary: bool) -> Result<Self, LinkError> {
        let description = if primary {
            "Dual RS232-HS A"
        } else {
            "Dual RS232-HS B"
        };
        let ft = Ftdi::with_description(description)?;
        let mut ft = Ft2232h::try_from(ft)
            .map_err(|_| LinkError::UnsupportedAdapter(description.into()))?;
        ft.initialize_mpsse_default().map_err(transfer)?;
        ft.set_clock(TCK_HZ).map_err(transfer)?;

        let upper = PIN_N_TRST | PIN_N_SRST;
        ft.set_gpio_upper(upper, UPPER_OUTPUT_PINS).map_err(transfer)?;
        let lower = PIN_TMS;
        ft.set_gpio_lower(lower, LOWER_OUTPUT_PINS).map_err(transfer)?;
        debug!("jtagkey opened on {}", description);

        Ok(JtagKey { ft, lower, upper })
    }

    fn send(&mut self, builder: MpsseCmdBuilder) -> Result<(), LinkError> {
        self.ft.send(builder.as_slice()).map_err(transfer)
    }

    fn lower_with(&self, tms: bool, tdi: bool) -> u8 {
        let mut pins = self.lower & !(PIN_TMS | PIN_TDI);
        if tms {
            pins |= PIN_TMS;
        }
        if tdi {
            pins |= PIN_TDI;
        }
        pins
    }
}

impl Cable for JtagKey {
    fn set_signal(&mut self, signal: Signal, high: bool) -> Result<(), LinkError> {
        let (upper, mask) = match signal {
            Signal::Tck => (false, PIN_TCK),
            Signal::Tms => (false, PIN_TMS),
            Signal::Tdi => (false, PIN_TDI),
            Signal::Trst => (true, PIN_N_TRST),
            Signal::Reset => (true, PIN_N_SRST),
        };
        let pins = if upper { &mut self.upper } else { &mut self.lower };
        if high {
            *pins |= mask;
        } else {
            *pins &= !mask;
        }

        let builder = if upper {
            MpsseCmdBuilder::new().set_gpio_upper(self.upper, UPPER_OUTPUT_PINS)
        } else {
            MpsseCmdBuilder::new().set_gpio_lower(self.lower, LOWER_OUTPUT_PINS)
        };
        self.send(builder)
    }

    fn read_tdo(&mut self) -> Result<bool, LinkError> {
        let builder = MpsseCmdBuilder::new().gpio_lower().send_immediate();
        let mut buf = [0u8; 1];
        self.ft.xfer(builder.as_slice(), &mut buf).map_err(transfer)?;
        Ok(buf[0] & PIN_TDO != 0)
    }

    fn clock(&mut self, tms: bool, tdi: bool) -> Result<(), LinkError> {
        let pins = self.lower_with(tms, tdi);
        let builder = MpsseCmdBuilder::new()
            .set_gpio_lower(pins & !PIN_TCK, LOWER_OUTPUT_PINS)
            .set_gpio_lower(pins | PIN_TCK, LOWER_OUTPUT_PINS);
        self.lower = pins | PIN_TCK;
        self.send(builder)
    }

    fn change_mode(&mut self, tms: &[bool], tdi: bool) -> Result<(), LinkError> {
        let Some(&last) = tms.last() else {
            return Ok(());
        };
        let mut builder = MpsseCmdBuilder::new();
        for chunk in tms.chunks(TMS_CHUNK) {
            let bits = chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, &t)| acc | (u8::from(t) << i));
            builder = builder.clock_tms_out(ClockTMSOut::NegEdge, bits, tdi, chunk.len() as u8);
        }
        // The engine leaves TCK low and TMS at its last level
        self.lower = self.lower_with(last, tdi) & !PIN_TCK;
        self.send(builder)
    }
}
