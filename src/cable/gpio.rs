//! Implement the `Cable` trait on plain `embedded-hal` pins, for hosts that wire the debug port
//! straight to their own GPIOs.
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{Error as _, InputPin, OutputPin, PinState};

use crate::cable::{Cable, Signal};
use crate::error::LinkError;

// Settle time required between a line change and a TDO sample
const SETTLE_NS: u32 = 100;

pub struct Gpio<Clk, Tms, Tdi, Tdo, Rst, Trst, Delay> {
    half_period: u32,
    delay: Delay,
    clock: Clk,
    tms: Tms,
    tdi: Tdi,
    tdo: Tdo,
    reset: Rst,
    trst: Trst,
}

impl<Clk, Tms, Tdi, Tdo, Rst, Trst, Delay> Gpio<Clk, Tms, Tdi, Tdo, Rst, Trst, Delay>
where
    Clk: OutputPin,
    Tms: OutputPin,
    Tdi: OutputPin,
    Tdo: InputPin,
    Rst: OutputPin,
    Trst: OutputPin,
    Delay: DelayNs,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        freq_khz: u32,
        clock: Clk,
        tms: Tms,
        tdi: Tdi,
        tdo: Tdo,
        reset: Rst,
        trst: Trst,
        delay: Delay,
    ) -> Self {
        let period_ns = 1_000_000 / freq_khz.max(1);
        let half_period = (period_ns / 2).max(SETTLE_NS);
        Gpio { half_period, delay, clock, tms, tdi, tdo, reset, trst }
    }
}

fn drive<P: OutputPin>(pin: &mut P, high: bool) -> Result<(), LinkError> {
    pin.set_state(PinState::from(high)).map_err(|e| LinkError::Pin(e.kind()))
}

impl<Clk, Tms, Tdi, Tdo, Rst, Trst, Delay> Cable for Gpio<Clk, Tms, Tdi, Tdo, Rst, Trst, Delay>
where
    Clk: OutputPin,
    Tms: OutputPin,
    Tdi: OutputPin,
    Tdo: InputPin,
    Rst: OutputPin,
    Trst: OutputPin,
    Delay: DelayNs,
{
    fn set_signal(&mut self, signal: Signal, high: bool) -> Result<(), LinkError> {
        match signal {
            Signal::Tck => {
                drive(&mut self.clock, high)?;
                // Hold each clock phase for half a period
                self.delay.delay_ns(self.half_period);
                Ok(())
            }
            Signal::Tms => drive(&mut self.tms, high),
            Signal::Tdi => drive(&mut self.tdi, high),
            Signal::Reset => drive(&mut self.reset, high),
            Signal::Trst => drive(&mut self.trst, high),
        }
    }

    fn read_tdo(&mut self) -> Result<bool, LinkError> {
        self.tdo.is_high().map_err(|e| LinkError::Pin(e.kind()))
    }

    fn settle(&mut self) -> Result<(), LinkError> {
        self.delay.delay_ns(SETTLE_NS);
        Ok(())
    }
}
