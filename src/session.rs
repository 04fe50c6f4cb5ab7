//! The life cycle of a connection to the target: line initialisation, debug mode entry and the
//! release of the target when the work is done.
//!
//! ```text
//! Unconnected --connect--> Reset --bring_up--> DebugRequested --> OnceEnabled
//!                            \                                       |
//!                             `--------------disconnect---------> Disconnected
//! ```
use alloc::boxed::Box;

use log::{debug, error, info};

use crate::cable::{Cable, Signal};
use crate::error::{Error, Result};
use crate::flash::{Block, EraseMode, Flasher};
use crate::image::ChecksumPolicy;
use crate::once::{Once, Reg};
use crate::poll::{retry, Cancel, NeverCancel, Retry};
use crate::statemachine::{JtagSM, JtagState};
use crate::taps::{ChainPosition, PathLengths, TapStatus, Taps, DEBUG_REQUEST, ENABLE_ONCE, IDCODE};

/// ENABLE_ONCE attempts before the target is declared unwilling to enter debug mode.
pub const DEBUG_RETRIES: usize = 10;

// Settle periods of ~100ns
const POWER_SETTLE: usize = 4;
const TRST_PULSE: usize = 4;
const RELEASE_SETTLE: usize = 2;

// Status register value with the PC extension bits (10..14) cleared
const SR_INIT: u16 = 0x0300;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    /// Lines initialised, /RESET asserted.
    Reset,
    DebugRequested,
    /// The core is in debug mode and the OnCE port accepts instructions.
    OnceEnabled,
    Disconnected,
}

/// What `disconnect` does with the target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExitMode {
    /// Reset the target so the application starts.
    #[default]
    Reset,
    LeaveInDebug,
}

/// Settings fixed for the whole session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub erase: EraseMode,
    pub block: Block,
    pub position: ChainPosition,
    /// Wait for the target to power up or leave reset before requesting debug mode.
    pub wait_for_target: bool,
    pub exit: ExitMode,
    pub checksum: ChecksumPolicy,
    pub debug_retries: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            erase: EraseMode::default(),
            block: Block::default(),
            position: ChainPosition::default(),
            wait_for_target: false,
            exit: ExitMode::default(),
            checksum: ChecksumPolicy::default(),
            debug_retries: DEBUG_RETRIES,
        }
    }
}

/// What `bring_up` learned about the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetInfo {
    pub idcode: u32,
    pub lengths: PathLengths,
    /// ENABLE_ONCE shifts it took until the core reported debug mode.
    pub debug_attempts: usize,
}

/// Owns the cable for the duration of the work.  Dropping a session disconnects it.
pub struct Session<C: Cable> {
    once: Once<C>,
    config: SessionConfig,
    state: SessionState,
    cancel: Box<dyn Cancel>,
}

impl<C: Cable> Session<C> {
    /// No line is touched until `connect`.
    pub fn new(cable: C, config: SessionConfig) -> Self {
        let sm = JtagSM::new(cable);
        let taps = Taps::new(sm, config.position);
        Session {
            once: Once::new(taps),
            config,
            state: SessionState::Unconnected,
            cancel: Box::new(NeverCancel),
        }
    }

    /// Use `cancel` to abort the power-up wait and every flash loop.
    pub fn with_cancel(mut self, cancel: impl Cancel + 'static) -> Self {
        self.cancel = Box::new(cancel);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn cable(&self) -> &C {
        &self.once.taps.sm.cable
    }

    pub fn cable_mut(&mut self) -> &mut C {
        &mut self.once.taps.sm.cable
    }

    fn expect_state(&self, expected: SessionState, operation: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::Parameter(alloc::format!(
                "{} needs a session in state {:?}, not {:?}",
                operation, expected, self.state
            )))
        }
    }

    /// Drive every line to its idle level, reset the TAP through /TRST and TMS and move it to
    /// Select-DR-Scan.  /RESET is left asserted.
    pub fn connect(&mut self) -> Result<()> {
        self.expect_state(SessionState::Unconnected, "connect")?;
        let position = self.config.position;
        if position != ChainPosition::default() {
            info!(
                "Target at position {} of instruction chain and {} of data chain.",
                position.instruction, position.data
            );
        }

        let taps = &mut self.once.taps;
        taps.settle(POWER_SETTLE)?;
        for (signal, high) in [
            (Signal::Tck, true),
            (Signal::Tms, true),
            (Signal::Trst, true),
            (Signal::Reset, true),
            (Signal::Tdi, false),
        ] {
            taps.sm.cable.set_signal(signal, high)?;
        }

        taps.sm.cable.set_signal(Signal::Trst, false)?;
        taps.sm.cable.set_signal(Signal::Reset, false)?;
        taps.settle(TRST_PULSE)?;
        taps.sm.cable.set_signal(Signal::Trst, true)?;

        taps.sm.mode_reset()?;
        taps.sm.change_mode(JtagState::SelectDR)?;
        self.state = SessionState::Reset;
        Ok(())
    }

    /// Release /RESET and keep requesting debug mode until the status shows the core is powered
    /// and in reset (or already in debug mode).
    fn wait_for_target(&mut self) -> Result<()> {
        info!("Waiting for target board to power-up & DSP to come out of reset...");
        let taps = &mut self.once.taps;
        taps.sm.cable.set_signal(Signal::Reset, true)?;
        loop {
            self.cancel.check()?;
            // Lengths change once the board gets power
            match taps.measure() {
                Ok(_) => {}
                Err(e @ (Error::Link(_) | Error::Cancelled)) => return Err(e),
                Err(e) => debug!("chain not ready: {}", e),
            }

            taps.sm.cable.set_signal(Signal::Trst, false)?;
            taps.settle(TRST_PULSE)?;
            taps.sm.cable.set_signal(Signal::Trst, true)?;
            taps.sm.mode_reset()?;
            taps.sm.change_mode(JtagState::SelectDR)?;

            let status = TapStatus::from(taps.shift_ir(DEBUG_REQUEST)?);
            info!("{}", status);
            if matches!(status, TapStatus::InReset | TapStatus::Debug) {
                return Ok(());
            }
        }
    }

    /// Measure the chain, read the JTAG ID and put the core into debug mode with the OnCE port
    /// enabled.  The memory map is switched to internal flash and the status register cleared.
    pub fn bring_up(&mut self) -> Result<TargetInfo> {
        self.expect_state(SessionState::Reset, "bring_up")?;

        if self.config.wait_for_target {
            self.wait_for_target()?;
        }
        let lengths = self.once.taps.measure()?;
        info!("JTAG IR path length: {}", lengths.instruction);
        info!("JTAG DR path length: {} (BYPASS)", lengths.data);

        let status = self.once.taps.shift_ir(IDCODE)?;
        info!("IDCode status: {:#x}", status);
        let idcode = self.once.taps.shift_dr(0, 32)?;
        info!("Jtag ID: {:#x}", idcode);

        let status = if self.config.wait_for_target {
            self.once.taps.shift_ir(DEBUG_REQUEST)?
        } else {
            self.once.taps.execute_in_reset(DEBUG_REQUEST)?
        };
        info!("Debug Request status: {:#x}", status);
        self.state = SessionState::DebugRequested;

        let taps = &mut self.once.taps;
        let outcome = retry(
            self.config.debug_retries,
            |attempt| {
                self.cancel.check()?;
                let status = taps.shift_ir(ENABLE_ONCE)?;
                info!("Enable OnCE status: {:#x}, attempt {}", status, attempt);
                Ok(status)
            },
            |&status| TapStatus::from(status) == TapStatus::Debug,
        )?;
        let debug_attempts = match outcome {
            Retry::Done { attempts, .. } => attempts,
            Retry::Exhausted { last, attempts } => {
                return Err(Error::DebugRefused { attempts, status: last });
            }
        };
        info!("Enable OnCE successful, target chip is in Debug mode");
        self.state = SessionState::OnceEnabled;

        // Internal flash memory map, in case EXTBOOT is set
        self.once.load_imm(Reg::Y0, 0)?;
        self.once.move_reg(Reg::Omr, Reg::Y0)?;
        self.once.jump(0)?;
        self.once.load_imm(Reg::Y0, SR_INIT)?;
        self.once.move_reg(Reg::Sr, Reg::Y0)?;

        Ok(TargetInfo {
            idcode,
            lengths,
            debug_attempts,
        })
    }

    /// A flash engine working on this session's target.
    pub fn flasher(&mut self) -> Result<Flasher<'_, C>> {
        self.expect_state(SessionState::OnceEnabled, "flash access")?;
        Ok(Flasher::new(
            &mut self.once,
            self.config.erase,
            self.config.block,
            &*self.cancel,
        ))
    }

    /// Release the target, restarting it unless the session leaves it in debug mode.  Both
    /// /RESET and /TRST are driven alongside the equivalent JTAG actions, so either line may be
    /// unwired.  Does nothing if the session is not connected.
    pub fn disconnect(&mut self) -> Result<()> {
        match self.state {
            SessionState::Unconnected | SessionState::Disconnected => return Ok(()),
            _ => {}
        }
        let once_enabled = self.state == SessionState::OnceEnabled;
        // Whatever happens below, the session is over
        self.state = SessionState::Disconnected;

        let cable = &mut self.once.taps.sm.cable;
        cable.set_signal(Signal::Tck, false)?;
        cable.set_signal(Signal::Tms, false)?;
        cable.set_signal(Signal::Tdi, false)?;

        match self.config.exit {
            ExitMode::Reset => {
                self.once.taps.sm.cable.set_signal(Signal::Reset, false)?;
                if once_enabled {
                    self.once.jump_and_run(0)?;
                }
                self.once.taps.sm.cable.set_signal(Signal::Trst, false)?;
                self.once.taps.shift_ir(IDCODE)?;
                self.once.taps.settle(RELEASE_SETTLE)?;
                self.once.taps.sm.cable.set_signal(Signal::Trst, true)?;
                self.once.taps.sm.cable.set_signal(Signal::Reset, true)?;
                info!("The target was reset, the application is running");
            }
            ExitMode::LeaveInDebug => {
                self.once.taps.shift_ir(IDCODE)?;
                self.once.taps.sm.cable.set_signal(Signal::Trst, true)?;
                self.once.taps.sm.cable.set_signal(Signal::Reset, true)?;
                info!("The target was left in debug mode");
            }
        }
        Ok(())
    }
}

impl<C: Cable> Drop for Session<C> {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            error!("disconnect failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cable::fake::FakeCable;

    use pretty_assertions::assert_eq;

    #[test]
    fn connect_holds_reset() {
        let mut session = Session::new(FakeCable::new(), SessionConfig::default());
        assert_eq!(session.state(), SessionState::Unconnected);
        session.connect().unwrap();
        assert_eq!(session.state(), SessionState::Reset);
        assert_eq!(session.cable().reset_lines(), (false, true));
        assert!(matches!(session.connect(), Err(Error::Parameter(_))));
    }

    #[test]
    fn bring_up_enters_debug() {
        let mut session = Session::new(FakeCable::new(), SessionConfig::default());
        session.connect().unwrap();
        let info = session.bring_up().unwrap();
        assert_eq!(info.idcode, session.cable().idcode());
        assert_eq!(info.lengths, PathLengths { instruction: 4, data: 1 });
        assert_eq!(info.debug_attempts, 1);
        assert_eq!(session.state(), SessionState::OnceEnabled);
        assert!(session.cable().in_debug());
        assert_eq!(session.cable().core_reg(Reg::Omr), 0);
        assert_eq!(session.cable().core_reg(Reg::Sr), SR_INIT);
        assert_eq!(session.cable().pc(), 0);
    }

    #[test]
    fn flash_access_needs_debug_mode() {
        let mut session = Session::new(FakeCable::new(), SessionConfig::default());
        assert!(matches!(session.bring_up(), Err(Error::Parameter(_))));
        session.connect().unwrap();
        assert!(session.flasher().is_err());
    }

    #[test]
    fn refusal_after_budget() {
        let mut cable = FakeCable::new();
        cable.refuse_debug(20);
        let config = SessionConfig {
            debug_retries: 10,
            ..SessionConfig::default()
        };
        let mut session = Session::new(cable, config);
        session.connect().unwrap();
        match session.bring_up() {
            Err(Error::DebugRefused { attempts, status }) => assert_eq!((attempts, status), (10, 0x9)),
            other => panic!("expected a refusal, got {:?}", other.map(|_| ())),
        }
        assert_eq!(session.state(), SessionState::DebugRequested);
    }

    #[test]
    fn disconnect_restarts_target() {
        let mut session = Session::new(FakeCable::new(), SessionConfig::default());
        session.connect().unwrap();
        session.bring_up().unwrap();
        session.disconnect().unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.cable().is_running());
        assert_eq!(session.cable().reset_lines(), (true, true));
        // a second call has nothing left to do
        session.disconnect().unwrap();
    }

    #[test]
    fn leave_in_debug() {
        let config = SessionConfig {
            exit: ExitMode::LeaveInDebug,
            ..SessionConfig::default()
        };
        let mut session = Session::new(FakeCable::new(), config);
        session.connect().unwrap();
        session.bring_up().unwrap();
        session.disconnect().unwrap();
        assert!(session.cable().in_debug());
    }
}
