//! Cancellation and retry helpers for the loops that wait on the target.
//!
//! Busy polls against the flash interface have no upper bound of their own: an unresponsive
//! target keeps them spinning.  Every iteration checks a `Cancel` token instead, so the caller
//! decides when to give up (Ctrl-C, a deadline, ...).
use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

/// Something a long running loop can ask whether it should stop.
pub trait Cancel {
    fn cancelled(&self) -> bool;

    /// `Err(Error::Cancelled)` once cancellation has been requested.
    fn check(&self) -> Result<()> {
        if self.cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Never cancels.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverCancel;

impl Cancel for NeverCancel {
    fn cancelled(&self) -> bool {
        false
    }
}

/// Set from a signal handler or another thread.
impl Cancel for AtomicBool {
    fn cancelled(&self) -> bool {
        self.load(Ordering::Relaxed)
    }
}

impl<T: Cancel + ?Sized> Cancel for &T {
    fn cancelled(&self) -> bool {
        (**self).cancelled()
    }
}

impl<T: Cancel + ?Sized> Cancel for alloc::sync::Arc<T> {
    fn cancelled(&self) -> bool {
        (**self).cancelled()
    }
}

/// Cancels once a point in time has passed.
#[cfg(feature = "std")]
#[derive(Clone, Copy, Debug)]
pub struct Deadline(pub std::time::Instant);

#[cfg(feature = "std")]
impl Deadline {
    pub fn after(timeout: std::time::Duration) -> Self {
        Deadline(std::time::Instant::now() + timeout)
    }
}

#[cfg(feature = "std")]
impl Cancel for Deadline {
    fn cancelled(&self) -> bool {
        std::time::Instant::now() >= self.0
    }
}

/// Outcome of a bounded retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retry<T> {
    /// Accepted value and the attempt (counting from 1) that produced it.
    Done { value: T, attempts: usize },
    /// Every attempt was rejected; the last observed value.
    Exhausted { last: T, attempts: usize },
}

/// Run `attempt` up to `attempts` times until `accept` approves its value.  Errors end the retry
/// immediately.
pub fn retry<T, F, A>(attempts: usize, mut attempt: F, accept: A) -> Result<Retry<T>>
where
    F: FnMut(usize) -> Result<T>,
    A: Fn(&T) -> bool,
{
    let mut n = 0;
    loop {
        n += 1;
        let value = attempt(n)?;
        if accept(&value) {
            return Ok(Retry::Done { value, attempts: n });
        }
        if n >= attempts {
            return Ok(Retry::Exhausted { last: value, attempts: n });
        }
    }
}

/// Call `read` until `done` approves its value, checking `cancel` before every read.  Returns the
/// approved value.
pub fn wait_until<T, F, D>(cancel: &dyn Cancel, mut read: F, done: D) -> Result<T>
where
    F: FnMut() -> Result<T>,
    D: Fn(&T) -> bool,
{
    loop {
        cancel.check()?;
        let value = read()?;
        if done(&value) {
            return Ok(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    #[test]
    fn retry_stops_on_accept() {
        let r = retry(10, |n| Ok(n * 2), |v| *v == 6).unwrap();
        assert_eq!(r, Retry::Done { value: 6, attempts: 3 });
    }

    #[test]
    fn retry_reports_last_value() {
        let r = retry(4, |n| Ok(n), |_| false).unwrap();
        assert_eq!(r, Retry::Exhausted { last: 4, attempts: 4 });
    }

    #[test]
    fn retry_propagates_errors() {
        let calls = Cell::new(0);
        let r: Result<Retry<u8>> = retry(
            5,
            |_| {
                calls.set(calls.get() + 1);
                Err(Error::Cancelled)
            },
            |_| true,
        );
        assert!(matches!(r, Err(Error::Cancelled)));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn wait_until_honours_cancel() {
        let flag = AtomicBool::new(false);
        let reads = Cell::new(0);
        let r = wait_until(
            &flag,
            || {
                reads.set(reads.get() + 1);
                if reads.get() == 3 {
                    flag.store(true, Ordering::Relaxed);
                }
                Ok(0x8000u16)
            },
            |v| v & 0x8000 == 0,
        );
        assert!(matches!(r, Err(Error::Cancelled)));
        assert_eq!(reads.get(), 3);

        let mut busy = 2;
        let v = wait_until(
            &NeverCancel,
            || {
                busy -= 1;
                Ok(busy)
            },
            |v| *v == 0,
        )
        .unwrap();
        assert_eq!(v, 0);
    }

    #[cfg(feature = "std")]
    #[test]
    fn expired_deadline_cancels() {
        let d = Deadline(std::time::Instant::now());
        assert!(d.cancelled());
        assert!(!Deadline::after(std::time::Duration::from_secs(60)).cancelled());
    }
}
