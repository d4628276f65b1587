//! Wait strategies for the init barrier
//!
//! The barrier only ever waits for a short-lived condition (siblings mapping
//! the pad, the leader finishing setup), so the default is a plain busy-wait.
//! Other strategies keep the same ordering guarantees since the condition
//! closure does its own acquire loads.

use crate::{Error, Result};
use std::time::{Duration, Instant};

/// How a caller waits for a condition to become true
pub trait WaitStrategy: Send + Sync {
    /// Block until `ready` returns true
    fn wait_until(&self, ready: &mut dyn FnMut() -> bool) -> Result<()>;
}

/// Unbounded busy-wait
#[derive(Debug, Clone, Copy, Default)]
pub struct Spin;

impl WaitStrategy for Spin {
    fn wait_until(&self, ready: &mut dyn FnMut() -> bool) -> Result<()> {
        while !ready() {
            std::hint::spin_loop();
        }
        Ok(())
    }
}

/// Busy-wait for a number of rounds, then yield the thread between polls
#[derive(Debug, Clone, Copy)]
pub struct SpinThenYield {
    pub spins: u32,
}

impl Default for SpinThenYield {
    fn default() -> Self {
        Self { spins: 1 << 10 }
    }
}

impl WaitStrategy for SpinThenYield {
    fn wait_until(&self, ready: &mut dyn FnMut() -> bool) -> Result<()> {
        let mut rounds = 0u32;
        while !ready() {
            if rounds < self.spins {
                rounds += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        Ok(())
    }
}

/// Busy-wait that gives up after `timeout` with [`Error::Timeout`]
///
/// Not used by default: an absent sibling stalls the group forever unless a
/// caller opts into this.
#[derive(Debug, Clone, Copy)]
pub struct BoundedSpin {
    pub timeout: Duration,
}

impl BoundedSpin {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl WaitStrategy for BoundedSpin {
    fn wait_until(&self, ready: &mut dyn FnMut() -> bool) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut polls = 0u32;
        while !ready() {
            polls = polls.wrapping_add(1);
            // reading the clock on every poll would dominate the loop
            if polls % 256 == 0 && Instant::now() >= deadline {
                return Err(Error::Timeout(self.timeout));
            }
            std::hint::spin_loop();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_spin_sees_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = {
            let flag = flag.clone();
            thread::spawn(move || flag.store(true, Ordering::Release))
        };
        Spin.wait_until(&mut || flag.load(Ordering::Acquire)).unwrap();
        setter.join().unwrap();
    }

    #[test]
    fn test_spin_then_yield_counts_polls() {
        let mut polls = 0;
        SpinThenYield { spins: 2 }
            .wait_until(&mut || {
                polls += 1;
                polls == 5
            })
            .unwrap();
        assert_eq!(polls, 5);
    }

    #[test]
    fn test_bounded_spin_times_out() {
        let timeout = Duration::from_millis(20);
        let err = BoundedSpin::new(timeout).wait_until(&mut || false).unwrap_err();
        assert_eq!(err, Error::Timeout(timeout));
    }

    #[test]
    fn test_bounded_spin_ready_immediately() {
        BoundedSpin::new(Duration::ZERO).wait_until(&mut || true).unwrap();
    }
}
