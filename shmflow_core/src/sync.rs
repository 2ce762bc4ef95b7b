//! Bounded wait loops over the segment's atomic control state.
//!
//! There are no cross-process locks in shmflow; every suspension point
//! (attach, reader notify wait, blocking push) is a poll of an atomic in the
//! mapped control block, spun with `crossbeam`'s backoff and bounded by a
//! deadline. Polling makes every wait trivially spurious-wakeup-safe and
//! lets a detach flag interrupt it promptly.

use crossbeam::utils::Backoff;
use std::time::{Duration, Instant};

/// Sleep slice once the spin backoff is exhausted.
pub(crate) const PARK_INTERVAL: Duration = Duration::from_micros(500);

/// A wait bound.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    end: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            end: Instant::now() + timeout,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.end
    }
}

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Ready,
    TimedOut,
}

/// Poll `ready` until it returns true or the deadline passes.
///
/// Spins briefly, then parks in short sleeps so a stalled peer does not pin
/// a core.
pub(crate) fn wait_until(deadline: Deadline, mut ready: impl FnMut() -> bool) -> WaitOutcome {
    let backoff = Backoff::new();
    loop {
        if ready() {
            return WaitOutcome::Ready;
        }
        if deadline.expired() {
            return WaitOutcome::TimedOut;
        }
        if backoff.is_completed() {
            std::thread::sleep(PARK_INTERVAL);
        } else {
            backoff.snooze();
        }
    }
}
