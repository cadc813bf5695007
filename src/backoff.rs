//! # BackOff
//!
//! The escalating wait policy used by [`SpinLock`](crate::SpinLock) while a
//! lock is contended.
//!
//! A wait cycle is made of at most [`MAX_SPINS`] short waits:
//!
//! - the first `YIELD_SPINS - 1` of them busy-spin with
//!   [`core::hint::spin_loop`] for [`BackOff::current`] iterations, doubling
//!   that count each time up to [`MAX_BACKOFF`];
//! - the rest hand the processor back with `std::thread::yield_now`.
//!
//! Once the cycle is exhausted the thread yields and the cycle starts over.
//! The spin delay carries into the next cycle, so a long wait settles at
//! `MAX_BACKOFF` spins followed by a run of yields, and never burns more than
//! a few dozen spin iterations in a row.
//!
//! ## Example
//! ```rust
//! use spinflow::BackOff;
//!
//! let mut backoff = BackOff::new();
//!
//! loop {
//!     if try_acquire() {
//!         break;
//!     }
//!     backoff.snooze();
//! }
//!
//! fn try_acquire() -> bool {
//!     true
//! }
//! ```

use crate::shim::{hint::spin_loop, thread::yield_now};

/// Short waits allowed per cycle before the cycle resets.
pub const MAX_SPINS: u32 = 4;

/// Short waits from this index on yield instead of busy-spinning.
pub const YIELD_SPINS: u32 = 2;

/// Upper bound for the busy-spin iteration count.
pub const MAX_BACKOFF: u32 = 32;

const START_VALUE: u32 = 1;

/// Exponential backoff with a bounded spin budget.
///
/// The spin count is capped low and the processor is yielded after a couple
/// of attempts in every cycle.
#[derive(Debug, Clone)]
pub struct BackOff {
    spins: u32,
    delay: u32,
}

impl BackOff {
    /// Creates a new [`BackOff`] at the start of a wait cycle.
    #[inline(always)]
    pub const fn new() -> Self {
        Self {
            spins: 0,
            delay: START_VALUE,
        }
    }

    /// Waits once, escalating according to the policy described on the module.
    #[inline]
    pub fn snooze(&mut self) {
        if self.spins >= MAX_SPINS {
            yield_now();
            self.spins = 0;
            return;
        }

        self.spins += 1;
        if self.spins < YIELD_SPINS {
            for _ in 0..self.delay {
                spin_loop();
            }
            self.delay = (self.delay << 1).min(MAX_BACKOFF);
        } else {
            yield_now();
        }
    }

    /// Starts a fresh wait cycle with the initial delay.
    #[inline(always)]
    pub fn reset(&mut self) {
        self.spins = 0;
        self.delay = START_VALUE;
    }

    /// Returns the current busy-spin iteration count.
    #[inline(always)]
    pub fn current(&self) -> u32 {
        self.delay
    }

    /// Returns `true` once the next [`snooze`](Self::snooze) will yield
    /// instead of spinning.
    #[inline(always)]
    pub fn is_yielding(&self) -> bool {
        self.spins + 1 >= YIELD_SPINS
    }
}

impl Default for BackOff {
    fn default() -> Self {
        Self::new()
    }
}
