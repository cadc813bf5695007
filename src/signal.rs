//! # Signal
//!
//! A wait-group style counter: work registers with [`Signal::increase`] /
//! [`Signal::add`], finishes with [`Signal::done`], and any number of threads
//! can block in [`Signal::wait`] until the count drops back to zero.
//!
//! Waiting parks the thread on a condition variable instead of spinning, so
//! it is suitable for waits of arbitrary length.
//!
//! ## Example
//! ```rust
//! use spinflow::Signal;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let signal = Arc::new(Signal::new());
//! for _ in 0..4 {
//!     signal.increase();
//!     let signal = Arc::clone(&signal);
//!     thread::spawn(move || {
//!         // ... work ...
//!         signal.done();
//!     });
//! }
//! signal.wait();
//! assert_eq!(signal.status(), 0);
//! ```

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Counter that can be waited on until it reaches zero.
#[derive(Debug, Default)]
pub struct Signal {
    count: Mutex<usize>,
    zero: Condvar,
}

impl Signal {
    /// Creates a signal with a count of zero.
    pub fn new() -> Self {
        Signal {
            count: Mutex::new(0),
            zero: Condvar::new(),
        }
    }

    /// Raises the count by `n`.
    pub fn add(&self, n: usize) {
        *self.count.lock() += n;
    }

    /// Raises the count by one.
    #[inline]
    pub fn increase(&self) {
        self.add(1);
    }

    /// Lowers the count by one, waking waiters when it reaches zero.
    ///
    /// # Panics
    /// Panics if the count is already zero.
    #[track_caller]
    pub fn done(&self) {
        let mut count = self.count.lock();
        assert!(*count > 0, "signal done() called more times than registered");
        *count -= 1;
        if *count == 0 {
            drop(count);
            self.zero.notify_all();
        }
    }

    /// Returns the current count.
    #[inline]
    pub fn status(&self) -> usize {
        *self.count.lock()
    }

    /// Blocks until the count is zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }

    /// Blocks until the count is zero or `timeout` elapses.
    ///
    /// Returns `true` if the count reached zero.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut count = self.count.lock();
        while *count > 0 {
            if self.zero.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// Calls [`Signal::done`] when dropped, including during unwinding.
#[derive(Debug)]
pub(crate) struct DoneOnDrop<'a>(pub(crate) &'a Signal);

impl Drop for DoneOnDrop<'_> {
    fn drop(&mut self) {
        self.0.done();
    }
}
