//! Switches the lock's primitives between `core`/`std` and `loom`.
//!
//! Only the spin lock is modelled under loom; the blocking parts of the crate
//! (`signal`, `buffer`, `flow`) always use `parking_lot`.

#[cfg(not(feature = "loom"))]
pub(crate) mod atomic {
    pub(crate) use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
}

#[cfg(feature = "loom")]
pub(crate) mod atomic {
    pub(crate) use loom::sync::atomic::{AtomicU32, AtomicU64, Ordering};
}

#[cfg(not(feature = "loom"))]
pub(crate) mod hint {
    pub(crate) use core::hint::spin_loop;
}

#[cfg(feature = "loom")]
pub(crate) mod hint {
    pub(crate) use loom::hint::spin_loop;
}

#[cfg(not(feature = "loom"))]
pub(crate) mod thread {
    pub(crate) use std::thread::yield_now;
}

#[cfg(feature = "loom")]
pub(crate) mod thread {
    pub(crate) use loom::thread::yield_now;
}

#[cfg(not(feature = "loom"))]
pub(crate) use std::thread_local;

#[cfg(feature = "loom")]
pub(crate) use loom::thread_local;
