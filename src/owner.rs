//! Per-thread owner identity used to tag the [`SpinLock`](crate::SpinLock) state word.

use core::fmt;
use core::num::NonZeroU32;
use core::sync::atomic::{AtomicU32, Ordering::Relaxed};

use crate::shim::thread_local;

/// Next identity to hand out. Zero is reserved for "no owner".
static NEXT_OWNER: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static CURRENT: OwnerId = OwnerId::allocate();
}

/// A stable, non-zero identity for the calling thread.
///
/// Identities are drawn from a process-wide counter the first time a thread
/// asks for one and stay fixed for the life of the thread. They are never
/// reused while the process runs (the 32-bit space wraps only after four
/// billion threads).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(NonZeroU32);

impl OwnerId {
    /// Returns the identity of the calling thread.
    #[inline]
    pub fn current() -> Self {
        CURRENT.with(|id| *id)
    }

    /// Rebuilds an identity from its raw value, `None` for zero.
    #[inline]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    /// Returns the raw numeric value.
    #[inline(always)]
    pub const fn get(self) -> u32 {
        self.0.get()
    }

    fn allocate() -> Self {
        loop {
            let raw = NEXT_OWNER.fetch_add(1, Relaxed);
            if let Some(id) = NonZeroU32::new(raw) {
                return Self(id);
            }
        }
    }
}

impl fmt::Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerId({})", self.get())
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}
