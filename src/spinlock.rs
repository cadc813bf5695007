//! # SpinLock
//!
//! An owner-tagged, reentrant spin lock with a bounded [`BackOff`].
//!
//! The whole lock state lives in one 64-bit word:
//!
//! ```text
//!  63              32 31             1   0
//! +------------------+----------------+---+
//! |  owner (OwnerId) |     unused     | L |
//! +------------------+----------------+---+
//! ```
//!
//! so a single compare-and-swap both checks that the lock is free and records
//! who took it. A separate waiter counter lets [`SpinLock::unlock`] skip the
//! CAS loop when nobody is spinning.
//!
//! ## Reentrancy
//! The thread that holds the lock may call [`SpinLock::lock`] again and
//! returns immediately. There is no depth counter: one [`SpinLock::unlock`]
//! releases the lock no matter how many times it was re-entered. The RAII
//! forms ([`SpinLock::guard`], [`SpinLock::with_lock`]) only release on the
//! outermost scope, so nested guards compose.
//!
//! ## Misuse
//! Unlocking from a thread that does not own the lock panics. This is a
//! lock-discipline bug, not a recoverable condition.
//!
//! ## Example
//! ```rust
//! use spinflow::SpinLock;
//! use std::time::Duration;
//!
//! let lock = SpinLock::new();
//!
//! lock.lock();
//! lock.lock(); // same thread: re-enters
//! assert!(lock.is_locked());
//! lock.unlock(); // fully released
//! assert!(!lock.is_locked());
//!
//! assert!(lock.try_lock_for(Duration::from_millis(10)));
//! lock.unlock();
//!
//! let total = lock.with_lock(|| 1 + 1);
//! assert_eq!(total, 2);
//! ```
//!
//! ## When *Not* to Use
//! - Long critical sections
//! - Code that blocks while holding the lock

use core::fmt;
use core::marker::PhantomData;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use crate::shim::atomic::{
    AtomicU32, AtomicU64,
    Ordering::{Acquire, Relaxed, Release},
};
use crate::{BackOff, OwnerId};

/// Locked bit of the state word.
const LOCKED: u64 = 1;

/// Position of the owner identity inside the state word.
const OWNER_SHIFT: u32 = 32;

/// How the calling thread came to hold the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Acquired,
    Reentered,
}

/// A spin-based, reentrant mutual exclusion primitive.
///
/// Unlike `std::sync::Mutex` this lock does not own the data it protects; it
/// guards a critical section. See the [module-level documentation](self) for
/// the state layout and reentrancy rules.
pub struct SpinLock {
    state: CachePadded<AtomicU64>,
    waiters: CachePadded<AtomicU32>,
}

impl SpinLock {
    /// Creates a new unlocked [`SpinLock`].
    #[cfg(not(feature = "loom"))]
    #[inline(always)]
    pub const fn new() -> Self {
        SpinLock {
            state: CachePadded::new(AtomicU64::new(0)),
            waiters: CachePadded::new(AtomicU32::new(0)),
        }
    }

    /// Creates a new unlocked [`SpinLock`].
    #[cfg(feature = "loom")]
    pub fn new() -> Self {
        SpinLock {
            state: CachePadded::new(AtomicU64::new(0)),
            waiters: CachePadded::new(AtomicU32::new(0)),
        }
    }

    /// Acquires the lock, spinning until it becomes available.
    ///
    /// Returns immediately if the calling thread already holds it.
    #[inline]
    pub fn lock(&self) {
        self.enter(None);
    }

    /// Acquires the lock without waiting.
    ///
    /// Returns `true` if the lock was free or is already held by the caller.
    #[inline]
    pub fn try_lock(&self) -> bool {
        let owner = OwnerId::current();
        self.fast_lock(owner) || self.is_reentrant(owner)
    }

    /// Tries to acquire the lock until `timeout` elapses.
    ///
    /// Returns `false` if the deadline passes first. A zero timeout behaves
    /// like [`try_lock`](Self::try_lock).
    #[inline]
    pub fn try_lock_for(&self, timeout: Duration) -> bool {
        // An unrepresentable deadline is as good as no deadline.
        let deadline = Instant::now().checked_add(timeout);
        match deadline {
            Some(deadline) => self.enter(Some(deadline)).is_some(),
            None => {
                self.enter(None);
                true
            }
        }
    }

    /// Releases the lock.
    ///
    /// # Panics
    /// Panics if the calling thread does not hold the lock.
    #[track_caller]
    pub fn unlock(&self) {
        let owner = OwnerId::current();
        let mut state = self.state.load(Relaxed);
        if !is_held_by(state, owner) {
            misuse(state, owner);
        }

        if self.waiters.load(Relaxed) == 0 {
            self.state.store(0, Release);
            return;
        }

        while let Err(current) = self
            .state
            .compare_exchange_weak(state, 0, Release, Relaxed)
        {
            state = current;
            if !is_held_by(state, owner) {
                misuse(state, owner);
            }
        }
    }

    /// Checks whether the lock is currently held.
    ///
    /// Advisory only: the answer may be stale by the time it is used.
    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.state.load(Relaxed) & LOCKED == LOCKED
    }

    /// Returns the current holder, if any. Advisory, like [`is_locked`](Self::is_locked).
    #[inline]
    pub fn owner(&self) -> Option<OwnerId> {
        let state = self.state.load(Relaxed);
        if state & LOCKED == 0 {
            return None;
        }
        OwnerId::from_raw((state >> OWNER_SHIFT) as u32)
    }

    /// Number of threads currently spinning on the lock. Advisory.
    #[inline]
    pub fn waiters(&self) -> u32 {
        self.waiters.load(Relaxed)
    }

    /// Acquires the lock and returns a guard that releases it on drop.
    ///
    /// If the caller already held the lock the guard does not release it, so
    /// the outer holder keeps it.
    #[inline]
    pub fn guard(&self) -> SpinGuard<'_> {
        let entry = self.enter(None);
        SpinGuard::new(self, entry == Some(Entry::Acquired))
    }

    /// [`guard`](Self::guard) bounded by `timeout`.
    #[inline]
    pub fn try_guard_for(&self, timeout: Duration) -> Option<SpinGuard<'_>> {
        let deadline = Instant::now().checked_add(timeout);
        self.enter(deadline)
            .map(|entry| SpinGuard::new(self, entry == Entry::Acquired))
    }

    /// Runs a closure while holding the lock.
    ///
    /// # Example
    /// ```
    /// use spinflow::SpinLock;
    ///
    /// let lock = SpinLock::new();
    /// let value = lock.with_lock(|| lock.with_lock(|| 7));
    /// assert_eq!(value, 7);
    /// assert!(!lock.is_locked());
    /// ```
    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.guard();
        f()
    }

    #[inline(always)]
    fn fast_lock(&self, owner: OwnerId) -> bool {
        self.state
            .compare_exchange(0, tag(owner), Acquire, Relaxed)
            .is_ok()
    }

    #[inline(always)]
    fn is_reentrant(&self, owner: OwnerId) -> bool {
        is_held_by(self.state.load(Relaxed), owner)
    }

    /// Shared acquisition path. `None` means the deadline passed.
    fn enter(&self, deadline: Option<Instant>) -> Option<Entry> {
        let owner = OwnerId::current();
        if self.fast_lock(owner) {
            return Some(Entry::Acquired);
        }
        if self.is_reentrant(owner) {
            return Some(Entry::Reentered);
        }
        if self.contended(owner, deadline) {
            Some(Entry::Acquired)
        } else {
            None
        }
    }

    #[cold]
    fn contended(&self, owner: OwnerId, deadline: Option<Instant>) -> bool {
        let _waiting = Waiting::register(&self.waiters);
        let tagged = tag(owner);
        let mut backoff = BackOff::new();
        let mut last = None;

        loop {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return false;
                }
            }

            let state = self.state.load(Relaxed);
            if state == 0 {
                if self
                    .state
                    .compare_exchange(0, tagged, Acquire, Relaxed)
                    .is_ok()
                {
                    return true;
                }
                // Lost the race; the winner's state is picked up next round.
                backoff.snooze();
            } else if last == Some(state) {
                backoff.snooze();
            }
            last = Some(state);
        }
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SpinLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .field("owner", &self.owner())
            .field("waiters", &self.waiters())
            .finish()
    }
}

/// A guard that releases the [`SpinLock`] when dropped.
///
/// Returned by [`SpinLock::guard`]. Not `Send`: the lock must be released by
/// the thread that took it.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
    release: bool,
    _not_send: PhantomData<*const ()>,
}

impl<'a> SpinGuard<'a> {
    fn new(lock: &'a SpinLock, release: bool) -> Self {
        SpinGuard {
            lock,
            release,
            _not_send: PhantomData,
        }
    }

    /// Returns `true` if dropping this guard releases the lock.
    #[inline(always)]
    pub fn is_outermost(&self) -> bool {
        self.release
    }
}

impl Drop for SpinGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        if self.release {
            self.lock.unlock();
        }
    }
}

impl fmt::Debug for SpinGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinGuard")
            .field("outermost", &self.release)
            .finish()
    }
}

/// Keeps the waiter count raised for as long as a thread spins.
struct Waiting<'a>(&'a AtomicU32);

impl<'a> Waiting<'a> {
    fn register(waiters: &'a AtomicU32) -> Self {
        waiters.fetch_add(1, Relaxed);
        Waiting(waiters)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Relaxed);
    }
}

#[inline(always)]
fn tag(owner: OwnerId) -> u64 {
    LOCKED | (u64::from(owner.get()) << OWNER_SHIFT)
}

#[inline(always)]
fn is_held_by(state: u64, owner: OwnerId) -> bool {
    state & LOCKED == LOCKED && state >> OWNER_SHIFT == u64::from(owner.get())
}

#[cold]
#[track_caller]
fn misuse(state: u64, caller: OwnerId) -> ! {
    let holder = OwnerId::from_raw((state >> OWNER_SHIFT) as u32);
    tracing::error!(%caller, ?holder, "unlock of spin lock not owned by current thread");
    panic!("unlock of spin lock not owned by current thread (caller {caller}, holder {holder:?})");
}

#[cfg(all(test, not(feature = "loom")))]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;

    /// Spawns a thread that takes `lock` and keeps it until told to let go.
    fn hold_elsewhere(lock: &Arc<SpinLock>) -> (mpsc::Sender<()>, thread::JoinHandle<()>) {
        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let lock = Arc::clone(lock);
        let handle = thread::spawn(move || {
            lock.lock();
            held_tx.send(()).unwrap();
            let _ = release_rx.recv();
            lock.unlock();
        });
        held_rx.recv().unwrap();
        (release_tx, handle)
    }

    #[test]
    fn test_basic_lock_unlock() {
        let lock = SpinLock::new();
        assert!(!lock.is_locked());
        assert_eq!(lock.owner(), None);

        lock.lock();
        assert!(lock.is_locked());
        assert_eq!(lock.owner(), Some(OwnerId::current()));

        lock.unlock();
        assert!(!lock.is_locked(), "Lock should be released after unlock");
        assert_eq!(lock.state.load(Relaxed), 0);
    }

    #[test]
    fn test_reentrant_lock_returns_promptly() {
        let lock = SpinLock::new();
        lock.lock();
        lock.lock();
        assert!(lock.try_lock());
        assert!(lock.try_lock_for(Duration::ZERO));

        // A single unlock releases regardless of depth.
        lock.unlock();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_nested_guards_release_once() {
        let lock = SpinLock::new();
        {
            let outer = lock.guard();
            assert!(outer.is_outermost());
            {
                let inner = lock.guard();
                assert!(!inner.is_outermost());
            }
            assert!(lock.is_locked(), "Inner guard must not release the outer hold");
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_try_lock_for_times_out() {
        let lock = Arc::new(SpinLock::new());
        let (release, handle) = hold_elsewhere(&lock);

        let started = Instant::now();
        assert!(!lock.try_lock_for(Duration::from_millis(50)));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_secs(5), "TryLock overshot its deadline: {waited:?}");
        assert_eq!(lock.waiters(), 0, "Timed-out waiter must deregister");
        assert!(lock.try_guard_for(Duration::from_millis(1)).is_none());

        release.send(()).unwrap();
        handle.join().unwrap();
        assert!(lock.try_lock_for(Duration::from_secs(1)));
        lock.unlock();
    }

    #[test]
    fn test_contended_unlock_hands_over() {
        let lock = Arc::new(SpinLock::new());
        let (release, handle) = hold_elsewhere(&lock);

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.lock();
                let me = OwnerId::current();
                assert_eq!(lock.owner(), Some(me));
                lock.unlock();
            })
        };
        while lock.waiters() == 0 {
            thread::yield_now();
        }

        release.send(()).unwrap();
        handle.join().unwrap();
        waiter.join().unwrap();
        assert!(!lock.is_locked());
        assert_eq!(lock.waiters(), 0);
    }

    #[test]
    #[should_panic(expected = "not owned by current thread")]
    fn test_unlock_unheld_panics() {
        let lock = SpinLock::new();
        lock.unlock();
    }

    #[test]
    fn test_unlock_by_non_owner_panics() {
        let lock = Arc::new(SpinLock::new());
        let (release, handle) = hold_elsewhere(&lock);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| lock.unlock()));
        assert!(result.is_err(), "Non-owner unlock must be fatal");
        assert!(lock.is_locked(), "Misuse must not release the lock");

        release.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_concurrent_access() {
        let lock = Arc::new(SpinLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            let total = Arc::clone(&total);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    lock.with_lock(|| {
                        assert_eq!(inside.fetch_add(1, SeqCst), 0, "Two holders at once");
                        total.fetch_add(1, SeqCst);
                        inside.fetch_sub(1, SeqCst);
                    });
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(total.load(SeqCst), 8 * 10_000, "Counter should match total increments");
        assert_eq!(inside.load(SeqCst), 0);
        assert_eq!(lock.waiters(), 0);
    }
}
