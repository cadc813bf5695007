//! # spinflow
//!
//! Two concurrency primitives that compose:
//!
//! - [`SpinLock`] — an owner-tagged, reentrant spin lock with a bounded
//!   [`BackOff`], a timed [`SpinLock::try_lock_for`], and a fatal check on
//!   unlock by a thread that does not hold it.
//! - [`DataFlow`] — a bounded producer/consumer pipeline with a
//!   `Closed → Started → Draining → Closed` lifecycle, any number of
//!   producers, one consumer, and a side buffer for errors.
//!
//! Supporting pieces are public too: [`Signal`] (a wait-group style counter),
//! the [`buffer`] module (the bounded FIFO behind a flow) and [`OwnerId`]
//! (the per-thread identity the lock records).
//!
//! ## Quick Example
//!
//! ```rust
//! use spinflow::{DataFlow, FlowState, SpinLock};
//! use std::sync::Arc;
//!
//! // SpinLock
//! let lock = SpinLock::new();
//! lock.lock();
//! assert!(lock.is_locked());
//! lock.unlock();
//!
//! // DataFlow
//! let flow = DataFlow::<String>::new(8);
//! let lines = Arc::new(SpinLock::new());
//! let (tx, rx) = std::sync::mpsc::channel();
//! flow.consume(move |data, _errors| {
//!     let _ = tx.send(data.iter().count());
//! })
//! .unwrap();
//! flow.produce(move |data, _errors| {
//!     lines.with_lock(|| data.send("hello".to_owned()).unwrap());
//! });
//! flow.stop();
//! assert_eq!(flow.status(), FlowState::Closed);
//! assert_eq!(rx.recv().unwrap(), 1);
//! ```
//!
//! ## Design
//!
//! ### SpinLock
//!
//! The lock state is a single `AtomicU64` holding a locked bit and the
//! owner's [`OwnerId`], so one compare-and-swap both takes the lock and
//! records the holder. Contended acquirers register as waiters and back off
//! with [`BackOff`]: a short exponential spin, then processor yields.
//!
//! ### DataFlow
//!
//! Producer registration and [`DataFlow::stop`] meet on an atomic state byte
//! and a [`Signal`]: a producer either registers before the flow starts
//! draining, and `stop()` waits for it, or sees the flow draining and never
//! runs. `stop()` blocks on condition variables rather than spinning, since
//! a drain can take arbitrarily long.
//!
//! ## Safety & Usage Notes
//!
//! - Prefer `SpinLock` for **short critical sections** only.
//! - One `unlock()` releases a re-entered lock completely; use
//!   [`SpinLock::guard`] or [`SpinLock::with_lock`] for nested scopes.
//! - A `DataFlow` producer blocked on a full buffer with no consumer keeps
//!   `stop()` waiting forever.
//!
//! ## Feature flags
//!
//! - **`loom`** — builds the lock on `loom` primitives for model checking.

pub mod backoff;
pub mod buffer;
pub mod error;
pub mod flow;
pub mod owner;
mod shim;
pub mod signal;
pub mod spinlock;

pub use backoff::BackOff;
pub use error::{BoxError, FlowError};
pub use flow::{DataFlow, FlowConfig, FlowState};
pub use owner::OwnerId;
pub use signal::Signal;
pub use spinlock::{SpinGuard, SpinLock};
