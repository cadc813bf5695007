//! # Bounded buffer
//!
//! A fixed-capacity FIFO shared by any number of [`Sender`]s and
//! [`Receiver`]s.
//!
//! - [`Sender::send`] blocks while the buffer is full (backpressure) and only
//!   fails once the buffer is closed.
//! - [`Receiver::recv`] blocks while the buffer is empty and open, and returns
//!   `None` once it is closed *and* drained. Items sent before the close are
//!   never lost.
//! - Closing is explicit ([`Sender::close`]); dropping handles does not close
//!   the buffer. A [`DataFlow`](crate::DataFlow) decides when its buffers close.
//! - A capacity of 0 makes a rendezvous buffer: each send waits until a
//!   receiver has taken the item.
//!
//! ## Example
//! ```rust
//! use spinflow::buffer::bounded;
//! use std::thread;
//!
//! let (tx, rx) = bounded(2);
//! let producer = thread::spawn(move || {
//!     for i in 0..10 {
//!         tx.send(i).unwrap();
//!     }
//!     tx.close();
//! });
//!
//! let received: Vec<i32> = rx.iter().collect();
//! producer.join().unwrap();
//! assert_eq!(received, (0..10).collect::<Vec<_>>());
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{RecvTimeoutError, SendError, TryRecvError, TrySendError};

struct Inner<T> {
    queue: VecDeque<T>,
    capacity: usize,
    closed: bool,
    /// Items ever pushed and popped; a rendezvous send waits on `taken`.
    sent: u64,
    taken: u64,
    /// Receivers parked in `recv`/`recv_timeout`.
    receivers_waiting: usize,
}

impl<T> Inner<T> {
    /// Items the queue may hold at once. A rendezvous buffer parks one item
    /// for the hand-off.
    #[inline]
    fn slots(&self) -> usize {
        self.capacity.max(1)
    }

    #[inline]
    fn is_rendezvous(&self) -> bool {
        self.capacity == 0
    }

    fn push(&mut self, value: T) -> u64 {
        self.queue.push_back(value);
        self.sent += 1;
        self.sent
    }
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    /// Notifies senders when space becomes available.
    not_full: Condvar,
    /// Notifies receivers when items become available.
    not_empty: Condvar,
}

impl<T> Shared<T> {
    fn close(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.closed = true;
        drop(inner);

        self.not_full.notify_all();
        self.not_empty.notify_all();
        true
    }

    fn pop(&self, inner: &mut Inner<T>) -> Option<T> {
        let value = inner.queue.pop_front()?;
        inner.taken += 1;
        if inner.is_rendezvous() {
            // Wakes the sender waiting on this hand-off as well as senders
            // waiting for the slot.
            self.not_full.notify_all();
        } else {
            self.not_full.notify_one();
        }
        Some(value)
    }

    /// Waits on `not_empty` as a counted receiver. Returns `true` on timeout.
    fn park_receiver(&self, inner: &mut MutexGuard<'_, Inner<T>>, deadline: Option<Instant>) -> bool {
        inner.receivers_waiting += 1;
        let timed_out = match deadline {
            Some(deadline) => self.not_empty.wait_until(inner, deadline).timed_out(),
            None => {
                self.not_empty.wait(inner);
                false
            }
        };
        inner.receivers_waiting -= 1;
        timed_out
    }
}

/// Creates a bounded buffer holding at most `capacity` items.
///
/// With a `capacity` of 0 the buffer holds nothing: [`Sender::send`] returns
/// only once a receiver has taken the item.
#[must_use]
pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            queue: VecDeque::with_capacity(capacity.max(1)),
            capacity,
            closed: false,
            sent: 0,
            taken: 0,
            receivers_waiting: 0,
        }),
        not_full: Condvar::new(),
        not_empty: Condvar::new(),
    });
    let sender = Sender {
        shared: Arc::clone(&shared),
    };
    let receiver = Receiver { shared };

    (sender, receiver)
}

/// The sending half of a bounded buffer. Cheap to clone.
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Sender<T> {
    /// Appends `value`, waiting for space if the buffer is full.
    ///
    /// On a rendezvous buffer this also waits until a receiver has taken
    /// `value`. If the buffer closes during that wait the item stays
    /// readable and the send still succeeds.
    ///
    /// # Errors
    ///
    /// Returns the value inside [`SendError`] if the buffer is closed, whether
    /// it was closed before the call or while waiting for space.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        let mut inner = self.shared.inner.lock();
        loop {
            if inner.closed {
                return Err(SendError(value));
            }
            if inner.queue.len() < inner.slots() {
                break;
            }
            self.shared.not_full.wait(&mut inner);
        }

        let ticket = inner.push(value);
        self.shared.not_empty.notify_one();
        if inner.is_rendezvous() {
            while inner.taken < ticket && !inner.closed {
                self.shared.not_full.wait(&mut inner);
            }
        }
        Ok(())
    }

    /// Appends `value` without waiting.
    ///
    /// A rendezvous buffer accepts the item only when a receiver is already
    /// waiting for it.
    ///
    /// # Errors
    ///
    /// - [`TrySendError::Full`] if the buffer is at capacity
    /// - [`TrySendError::Closed`] if the buffer is closed
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(TrySendError::Closed(value));
        }
        let full = if inner.is_rendezvous() {
            !inner.queue.is_empty() || inner.receivers_waiting == 0
        } else {
            inner.queue.len() >= inner.capacity
        };
        if full {
            return Err(TrySendError::Full(value));
        }
        inner.push(value);
        drop(inner);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Closes the buffer for every handle.
    ///
    /// Pending and future sends fail; buffered items stay readable. Returns
    /// `false` if the buffer was already closed.
    pub fn close(&self) -> bool {
        self.shared.close()
    }

    /// Returns `true` if the buffer is closed.
    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().closed
    }

    /// Returns the buffer's capacity.
    pub fn capacity(&self) -> usize {
        self.shared.inner.lock().capacity
    }

    /// Returns the number of buffered items.
    pub fn len(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    /// Returns `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("closed", &self.is_closed())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// The receiving half of a bounded buffer.
///
/// Clones share the same queue; each item is delivered to exactly one of them.
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Receiver<T> {
    /// Takes the oldest item, waiting while the buffer is empty.
    ///
    /// Returns `None` once the buffer is closed and drained.
    pub fn recv(&self) -> Option<T> {
        let mut inner = self.shared.inner.lock();
        loop {
            if let Some(value) = self.shared.pop(&mut inner) {
                return Some(value);
            }
            if inner.closed {
                return None;
            }
            self.shared.park_receiver(&mut inner, None);
        }
    }

    /// Takes the oldest item without waiting.
    ///
    /// # Errors
    ///
    /// - [`TryRecvError::Empty`] if nothing is buffered
    /// - [`TryRecvError::Closed`] if the buffer is closed and drained
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut inner = self.shared.inner.lock();
        match self.shared.pop(&mut inner) {
            Some(value) => Ok(value),
            None if inner.closed => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Takes the oldest item, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// - [`RecvTimeoutError::Timeout`] if nothing arrived in time
    /// - [`RecvTimeoutError::Closed`] if the buffer is closed and drained
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.recv().ok_or(RecvTimeoutError::Closed);
        };
        let mut inner = self.shared.inner.lock();
        loop {
            if let Some(value) = self.shared.pop(&mut inner) {
                return Ok(value);
            }
            if inner.closed {
                return Err(RecvTimeoutError::Closed);
            }
            if self.shared.park_receiver(&mut inner, Some(deadline)) {
                return self
                    .shared
                    .pop(&mut inner)
                    .ok_or(if inner.closed {
                        RecvTimeoutError::Closed
                    } else {
                        RecvTimeoutError::Timeout
                    });
            }
        }
    }

    /// Returns an iterator that blocks for each item and ends once the
    /// buffer is closed and drained.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { receiver: self }
    }

    /// Returns `true` if the buffer is closed. Items may still be buffered.
    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().closed
    }

    /// Returns the number of buffered items.
    pub fn len(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    /// Returns `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("closed", &self.is_closed())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Borrowing iterator returned by [`Receiver::iter`].
#[derive(Debug)]
pub struct Iter<'a, T> {
    receiver: &'a Receiver<T>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.receiver.recv()
    }
}

/// Owning iterator returned by `Receiver::into_iter`.
#[derive(Debug)]
pub struct IntoIter<T> {
    receiver: Receiver<T>,
}

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.receiver.recv()
    }
}

impl<T> IntoIterator for Receiver<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> IntoIter<T> {
        IntoIter { receiver: self }
    }
}

impl<'a, T> IntoIterator for &'a Receiver<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}
