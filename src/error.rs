//! Error types for the buffer and the data flow.

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

/// Type-erased error carried by a flow's error buffer.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors returned when attaching work to a [`DataFlow`](crate::DataFlow).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FlowError {
    /// The flow is draining or closed.
    #[error("data flow is not started")]
    NotStarted,
    /// A consumer is already attached for this run of the flow.
    #[error("data flow already has a consumer")]
    ConsumerAttached,
    /// The worker thread could not be spawned.
    #[error("failed to spawn data flow worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Error returned by [`Sender::send`](crate::buffer::Sender::send) once the
/// buffer is closed. The value is handed back.
#[derive(PartialEq, Eq, Clone, Copy)]
pub struct SendError<T>(pub T);

impl<T> SendError<T> {
    /// Returns the value that could not be sent.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendError").finish_non_exhaustive()
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sending on a closed buffer")
    }
}

impl<T> StdError for SendError<T> {}

/// Error returned by [`Sender::try_send`](crate::buffer::Sender::try_send).
#[derive(PartialEq, Eq, Clone, Copy)]
pub enum TrySendError<T> {
    /// The buffer is at capacity.
    Full(T),
    /// The buffer is closed.
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Returns the value that could not be sent.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(value) | Self::Closed(value) => value,
        }
    }

    /// Returns `true` if the send failed because the buffer was full.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => write!(f, "sending on a full buffer"),
            Self::Closed(_) => write!(f, "sending on a closed buffer"),
        }
    }
}

impl<T> StdError for TrySendError<T> {}

impl<T> From<SendError<T>> for TrySendError<T> {
    fn from(err: SendError<T>) -> Self {
        Self::Closed(err.0)
    }
}

/// Error returned by [`Receiver::try_recv`](crate::buffer::Receiver::try_recv).
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum TryRecvError {
    /// Nothing buffered right now.
    #[error("receiving on an empty buffer")]
    Empty,
    /// The buffer is closed and fully drained.
    #[error("receiving on a closed buffer")]
    Closed,
}

/// Error returned by [`Receiver::recv_timeout`](crate::buffer::Receiver::recv_timeout).
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum RecvTimeoutError {
    /// Nothing arrived before the deadline.
    #[error("timed out waiting on buffer")]
    Timeout,
    /// The buffer is closed and fully drained.
    #[error("receiving on a closed buffer")]
    Closed,
}
