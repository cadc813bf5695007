//! # DataFlow
//!
//! A bounded, multi-producer pipeline with one terminal consumer and an
//! out-of-band error stream.
//!
//! ```text
//!              produce(fn)          consume(fn)
//!  producer ─┐                   ┌─> consumer
//!  producer ─┼─> [ data  buffer ]┤
//!  producer ─┘   [ error buffer ]┴─> on_error(fn) ...
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//!  Closed ──start()──> Started ──stop()──> Draining ──drained──> Closed
//! ```
//!
//! - `Started`: producers register and write, a consumer may attach.
//! - `Draining`: [`DataFlow::stop`] has begun. New producers are turned away
//!   (their work function never runs). Once every registered producer has
//!   returned, both buffers close. The consumer keeps reading what is left.
//! - `Closed`: the consumer and error handlers have returned. A later
//!   [`DataFlow::start`] opens a fresh pair of buffers.
//!
//! Work functions run on their own threads; `produce`, `consume` and
//! `on_error` return immediately. [`DataFlow::stop`] blocks until the whole
//! pipeline has quiesced.
//!
//! ## Backpressure
//! A producer sending into a full data buffer waits. If nothing consumes the
//! data buffer, or the error buffer fills with no one reading it, producers
//! wait forever and so does `stop()`. Attach a consumer (and an error handler
//! if producers report errors) before producing in volume.
//!
//! ## Example
//! ```rust
//! use spinflow::DataFlow;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let flow = DataFlow::<u32>::new(16);
//! let seen = Arc::new(AtomicUsize::new(0));
//!
//! let counter = Arc::clone(&seen);
//! flow.consume(move |data, _errors| {
//!     for _ in data {
//!         counter.fetch_add(1, Ordering::SeqCst);
//!     }
//! })
//! .unwrap();
//!
//! for _ in 0..3 {
//!     flow.produce(|data, _errors| {
//!         for i in 0..100 {
//!             data.send(i).unwrap();
//!         }
//!     });
//! }
//!
//! flow.stop();
//! assert_eq!(seen.load(Ordering::SeqCst), 300);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering::SeqCst};
use std::sync::Arc;
use std::thread;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::buffer::{bounded, Receiver, Sender};
use crate::error::{BoxError, FlowError, TrySendError};
use crate::signal::DoneOnDrop;
use crate::{Signal, SpinLock};

/// Default data buffer capacity.
pub const DEFAULT_CAPACITY: usize = 64;

/// Lifecycle state of a [`DataFlow`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowState {
    /// No activity. Producers are turned away.
    Closed = 0,
    /// Shutting down: producers are turned away, the consumer is draining.
    Draining = 1,
    /// Fully open.
    Started = 2,
}

impl FlowState {
    #[inline]
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => FlowState::Closed,
            1 => FlowState::Draining,
            2 => FlowState::Started,
            _ => unreachable!("invalid flow state {raw}"),
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowState::Closed => "closed",
            FlowState::Draining => "draining",
            FlowState::Started => "started",
        };
        f.write_str(name)
    }
}

/// Construction parameters for a [`DataFlow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowConfig {
    /// Data buffer capacity.
    pub capacity: usize,
    /// Error buffer capacity; derived from `capacity` when `None`.
    pub error_capacity: Option<usize>,
    /// Prefix for worker thread names.
    pub thread_name: String,
}

impl FlowConfig {
    /// Config with the given data capacity and defaults elsewhere.
    pub fn new(capacity: usize) -> Self {
        FlowConfig {
            capacity,
            ..FlowConfig::default()
        }
    }

    /// Sets an explicit error buffer capacity.
    pub fn error_capacity(mut self, capacity: usize) -> Self {
        self.error_capacity = Some(capacity);
        self
    }

    /// Sets the worker thread name prefix.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Error buffer capacity actually used: one twentieth of the data
    /// capacity plus two, unless set explicitly.
    pub fn resolved_error_capacity(&self) -> usize {
        self.error_capacity
            .unwrap_or(self.capacity / 20 + 2)
            .max(1)
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            capacity: DEFAULT_CAPACITY,
            error_capacity: None,
            thread_name: String::from("data-flow"),
        }
    }
}

/// The buffers of one Started..Closed run.
struct Conduit<T> {
    data: Sender<T>,
    data_out: Receiver<T>,
    errors: Sender<BoxError>,
    errors_out: Receiver<BoxError>,
    consumer_attached: AtomicBool,
}

impl<T> Conduit<T> {
    fn open(config: &FlowConfig) -> Self {
        let (data, data_out) = bounded(config.capacity);
        let (errors, errors_out) = bounded(config.resolved_error_capacity());
        Conduit {
            data,
            data_out,
            errors,
            errors_out,
            consumer_attached: AtomicBool::new(false),
        }
    }

    fn close(&self) {
        self.data.close();
        self.errors.close();
    }
}

struct Shared<T> {
    state: AtomicU8,
    conduit: ArcSwap<Conduit<T>>,
    /// Registered producers whose work function has not returned.
    producers: Signal,
    /// Attached consumer and error handlers that have not returned.
    drains: Signal,
    /// Serializes `start()`; held only while a fresh conduit is installed.
    lifecycle: SpinLock,
    /// Serializes `stop()`.
    stopping: Mutex<()>,
    config: FlowConfig,
}

impl<T> Shared<T> {
    #[inline]
    fn state(&self) -> FlowState {
        FlowState::from_u8(self.state.load(SeqCst))
    }

    /// Registers with `signal` if the flow is started.
    ///
    /// The registration is published before the state is checked again, so
    /// `stop()` either sees it in the count or the caller sees `Draining`.
    fn register(&self, signal: &Signal) -> bool {
        if self.state() != FlowState::Started {
            return false;
        }
        signal.increase();
        if self.state() != FlowState::Started {
            signal.done();
            return false;
        }
        true
    }

    fn worker(&self, role: &str) -> thread::Builder {
        thread::Builder::new().name(format!("{}-{role}", self.config.thread_name))
    }
}

/// A bounded producer/consumer pipeline with explicit lifecycle control.
///
/// Cloning a `DataFlow` yields another handle to the same pipeline.
pub struct DataFlow<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> DataFlow<T> {
    /// Creates a started flow whose data buffer holds `capacity` items.
    ///
    /// A `capacity` of 0 hands each item straight from producer to consumer.
    pub fn new(capacity: usize) -> Self {
        Self::with_config(FlowConfig::new(capacity))
    }

    /// Creates a started flow from `config`.
    pub fn with_config(config: FlowConfig) -> Self {
        let conduit = Conduit::open(&config);
        debug!(
            capacity = config.capacity,
            error_capacity = config.resolved_error_capacity(),
            "flow started"
        );
        DataFlow {
            shared: Arc::new(Shared {
                state: AtomicU8::new(FlowState::Started as u8),
                conduit: ArcSwap::from_pointee(conduit),
                producers: Signal::new(),
                drains: Signal::new(),
                lifecycle: SpinLock::new(),
                stopping: Mutex::new(()),
                config,
            }),
        }
    }

    /// Returns the current lifecycle state.
    #[inline]
    pub fn status(&self) -> FlowState {
        self.shared.state()
    }

    /// Reopens a closed flow with fresh buffers.
    ///
    /// Does nothing if the flow is started or still draining.
    pub fn start(&self) -> &Self {
        if self.status() != FlowState::Started {
            let shared = &self.shared;
            shared.lifecycle.with_lock(|| {
                if shared.state() == FlowState::Closed {
                    shared.conduit.store(Arc::new(Conduit::open(&shared.config)));
                    shared.state.store(FlowState::Started as u8, SeqCst);
                    debug!(capacity = shared.config.capacity, "flow started");
                }
            });
        }
        self
    }

    /// Runs `work` on a new thread as a registered producer.
    ///
    /// `work` receives send handles to the data and error buffers. Returns
    /// `false` without running `work` if the flow is not started.
    pub fn produce<F>(&self, work: F) -> bool
    where
        F: FnOnce(Sender<T>, Sender<BoxError>) + Send + 'static,
    {
        let shared = &self.shared;
        if !shared.register(&shared.producers) {
            trace!(state = %self.status(), "producer turned away");
            return false;
        }

        let conduit = shared.conduit.load_full();
        let data = conduit.data.clone();
        let errors = conduit.errors.clone();
        let worker = Arc::clone(shared);
        let spawned = shared.worker("producer").spawn(move || {
            let _done = DoneOnDrop(&worker.producers);
            work(data, errors);
        });

        match spawned {
            Ok(handle) => {
                trace!(thread = ?handle.thread().name(), "producer spawned");
                true
            }
            Err(err) => {
                shared.producers.done();
                error!(%err, "failed to spawn producer");
                report_spawn_failure(&conduit.errors, err);
                false
            }
        }
    }

    /// Attaches the consumer for the current run of the flow.
    ///
    /// `work` runs on a new thread with receive handles to the data and error
    /// buffers. It should read until the data buffer reports closed; its
    /// return lets a pending [`stop`](Self::stop) finish.
    ///
    /// # Errors
    ///
    /// - [`FlowError::NotStarted`] if the flow is draining or closed
    /// - [`FlowError::ConsumerAttached`] if this run already has a consumer
    /// - [`FlowError::Spawn`] if the thread could not be created
    pub fn consume<F>(&self, work: F) -> Result<(), FlowError>
    where
        F: FnOnce(Receiver<T>, Receiver<BoxError>) + Send + 'static,
    {
        let shared = &self.shared;
        if !shared.register(&shared.drains) {
            return Err(FlowError::NotStarted);
        }

        let conduit = shared.conduit.load_full();
        if conduit.consumer_attached.swap(true, SeqCst) {
            shared.drains.done();
            return Err(FlowError::ConsumerAttached);
        }

        let data = conduit.data_out.clone();
        let errors = conduit.errors_out.clone();
        let worker = Arc::clone(shared);
        let spawned = shared.worker("consumer").spawn(move || {
            let _done = DoneOnDrop(&worker.drains);
            work(data, errors);
        });

        match spawned {
            Ok(_) => {
                trace!("consumer attached");
                Ok(())
            }
            Err(err) => {
                conduit.consumer_attached.store(false, SeqCst);
                shared.drains.done();
                error!(%err, "failed to spawn consumer");
                Err(FlowError::Spawn(err))
            }
        }
    }

    /// Attaches a handler that drains the error buffer on its own thread.
    ///
    /// Several handlers may be attached; each error reaches one of them (or
    /// the consumer, which shares the error buffer).
    ///
    /// # Errors
    ///
    /// - [`FlowError::NotStarted`] if the flow is draining or closed
    /// - [`FlowError::Spawn`] if the thread could not be created
    pub fn on_error<F>(&self, work: F) -> Result<(), FlowError>
    where
        F: FnOnce(Receiver<BoxError>) + Send + 'static,
    {
        let shared = &self.shared;
        if !shared.register(&shared.drains) {
            return Err(FlowError::NotStarted);
        }

        let errors = shared.conduit.load().errors_out.clone();
        let worker = Arc::clone(shared);
        let spawned = shared.worker("errors").spawn(move || {
            let _done = DoneOnDrop(&worker.drains);
            work(errors);
        });

        match spawned {
            Ok(_) => Ok(()),
            Err(err) => {
                shared.drains.done();
                error!(%err, "failed to spawn error handler");
                Err(FlowError::Spawn(err))
            }
        }
    }

    /// Shuts the flow down and blocks until it is closed.
    ///
    /// Bars new producers, waits for registered producers to return, closes
    /// both buffers, then waits for the consumer and error handlers to drain
    /// them and return. Does nothing if the flow is already closed; a call
    /// racing another `stop()` returns once that one has finished.
    ///
    /// With no consumer attached, items still buffered at close are dropped.
    /// Calling `stop()` from inside a work function of the same flow never
    /// returns.
    pub fn stop(&self) -> &Self {
        let shared = &self.shared;
        let _serial = shared.stopping.lock();

        let draining = shared.state.compare_exchange(
            FlowState::Started as u8,
            FlowState::Draining as u8,
            SeqCst,
            SeqCst,
        );
        if draining.is_err() {
            return self;
        }
        debug!(producers = shared.producers.status(), "flow stopping");

        shared.producers.wait();
        let conduit = shared.conduit.load_full();
        conduit.close();
        trace!(buffered = conduit.data.len(), "flow buffers closed");

        shared.drains.wait();
        if !conduit.consumer_attached.load(SeqCst) && !conduit.data.is_empty() {
            warn!(
                discarded = conduit.data.len(),
                "flow closed without a consumer; buffered items dropped"
            );
        }

        shared.state.store(FlowState::Closed as u8, SeqCst);
        debug!("flow closed");
        self
    }

    /// Number of registered producers still running.
    pub fn producers(&self) -> usize {
        self.shared.producers.status()
    }

    /// Data buffer capacity.
    pub fn capacity(&self) -> usize {
        self.shared.config.capacity
    }

    /// Error buffer capacity.
    pub fn error_capacity(&self) -> usize {
        self.shared.config.resolved_error_capacity()
    }
}

impl<T> Clone for DataFlow<T> {
    fn clone(&self) -> Self {
        DataFlow {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for DataFlow<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataFlow")
            .field("state", &self.shared.state())
            .field("producers", &self.shared.producers.status())
            .field("capacity", &self.shared.config.capacity)
            .finish_non_exhaustive()
    }
}

/// Pushes a producer spawn failure onto the error buffer without waiting.
fn report_spawn_failure(errors: &Sender<BoxError>, err: std::io::Error) {
    match errors.try_send(Box::new(FlowError::Spawn(err))) {
        Ok(()) => {}
        Err(TrySendError::Full(lost)) => {
            warn!(error = %lost, "error buffer full; spawn failure not reported");
        }
        Err(TrySendError::Closed(_)) => {
            trace!("error buffer closed; spawn failure not reported");
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[test]
    fn test_new_flow_is_started() {
        let flow = DataFlow::<u8>::new(40);
        assert_eq!(flow.status(), FlowState::Started);
        assert_eq!(flow.capacity(), 40);
        assert_eq!(flow.error_capacity(), 4);
        assert_eq!(flow.producers(), 0);
    }

    #[test]
    fn test_state_bytes_round_trip() {
        for state in [FlowState::Closed, FlowState::Draining, FlowState::Started] {
            assert_eq!(FlowState::from_u8(state as u8), state);
        }
    }

    #[test]
    #[should_panic(expected = "invalid flow state")]
    fn test_unknown_state_byte_panics() {
        FlowState::from_u8(3);
    }

    #[test]
    fn test_config_overrides() {
        let config = FlowConfig::new(8).error_capacity(3).thread_name("ingest");
        assert_eq!(config.resolved_error_capacity(), 3);
        assert_eq!(FlowConfig::new(1).resolved_error_capacity(), 2);

        let flow = DataFlow::<u8>::with_config(config);
        let (tx, rx) = std::sync::mpsc::channel();
        flow.consume(move |data, _| {
            let _ = tx.send(thread::current().name().map(str::to_owned));
            for _ in data {}
        })
        .unwrap();
        assert_eq!(rx.recv().unwrap().as_deref(), Some("ingest-consumer"));
        flow.stop();
    }

    #[test]
    #[traced_test]
    fn test_stop_without_consumer_closes() {
        let flow = DataFlow::<u8>::new(4);
        assert!(flow.produce(|data, _| {
            data.send(1).unwrap();
        }));
        flow.stop();
        assert_eq!(flow.status(), FlowState::Closed);
        assert!(logs_contain("buffered items dropped"));

        // Idempotent once closed.
        flow.stop();
        assert_eq!(flow.status(), FlowState::Closed);
    }

    #[test]
    fn test_zero_capacity_hands_items_to_consumer() {
        let flow = DataFlow::<u32>::new(0);
        assert_eq!(flow.capacity(), 0);
        assert_eq!(flow.error_capacity(), 2);

        let (tx, rx) = std::sync::mpsc::channel();
        flow.consume(move |data, _| {
            let _ = tx.send(data.iter().collect::<Vec<_>>());
        })
        .unwrap();
        for base in [0, 100] {
            assert!(flow.produce(move |data, _| {
                for i in base..base + 20 {
                    data.send(i).unwrap();
                }
            }));
        }
        flow.stop();

        let mut got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        got.sort_unstable();
        let expected: Vec<u32> = (0..20).chain(100..120).collect();
        assert_eq!(got, expected);
    }

    #[test]
    #[traced_test]
    fn test_spawn_failure_on_full_error_buffer_is_logged() {
        let (errors, errors_out) = bounded::<BoxError>(1);
        report_spawn_failure(&errors, std::io::Error::other("first"));
        report_spawn_failure(&errors, std::io::Error::other("second"));

        assert_eq!(errors_out.len(), 1);
        let reported = errors_out.try_recv().unwrap();
        assert!(reported.to_string().contains("first"));
        assert!(logs_contain("spawn failure not reported"));
    }

    #[test]
    fn test_attach_rules() {
        let flow = DataFlow::<u8>::new(4);
        flow.consume(|data, _| for _ in data {}).unwrap();
        assert!(matches!(
            flow.consume(|_, _| {}),
            Err(FlowError::ConsumerAttached)
        ));
        flow.stop();

        assert!(matches!(flow.consume(|_, _| {}), Err(FlowError::NotStarted)));
        assert!(matches!(flow.on_error(|_| {}), Err(FlowError::NotStarted)));
        assert!(!flow.produce(|_, _| unreachable!()));
    }

    #[test]
    fn test_restart_opens_fresh_buffers() {
        let flow = DataFlow::<u32>::new(4);
        flow.stop();
        assert!(flow.start().status() == FlowState::Started);
        assert_eq!(flow.start().status(), FlowState::Started, "start is idempotent");

        let (tx, rx) = std::sync::mpsc::channel();
        flow.consume(move |data, _| {
            let _ = tx.send(data.iter().sum::<u32>());
        })
        .unwrap();
        flow.produce(|data, _| {
            for i in 1..=10 {
                data.send(i).unwrap();
            }
        });
        flow.stop();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 55);
    }

    #[test]
    fn test_panicking_producer_deregisters() {
        let flow = DataFlow::<u8>::new(4);
        flow.consume(|data, _| for _ in data {}).unwrap();
        flow.produce(|_, _| panic!("producer failed"));
        flow.stop();
        assert_eq!(flow.producers(), 0);
        assert_eq!(flow.status(), FlowState::Closed);
    }

    #[test]
    #[traced_test]
    fn test_lifecycle_is_logged() {
        let flow = DataFlow::<u8>::new(2);
        flow.stop();
        flow.start();
        flow.stop();
        assert!(logs_contain("flow started"));
        assert!(logs_contain("flow stopping"));
        assert!(logs_contain("flow closed"));
    }
}
