//! Demo of the `spinflow` primitives.
//!
//! Spawns a pool of threads that increment a shared counter under a
//! [`SpinLock`], then pushes three batches through a [`DataFlow`] and sums
//! them in a single consumer. Set `RUST_LOG=spinflow=debug` to watch the
//! flow's lifecycle.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::thread;

use spinflow::{DataFlow, SpinLock};
use tracing::info;
use tracing_subscriber::EnvFilter;

const THREADS: usize = 16;
const INCREMENTS: usize = 100_000;

/// A counter whose every access happens under `lock`.
struct Guarded {
    lock: SpinLock,
    value: UnsafeCell<u64>,
}

// Safety: `value` is only touched while `lock` is held.
unsafe impl Sync for Guarded {}

impl Guarded {
    fn add(&self, n: u64) {
        self.lock.with_lock(|| unsafe { *self.value.get() += n });
    }

    fn get(&self) -> u64 {
        self.lock.with_lock(|| unsafe { *self.value.get() })
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    info!(threads = THREADS, increments = INCREMENTS, "starting spin lock demo");
    let counter = Arc::new(Guarded {
        lock: SpinLock::new(),
        value: UnsafeCell::new(0),
    });

    let threads: Vec<_> = (0..THREADS)
        .map(|_| {
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..INCREMENTS {
                    counter.add(1);
                }
            })
        })
        .collect();
    for t in threads {
        let _ = t.join();
    }
    info!(value = counter.get(), "spin lock demo finished");

    let flow = DataFlow::<u64>::new(32);
    let (total_tx, total_rx) = std::sync::mpsc::channel();
    if let Err(err) = flow.consume(move |data, errors| {
        let sum: u64 = data.iter().sum();
        for err in errors.iter() {
            tracing::warn!(%err, "producer reported an error");
        }
        let _ = total_tx.send(sum);
    }) {
        tracing::error!(%err, "could not attach consumer");
        return;
    }

    for batch in 0..3u64 {
        flow.produce(move |data, _errors| {
            for i in 0..1_000 {
                if data.send(batch * 1_000 + i).is_err() {
                    break;
                }
            }
        });
    }

    flow.stop();
    match total_rx.recv() {
        Ok(sum) => info!(sum, state = %flow.status(), "data flow demo finished"),
        Err(_) => tracing::error!("consumer exited without a result"),
    }
}
