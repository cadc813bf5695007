#![cfg(not(feature = "loom"))]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use spinflow::{BoxError, DataFlow, FlowState};

#[test]
fn test_single_producer_order_is_preserved() {
    let flow = DataFlow::<u32>::new(20);
    let (tx, rx) = mpsc::channel();
    flow.consume(move |data, _| {
        let _ = tx.send(data.iter().collect::<Vec<_>>());
    })
    .unwrap();
    assert!(flow.produce(|data, _| {
        for i in 0..1000 {
            data.send(i).unwrap();
        }
    }));

    flow.stop();
    assert_eq!(rx.recv().unwrap(), (0..1000).collect::<Vec<_>>());
}

#[test]
fn test_stop_waits_for_every_item() {
    let flow = DataFlow::<(usize, u32)>::new(20);
    let seen = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    let counter = Arc::clone(&seen);
    flow.consume(move |data, _| {
        let mut last: HashMap<usize, u32> = HashMap::new();
        for (producer, i) in data {
            if let Some(prev) = last.insert(producer, i) {
                assert!(i > prev, "producer {producer} reordered");
            }
            counter.fetch_add(1, SeqCst);
        }
        let _ = tx.send(last.len());
    })
    .unwrap();

    for producer in 0..3 {
        assert!(flow.produce(move |data, _| {
            for i in 0..1000 {
                data.send((producer, i)).unwrap();
            }
        }));
    }

    flow.stop();
    assert_eq!(seen.load(SeqCst), 3000, "stop returned before the consumer drained");
    assert_eq!(flow.status(), FlowState::Closed);
    assert_eq!(rx.recv().unwrap(), 3);
}

#[test]
fn test_produce_is_barred_once_stop_begins() {
    let flow = DataFlow::<u32>::new(4);
    flow.consume(|data, _| for _ in data {}).unwrap();

    let in_producer = Arc::new(Barrier::new(2));
    let (finish_tx, finish_rx) = mpsc::channel::<()>();
    {
        let in_producer = Arc::clone(&in_producer);
        assert!(flow.produce(move |data, _| {
            in_producer.wait();
            let _ = finish_rx.recv();
            data.send(1).unwrap();
        }));
    }
    in_producer.wait();

    let stopper = {
        let flow = flow.clone();
        thread::spawn(move || {
            flow.stop();
        })
    };
    while flow.status() == FlowState::Started {
        thread::yield_now();
    }
    assert_eq!(flow.status(), FlowState::Draining);

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    assert!(!flow.produce(move |_, _| flag.store(true, SeqCst)));

    finish_tx.send(()).unwrap();
    stopper.join().unwrap();
    assert_eq!(flow.status(), FlowState::Closed);
    assert!(!ran.load(SeqCst), "a barred producer must never run");
}

#[test]
fn test_state_never_moves_backwards() {
    let flow = DataFlow::<u32>::new(8);
    let done = Arc::new(AtomicBool::new(false));

    let poller = {
        let flow = flow.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut observed = vec![flow.status()];
            while !done.load(SeqCst) {
                let state = flow.status();
                if observed.last() != Some(&state) {
                    observed.push(state);
                }
            }
            let state = flow.status();
            if observed.last() != Some(&state) {
                observed.push(state);
            }
            observed
        })
    };

    flow.consume(|data, _| {
        for _ in data {
            thread::sleep(Duration::from_micros(50));
        }
    })
    .unwrap();
    for _ in 0..2 {
        flow.produce(|data, _| {
            for i in 0..200 {
                data.send(i).unwrap();
            }
        });
    }
    flow.stop();
    done.store(true, SeqCst);

    let observed = poller.join().unwrap();
    let order = [FlowState::Started, FlowState::Draining, FlowState::Closed];
    let mut position = 0;
    for state in &observed {
        let at = order
            .iter()
            .position(|s| s == state)
            .unwrap_or_else(|| panic!("unexpected state {state}"));
        assert!(at >= position, "state went backwards: {observed:?}");
        position = at;
    }
    assert_eq!(observed.last(), Some(&FlowState::Closed));
}

#[test]
fn test_errors_travel_on_the_side_channel() {
    let flow = DataFlow::<u32>::new(8);
    let (err_tx, err_rx) = mpsc::channel();
    flow.consume(|data, _| for _ in data {}).unwrap();
    flow.on_error(move |errors| {
        for err in errors {
            let _ = err_tx.send(err.to_string());
        }
    })
    .unwrap();

    flow.produce(|data, errors| {
        for i in 0..5 {
            if i == 3 {
                let err: BoxError = format!("bad item {i}").into();
                errors.send(err).unwrap();
            } else {
                data.send(i).unwrap();
            }
        }
    });

    flow.stop();
    let reported: Vec<String> = err_rx.iter().collect();
    assert_eq!(reported, vec!["bad item 3".to_owned()]);
}

#[test]
fn test_concurrent_stops_all_return_closed() {
    let flow = DataFlow::<u32>::new(8);
    flow.consume(|data, _| {
        for _ in data {
            thread::sleep(Duration::from_millis(1));
        }
    })
    .unwrap();
    flow.produce(|data, _| {
        for i in 0..50 {
            data.send(i).unwrap();
        }
    });

    let stoppers: Vec<_> = (0..4)
        .map(|_| {
            let flow = flow.clone();
            thread::spawn(move || flow.stop().status())
        })
        .collect();
    for s in stoppers {
        assert_eq!(s.join().unwrap(), FlowState::Closed);
    }
}

#[test]
fn test_restart_after_close() {
    let flow = DataFlow::<u32>::new(4);
    for round in 0..3u32 {
        let (tx, rx) = mpsc::channel();
        flow.start();
        assert_eq!(flow.status(), FlowState::Started);
        flow.consume(move |data, _| {
            let _ = tx.send(data.iter().sum::<u32>());
        })
        .unwrap();
        flow.produce(move |data, _| {
            for _ in 0..10 {
                data.send(round).unwrap();
            }
        });
        flow.stop();
        assert_eq!(rx.recv().unwrap(), round * 10);
    }
}
