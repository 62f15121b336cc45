// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
mod common;

use std::time::Duration;

use common::*;
use rdt_pools::collector::Collector;
use rdt_pools::collector::CollectorState;
use rdt_pools::pipeline::Sample;
use rdt_pools::pipeline::Shared;

const INTERVAL: Duration = Duration::from_millis(100);
const ACQ: Duration = Duration::from_millis(50);

/// Pulse until a sample shows up. The collector may still be setting up
/// when the first pulse goes out.
fn next_sample(shared: &Shared) -> Option<Sample> {
    for _ in 0..100 {
        shared.tick.pulse();
        if let Ok(sample) = shared.sample_rx.recv_timeout(Duration::from_millis(50)) {
            return Some(sample);
        }
    }
    None
}

#[test]
fn test_lifecycle_closes_every_handle() {
    setup_test();
    let shared = shared_for(&[100], INTERVAL, ACQ);
    let backend = FakeCounters::new();
    let collector = Collector::new(100, backend.clone(), test_catalog(), shared.clone());
    assert_eq!(collector.state(), CollectorState::Configuring);
    let handle = std::thread::spawn(move || collector.run());

    for _ in 0..3 {
        let sample = next_sample(&shared).unwrap();
        assert_eq!(sample.target, 100);
        assert_eq!(sample.counters.len(), 4);
        assert_eq!(sample.counters["cpu-cycles"], 1001);
        assert_eq!(sample.counters["cache-misses"], 1004);
    }
    // Both groups enabled once through their leaders
    assert_eq!(backend.enabled(), 2);
    assert!(backend.resets() >= 6);
    assert_eq!(backend.open_handles(), 4);

    shared.shutdown();
    assert_eq!(handle.join().unwrap(), CollectorState::Terminated);
    assert_eq!(backend.opened(), 4);
    assert_eq!(backend.open_handles(), 0);
    assert_eq!(shared.stats.general().num_errors, 0);
}

#[test]
fn test_open_failure() {
    setup_test();
    let shared = shared_for(&[100], INTERVAL, ACQ);
    let backend = FakeCounters::new();
    // First member of the second group
    backend.fail_open_at(3);

    let collector = Collector::new(100, backend.clone(), test_catalog(), shared.clone());
    assert_eq!(collector.run(), CollectorState::Failed);
    assert_eq!(backend.opened(), 2);
    assert_eq!(backend.open_handles(), 0);
    assert_eq!(backend.enabled(), 0);
    assert_eq!(shared.stats.general().num_errors, 1);
    assert!(shared.sample_rx.is_empty());
}

#[test]
fn test_enable_failure() {
    setup_test();
    let shared = shared_for(&[100], INTERVAL, ACQ);
    let backend = FakeCounters::new();
    backend.fail_enable();

    let collector = Collector::new(100, backend.clone(), test_catalog(), shared.clone());
    assert_eq!(collector.run(), CollectorState::Failed);
    assert_eq!(backend.opened(), 4);
    assert_eq!(backend.open_handles(), 0);
    assert_eq!(shared.stats.general().num_errors, 1);
}

#[test]
fn test_read_failure_omits_event() {
    setup_test();
    let shared = shared_for(&[100], INTERVAL, ACQ);
    let backend = FakeCounters::new();
    backend.fail_read(2);

    let collector = Collector::new(100, backend.clone(), test_catalog(), shared.clone());
    let handle = std::thread::spawn(move || collector.run());

    let sample = next_sample(&shared).unwrap();
    assert_eq!(sample.counters.len(), 3);
    assert!(!sample.counters.contains_key("instructions"));
    assert!(shared.stats.general().num_errors >= 1);

    shared.shutdown();
    assert_eq!(handle.join().unwrap(), CollectorState::Terminated);
    assert_eq!(backend.open_handles(), 0);
}

#[test]
fn test_sample_stamped_before_reads() {
    setup_test();
    let shared = shared_for(&[100], INTERVAL, ACQ);
    let backend = FakeCounters::new();
    backend.slow_read(Duration::from_millis(30));

    let collector = Collector::new(100, backend.clone(), test_catalog(), shared.clone());
    let handle = std::thread::spawn(move || collector.run());

    let sample = next_sample(&shared).unwrap();
    // Four reads of 30ms each happen after the stamp
    assert!(sample.time_stamp.elapsed() >= Duration::from_millis(120));

    shared.shutdown();
    assert_eq!(handle.join().unwrap(), CollectorState::Terminated);
    assert_eq!(backend.open_handles(), 0);
}

#[test]
fn test_removed_target_stops_without_sample() {
    setup_test();
    let shared = shared_for(&[100, 200], INTERVAL, ACQ);
    let backend = FakeCounters::new();
    let collector = Collector::new(100, backend.clone(), test_catalog(), shared.clone());
    let handle = std::thread::spawn(move || collector.run());

    assert!(next_sample(&shared).is_some());
    std::thread::sleep(Duration::from_millis(20));
    let _ = shared.sample_rx.try_iter().count();

    shared.config.set_config(config_for(&[200]));
    shared.tick.pulse();
    assert_eq!(handle.join().unwrap(), CollectorState::Terminated);
    assert!(shared.sample_rx.is_empty());
    assert_eq!(backend.open_handles(), 0);
    assert!(!shared.should_stop());
}

#[test]
fn test_unmonitored_target_never_samples() {
    setup_test();
    let shared = shared_for(&[200], INTERVAL, ACQ);
    let backend = FakeCounters::new();
    let collector = Collector::new(100, backend.clone(), test_catalog(), shared.clone());
    let handle = std::thread::spawn(move || collector.run());

    assert!(wait_for(Duration::from_secs(5), || {
        shared.tick.pulse();
        handle.is_finished()
    }));
    assert_eq!(handle.join().unwrap(), CollectorState::Terminated);
    assert!(shared.sample_rx.is_empty());
    assert_eq!(backend.open_handles(), 0);
}
