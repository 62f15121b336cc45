// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
mod common;

use std::time::Duration;
use std::time::Instant;

use common::*;
use rdt_pools::aggregator::Aggregator;
use rdt_pools::clock::SamplingClock;
use rdt_pools::collector::Collector;
use rdt_pools::collector::CollectorState;
use rdt_pools::supervisor::Supervisor;

#[test]
fn test_aggregator_honors_deadline() {
    setup_test();
    let acq = Duration::from_millis(100);
    let shared = shared_for(&[1, 2, 3], Duration::from_millis(200), acq);
    let mut aggregator = Aggregator::new(shared.clone(), test_catalog(), None);

    let tick_start = Instant::now();
    let report = aggregator.process_tick(tick_start);
    let elapsed = tick_start.elapsed();
    assert_eq!(aggregator.collectors_num(), 3);
    assert_eq!(report.expected, 3);
    assert_eq!(report.received, 0);
    assert!(!report.published);
    assert!(elapsed >= acq);
    assert!(elapsed < acq + Duration::from_millis(100));
}

#[test]
fn test_missing_collector_still_publishes() {
    setup_test();
    let shared = shared_for(
        &[1, 2, 3],
        Duration::from_millis(100),
        Duration::from_millis(50),
    );
    let backend = FakeCounters::new();

    let mut workers = vec![];
    for target in [1, 2] {
        let collector = Collector::new(target, backend.clone(), test_catalog(), shared.clone());
        workers.push(std::thread::spawn(move || collector.run()));
    }
    let clock = SamplingClock::new(shared.clone());
    let clock = std::thread::spawn(move || clock.run());
    let aggregator = Aggregator::new(shared.clone(), test_catalog(), Some(1024.0));
    let aggregator = std::thread::spawn(move || aggregator.run());

    let mut published = None;
    assert!(wait_for(Duration::from_secs(10), || {
        published = shared
            .stats
            .pool_stats(1)
            .filter(|pool| pool.targets.len() == 2);
        published.is_some()
    }));

    let pool = published.unwrap();
    let mut targets = pool.targets.clone();
    targets.sort_unstable();
    assert_eq!(targets, vec![1, 2]);
    assert_eq!(pool.counters["cpu-cycles"], 2 * 1001);
    assert_eq!(pool.cache_ways, Some(8));
    assert_eq!(pool.llc_alloc_kb, Some(8.0 * 1024.0));
    assert!(shared.stats.app_stats(3).is_none());

    shared.shutdown();
    clock.join().unwrap();
    aggregator.join().unwrap();
    for worker in workers {
        assert_eq!(worker.join().unwrap(), CollectorState::Terminated);
    }
    assert_eq!(backend.open_handles(), 0);
}

#[test]
fn test_supervisor_tracks_config() {
    setup_test();
    let shared = shared_for(&[1, 2], Duration::from_millis(100), Duration::from_millis(50));
    let backend = FakeCounters::new();
    let mut supervisor =
        Supervisor::new(shared.clone(), backend.clone(), test_catalog()).with_pid_check(|_| true);

    assert_eq!(supervisor.reconcile(), 2);
    assert_eq!(supervisor.live_targets(), vec![1, 2]);
    // No second collector for a live target
    assert_eq!(supervisor.reconcile(), 2);

    shared.config.set_config(config_for(&[2, 3]));
    supervisor.reconcile();
    assert!(supervisor.live_targets().contains(&3));

    // Collector 1 leaves on the next tick it sees
    assert!(wait_for(Duration::from_secs(10), || {
        shared.tick.pulse();
        supervisor.reconcile();
        supervisor.live_targets() == vec![2, 3]
    }));

    shared.shutdown();
    supervisor.join_all();
    assert!(supervisor.live_targets().is_empty());
    assert_eq!(backend.open_handles(), 0);
    assert_eq!(shared.stats.general().num_errors, 0);
}

#[test]
fn test_supervisor_skips_dead_pids() {
    setup_test();
    let shared = shared_for(&[1, 2], Duration::from_millis(100), Duration::from_millis(50));
    let backend = FakeCounters::new();
    let mut supervisor = Supervisor::new(shared.clone(), backend.clone(), test_catalog())
        .with_pid_check(|pid| pid != 2);

    assert_eq!(supervisor.reconcile(), 1);
    assert_eq!(shared.stats.general().num_errors, 1);
    // Not retried until the configuration changes
    supervisor.reconcile();
    assert_eq!(shared.stats.general().num_errors, 1);

    shared.config.set_config(config_for(&[1, 2]));
    supervisor.reconcile();
    assert_eq!(shared.stats.general().num_errors, 2);
    assert_eq!(supervisor.live_targets(), vec![1]);

    shared.shutdown();
    supervisor.join_all();
    assert_eq!(backend.open_handles(), 0);
}

#[test]
fn test_end_to_end() {
    setup_test();
    let shared = shared_for(
        &[1, 2, 3],
        Duration::from_millis(100),
        Duration::from_millis(50),
    );
    let backend = FakeCounters::new();

    let supervisor = Supervisor::new(shared.clone(), backend.clone(), test_catalog())
        .with_pid_check(|_| true);
    let clock = SamplingClock::new(shared.clone());
    let aggregator = Aggregator::new(shared.clone(), test_catalog(), None);
    let workers = vec![
        std::thread::spawn(move || supervisor.run()),
        std::thread::spawn(move || clock.run()),
        std::thread::spawn(move || aggregator.run()),
    ];

    let mut snapshot = None;
    assert!(wait_for(Duration::from_secs(10), || {
        let current = shared.stats.snapshot();
        if current.pools.get(&1).is_some_and(|pool| pool.targets.len() == 3) {
            snapshot = Some(current);
        }
        snapshot.is_some()
    }));
    let snapshot = snapshot.unwrap();
    let app = &snapshot.apps[&2];
    assert_eq!(app.targets, vec![2]);
    assert_eq!(app.ipc, Some(1002.0 / 1001.0));
    assert_eq!(app.cache_miss_ratio, Some(1004.0 / 1003.0));

    // Drop a target, the pool converges to two
    shared.config.set_config(config_for(&[1, 3]));
    assert!(wait_for(Duration::from_secs(10), || {
        shared.stats.pool_stats(1).is_some_and(|pool| {
            let mut targets = pool.targets.clone();
            targets.sort_unstable();
            targets == vec![1, 3]
        })
    }));

    shared.shutdown();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(backend.open_handles(), 0);
}
