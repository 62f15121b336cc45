// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-tick reduction of collector samples into pool and app stats.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use crossbeam::channel::RecvTimeoutError;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::clock::Wait;
use crate::config::Config;
use crate::perf;
use crate::perf::EventCatalog;
use crate::pipeline::Sample;
use crate::pipeline::Shared;
use crate::stats::EntityStats;
use crate::AppId;
use crate::PoolId;

/// What happened during one tick, mostly for logging and tests.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickReport {
    pub expected: usize,
    pub received: usize,
    pub discarded: usize,
    pub published: bool,
    pub elapsed: Duration,
}

pub struct Aggregator {
    shared: Shared,
    catalog: Arc<EventCatalog>,
    cache_way_size_kb: Option<f64>,
    collectors_num: usize,
}

impl Aggregator {
    pub fn new(shared: Shared, catalog: Arc<EventCatalog>, cache_way_size_kb: Option<f64>) -> Self {
        Self {
            shared,
            catalog,
            cache_way_size_kb,
            collectors_num: 0,
        }
    }

    pub fn collectors_num(&self) -> usize {
        self.collectors_num
    }

    /// Collect the samples of the tick that started at `tick_start` and
    /// publish them. Returns no later than `acquisition_max` after
    /// `tick_start`, plus the time the reduction itself takes.
    pub fn process_tick(&mut self, tick_start: Instant) -> TickReport {
        let acquisition_max = self.shared.acquisition_max;
        self.collectors_num = self.shared.config.monitored_targets().len();

        let deadline = tick_start + acquisition_max;
        let mut samples: Vec<Sample> = Vec::with_capacity(self.collectors_num);
        let mut discarded = 0;
        while samples.len() < self.collectors_num {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.shared.sample_rx.recv_timeout(deadline - now) {
                Ok(sample) => {
                    if sample.time_stamp + acquisition_max < tick_start {
                        warn!("Discarding stale sample of PID {}", sample.target);
                        discarded += 1;
                        continue;
                    }
                    samples.push(sample);
                }
                Err(RecvTimeoutError::Timeout) => {
                    debug!("Sample queue timed out");
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let mut report = TickReport {
            expected: self.collectors_num,
            received: samples.len(),
            discarded,
            ..Default::default()
        };

        if samples.is_empty() {
            debug!("No samples this tick");
            report.elapsed = tick_start.elapsed();
            return report;
        }

        let config = self.shared.config.get_config();
        let (pools, apps) = aggregate(
            &samples,
            &config,
            &self.catalog,
            self.cache_way_size_kb,
            self.shared.interval,
        );
        trace!("Pools: {:?}", pools);
        trace!("Apps: {:?}", apps);
        self.shared.stats.publish(pools, apps);
        report.published = true;
        report.elapsed = tick_start.elapsed();

        if report.received != report.expected {
            warn!(
                "Samples {}/{} received in {:.3}s",
                report.received,
                report.expected,
                report.elapsed.as_secs_f64()
            );
        }
        if report.elapsed > acquisition_max {
            warn!(
                "Aggregation took {:.3}s, deadline {:.3}s",
                report.elapsed.as_secs_f64(),
                acquisition_max.as_secs_f64()
            );
        }
        report
    }

    pub fn run(mut self) {
        info!("Aggregator started");
        let mut seen = self.shared.tick.current();
        while !self.shared.should_stop() {
            let tick_start = match self.shared.tick.wait_after(seen, self.shared.tick_timeout()) {
                Wait::Tick(tick, pulsed_at) => {
                    seen = tick;
                    pulsed_at
                }
                Wait::Timeout => continue,
                Wait::Closed => break,
            };
            self.process_tick(tick_start);
        }
        info!("Aggregator stopped");
    }
}

fn accumulate(stats: &mut EntityStats, sample: &Sample) {
    stats.targets.push(sample.target);
    for (event, value) in &sample.counters {
        let sum = stats.counters.entry(event.clone()).or_default();
        *sum = sum.saturating_add(*value);
    }
}

fn ratio(num: Option<&u64>, den: Option<&u64>) -> Option<f64> {
    match (num, den) {
        (Some(n), Some(d)) if *d > 0 => Some(*n as f64 / *d as f64),
        _ => None,
    }
}

/// Fill in scaled values and rates from the summed counters.
fn derive(stats: &mut EntityStats, catalog: &EventCatalog, period: Duration) {
    stats.values = stats
        .counters
        .iter()
        .map(|(event, value)| (event.clone(), *value as f64 * catalog.scale(event)))
        .collect();

    let secs = period.as_secs_f64();
    stats.llc_occupancy_kb = stats.values.get(perf::LLC_OCCUPANCY).map(|b| b / 1024.0);
    stats.mbm_total_bps = stats.values.get(perf::MBM_TOTAL_BYTES).map(|b| b / secs);
    stats.mbm_local_bps = stats.values.get(perf::MBM_LOCAL_BYTES).map(|b| b / secs);
    stats.ipc = ratio(
        stats.counters.get(perf::INSTRUCTIONS),
        stats.counters.get(perf::CPU_CYCLES),
    );
    stats.cache_miss_ratio = ratio(
        stats.counters.get(perf::CACHE_MISSES),
        stats.counters.get(perf::CACHE_REFERENCES),
    );
}

/// Group `samples` by pool and by app of their target and derive the
/// per-entity stats. Pools with a cache allocation are always reported so
/// their allocation shows up even while idle.
pub fn aggregate(
    samples: &[Sample],
    config: &Config,
    catalog: &EventCatalog,
    cache_way_size_kb: Option<f64>,
    period: Duration,
) -> (BTreeMap<PoolId, EntityStats>, BTreeMap<AppId, EntityStats>) {
    let mut pools: BTreeMap<PoolId, EntityStats> = BTreeMap::new();
    let mut apps: BTreeMap<AppId, EntityStats> = BTreeMap::new();

    for sample in samples {
        let Some(app) = config.app_of(sample.target) else {
            debug!("PID {} not in any app", sample.target);
            continue;
        };
        accumulate(apps.entry(app).or_default(), sample);
        if let Some(pool) = config.pool_of_app(app) {
            accumulate(pools.entry(pool).or_default(), sample);
        }
    }

    for pool in &config.pools {
        if pool.cbm.is_some() {
            pools.entry(pool.id).or_default();
        }
    }

    for (id, stats) in pools.iter_mut() {
        derive(stats, catalog, period);
        if let Some(ways) = config.pool_cache_ways(*id) {
            stats.cache_ways = Some(ways);
            stats.llc_alloc_kb = cache_way_size_kb.map(|kb| kb * ways as f64);
        }
    }
    for stats in apps.values_mut() {
        derive(stats, catalog, period);
    }

    (pools, apps)
}
