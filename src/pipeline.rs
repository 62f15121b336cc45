// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Result;
use crossbeam::channel::bounded;
use crossbeam::channel::Receiver;
use crossbeam::channel::Sender;

use crate::clock::TickSignal;
use crate::config::ConfigStore;
use crate::stats::StatsStore;
use crate::TargetId;

pub const SAMPLE_QUEUE_DEPTH: usize = 4096;

/// Counter deltas of one target over one tick.
#[derive(Clone, Debug)]
pub struct Sample {
    pub time_stamp: Instant,
    pub target: TargetId,
    pub counters: BTreeMap<String, u64>,
}

impl Sample {
    pub fn new(time_stamp: Instant, target: TargetId, counters: BTreeMap<String, u64>) -> Self {
        Self {
            time_stamp,
            target,
            counters,
        }
    }
}

/// State handed to every worker. Cloning is cheap, all clones refer to the
/// same queue, signal and stores.
#[derive(Clone, Debug)]
pub struct Shared {
    pub stop: Arc<AtomicBool>,
    pub tick: Arc<TickSignal>,
    pub sample_tx: Sender<Sample>,
    pub sample_rx: Receiver<Sample>,
    pub config: Arc<ConfigStore>,
    pub stats: Arc<StatsStore>,
    /// Sampling period.
    pub interval: Duration,
    /// How long the aggregator waits for one tick's samples.
    pub acquisition_max: Duration,
}

impl Shared {
    pub fn new(
        config: Arc<ConfigStore>,
        stats: Arc<StatsStore>,
        stop: Arc<AtomicBool>,
        interval: Duration,
        acquisition_max: Duration,
    ) -> Result<Self> {
        if interval.is_zero() {
            bail!("Sampling interval must be positive");
        }
        if acquisition_max.is_zero() || acquisition_max > interval {
            bail!(
                "Acquisition deadline {:?} must be positive and at most the interval {:?}",
                acquisition_max,
                interval
            );
        }

        let (sample_tx, sample_rx) = bounded(SAMPLE_QUEUE_DEPTH);
        Ok(Self {
            stop,
            tick: Arc::new(TickSignal::new()),
            sample_tx,
            sample_rx,
            config,
            stats,
            interval,
            acquisition_max,
        })
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Raise the stop flag and wake everyone blocked on the tick.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.tick.close();
    }

    /// Bound on a wait for the next tick. Two periods, so a late tick is
    /// still caught but a dead clock does not block forever.
    pub fn tick_timeout(&self) -> Duration {
        self.interval * 2
    }

    #[cfg(test)]
    pub(crate) fn for_test(interval: Duration, acquisition_max: Duration) -> Self {
        Self::new(
            Arc::new(ConfigStore::default()),
            Arc::new(StatsStore::new()),
            Arc::new(AtomicBool::new(false)),
            interval,
            acquisition_max,
        )
        .unwrap()
    }
}
