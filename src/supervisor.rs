// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Keeps one collector thread per monitored target.
//!
//! On every tick the supervisor reaps collectors that exited and starts a
//! collector for each monitored target without one. Collectors of removed
//! targets notice the removal themselves on their next tick. A target whose
//! collector failed, or whose PID is not alive, is only retried after the
//! configuration changes.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::clock::Wait;
use crate::collector::Collector;
use crate::collector::CollectorState;
use crate::perf::CounterBackend;
use crate::perf::EventCatalog;
use crate::pipeline::Shared;
use crate::procfs;
use crate::TargetId;

pub struct Supervisor<B: CounterBackend> {
    shared: Shared,
    backend: Arc<B>,
    catalog: Arc<EventCatalog>,
    live: BTreeMap<TargetId, JoinHandle<CollectorState>>,
    failed: BTreeSet<TargetId>,
    generation: Option<u64>,
    pid_check: fn(TargetId) -> bool,
}

impl<B: CounterBackend> Supervisor<B> {
    pub fn new(shared: Shared, backend: Arc<B>, catalog: Arc<EventCatalog>) -> Self {
        Self {
            shared,
            backend,
            catalog,
            live: BTreeMap::new(),
            failed: BTreeSet::new(),
            generation: None,
            pid_check: procfs::is_pid_valid,
        }
    }

    /// Replace the liveness check applied before starting a collector.
    pub fn with_pid_check(mut self, pid_check: fn(TargetId) -> bool) -> Self {
        self.pid_check = pid_check;
        self
    }

    pub fn live_targets(&self) -> Vec<TargetId> {
        self.live.keys().copied().collect()
    }

    fn reap(&mut self) {
        let finished: Vec<TargetId> = self
            .live
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(target, _)| *target)
            .collect();

        for target in finished {
            let Some(handle) = self.live.remove(&target) else {
                continue;
            };
            match handle.join() {
                Ok(CollectorState::Failed) => {
                    self.failed.insert(target);
                }
                Ok(state) => debug!("Collector for PID {} exited in {:?}", target, state),
                Err(_) => {
                    warn!("Collector for PID {} panicked", target);
                    self.shared.stats.increment_error();
                    self.failed.insert(target);
                }
            }
        }
    }

    fn spawn(&mut self, target: TargetId) {
        let collector = Collector::new(
            target,
            self.backend.clone(),
            self.catalog.clone(),
            self.shared.clone(),
        );
        match std::thread::Builder::new()
            .name(format!("collector-{target}"))
            .spawn(move || collector.run())
        {
            Ok(handle) => {
                self.live.insert(target, handle);
            }
            Err(e) => {
                warn!("Failed to start collector for PID {}: {}", target, e);
                self.shared.stats.increment_error();
                self.failed.insert(target);
            }
        }
    }

    /// Bring the live collectors in line with the monitored targets.
    /// Returns the number of live collectors.
    pub fn reconcile(&mut self) -> usize {
        self.reap();

        let generation = self.shared.config.generation();
        if self.generation != Some(generation) {
            if self.generation.is_some() {
                debug!("Configuration generation {}", generation);
            }
            self.generation = Some(generation);
            self.failed.clear();
        }

        for target in self.shared.config.monitored_targets() {
            if self.live.contains_key(&target) || self.failed.contains(&target) {
                continue;
            }
            if !(self.pid_check)(target) {
                warn!("PID {} is not running, not monitoring it", target);
                self.shared.stats.increment_error();
                self.failed.insert(target);
                continue;
            }
            self.spawn(target);
        }

        self.live.len()
    }

    /// Wait for every collector to finish.
    pub fn join_all(&mut self) {
        for (target, handle) in std::mem::take(&mut self.live) {
            if handle.join().is_err() {
                warn!("Collector for PID {} panicked", target);
            }
        }
    }

    pub fn run(mut self) {
        info!("Supervisor started");
        self.reconcile();

        let mut seen = self.shared.tick.current();
        while !self.shared.should_stop() {
            match self.shared.tick.wait_after(seen, self.shared.tick_timeout()) {
                Wait::Tick(tick, _) => seen = tick,
                Wait::Timeout => continue,
                Wait::Closed => break,
            }
            self.reconcile();
        }

        self.join_all();
        info!("Supervisor stopped");
    }
}
