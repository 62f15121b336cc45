// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! One worker per monitored target.
//!
//! A collector opens the catalog's event groups for its target, enables
//! them, and on every tick reads and resets all counters and queues a
//! [`Sample`] with the deltas. It leaves the sampling loop on stop or as
//! soon as its target is no longer monitored, and always disables and
//! closes its counters before returning.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use crossbeam::channel::TrySendError;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::clock::Wait;
use crate::perf::CounterBackend;
use crate::perf::EventCatalog;
use crate::perf::EventSpec;
use crate::pipeline::Sample;
use crate::pipeline::Shared;
use crate::TargetId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectorState {
    Configuring,
    Armed,
    Sampling,
    Stopping,
    Terminated,
    Failed,
}

/// Counters sharing one leader. `handles[0]` is the leader.
struct CounterGroup<H> {
    handles: Vec<(String, H)>,
}

impl<H> CounterGroup<H> {
    fn leader(&self) -> Option<&H> {
        self.handles.first().map(|(_, h)| h)
    }
}

pub struct Collector<B: CounterBackend> {
    target: TargetId,
    backend: Arc<B>,
    catalog: Arc<EventCatalog>,
    shared: Shared,
    state: CollectorState,
    groups: Vec<CounterGroup<B::Handle>>,
}

impl<B: CounterBackend> Collector<B> {
    pub fn new(
        target: TargetId,
        backend: Arc<B>,
        catalog: Arc<EventCatalog>,
        shared: Shared,
    ) -> Self {
        Self {
            target,
            backend,
            catalog,
            shared,
            state: CollectorState::Configuring,
            groups: vec![],
        }
    }

    pub fn target(&self) -> TargetId {
        self.target
    }

    pub fn state(&self) -> CollectorState {
        self.state
    }

    fn open(&self, event: &EventSpec, leader: Option<&B::Handle>) -> Result<B::Handle> {
        Ok(self
            .backend
            .open(event.event_type, event.config, self.target, -1, leader, 0)?)
    }

    /// Open every group, disabled. On error whatever was opened is closed.
    fn configure(&mut self) -> Result<()> {
        let catalog = self.catalog.clone();
        for events in catalog.groups() {
            let Some((first, rest)) = events.split_first() else {
                continue;
            };
            let leader = self.open(first, None)?;
            let mut handles = Vec::with_capacity(events.len());
            for event in rest {
                let handle = self.open(event, Some(&leader))?;
                handles.push((event.name.clone(), handle));
            }
            handles.insert(0, (first.name.clone(), leader));
            self.groups.push(CounterGroup { handles });
        }
        Ok(())
    }

    fn arm(&self) -> Result<()> {
        for group in &self.groups {
            if let Some(leader) = group.leader() {
                self.backend.enable(leader, true)?;
            }
        }
        Ok(())
    }

    /// Read and reset every counter. Failed reads leave the event out.
    fn collect(&self, time_stamp: Instant) -> Sample {
        let mut counters = BTreeMap::new();
        for group in &self.groups {
            for (name, handle) in &group.handles {
                match self.backend.read(handle) {
                    Ok(reading) => {
                        counters.insert(name.clone(), reading.value);
                    }
                    Err(e) => {
                        warn!("PID {}: failed to read {}: {}", self.target, name, e);
                        self.shared.stats.increment_error();
                    }
                }
            }
            if let Some(leader) = group.leader() {
                if let Err(e) = self.backend.reset(leader, true) {
                    warn!("PID {}: failed to reset counters: {}", self.target, e);
                    self.shared.stats.increment_error();
                }
            }
        }
        Sample::new(time_stamp, self.target, counters)
    }

    fn teardown(&mut self) {
        for group in &self.groups {
            if let Some(leader) = group.leader() {
                if let Err(e) = self.backend.disable(leader, true) {
                    debug!("PID {}: failed to disable counters: {}", self.target, e);
                }
            }
        }
        self.groups.clear();
    }

    fn fail(&mut self, what: &str, e: anyhow::Error) -> CollectorState {
        warn!("PID {}: failed to {} counters: {:#}", self.target, what, e);
        self.shared.stats.increment_error();
        self.teardown();
        self.state = CollectorState::Failed;
        self.state
    }

    fn sampling_loop(&mut self) {
        let mut seen = self.shared.tick.current();
        while !self.shared.should_stop() {
            match self.shared.tick.wait_after(seen, self.shared.tick_timeout()) {
                Wait::Tick(tick, _) => seen = tick,
                Wait::Timeout => {
                    debug!("PID {}: no tick within {:?}", self.target, self.shared.tick_timeout());
                    continue;
                }
                Wait::Closed => break,
            }
            let woke = Instant::now();

            if !self.shared.config.is_monitored(self.target) {
                info!("PID {} no longer monitored", self.target);
                break;
            }

            let sample = self.collect(woke);
            trace!("PID {}: {:?}", self.target, sample.counters);
            match self.shared.sample_tx.try_send(sample) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("PID {}: sample queue full, dropping sample", self.target);
                    self.shared.stats.increment_error();
                }
                Err(TrySendError::Disconnected(_)) => break,
            }

            if !self.shared.config.is_monitored(self.target) {
                info!("PID {} no longer monitored", self.target);
                break;
            }
        }
    }

    /// Run the whole lifecycle and return the final state, either
    /// `Terminated` or `Failed`.
    pub fn run(mut self) -> CollectorState {
        debug!("Collector for PID {} starting", self.target);

        self.state = CollectorState::Configuring;
        if let Err(e) = self.configure() {
            return self.fail("open", e);
        }

        self.state = CollectorState::Armed;
        if let Err(e) = self.arm() {
            return self.fail("enable", e);
        }

        info!("Collector for PID {} sampling", self.target);
        self.state = CollectorState::Sampling;
        self.sampling_loop();

        self.state = CollectorState::Stopping;
        self.teardown();
        self.state = CollectorState::Terminated;
        info!("Collector for PID {} terminated", self.target);
        self.state
    }
}
