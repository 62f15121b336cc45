// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Periodic tick broadcast.
//!
//! [`TickSignal`] is a monotonically increasing tick counter behind a
//! condition variable. A waiter remembers the last tick it handled and
//! blocks until the counter moves past it, so a tick is observed exactly
//! once per waiter no matter when the waiter got around to blocking.

use std::sync::atomic::Ordering;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;
use tracing::info;

use crate::pipeline::Shared;

/// Outcome of [`TickSignal::wait_after`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// A tick newer than the one passed in, carrying its number and the
    /// time it was pulsed.
    Tick(u64, Instant),
    Timeout,
    /// The signal was closed, waiters should unwind.
    Closed,
}

#[derive(Debug, Default)]
struct TickState {
    tick: u64,
    pulsed_at: Option<Instant>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct TickSignal {
    state: Mutex<TickState>,
    cv: Condvar,
}

impl TickSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the tick and wake every waiter.
    pub fn pulse(&self) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.tick += 1;
        state.pulsed_at = Some(Instant::now());
        self.cv.notify_all();
        state.tick
    }

    pub fn current(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tick
    }

    /// Block until a tick newer than `seen`, close or `timeout`.
    pub fn wait_after(&self, seen: u64, timeout: Duration) -> Wait {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (state, _) = self
            .cv
            .wait_timeout_while(state, timeout, |s| s.tick <= seen && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            Wait::Closed
        } else if state.tick > seen {
            Wait::Tick(state.tick, state.pulsed_at.unwrap_or_else(Instant::now))
        } else {
            Wait::Timeout
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        self.cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }
}

/// Drives [`TickSignal`] at a fixed period.
pub struct SamplingClock {
    shared: Shared,
}

impl SamplingClock {
    pub fn new(shared: Shared) -> Self {
        Self { shared }
    }

    fn stopped(&self) -> bool {
        self.shared.stop.load(Ordering::Relaxed) || self.shared.tick.is_closed()
    }

    /// Sleep up to `dur`, waking early on stop.
    fn sleep(&self, dur: Duration) {
        let deadline = Instant::now() + dur;
        let step = Duration::from_millis(50);
        while !self.stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(step.min(deadline - now));
        }
    }

    /// Discard queued samples, then start a new tick.
    pub fn tick(&self) -> u64 {
        let stale = self.shared.sample_rx.try_iter().count();
        if stale > 0 {
            debug!("Discarded {} stale samples", stale);
        }
        self.shared.tick.pulse()
    }

    pub fn run(&self) {
        let interval = self.shared.interval;
        info!("Sampling clock started, interval {:?}", interval);

        // Give the workers one period to get ready.
        self.sleep(interval);
        while !self.stopped() {
            let started = Instant::now();
            let tick = self.tick();
            debug!("Tick {}", tick);
            self.sleep(interval.saturating_sub(started.elapsed()));
        }

        info!("Sampling clock stopped");
    }
}
