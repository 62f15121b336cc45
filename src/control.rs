// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Re-applies resource allocation whenever the configuration changes.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::config::Config;
use crate::config::ConfigStore;
use crate::stats::StatsStore;

/// Granularity of the wait for a configuration change.
const CHANGE_POLL: Duration = Duration::from_millis(100);
/// Longest uninterrupted sleep while rate limited.
const SLEEP_STEP: Duration = Duration::from_millis(20);

/// Programs cache and memory bandwidth allocation for a configuration.
pub trait Allocator {
    fn reconfigure(&mut self, config: &Config) -> Result<()>;
}

/// Programs per-pool core frequency/power settings.
pub trait PowerControl {
    fn reconfigure_power(&mut self, config: &Config) -> Result<()>;
}

/// Enforces a minimum spacing between two events.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    min_spacing: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub fn new(rate_hz: u32) -> Self {
        Self {
            min_spacing: Duration::from_secs_f64(1.0 / rate_hz.max(1) as f64),
            last: None,
        }
    }

    pub fn min_spacing(&self) -> Duration {
        self.min_spacing
    }

    /// How long to wait at `now` before the next event is allowed.
    pub fn residual(&self, now: Instant) -> Duration {
        match self.last {
            Some(last) => self
                .min_spacing
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }

    pub fn mark(&mut self, at: Instant) {
        self.last = Some(at);
    }
}

pub struct ControlLoop {
    config: Arc<ConfigStore>,
    stats: Arc<StatsStore>,
    stop: Arc<AtomicBool>,
    allocator: Box<dyn Allocator>,
    power: Option<Box<dyn PowerControl>>,
    limiter: RateLimiter,
    monitor_interval: Option<Duration>,
    reconfigurations: u64,
}

impl ControlLoop {
    pub fn new(
        config: Arc<ConfigStore>,
        stats: Arc<StatsStore>,
        stop: Arc<AtomicBool>,
        allocator: Box<dyn Allocator>,
        rate_hz: u32,
    ) -> Self {
        Self {
            config,
            stats,
            stop,
            allocator,
            power: None,
            limiter: RateLimiter::new(rate_hz),
            monitor_interval: None,
            reconfigurations: 0,
        }
    }

    pub fn with_power(mut self, power: Box<dyn PowerControl>) -> Self {
        self.power = Some(power);
        self
    }

    /// Log a stats summary every `interval`.
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = Some(interval);
        self
    }

    pub fn reconfigurations(&self) -> u64 {
        self.reconfigurations
    }

    /// Apply the current configuration once and make it the rate limit
    /// baseline.
    pub fn apply(&mut self) -> Result<()> {
        let config = self.config.get_config();

        self.allocator
            .reconfigure(&config)
            .context("Failed to reconfigure resource allocation")?;

        if let Some(power) = self.power.as_mut() {
            if config.sstbf.configured {
                debug!("SST-BF configured, skipping power profiles");
            } else {
                power
                    .reconfigure_power(&config)
                    .context("Failed to reconfigure power profiles")?;
            }
        }

        self.limiter.mark(Instant::now());
        self.reconfigurations += 1;
        Ok(())
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Sleep up to `dur`. Returns false if stopped first.
    fn sleep(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        loop {
            if self.stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_STEP.min(deadline - now));
        }
    }

    fn log_summary(&self) {
        let general = self.stats.general();
        let snapshot = self.stats.snapshot();
        info!(
            "pools={} apps={} errors={} flushes={} invalid_access={}",
            snapshot.pools.len(),
            snapshot.apps.len(),
            general.num_errors,
            general.num_flushes,
            general.num_invalid_access
        );
        match self.stats.to_json() {
            Ok(json) => debug!("stats: {}", json),
            Err(e) => debug!("Failed to render stats: {:#}", e),
        }
    }

    /// Run until stopped. A failed reconfiguration is returned and ends the
    /// loop; nothing is retried until the configuration changes again,
    /// which is never since the daemon goes down.
    pub fn run(&mut self) -> Result<()> {
        info!(
            "Control loop started, at most one reconfiguration per {:?}",
            self.limiter.min_spacing()
        );
        let mut last_summary = Instant::now();

        while !self.stopped() {
            if self.config.wait_config_changed(CHANGE_POLL) {
                let residual = self.limiter.residual(Instant::now());
                if !residual.is_zero() {
                    debug!("Rate limited, delaying reconfiguration by {:?}", residual);
                    if !self.sleep(residual) {
                        break;
                    }
                }

                if let Err(e) = self.apply() {
                    error!("{:#}", e);
                    return Err(e);
                }
                info!(
                    "Configuration generation {} applied",
                    self.config.generation()
                );
            }

            if let Some(interval) = self.monitor_interval {
                if last_summary.elapsed() >= interval {
                    self.log_summary();
                    last_summary = Instant::now();
                }
            }
        }

        info!("Control loop stopped");
        Ok(())
    }
}
