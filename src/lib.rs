// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # rdt_pools
//!
//! Userspace daemon that partitions shared hardware resources (last-level
//! cache ways, memory bandwidth, core frequency) among pools of processes and
//! reports per-pool and per-application cache and bandwidth consumption.
//!
//! The moving parts are plain OS threads sharing one [`pipeline::Shared`]
//! handle:
//!
//! - [`clock::SamplingClock`] drains stale samples and advances the tick.
//! - [`collector::Collector`] (one per monitored PID) reads and resets its
//!   perf counters on every tick and queues one [`pipeline::Sample`].
//! - [`aggregator::Aggregator`] collects the tick's samples within the
//!   acquisition deadline and publishes pool/app stats into
//!   [`stats::StatsStore`].
//! - [`supervisor::Supervisor`] keeps the set of live collectors in line with
//!   the monitored PIDs of [`config::ConfigStore`].
//! - [`flusher::CacheFlusher`] serves asynchronous cache flush requests.
//! - [`control::ControlLoop`] re-applies resource allocation when the
//!   configuration changes, at a bounded rate.
pub mod aggregator;
pub mod clock;
pub mod collector;
pub mod config;
pub mod control;
pub mod flusher;
pub mod misc;
pub mod perf;
pub mod pipeline;
pub mod power;
pub mod procfs;
pub mod resctrl;
pub mod stats;
pub mod supervisor;
pub mod watcher;

/// A monitored process or task.
pub type TargetId = u32;
/// Identifier of a pool, as given in the configuration.
pub type PoolId = u32;
/// Identifier of an application, as given in the configuration.
pub type AppId = u32;

/// Default sampling period.
pub const SAMPLING_INTERVAL_S: f64 = 1.0;
/// Default maximum time the aggregator waits for one tick's samples.
pub const ACQUISITION_MAX_TIME_S: f64 = 0.5;
/// Default upper bound of reconfigurations per second.
pub const RATE_LIMIT_HZ: u32 = 10;
/// Kernel interface accepting one PID per line to flush its cache lines.
pub const PID_FLUSH_PATH: &str = "/proc/intel_pid_cache_flush";

pub use aggregator::Aggregator;
pub use clock::SamplingClock;
pub use clock::TickSignal;
pub use collector::Collector;
pub use config::Config;
pub use config::ConfigStore;
pub use control::ControlLoop;
pub use flusher::CacheFlusher;
pub use flusher::FlushRequests;
pub use pipeline::Sample;
pub use pipeline::Shared;
pub use stats::StatsStore;
pub use supervisor::Supervisor;
