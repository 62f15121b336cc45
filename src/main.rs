// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tracing::debug;
use tracing::info;
use tracing::warn;
use tracing_subscriber::filter::EnvFilter;

use rdt_pools::aggregator::Aggregator;
use rdt_pools::clock::SamplingClock;
use rdt_pools::config::Config;
use rdt_pools::config::ConfigStore;
use rdt_pools::control::ControlLoop;
use rdt_pools::flusher::CacheFlusher;
use rdt_pools::perf::EventCatalog;
use rdt_pools::perf::PerfCounters;
use rdt_pools::pipeline::Shared;
use rdt_pools::power::CpufreqPower;
use rdt_pools::resctrl;
use rdt_pools::resctrl::ResctrlAllocator;
use rdt_pools::stats::StatsStore;
use rdt_pools::supervisor::Supervisor;
use rdt_pools::watcher::ConfigWatcher;

const DAEMON_NAME: &str = "rdt_pools";

/// rdt_pools: cache, memory bandwidth and power partitioning for process pools
///
/// Processes are grouped into apps and apps into pools. Every pool gets its
/// own resctrl group with the pool's cache bitmask and bandwidth limit, and
/// optionally a cpufreq power profile on its cores.
///
/// Every monitored PID is sampled through perf counters once per interval;
/// per-pool and per-app cache occupancy, memory bandwidth and IPC are
/// aggregated from the samples.
#[derive(Debug, Parser)]
struct Opts {
    /// Pool configuration: a JSON file path, f:PATH/file:PATH, or inline JSON.
    #[clap(short = 'c', long)]
    config: Option<String>,

    /// Sampling period in seconds.
    #[clap(long, default_value = "1.0")]
    interval_s: f64,

    /// Maximum time the aggregator waits for one period's samples, in
    /// seconds. Must not exceed --interval-s.
    #[clap(long, default_value = "0.5")]
    acquisition_max_s: f64,

    /// Maximum number of reconfigurations per second.
    #[clap(long, default_value = "10")]
    rate_limit_hz: u32,

    /// Kernel interface flushing the cache lines of the PIDs written to it.
    #[clap(long, default_value = rdt_pools::PID_FLUSH_PATH)]
    flush_path: PathBuf,

    /// Also flush the other threads and the children of each PID.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    flush_children: bool,

    /// Do not start the cache flush worker.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_flush: bool,

    /// Mount point of the resctrl filesystem.
    #[clap(long, default_value = resctrl::RESCTRL_ROOT)]
    resctrl_root: PathBuf,

    /// CPU sysfs directory, for cpufreq and cache topology.
    #[clap(long, default_value = rdt_pools::power::CPU_SYSFS)]
    cpu_sysfs: PathBuf,

    /// Apply pool power profiles through cpufreq.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enable_power: bool,

    /// Reload the configuration file when it changes.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    watch_config: bool,

    /// Interval in seconds between stats summaries in the log, 0 to disable.
    #[clap(long, default_value = "10")]
    monitor_interval_s: u64,

    /// Specify the logging level. Accepts rust's envfilter syntax for modular
    /// logging: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html#example-syntax. Examples: ["info", "warn,rdt_pools::collector=debug"]
    #[clap(long, default_value = "info")]
    log_level: String,

    /// Print version and exit.
    #[clap(short = 'V', long, action = clap::ArgAction::SetTrue)]
    version: bool,
}

fn load_config(input: &str) -> Result<ConfigStore> {
    if input.trim_start().starts_with('{') {
        return Ok(ConfigStore::new(Config::parse(input)?));
    }
    let path = input
        .strip_prefix("file:")
        .or_else(|| input.strip_prefix("f:"))
        .unwrap_or(input);
    ConfigStore::load(path.as_ref()).with_context(|| format!("Failed to load {}", path))
}

fn spawn<F>(name: &str, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .with_context(|| format!("Failed to spawn {} thread", name))
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if opts.version {
        println!("{} {}", DAEMON_NAME, env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| match EnvFilter::try_new(&opts.log_level) {
            Ok(filter) => Ok(filter),
            Err(e) => {
                eprintln!(
                    "invalid log envvar: {}, using info, err is: {}",
                    opts.log_level, e
                );
                EnvFilter::try_new("info")
            }
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
    {
        Ok(()) => {}
        Err(e) => eprintln!("failed to init logger: {}", e),
    }

    debug!("opts={:?}", &opts);

    let Some(config_input) = opts.config.as_deref() else {
        bail!("--config is required");
    };
    if !(opts.interval_s > 0.0) || !(opts.acquisition_max_s > 0.0) {
        bail!("--interval-s and --acquisition-max-s must be positive");
    }
    if opts.watch_config && config_input.trim_start().starts_with('{') {
        bail!("--watch-config needs a configuration file");
    }

    let config = Arc::new(load_config(config_input)?);
    let stats = Arc::new(StatsStore::new());
    let shutdown = Arc::new(AtomicBool::new(false));
    let shared = Shared::new(
        config.clone(),
        stats.clone(),
        shutdown.clone(),
        Duration::from_secs_f64(opts.interval_s),
        Duration::from_secs_f64(opts.acquisition_max_s),
    )?;

    let shared_clone = shared.clone();
    ctrlc::set_handler(move || {
        shared_clone.shutdown();
    })
    .context("Error setting Ctrl-C handler")?;

    let flusher = if opts.no_flush {
        None
    } else {
        Some(CacheFlusher::new(
            shared.clone(),
            &opts.flush_path,
            opts.flush_children,
        ))
    };

    let mut allocator = ResctrlAllocator::new(&opts.resctrl_root);
    if let Some((_, requests)) = &flusher {
        allocator = allocator.with_flush(requests.clone());
    }
    let mut control = ControlLoop::new(
        config.clone(),
        stats.clone(),
        shutdown.clone(),
        Box::new(allocator),
        opts.rate_limit_hz,
    );
    if opts.enable_power {
        control = control.with_power(Box::new(CpufreqPower::new(&opts.cpu_sysfs)));
    }
    if opts.monitor_interval_s > 0 {
        control = control.with_monitor_interval(Duration::from_secs(opts.monitor_interval_s));
    }
    control.apply().context("Failed to apply initial configuration")?;
    info!("Initial configuration applied");

    let catalog = Arc::new(EventCatalog::detect());
    if catalog.is_empty() {
        bail!("No perf events available");
    }
    let cache_way_size_kb = match resctrl::cache_way_size_kb(&opts.cpu_sysfs) {
        Ok(kb) => Some(kb),
        Err(e) => {
            warn!("Cache way size unknown, not reporting allocations: {:#}", e);
            None
        }
    };

    let mut workers = vec![];
    {
        let clock = SamplingClock::new(shared.clone());
        workers.push(spawn("clock", move || clock.run())?);
    }
    {
        let aggregator = Aggregator::new(shared.clone(), catalog.clone(), cache_way_size_kb);
        workers.push(spawn("aggregator", move || aggregator.run())?);
    }
    {
        let supervisor = Supervisor::new(shared.clone(), Arc::new(PerfCounters), catalog.clone());
        workers.push(spawn("supervisor", move || supervisor.run())?);
    }

    // The allocator holds the submission side until the control loop ends.
    if let Some((flusher, _)) = flusher {
        workers.push(spawn("flusher", move || flusher.run())?);
    }

    if opts.watch_config {
        let watcher = ConfigWatcher::new(config.clone())?;
        let shared_clone = shared.clone();
        workers.push(spawn("watcher", move || watcher.run(shared_clone))?);
    }

    info!("{} started", DAEMON_NAME);
    let res = control.run();

    shared.shutdown();
    for worker in workers {
        if worker.join().is_err() {
            warn!("Worker thread panicked");
        }
    }

    if res.is_ok() {
        info!("{} exiting", DAEMON_NAME);
    }
    res
}
