// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use rdt_pools::config::Config;
use rdt_pools::config::ConfigStore;
use rdt_pools::perf::CounterBackend;
use rdt_pools::perf::CounterReading;
use rdt_pools::perf::EventCatalog;
use rdt_pools::perf::EventSpec;
use rdt_pools::perf::PerfError;
use rdt_pools::pipeline::Shared;
use rdt_pools::stats::StatsStore;
use rdt_pools::TargetId;

/// Initialize tracing from `RUST_LOG`. Safe to call from every test.
pub fn setup_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// In-memory counter backend counting opens and closes.
#[derive(Debug, Default)]
pub struct FakeCounters {
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
    enabled: AtomicUsize,
    resets: AtomicUsize,
    /// Fail the open call with this 1-based index.
    fail_open_at: Mutex<Option<usize>>,
    fail_enable: AtomicBool,
    fail_read: Mutex<BTreeSet<u64>>,
    read_delay: Mutex<Duration>,
}

#[derive(Debug)]
pub struct FakeHandle {
    config: u64,
    closed: Arc<AtomicUsize>,
}

impl Drop for FakeHandle {
    fn drop(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn denied() -> std::io::Error {
    std::io::Error::from_raw_os_error(libc::EACCES)
}

impl FakeCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_open_at(&self, n: usize) {
        *self.fail_open_at.lock().unwrap() = Some(n);
    }

    pub fn fail_enable(&self) {
        self.fail_enable.store(true, Ordering::SeqCst);
    }

    /// Reads of events with this config fail.
    pub fn fail_read(&self, config: u64) {
        self.fail_read.lock().unwrap().insert(config);
    }

    /// Every read takes this long.
    pub fn slow_read(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = delay;
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn open_handles(&self) -> usize {
        self.opened() - self.closed.load(Ordering::SeqCst)
    }

    pub fn enabled(&self) -> usize {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl CounterBackend for FakeCounters {
    type Handle = FakeHandle;

    fn open(
        &self,
        _event_type: u32,
        config: u64,
        _target: TargetId,
        _cpu: i32,
        _group_leader: Option<&FakeHandle>,
        _flags: u64,
    ) -> Result<FakeHandle, PerfError> {
        let attempt = self.opened() + 1;
        if *self.fail_open_at.lock().unwrap() == Some(attempt) {
            return Err(PerfError::Open(denied()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(FakeHandle {
            config,
            closed: self.closed.clone(),
        })
    }

    fn enable(&self, _handle: &FakeHandle, _as_group: bool) -> Result<(), PerfError> {
        if self.fail_enable.load(Ordering::SeqCst) {
            return Err(PerfError::Ioctl(denied()));
        }
        self.enabled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn disable(&self, _handle: &FakeHandle, _as_group: bool) -> Result<(), PerfError> {
        Ok(())
    }

    fn reset(&self, _handle: &FakeHandle, _as_group: bool) -> Result<(), PerfError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read(&self, handle: &FakeHandle) -> Result<CounterReading, PerfError> {
        if self.fail_read.lock().unwrap().contains(&handle.config) {
            return Err(PerfError::Read(denied()));
        }
        let delay = *self.read_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        Ok(CounterReading {
            value: 1000 + handle.config,
            time_enabled: 10,
            time_running: 10,
            id: handle.config,
        })
    }
}

/// Two groups of two events, configs 1..=4.
pub fn test_catalog() -> Arc<EventCatalog> {
    Arc::new(EventCatalog::new(vec![
        vec![
            EventSpec::new("cpu-cycles", 0, 1, "cycles"),
            EventSpec::new("instructions", 0, 2, "instructions"),
        ],
        vec![
            EventSpec::new("cache-references", 0, 3, "hits"),
            EventSpec::new("cache-misses", 0, 4, "misses"),
        ],
    ]))
}

/// One pool with one app per PID.
pub fn config_for(pids: &[TargetId]) -> Config {
    let apps: Vec<String> = pids
        .iter()
        .map(|pid| format!(r#"{{"id": {pid}, "name": "app{pid}", "pids": [{pid}]}}"#))
        .collect();
    let app_ids: Vec<String> = pids.iter().map(|pid| pid.to_string()).collect();
    Config::parse(&format!(
        r#"{{
            "pools": [{{"id": 1, "name": "pool", "apps": [{}], "cbm": "0xff"}}],
            "apps": [{}]
        }}"#,
        app_ids.join(", "),
        apps.join(", ")
    ))
    .unwrap()
}

pub fn shared_for(pids: &[TargetId], interval: Duration, acquisition_max: Duration) -> Shared {
    Shared::new(
        Arc::new(ConfigStore::new(config_for(pids))),
        Arc::new(StatsStore::new()),
        Arc::new(AtomicBool::new(false)),
        interval,
        acquisition_max,
    )
    .unwrap()
}

/// Poll `cond` every few milliseconds until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
