// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-process counters on top of `perf_event_open(2)`.
//!
//! Provides two pieces:
//!
//! - [`CounterBackend`]: open/enable/disable/reset/read on counter handles.
//!   [`PerfCounters`] is the kernel implementation; handles close their file
//!   descriptor on drop.
//!
//! - [`EventCatalog`]: the ordered groups of events every collector opens.
//!   Each group gets its own leader since the kernel refuses to mix PMUs in
//!   one group (the resource monitoring PMU is separate from the core PMU).

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use perf_event_open_sys as perf;
use tracing::{debug, info, warn};

use crate::TargetId;

const PERF_FORMAT_TOTAL_TIME_ENABLED: u64 = 1 << 0;
const PERF_FORMAT_TOTAL_TIME_RUNNING: u64 = 1 << 1;
const PERF_FORMAT_ID: u64 = 1 << 2;

/// `read_format` of every counter, so multiplexing can be told from the
/// enabled/running times.
pub const READ_FORMAT: u64 =
    PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_TOTAL_TIME_RUNNING | PERF_FORMAT_ID;

const PERF_IOC_FLAG_GROUP: libc::c_ulong = 1;

/// sysfs directory of the cache monitoring PMU.
pub const CQM_SYSFS: &str = "/sys/devices/intel_cqm";

pub const LLC_OCCUPANCY: &str = "llc_occupancy";
pub const MBM_TOTAL_BYTES: &str = "mbm_total_bytes";
pub const MBM_LOCAL_BYTES: &str = "mbm_local_bytes";
pub const CPU_CYCLES: &str = "cpu-cycles";
pub const INSTRUCTIONS: &str = "instructions";
pub const CACHE_REFERENCES: &str = "cache-references";
pub const CACHE_MISSES: &str = "cache-misses";

/// Errors from counter operations.
#[derive(Debug)]
pub enum PerfError {
    /// `perf_event_open` syscall failed.
    Open(io::Error),
    /// ioctl on the perf fd failed.
    Ioctl(io::Error),
    /// read on the perf fd failed.
    Read(io::Error),
}

impl fmt::Display for PerfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PerfError::Open(e) => write!(f, "perf_event_open failed: {e}"),
            PerfError::Ioctl(e) => write!(f, "perf ioctl failed: {e}"),
            PerfError::Read(e) => write!(f, "perf read failed: {e}"),
        }
    }
}

impl std::error::Error for PerfError {}

/// One raw read of a counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterReading {
    pub value: u64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub id: u64,
}

/// Kernel counter operations, per handle.
///
/// Dropping a handle closes it.
pub trait CounterBackend: Send + Sync + 'static {
    type Handle: Send + 'static;

    /// Open a disabled counter for `target`. Members of a group pass the
    /// group leader's handle.
    fn open(
        &self,
        event_type: u32,
        config: u64,
        target: TargetId,
        cpu: i32,
        group_leader: Option<&Self::Handle>,
        flags: u64,
    ) -> Result<Self::Handle, PerfError>;

    fn enable(&self, handle: &Self::Handle, as_group: bool) -> Result<(), PerfError>;

    fn disable(&self, handle: &Self::Handle, as_group: bool) -> Result<(), PerfError>;

    fn reset(&self, handle: &Self::Handle, as_group: bool) -> Result<(), PerfError>;

    fn read(&self, handle: &Self::Handle) -> Result<CounterReading, PerfError>;
}

/// An open perf event file descriptor.
#[derive(Debug)]
pub struct PerfFd {
    fd: RawFd,
}

impl PerfFd {
    pub fn raw(&self) -> RawFd {
        self.fd
    }
}

impl Drop for PerfFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// [`CounterBackend`] backed by the `perf_event_open` syscall.
#[derive(Clone, Copy, Debug, Default)]
pub struct PerfCounters;

impl CounterBackend for PerfCounters {
    type Handle = PerfFd;

    fn open(
        &self,
        event_type: u32,
        config: u64,
        target: TargetId,
        cpu: i32,
        group_leader: Option<&PerfFd>,
        flags: u64,
    ) -> Result<PerfFd, PerfError> {
        let mut attr = perf::bindings::perf_event_attr {
            type_: event_type,
            size: std::mem::size_of::<perf::bindings::perf_event_attr>() as u32,
            config,
            read_format: READ_FORMAT,
            ..Default::default()
        };
        attr.set_disabled(1);

        let group_fd = group_leader.map_or(-1, |leader| leader.fd);
        let fd = unsafe {
            perf::perf_event_open(
                &mut attr,
                target as libc::pid_t,
                cpu,
                group_fd,
                flags as libc::c_ulong,
            )
        };
        if fd < 0 {
            return Err(PerfError::Open(io::Error::last_os_error()));
        }

        let handle = PerfFd { fd };
        ioctl(handle.fd, perf::bindings::RESET, 0)?;
        Ok(handle)
    }

    fn enable(&self, handle: &PerfFd, as_group: bool) -> Result<(), PerfError> {
        ioctl(handle.fd, perf::bindings::ENABLE, group_flag(as_group))
    }

    fn disable(&self, handle: &PerfFd, as_group: bool) -> Result<(), PerfError> {
        ioctl(handle.fd, perf::bindings::DISABLE, group_flag(as_group))
    }

    fn reset(&self, handle: &PerfFd, as_group: bool) -> Result<(), PerfError> {
        ioctl(handle.fd, perf::bindings::RESET, group_flag(as_group))
    }

    fn read(&self, handle: &PerfFd) -> Result<CounterReading, PerfError> {
        read_counter(handle.fd)
    }
}

fn group_flag(as_group: bool) -> libc::c_ulong {
    if as_group {
        PERF_IOC_FLAG_GROUP
    } else {
        0
    }
}

fn ioctl(fd: RawFd, request: u32, arg: libc::c_ulong) -> Result<(), PerfError> {
    let ret = unsafe { libc::ioctl(fd, request as libc::c_ulong, arg) };
    if ret < 0 {
        return Err(PerfError::Ioctl(io::Error::last_os_error()));
    }
    Ok(())
}

// Layout follows READ_FORMAT: value, time_enabled, time_running, id.
fn read_counter(fd: RawFd) -> Result<CounterReading, PerfError> {
    let mut buf = [0u64; 4];
    let len = std::mem::size_of_val(&buf);
    let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, len) };
    if ret < 0 {
        return Err(PerfError::Read(io::Error::last_os_error()));
    }
    if ret as usize != len {
        return Err(PerfError::Read(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short read of {ret} bytes"),
        )));
    }
    Ok(CounterReading {
        value: buf[0],
        time_enabled: buf[1],
        time_running: buf[2],
        id: buf[3],
    })
}

/// A counter to open for every monitored target.
#[derive(Clone, Debug, PartialEq)]
pub struct EventSpec {
    pub name: String,
    pub event_type: u32,
    pub config: u64,
    /// Multiplier turning a raw count into `unit`.
    pub scale: f64,
    pub unit: String,
}

impl EventSpec {
    pub fn new(name: &str, event_type: u32, config: u64, unit: &str) -> Self {
        Self {
            name: name.to_string(),
            event_type,
            config,
            scale: 1.0,
            unit: unit.to_string(),
        }
    }
}

/// Events sharing one group leader, leader first.
pub type EventGroup = Vec<EventSpec>;

/// Ordered event groups opened by each collector.
#[derive(Clone, Debug, Default)]
pub struct EventCatalog {
    groups: Vec<EventGroup>,
}

impl EventCatalog {
    pub fn new(groups: Vec<EventGroup>) -> Self {
        Self {
            groups: groups.into_iter().filter(|g| !g.is_empty()).collect(),
        }
    }

    /// Core PMU events plus whatever cache monitoring events the kernel
    /// exposes.
    pub fn detect() -> Self {
        let mut groups = pmu_event_groups();
        match detect_cqm_events(Path::new(CQM_SYSFS)) {
            Ok(cqm) if !cqm.is_empty() => groups.push(cqm),
            Ok(_) => warn!("No cache monitoring events supported"),
            Err(e) => warn!("Cache monitoring events not supported: {:#}", e),
        }

        let catalog = Self::new(groups);
        for group in catalog.groups() {
            info!(
                "Event group: {:?}",
                group.iter().map(|e| e.name.as_str()).collect::<Vec<_>>()
            );
        }
        catalog
    }

    pub fn groups(&self) -> &[EventGroup] {
        &self.groups
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&EventSpec> {
        self.groups.iter().flatten().find(|e| e.name == name)
    }

    pub fn scale(&self, name: &str) -> f64 {
        self.get(name).map_or(1.0, |e| e.scale)
    }

    pub fn num_events(&self) -> usize {
        self.groups.iter().map(|g| g.len()).sum()
    }
}

/// Core PMU events. Cycles/instructions and the cache reference/miss pair
/// are separate groups so one can be scheduled when the other does not fit.
pub fn pmu_event_groups() -> Vec<EventGroup> {
    let hw = perf::bindings::PERF_TYPE_HARDWARE;
    vec![
        vec![
            EventSpec::new(
                CPU_CYCLES,
                hw,
                perf::bindings::PERF_COUNT_HW_CPU_CYCLES as u64,
                "cycles",
            ),
            EventSpec::new(
                INSTRUCTIONS,
                hw,
                perf::bindings::PERF_COUNT_HW_INSTRUCTIONS as u64,
                "instructions",
            ),
        ],
        vec![
            EventSpec::new(
                CACHE_REFERENCES,
                hw,
                perf::bindings::PERF_COUNT_HW_CACHE_REFERENCES as u64,
                "hits",
            ),
            EventSpec::new(
                CACHE_MISSES,
                hw,
                perf::bindings::PERF_COUNT_HW_CACHE_MISSES as u64,
                "misses",
            ),
        ],
    ]
}

/// Read the cache monitoring PMU description under `root`
/// (`type`, `events/<event>`, `events/<event>.scale`, `events/<event>.unit`).
pub fn detect_cqm_events(root: &Path) -> Result<EventGroup> {
    let type_path = root.join("type");
    let event_type: u32 = std::fs::read_to_string(&type_path)
        .with_context(|| format!("Failed to read {}", type_path.display()))?
        .trim()
        .parse()
        .with_context(|| format!("Failed to parse {}", type_path.display()))?;

    let mut events = vec![];
    for (name, file) in [
        (LLC_OCCUPANCY, "llc_occupancy"),
        (MBM_TOTAL_BYTES, "total_bytes"),
        (MBM_LOCAL_BYTES, "local_bytes"),
    ] {
        let path = root.join("events").join(file);
        let desc = match std::fs::read_to_string(&path) {
            Ok(desc) => desc,
            Err(_) => {
                debug!("{} event not supported", name);
                continue;
            }
        };
        let config = parse_event_config(&desc)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        let scale = match std::fs::read_to_string(root.join("events").join(format!("{file}.scale")))
        {
            Ok(s) => s
                .trim()
                .parse::<f64>()
                .with_context(|| format!("Invalid scale for {}", name))?,
            Err(_) => 1.0,
        };
        let unit = std::fs::read_to_string(root.join("events").join(format!("{file}.unit")))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        events.push(EventSpec {
            name: name.to_string(),
            event_type,
            config,
            scale,
            unit,
        });
    }

    Ok(events)
}

/// Pull the event selector out of a sysfs event description such as
/// `event=0x02`.
pub fn parse_event_config(desc: &str) -> Result<u64> {
    let hex = desc
        .find("0x")
        .or_else(|| desc.find("0X"))
        .map(|pos| &desc[pos + 2..])
        .ok_or_else(|| anyhow!("no hexadecimal selector in '{}'", desc.trim()))?;
    let digits: String = hex.chars().take_while(|c| c.is_ascii_hexdigit()).collect();
    Ok(u64::from_str_radix(&digits, 16)?)
}
