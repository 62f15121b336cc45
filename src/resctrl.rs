// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Cache and memory bandwidth allocation through the resctrl filesystem.
//!
//! Every pool gets its own control group `<root>/rdt_pools_<id>`. Its
//! `schemata` carries the pool's L3 bitmask and MBA percentage on every
//! cache domain, `cpus_list` the pool's cores and `tasks` the PIDs of the
//! pool's apps. Groups of pools that no longer exist are removed.
//!
//! PIDs that lose their pool go back to the root group. With a flush
//! handle attached, those PIDs and the ones moved to a lower priority pool
//! get their cache flushed.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::parse_cbm;
use crate::config::Config;
use crate::config::PoolSpec;
use crate::control::Allocator;
use crate::flusher::FlushRequests;
use crate::misc::read_file_byte;
use crate::misc::read_from_file;
use crate::PoolId;
use crate::TargetId;

pub const RESCTRL_ROOT: &str = "/sys/fs/resctrl";
const GROUP_PREFIX: &str = "rdt_pools_";

/// Size of one L3 way in KiB, from the cache description of CPU 0.
pub fn cache_way_size_kb(cpu_sysfs: &Path) -> Result<f64> {
    let index3 = cpu_sysfs.join("cpu0").join("cache").join("index3");
    let size = read_file_byte(&index3.join("size"))?;
    let ways: usize = read_from_file(&index3.join("ways_of_associativity"))?;
    if ways == 0 {
        bail!("{:?} reports zero ways", index3);
    }
    Ok(size as f64 / ways as f64 / 1024.0)
}

/// Domain ids per resource, from `L3:0=fff;1=fff` style lines.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Domains {
    pub l3: Vec<u32>,
    pub mb: Vec<u32>,
}

impl Domains {
    pub fn parse(schemata: &str) -> Result<Self> {
        let mut domains = Self::default();
        for line in schemata.lines() {
            let Some((resource, values)) = line.trim().split_once(':') else {
                continue;
            };
            let ids = values
                .split(';')
                .filter(|v| !v.trim().is_empty())
                .map(|v| {
                    let id = v.split_once('=').map_or(v, |(id, _)| id);
                    id.trim()
                        .parse::<u32>()
                        .with_context(|| format!("Invalid domain in '{}'", line))
                })
                .collect::<Result<Vec<_>>>()?;
            match resource.trim() {
                "L3" => domains.l3 = ids,
                "MB" => domains.mb = ids,
                _ => {}
            }
        }
        Ok(domains)
    }
}

fn schemata_line(resource: &str, domains: &[u32], value: &str) -> String {
    let parts: Vec<String> = domains.iter().map(|d| format!("{d}={value}")).collect();
    format!("{}:{}\n", resource, parts.join(";"))
}

fn write_attr(path: &Path, content: &str) -> io::Result<()> {
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    f.write_all(content.as_bytes())
}

/// Pool and pool priority of every PID with a pool.
type Assignment = BTreeMap<TargetId, (PoolId, u32)>;

fn assignment(config: &Config) -> Assignment {
    let mut assigned = Assignment::new();
    for pool in &config.pools {
        for pid in config.pool_pids(pool) {
            assigned.entry(pid).or_insert((pool.id, pool.priority));
        }
    }
    assigned
}

/// PIDs that left every pool, and PIDs moved to a lower priority pool.
fn moved_pids(prev: &Assignment, next: &Assignment) -> (Vec<TargetId>, Vec<TargetId>) {
    let mut released = vec![];
    let mut demoted = vec![];
    for (pid, (pool, priority)) in prev {
        match next.get(pid) {
            None => released.push(*pid),
            Some((new_pool, new_priority)) if new_pool != pool && new_priority < priority => {
                demoted.push(*pid)
            }
            Some(_) => {}
        }
    }
    (released, demoted)
}

#[derive(Debug)]
pub struct ResctrlAllocator {
    root: PathBuf,
    flush: Option<FlushRequests>,
    assigned: Assignment,
}

impl ResctrlAllocator {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            flush: None,
            assigned: Assignment::new(),
        }
    }

    /// Submit released and demoted PIDs for a cache flush.
    pub fn with_flush(mut self, flush: FlushRequests) -> Self {
        self.flush = Some(flush);
        self
    }

    pub fn group_dir(&self, pool: PoolId) -> PathBuf {
        self.root.join(format!("{GROUP_PREFIX}{pool}"))
    }

    fn domains(&self) -> Result<Domains> {
        let path = self.root.join("schemata");
        let schemata = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}, is resctrl mounted?", path.display()))?;
        Domains::parse(&schemata)
    }

    fn schemata(&self, pool: &PoolSpec, domains: &Domains) -> Result<String> {
        let mut schemata = String::new();
        if let Some(cbm) = &pool.cbm {
            if domains.l3.is_empty() {
                bail!("Pool {}: L3 allocation not supported", pool.id);
            }
            schemata += &schemata_line("L3", &domains.l3, &format!("{:x}", parse_cbm(cbm)?));
        }
        if let Some(mba) = pool.mba {
            if domains.mb.is_empty() {
                bail!("Pool {}: memory bandwidth allocation not supported", pool.id);
            }
            schemata += &schemata_line("MB", &domains.mb, &mba.to_string());
        }
        Ok(schemata)
    }

    fn assign_tasks(&self, dir: &Path, pids: &[u32]) -> Result<()> {
        let path = dir.join("tasks");
        for pid in pids {
            // tasks takes one PID per write
            let res = fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(&path)
                .and_then(|mut f| f.write_all(format!("{pid}\n").as_bytes()));
            match res {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
                    warn!("PID {} vanished, not assigned to {}", pid, dir.display());
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to assign PID {} to {}", pid, dir.display())
                    })
                }
            }
        }
        Ok(())
    }

    fn configure_pool(&self, config: &Config, pool: &PoolSpec, domains: &Domains) -> Result<()> {
        let dir = self.group_dir(pool.id);
        if !dir.exists() {
            fs::create_dir(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
            debug!("Created {}", dir.display());
        }

        let schemata = self.schemata(pool, domains)?;
        if !schemata.is_empty() {
            write_attr(&dir.join("schemata"), &schemata)
                .with_context(|| format!("Pool {}: failed to write schemata", pool.id))?;
        }

        if !pool.cores.is_empty() {
            let cpus: Vec<String> = pool.cores.iter().map(|c| c.to_string()).collect();
            write_attr(&dir.join("cpus_list"), &format!("{}\n", cpus.join(",")))
                .with_context(|| format!("Pool {}: failed to write cpus_list", pool.id))?;
        }

        self.assign_tasks(&dir, &config.pool_pids(pool))
    }

    fn remove_stale_groups(&self, config: &Config) -> Result<()> {
        let live: BTreeSet<PoolId> = config.pools.iter().map(|p| p.id).collect();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix(GROUP_PREFIX))
                .and_then(|id| id.parse::<PoolId>().ok())
            else {
                continue;
            };
            if !live.contains(&id) {
                fs::remove_dir(entry.path())
                    .with_context(|| format!("Failed to remove {}", entry.path().display()))?;
                info!("Removed resctrl group of pool {}", id);
            }
        }
        Ok(())
    }
}

impl Allocator for ResctrlAllocator {
    fn reconfigure(&mut self, config: &Config) -> Result<()> {
        let domains = self.domains()?;
        let assigned = assignment(config);
        let (released, demoted) = moved_pids(&self.assigned, &assigned);

        self.remove_stale_groups(config)?;
        for pool in &config.pools {
            self.configure_pool(config, pool, &domains)?;
        }
        if !released.is_empty() {
            self.assign_tasks(&self.root, &released)?;
            info!("Released {} PIDs to the default group", released.len());
        }
        self.assigned = assigned;
        info!("Allocation applied to {} pools", config.pools.len());

        if let Some(flush) = &self.flush {
            let mut pids: Vec<TargetId> = released.into_iter().chain(demoted).collect();
            pids.sort_unstable();
            if !pids.is_empty() {
                debug!("Requesting cache flush of {:?}", pids);
                if let Err(e) = flush.submit(&pids) {
                    warn!("{:#}", e);
                }
            }
        }
        Ok(())
    }
}
