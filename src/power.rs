// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-pool core frequency and energy/performance preference through
//! cpufreq sysfs.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use tracing::debug;
use tracing::info;

use crate::config::Config;
use crate::config::PowerProfile;
use crate::control::PowerControl;
use crate::misc::read_from_file;
use crate::misc::write_to_file;
use crate::PoolId;

pub const CPU_SYSFS: &str = "/sys/devices/system/cpu";

pub const VALID_EPP: [&str; 4] = [
    "performance",
    "balance_performance",
    "balance_power",
    "power",
];
pub const DEFAULT_EPP: &str = "balance_power";

const EPP_FILE: &str = "energy_performance_preference";

/// What was last applied to a pool: its cores and profile.
type Applied = (Vec<usize>, Option<PowerProfile>);

#[derive(Debug)]
pub struct CpufreqPower {
    cpu_root: PathBuf,
    prev: BTreeMap<PoolId, Applied>,
}

impl CpufreqPower {
    pub fn new(cpu_root: &Path) -> Self {
        Self {
            cpu_root: cpu_root.to_path_buf(),
            prev: BTreeMap::new(),
        }
    }

    fn cpufreq_dir(&self, cpu: usize) -> PathBuf {
        self.cpu_root.join(format!("cpu{cpu}")).join("cpufreq")
    }

    fn set_core(&self, cpu: usize, min_khz: Option<u64>, max_khz: Option<u64>, epp: &str) -> Result<()> {
        let dir = self.cpufreq_dir(cpu);
        let min_khz = match min_khz {
            Some(v) => v,
            None => read_from_file(&dir.join("cpuinfo_min_freq"))?,
        };
        let max_khz = match max_khz {
            Some(v) => v,
            None => read_from_file(&dir.join("cpuinfo_max_freq"))?,
        };

        // The kernel rejects min above the current max, so order the writes.
        let cur_max: u64 = read_from_file(&dir.join("scaling_max_freq"))?;
        let min_path = dir.join("scaling_min_freq");
        let max_path = dir.join("scaling_max_freq");
        if min_khz > cur_max {
            write_to_file(&max_path, &max_khz.to_string())?;
            write_to_file(&min_path, &min_khz.to_string())?;
        } else {
            write_to_file(&min_path, &min_khz.to_string())?;
            write_to_file(&max_path, &max_khz.to_string())?;
        }

        let epp_path = dir.join(EPP_FILE);
        if epp_path.exists() {
            write_to_file(&epp_path, epp)?;
        }
        Ok(())
    }

    fn apply_profile(&self, cores: &[usize], profile: &PowerProfile) -> Result<()> {
        let min = profile.min_freq.map(|mhz| mhz as u64 * 1000);
        let max = profile.max_freq.map(|mhz| mhz as u64 * 1000);
        let epp = profile.epp.as_deref().unwrap_or(DEFAULT_EPP);
        for cpu in cores {
            self.set_core(*cpu, min, max, epp)
                .with_context(|| format!("Failed to apply profile '{}' to CPU {}", profile.name, cpu))?;
        }
        Ok(())
    }

    fn reset_cores(&self, cores: &[usize]) -> Result<()> {
        for cpu in cores {
            self.set_core(*cpu, None, None, DEFAULT_EPP)
                .with_context(|| format!("Failed to reset CPU {}", cpu))?;
        }
        Ok(())
    }
}

impl PowerControl for CpufreqPower {
    fn reconfigure_power(&mut self, config: &Config) -> Result<()> {
        if config.sstbf.configured {
            debug!("SST-BF configured, leaving core frequencies alone");
            self.prev.clear();
            return Ok(());
        }

        let mut applied = BTreeMap::new();
        for pool in &config.pools {
            let profile = pool
                .power_profile
                .and_then(|id| config.power_profile(id))
                .cloned();
            let state = (pool.cores.clone(), profile);
            if self.prev.get(&pool.id) == Some(&state) {
                applied.insert(pool.id, state);
                continue;
            }

            match &state.1 {
                Some(profile) => {
                    info!("Pool {}: applying power profile '{}'", pool.id, profile.name);
                    self.apply_profile(&pool.cores, profile)?;
                }
                None => {
                    debug!("Pool {}: resetting cores {:?}", pool.id, pool.cores);
                    self.reset_cores(&pool.cores)?;
                }
            }
            applied.insert(pool.id, state);
        }
        self.prev = applied;
        Ok(())
    }
}
