// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;

use crate::power::VALID_EPP;
use crate::AppId;
use crate::PoolId;
use crate::TargetId;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pools: Vec<PoolSpec>,
    #[serde(default)]
    pub apps: Vec<AppSpec>,
    #[serde(default)]
    pub power_profiles: Vec<PowerProfile>,
    #[serde(default)]
    pub sstbf: SstbfSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub id: PoolId,
    pub name: String,
    #[serde(default)]
    pub apps: Vec<AppId>,
    #[serde(default)]
    pub cores: Vec<usize>,
    /// L3 capacity bitmask, hexadecimal.
    pub cbm: Option<String>,
    /// Memory bandwidth limit in percent.
    pub mba: Option<u32>,
    pub min_cws: Option<u32>,
    pub power_profile: Option<u32>,
    /// Higher runs first. PIDs moved to a lower priority pool get their
    /// cache flushed.
    #[serde(default)]
    pub priority: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AppSpec {
    pub id: AppId,
    pub name: String,
    #[serde(default)]
    pub pids: Vec<TargetId>,
    #[serde(default)]
    pub cores: Vec<usize>,
}

/// Frequencies are in MHz.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerProfile {
    pub id: u32,
    pub name: String,
    pub min_freq: Option<u32>,
    pub max_freq: Option<u32>,
    pub epp: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SstbfSpec {
    #[serde(default)]
    pub configured: bool,
}

/// Parse a hexadecimal capacity bitmask, with or without `0x`.
pub fn parse_cbm(cbm: &str) -> Result<u64> {
    let digits = cbm
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    let mask = u64::from_str_radix(digits, 16)
        .with_context(|| format!("Invalid cache bitmask '{}'", cbm))?;
    if mask == 0 {
        bail!("Cache bitmask '{}' is empty", cbm);
    }
    Ok(mask)
}

impl Config {
    /// Parse `f:PATH`/`file:PATH` or inline JSON and validate it.
    pub fn parse(input: &str) -> Result<Self> {
        let config: Config = if input.starts_with("f:") || input.starts_with("file:") {
            let path = input.split_once(':').map(|x| x.1).unwrap_or_default();
            let mut f = fs::OpenOptions::new()
                .read(true)
                .open(path)
                .with_context(|| format!("Failed to open {}", path))?;
            let mut content = String::new();
            f.read_to_string(&mut content)?;
            serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path))?
        } else {
            serde_json::from_str(input)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::parse(&format!("f:{}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        let mut pool_ids = BTreeSet::new();
        let mut app_ids = BTreeSet::new();
        let mut profile_ids = BTreeSet::new();
        let mut app_owner = BTreeMap::new();
        let mut pid_owner = BTreeMap::new();

        for profile in &self.power_profiles {
            if !profile_ids.insert(profile.id) {
                bail!("Duplicate power profile id {}", profile.id);
            }
            if let Some(epp) = &profile.epp {
                if !VALID_EPP.contains(&epp.as_str()) {
                    bail!("Power profile {}: invalid EPP '{}'", profile.id, epp);
                }
            }
            if let (Some(min), Some(max)) = (profile.min_freq, profile.max_freq) {
                if min > max {
                    bail!("Power profile {}: min_freq > max_freq", profile.id);
                }
            }
        }

        for app in &self.apps {
            if !app_ids.insert(app.id) {
                bail!("Duplicate app id {}", app.id);
            }
            for pid in &app.pids {
                if let Some(other) = pid_owner.insert(*pid, app.id) {
                    bail!("PID {} belongs to apps {} and {}", pid, other, app.id);
                }
            }
        }

        for pool in &self.pools {
            if !pool_ids.insert(pool.id) {
                bail!("Duplicate pool id {}", pool.id);
            }
            for app in &pool.apps {
                if !app_ids.contains(app) {
                    bail!("Pool {}: unknown app {}", pool.id, app);
                }
                if let Some(other) = app_owner.insert(*app, pool.id) {
                    bail!("App {} belongs to pools {} and {}", app, other, pool.id);
                }
            }
            if let Some(cbm) = &pool.cbm {
                parse_cbm(cbm).with_context(|| format!("Pool {}", pool.id))?;
            }
            if let Some(mba) = pool.mba {
                if !(1..=100).contains(&mba) {
                    bail!("Pool {}: mba {} out of range 1..=100", pool.id, mba);
                }
            }
            if let Some(profile) = pool.power_profile {
                if !profile_ids.contains(&profile) {
                    bail!("Pool {}: unknown power profile {}", pool.id, profile);
                }
            }
        }

        Ok(())
    }

    pub fn pool(&self, id: PoolId) -> Option<&PoolSpec> {
        self.pools.iter().find(|p| p.id == id)
    }

    pub fn app(&self, id: AppId) -> Option<&AppSpec> {
        self.apps.iter().find(|a| a.id == id)
    }

    pub fn power_profile(&self, id: u32) -> Option<&PowerProfile> {
        self.power_profiles.iter().find(|p| p.id == id)
    }

    pub fn pool_of_app(&self, app: AppId) -> Option<PoolId> {
        self.pools
            .iter()
            .find(|p| p.apps.contains(&app))
            .map(|p| p.id)
    }

    pub fn app_of(&self, target: TargetId) -> Option<AppId> {
        self.apps
            .iter()
            .find(|a| a.pids.contains(&target))
            .map(|a| a.id)
    }

    pub fn pool_of(&self, target: TargetId) -> Option<PoolId> {
        self.app_of(target).and_then(|app| self.pool_of_app(app))
    }

    /// PIDs of every app in configuration order, without duplicates.
    pub fn monitored_targets(&self) -> Vec<TargetId> {
        let mut seen = BTreeSet::new();
        self.apps
            .iter()
            .flat_map(|a| a.pids.iter().copied())
            .filter(|pid| seen.insert(*pid))
            .collect()
    }

    /// Number of cache ways set in the pool's bitmask.
    pub fn pool_cache_ways(&self, pool: PoolId) -> Option<u32> {
        let cbm = self.pool(pool)?.cbm.as_deref()?;
        parse_cbm(cbm).ok().map(|mask| mask.count_ones())
    }

    pub fn pool_pids(&self, pool: &PoolSpec) -> Vec<TargetId> {
        pool.apps
            .iter()
            .filter_map(|id| self.app(*id))
            .flat_map(|a| a.pids.iter().copied())
            .collect()
    }
}

/// Current configuration shared by all workers.
///
/// Every [`ConfigStore::set_config`] bumps the generation token and raises
/// the "changed" flag that the control loop consumes.
#[derive(Debug, Default)]
pub struct ConfigStore {
    config: RwLock<Arc<Config>>,
    generation: AtomicU64,
    changed: Mutex<bool>,
    changed_cv: Condvar,
    path: Option<PathBuf>,
}

impl ConfigStore {
    pub fn new(config: Config) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            ..Default::default()
        }
    }

    /// Load `path` and remember it for [`ConfigStore::reload`].
    pub fn load(path: &Path) -> Result<Self> {
        let config = Config::load(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            ..Self::new(config)
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_config(&self, config: Config) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
        self.generation.fetch_add(1, Ordering::AcqRel);

        let mut changed = self.changed.lock().unwrap_or_else(PoisonError::into_inner);
        *changed = true;
        self.changed_cv.notify_all();
    }

    pub fn get_config(&self) -> Arc<Config> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Returns and clears the changed flag.
    pub fn is_config_changed(&self) -> bool {
        let mut changed = self.changed.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *changed)
    }

    /// Like [`ConfigStore::is_config_changed`] but blocks for up to `timeout`
    /// waiting for a change.
    pub fn wait_config_changed(&self, timeout: Duration) -> bool {
        let changed = self.changed.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut changed, _) = self
            .changed_cv
            .wait_timeout_while(changed, timeout, |changed| !*changed)
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *changed)
    }

    pub fn monitored_targets(&self) -> Vec<TargetId> {
        self.get_config().monitored_targets()
    }

    pub fn is_monitored(&self, target: TargetId) -> bool {
        self.get_config().app_of(target).is_some()
    }

    pub fn pool_of(&self, target: TargetId) -> Option<PoolId> {
        self.get_config().pool_of(target)
    }

    pub fn app_of(&self, target: TargetId) -> Option<AppId> {
        self.get_config().app_of(target)
    }

    pub fn pool_cache_ways(&self, pool: PoolId) -> Option<u32> {
        self.get_config().pool_cache_ways(pool)
    }

    /// Re-read the backing file. Returns whether a new configuration was
    /// installed. On error the current configuration stays.
    pub fn reload(&self) -> Result<bool> {
        let path = match &self.path {
            Some(path) => path,
            None => bail!("Configuration has no backing file"),
        };
        let config = Config::load(path)?;
        if *self.get_config() == config {
            return Ok(false);
        }
        info!("Reloaded configuration from {}", path.display());
        self.set_config(config);
        Ok(true)
    }
}
