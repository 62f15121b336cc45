// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Latest aggregated snapshot and process-wide counters.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::AppId;
use crate::PoolId;
use crate::TargetId;

/// Statistics of one pool or app, derived from one tick.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityStats {
    pub targets: Vec<TargetId>,
    /// Raw counter deltas summed over all targets.
    pub counters: BTreeMap<String, u64>,
    /// `counters` multiplied by each event's scale.
    pub values: BTreeMap<String, f64>,
    pub llc_occupancy_kb: Option<f64>,
    pub mbm_total_bps: Option<f64>,
    pub mbm_local_bps: Option<f64>,
    pub ipc: Option<f64>,
    pub cache_miss_ratio: Option<f64>,
    pub cache_ways: Option<u32>,
    pub llc_alloc_kb: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneralStats {
    pub num_errors: u64,
    pub num_flushes: u64,
    pub num_invalid_access: u64,
}

/// One published tick.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub pools: BTreeMap<PoolId, EntityStats>,
    pub apps: BTreeMap<AppId, EntityStats>,
}

#[derive(Debug, Serialize)]
struct Report<'a> {
    general: GeneralStats,
    pools: &'a BTreeMap<PoolId, EntityStats>,
    apps: &'a BTreeMap<AppId, EntityStats>,
}

/// Shared between all workers. Counters only ever grow; the snapshot is
/// replaced as a whole so readers never see pool and app stats of
/// different ticks.
#[derive(Debug, Default)]
pub struct StatsStore {
    num_errors: AtomicU64,
    num_flushes: AtomicU64,
    num_invalid_access: AtomicU64,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl StatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_error(&self) {
        self.num_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_flush(&self) {
        self.num_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_invalid_access(&self) {
        self.num_invalid_access.fetch_add(1, Ordering::Relaxed);
    }

    pub fn general(&self) -> GeneralStats {
        GeneralStats {
            num_errors: self.num_errors.load(Ordering::Relaxed),
            num_flushes: self.num_flushes.load(Ordering::Relaxed),
            num_invalid_access: self.num_invalid_access.load(Ordering::Relaxed),
        }
    }

    pub fn publish_pool_stats(&self, pools: BTreeMap<PoolId, EntityStats>) {
        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        *snapshot = Arc::new(Snapshot {
            pools,
            apps: snapshot.apps.clone(),
        });
    }

    pub fn publish_app_stats(&self, apps: BTreeMap<AppId, EntityStats>) {
        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        *snapshot = Arc::new(Snapshot {
            pools: snapshot.pools.clone(),
            apps,
        });
    }

    /// Replace both maps in one step.
    pub fn publish(
        &self,
        pools: BTreeMap<PoolId, EntityStats>,
        apps: BTreeMap<AppId, EntityStats>,
    ) {
        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        *snapshot = Arc::new(Snapshot { pools, apps });
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn pool_stats(&self, pool: PoolId) -> Option<EntityStats> {
        self.snapshot().pools.get(&pool).cloned()
    }

    pub fn app_stats(&self, app: AppId) -> Option<EntityStats> {
        self.snapshot().apps.get(&app).cloned()
    }

    pub fn to_json(&self) -> Result<String> {
        let snapshot = self.snapshot();
        let report = Report {
            general: self.general(),
            pools: &snapshot.pools,
            apps: &snapshot.apps,
        };
        Ok(serde_json::to_string_pretty(&report)?)
    }
}
