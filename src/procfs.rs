// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::fs;
use std::path::Path;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;

use crate::TargetId;

pub const PROC_ROOT: &str = "/proc";

/// Single-character process state from `<proc>/<pid>/stat`.
pub fn pid_state(proc_root: &Path, pid: TargetId) -> Result<char> {
    let path = proc_root.join(pid.to_string()).join("stat");
    let stat = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    // comm may contain spaces and parentheses, the state follows the last ')'
    let (_, rest) = stat
        .rsplit_once(')')
        .ok_or_else(|| anyhow!("Malformed {}", path.display()))?;
    rest.trim_start()
        .chars()
        .next()
        .ok_or_else(|| anyhow!("Missing state in {}", path.display()))
}

/// A PID is worth monitoring if it exists and is running or sleeping.
pub fn is_pid_valid_in(proc_root: &Path, pid: TargetId) -> bool {
    matches!(pid_state(proc_root, pid), Ok('R' | 'S' | 'D'))
}

pub fn is_pid_valid(pid: TargetId) -> bool {
    is_pid_valid_in(Path::new(PROC_ROOT), pid)
}

/// Direct children of the main thread of `pid`.
pub fn pid_children(proc_root: &Path, pid: TargetId) -> Result<Vec<TargetId>> {
    let path = proc_root
        .join(pid.to_string())
        .join("task")
        .join(pid.to_string())
        .join("children");
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    content
        .split_whitespace()
        .map(|s| {
            s.parse::<TargetId>()
                .with_context(|| format!("Invalid child PID '{}' in {}", s, path.display()))
        })
        .collect()
}

/// Thread ids of `pid`, sorted.
pub fn pid_tids(proc_root: &Path, pid: TargetId) -> Result<Vec<TargetId>> {
    let path = proc_root.join(pid.to_string()).join("task");
    let mut tids: Vec<TargetId> = fs::read_dir(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect();
    tids.sort_unstable();
    Ok(tids)
}
