// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Asynchronous cache flushes through the kernel's per-PID flush file.

use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use crossbeam::channel::unbounded;
use crossbeam::channel::Receiver;
use crossbeam::channel::RecvTimeoutError;
use crossbeam::channel::SendError;
use crossbeam::channel::Sender;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::pipeline::Shared;
use crate::procfs;
use crate::stats::StatsStore;
use crate::TargetId;

/// How often the worker looks at the stop flag while the queue is empty.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct IdleSignal {
    idle: Mutex<bool>,
    cv: Condvar,
}

impl IdleSignal {
    fn set(&self, idle: bool) {
        let mut cur = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        *cur = idle;
        self.cv.notify_all();
    }

    fn get(&self) -> bool {
        *self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait(&self, timeout: Duration) -> bool {
        let idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let (idle, _) = self
            .cv
            .wait_timeout_while(idle, timeout, |idle| !*idle)
            .unwrap_or_else(PoisonError::into_inner);
        *idle
    }
}

/// Submission side of the flush queue, handed to whoever serves flush
/// requests.
#[derive(Clone, Debug)]
pub struct FlushRequests {
    tx: Sender<Vec<TargetId>>,
    idle: Arc<IdleSignal>,
}

impl FlushRequests {
    pub fn submit(&self, pids: &[TargetId]) -> Result<()> {
        if let Err(SendError(_)) = self.tx.send(pids.to_vec()) {
            bail!("Flush worker is gone");
        }
        Ok(())
    }

    /// No batch is being written right now.
    pub fn is_idle(&self) -> bool {
        self.idle.get()
    }

    /// Wait up to `timeout` for the worker to go idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.idle.wait(timeout)
    }
}

pub struct CacheFlusher {
    shared: Shared,
    path: PathBuf,
    proc_root: PathBuf,
    flush_children: bool,
    rx: Receiver<Vec<TargetId>>,
    idle: Arc<IdleSignal>,
}

impl CacheFlusher {
    pub fn new(shared: Shared, path: &Path, flush_children: bool) -> (Self, FlushRequests) {
        let (tx, rx) = unbounded();
        let idle = Arc::new(IdleSignal {
            idle: Mutex::new(true),
            cv: Condvar::new(),
        });
        let flusher = Self {
            shared,
            path: path.to_path_buf(),
            proc_root: PathBuf::from(procfs::PROC_ROOT),
            flush_children,
            rx,
            idle: idle.clone(),
        };
        (flusher, FlushRequests { tx, idle })
    }

    /// Where to look up threads and children when `flush_children` is set.
    pub fn with_proc_root(mut self, proc_root: &Path) -> Self {
        self.proc_root = proc_root.to_path_buf();
        self
    }

    fn expand(&self, pids: &[TargetId]) -> Vec<TargetId> {
        if !self.flush_children {
            return pids.to_vec();
        }
        let mut all = Vec::with_capacity(pids.len());
        for pid in pids {
            all.push(*pid);
            match procfs::pid_tids(&self.proc_root, *pid) {
                Ok(tids) => all.extend(tids.into_iter().filter(|tid| tid != pid)),
                Err(e) => debug!("No threads of PID {}: {:#}", pid, e),
            }
            match procfs::pid_children(&self.proc_root, *pid) {
                Ok(children) => all.extend(children),
                Err(e) => debug!("No children of PID {}: {:#}", pid, e),
            }
        }
        all
    }

    /// Write one batch. Per-PID failures are counted and skipped.
    pub fn flush(&self, pids: &[TargetId]) {
        let stats = &self.shared.stats;
        let pids = self.expand(pids);
        flush_pids(&self.path, &pids, stats);
    }

    pub fn run(self) {
        info!("Cache flusher started, writing to {}", self.path.display());
        while !self.shared.should_stop() {
            let pids = match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(pids) => pids,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            self.idle.set(false);
            debug!("Flushing {} PIDs", pids.len());
            self.flush(&pids);
            self.idle.set(true);
        }
        info!("Cache flusher stopped");
    }
}

/// Write each PID as its own line to the flush file at `path`.
pub fn flush_pids(path: &Path, pids: &[TargetId], stats: &StatsStore) {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            warn!("{} is a symlink, refusing to flush", path.display());
            stats.increment_error();
            return;
        }
        _ => {}
    }

    let mut file = match OpenOptions::new().append(true).open(path) {
        Ok(file) => file,
        Err(e) => {
            warn!("Failed to open {}: {}", path.display(), e);
            stats.increment_error();
            return;
        }
    };

    for pid in pids {
        let res = file
            .write_all(format!("{pid}\n").as_bytes())
            .and_then(|_| file.flush());
        match res {
            Ok(()) => stats.increment_flush(),
            Err(e) => {
                warn!("Failed to flush PID {}: {}", pid, e);
                stats.increment_error();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_flush_pids() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("flush");
        fs::write(&path, "").unwrap();
        let stats = StatsStore::new();

        flush_pids(&path, &[1, 2, 3], &stats);
        assert_eq!(fs::read_to_string(&path).unwrap(), "1\n2\n3\n");
        assert_eq!(stats.general().num_flushes, 3);
        assert_eq!(stats.general().num_errors, 0);
    }

    #[test]
    fn test_flush_refuses_symlink() {
        let tmp = TempDir::new().unwrap();
        let real = tmp.path().join("real");
        let link = tmp.path().join("flush");
        fs::write(&real, "").unwrap();
        std::os::unix::fs::symlink(&real, &link).unwrap();
        let stats = StatsStore::new();

        flush_pids(&link, &[1], &stats);
        assert_eq!(fs::read_to_string(&real).unwrap(), "");
        assert_eq!(stats.general().num_errors, 1);
        assert_eq!(stats.general().num_flushes, 0);
    }

    #[test]
    fn test_flush_missing_file() {
        let tmp = TempDir::new().unwrap();
        let stats = StatsStore::new();
        flush_pids(&tmp.path().join("flush"), &[1, 2], &stats);
        assert_eq!(stats.general().num_errors, 1);
        assert!(!tmp.path().join("flush").exists());
    }

    #[test]
    fn test_flush_children() {
        let tmp = TempDir::new().unwrap();
        let proc_root = tmp.path().join("proc");
        let task = proc_root.join("10/task/10");
        fs::create_dir_all(&task).unwrap();
        fs::create_dir_all(proc_root.join("10/task/13")).unwrap();
        fs::write(task.join("children"), "11 12\n").unwrap();
        let path = tmp.path().join("flush");
        fs::write(&path, "").unwrap();

        let shared = Shared::for_test(Duration::from_millis(100), Duration::from_millis(50));
        let (flusher, _requests) = CacheFlusher::new(shared.clone(), &path, true);
        let flusher = flusher.with_proc_root(&proc_root);
        // 20 has no /proc entry, still flushed
        flusher.flush(&[10, 20]);
        assert_eq!(fs::read_to_string(&path).unwrap(), "10\n13\n11\n12\n20\n");
        assert_eq!(shared.stats.general().num_flushes, 5);
    }
}
