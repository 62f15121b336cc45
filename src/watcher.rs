// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Reloads the configuration file when it is rewritten.
//!
//! The directory is watched rather than the file so that editors and
//! deployment tools replacing the file by rename are noticed too.

use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use inotify::Inotify;
use inotify::WatchMask;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::clock::Wait;
use crate::config::ConfigStore;
use crate::pipeline::Shared;

pub struct ConfigWatcher {
    inotify: Inotify,
    file_name: OsString,
    config: Arc<ConfigStore>,
}

impl ConfigWatcher {
    pub fn new(config: Arc<ConfigStore>) -> Result<Self> {
        let path = config
            .path()
            .ok_or_else(|| anyhow!("Configuration has no backing file to watch"))?;
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow!("{} is not a file", path.display()))?
            .to_os_string();
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        let inotify = Inotify::init().context("Failed to initialize inotify")?;
        inotify
            .watches()
            .add(
                dir,
                WatchMask::CLOSE_WRITE | WatchMask::MOVED_TO | WatchMask::CREATE,
            )
            .with_context(|| format!("Failed to watch {}", dir.display()))?;
        debug!("Watching {} for {:?}", dir.display(), file_name);

        Ok(Self {
            inotify,
            file_name,
            config,
        })
    }

    /// Drain pending events and reload if the configuration file was
    /// touched. Returns whether a new configuration was installed.
    pub fn poll(&mut self) -> Result<bool> {
        let mut buffer = [0; 1024];
        let mut touched = false;

        loop {
            match self.inotify.read_events(&mut buffer) {
                Ok(events) => {
                    let mut any = false;
                    for event in events {
                        any = true;
                        if event.name == Some(self.file_name.as_os_str()) {
                            touched = true;
                        }
                    }
                    if !any {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    return Err(e).context("Failed to read inotify events");
                }
            }
        }

        if !touched {
            return Ok(false);
        }

        match self.config.reload() {
            Ok(changed) => Ok(changed),
            Err(e) => {
                warn!("Keeping previous configuration: {:#}", e);
                Ok(false)
            }
        }
    }

    pub fn run(mut self, shared: Shared) {
        info!("Configuration watcher started");
        let mut seen = shared.tick.current();
        while !shared.should_stop() {
            match shared.tick.wait_after(seen, shared.interval) {
                Wait::Tick(tick, _) => seen = tick,
                Wait::Timeout => {}
                Wait::Closed => break,
            }
            if let Err(e) = self.poll() {
                warn!("{:#}", e);
                shared.stats.increment_error();
            }
        }
        info!("Configuration watcher stopped");
    }
}
