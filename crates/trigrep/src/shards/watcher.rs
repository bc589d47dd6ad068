// Copyright 2026 Trigrep Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{bail, Context, Result};
use log::{info, warn};
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use crate::shard::{Shard, SHARD_EXTENSION};
use crate::types::Searcher;

/// Signals a newly loaded or evicted shard. `searcher == None` evicts.
pub struct ShardLoadEvent {
    pub name: String,
    pub searcher: Option<Arc<dyn Searcher>>,
}

/// Watches a directory for shard files, emitting load events when a file
/// appears or its mtime changes and evict events when it disappears.
/// Filesystem notifications trigger rescans; a periodic rescan acts as the
/// safety net when notifications are unavailable or lossy.
pub struct ShardWatcher {
    dir: PathBuf,
    quit: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    initial_events: usize,
}

pub(crate) const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_secs(1);

impl ShardWatcher {
    pub fn new(dir: impl AsRef<Path>, sink: SyncSender<ShardLoadEvent>) -> Result<ShardWatcher> {
        Self::with_rescan_interval(dir, sink, DEFAULT_RESCAN_INTERVAL)
    }

    /// The initial directory scan runs before this returns; its events are
    /// already in the sink, so callers must be draining it.
    pub fn with_rescan_interval(
        dir: impl AsRef<Path>,
        sink: SyncSender<ShardLoadEvent>,
        interval: Duration,
    ) -> Result<ShardWatcher> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            bail!("index directory {} does not exist", dir.display());
        }

        let mut known: HashMap<String, SystemTime> = HashMap::new();
        let initial_events = match rescan(&dir, &mut known, &sink) {
            Ok(n) => n,
            Err(ScanError::SinkClosed) => bail!("event sink closed during initial scan"),
            Err(ScanError::Io(e)) => {
                return Err(e.context(format!("scan {}", dir.display())))
            }
        };

        let quit = Arc::new(AtomicBool::new(false));
        let handle = spawn_watch_thread(dir.clone(), known, sink, quit.clone(), interval);

        Ok(ShardWatcher {
            dir,
            quit,
            handle: Mutex::new(Some(handle)),
            initial_events,
        })
    }

    /// Number of load events posted by the initial scan.
    pub fn initial_events(&self) -> usize {
        self.initial_events
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stop the background thread. Idempotent; also run on drop.
    pub fn close(&self) {
        self.quit.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ShardWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_watch_thread(
    dir: PathBuf,
    mut known: HashMap<String, SystemTime>,
    sink: SyncSender<ShardLoadEvent>,
    quit: Arc<AtomicBool>,
    interval: Duration,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let (ntx, nrx) = std::sync::mpsc::channel::<()>();
        let mut _watcher: Option<RecommendedWatcher> = None;
        match RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                if res.is_ok() {
                    let _ = ntx.send(());
                }
            },
            Config::default(),
        ) {
            Ok(mut w) => match w.watch(&dir, RecursiveMode::NonRecursive) {
                Ok(()) => _watcher = Some(w),
                Err(e) => warn!(
                    "cannot watch {}: {}; relying on periodic rescans",
                    dir.display(),
                    e
                ),
            },
            Err(e) => warn!(
                "filesystem notifications unavailable: {}; relying on periodic rescans",
                e
            ),
        }

        loop {
            if quit.load(Ordering::Relaxed) {
                return;
            }
            match nrx.recv_timeout(interval) {
                Ok(()) => {
                    // Coalesce the burst that a shard rename produces.
                    while nrx.try_recv().is_ok() {}
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    std::thread::sleep(interval);
                }
            }
            if quit.load(Ordering::Relaxed) {
                return;
            }
            match rescan(&dir, &mut known, &sink) {
                Ok(_) => {}
                Err(ScanError::SinkClosed) => return,
                Err(ScanError::Io(e)) => {
                    warn!("rescan of {} failed: {:#}", dir.display(), e);
                }
            }
        }
    })
}

enum ScanError {
    SinkClosed,
    Io(anyhow::Error),
}

impl From<anyhow::Error> for ScanError {
    fn from(e: anyhow::Error) -> Self {
        ScanError::Io(e)
    }
}

/// One pass over the directory: evict names gone from disk, (re)load names
/// whose mtime changed. Returns the number of events posted.
fn rescan(
    dir: &Path,
    known: &mut HashMap<String, SystemTime>,
    sink: &SyncSender<ShardLoadEvent>,
) -> std::result::Result<usize, ScanError> {
    let mut on_disk: HashMap<String, SystemTime> = HashMap::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("read index directory {}", dir.display()))
        .map_err(ScanError::Io)?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SHARD_EXTENSION) {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Ok(meta) = entry.metadata() else { continue };
        let Ok(mtime) = meta.modified() else { continue };
        on_disk.insert(name.to_string(), mtime);
    }

    let mut posted = 0usize;

    let gone: Vec<String> = known
        .keys()
        .filter(|k| !on_disk.contains_key(*k))
        .cloned()
        .collect();
    for name in gone {
        info!("evicting shard {}", name);
        send(
            sink,
            ShardLoadEvent {
                name: name.clone(),
                searcher: None,
            },
        )?;
        known.remove(&name);
        posted += 1;
    }

    for (name, mtime) in on_disk {
        if known.get(&name) == Some(&mtime) {
            continue;
        }
        match Shard::open(dir.join(&name)) {
            Ok(shard) => {
                info!("loading shard {}", name);
                known.insert(name.clone(), mtime);
                send(
                    sink,
                    ShardLoadEvent {
                        name,
                        searcher: Some(Arc::new(shard)),
                    },
                )?;
                posted += 1;
            }
            Err(e) => {
                // A previously working version, if any, stays loaded.
                warn!("not loading shard {}: {:#}", name, e);
            }
        }
    }
    Ok(posted)
}

fn send(
    sink: &SyncSender<ShardLoadEvent>,
    ev: ShardLoadEvent,
) -> std::result::Result<(), ScanError> {
    sink.send(ev).map_err(|_| ScanError::SinkClosed)
}
