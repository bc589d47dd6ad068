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

//! Shard lifecycle: the directory watcher, the sharded fan-out searcher and
//! their composition.

mod sharded;
mod throttle;
mod watcher;

pub use sharded::ShardedSearcher;
pub use watcher::{ShardLoadEvent, ShardWatcher};

use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::query::Query;
use crate::types::{RepoList, SearchContext, SearchOptions, SearchResult, Searcher};

/// `ShardWatcher` wired to a `ShardedSearcher`: one pump thread drains the
/// watcher's events into `replace` calls. Closing stops the watcher (which
/// ends the pump) and then closes every shard.
pub struct DirectorySearcher {
    searcher: Arc<ShardedSearcher>,
    watcher: ShardWatcher,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

struct Progress {
    applied: Mutex<usize>,
    cond: Condvar,
}

impl DirectorySearcher {
    pub fn new(dir: impl AsRef<Path>) -> Result<DirectorySearcher> {
        let searcher = Arc::new(ShardedSearcher::new());
        let (tx, rx) = mpsc::sync_channel::<ShardLoadEvent>(64);

        let progress = Arc::new(Progress {
            applied: Mutex::new(0),
            cond: Condvar::new(),
        });
        let pump = {
            let searcher = searcher.clone();
            let progress = progress.clone();
            std::thread::spawn(move || {
                for ev in rx {
                    searcher.replace(&ev.name, ev.searcher);
                    let mut applied = progress.applied.lock();
                    *applied += 1;
                    progress.cond.notify_all();
                }
            })
        };

        // The watcher posts its initial scan before returning; wait until
        // the pump has applied it so a fresh searcher sees existing shards.
        let watcher = ShardWatcher::new(dir, tx)?;
        let want = watcher.initial_events();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let mut applied = progress.applied.lock();
        while *applied < want {
            if progress.cond.wait_until(&mut applied, deadline).timed_out() {
                break;
            }
        }
        drop(applied);

        Ok(DirectorySearcher {
            searcher,
            watcher,
            pump: Mutex::new(Some(pump)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn shard_count(&self) -> usize {
        self.searcher.shard_count()
    }
}

impl Searcher for DirectorySearcher {
    fn search(
        &self,
        ctx: &SearchContext,
        q: &Query,
        opts: &SearchOptions,
    ) -> Result<SearchResult> {
        self.searcher.search(ctx, q, opts)
    }

    fn list(&self, ctx: &SearchContext, q: &Query) -> Result<RepoList> {
        self.searcher.list(ctx, q)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Order matters: stopping the watcher drops the event sender, which
        // ends the pump; only then is the shard set stable to close.
        self.watcher.close();
        if let Some(pump) = self.pump.lock().take() {
            let _ = pump.join();
        }
        self.searcher.close();
    }

    fn ident(&self) -> String {
        format!("directory:{}", self.watcher.dir().display())
    }
}

impl Drop for DirectorySearcher {
    fn drop(&mut self) {
        self.close();
    }
}
