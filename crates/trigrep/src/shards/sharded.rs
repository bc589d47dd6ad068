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

use anyhow::Result;
use log::error;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;

use super::throttle::Semaphore;
use crate::query::Query;
use crate::types::{
    sort_files_by_score, RepoList, RepoListEntry, SearchContext, SearchOptions, SearchResult,
    Searcher, Stats,
};

/// Fans queries out over the currently loaded shards.
///
/// Coordination is a counting semaphore of `num_cpu` permits: searches take
/// one, shard replacement takes all of them, so no search ever observes a
/// closed shard. Searching is CPU bound, so more than `num_cpu` concurrent
/// operations would only add memory pressure. A second semaphore of
/// `10 * num_cpu` permits bounds the per-query task fan-out.
pub struct ShardedSearcher {
    shards: Mutex<HashMap<String, Arc<dyn Searcher>>>,
    throttle: Semaphore,
    query_throttle: Arc<Semaphore>,
}

impl Default for ShardedSearcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardedSearcher {
    pub fn new() -> ShardedSearcher {
        Self::with_parallelism(rayon::current_num_threads())
    }

    pub fn with_parallelism(num_cpu: usize) -> ShardedSearcher {
        let num_cpu = num_cpu.max(1);
        ShardedSearcher {
            shards: Mutex::new(HashMap::new()),
            throttle: Semaphore::new(num_cpu),
            query_throttle: Arc::new(Semaphore::new(10 * num_cpu)),
        }
    }

    pub fn shard_count(&self) -> usize {
        let _read = self.throttle.acquire(1);
        self.shards.lock().len()
    }

    /// Install, swap or evict (`searcher == None`) a shard under the given
    /// name. Serializes with every outstanding read by taking all permits.
    pub fn replace(&self, name: &str, searcher: Option<Arc<dyn Searcher>>) {
        let _all = self.throttle.acquire(self.throttle.capacity());
        let mut shards = self.shards.lock();
        let old = match searcher {
            Some(s) => shards.insert(name.to_string(), s),
            None => shards.remove(name),
        };
        if let Some(old) = old {
            old.close();
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn Searcher>> {
        self.shards.lock().values().cloned().collect()
    }
}

impl Searcher for ShardedSearcher {
    fn search(
        &self,
        ctx: &SearchContext,
        q: &Query,
        opts: &SearchOptions,
    ) -> Result<SearchResult> {
        let queued = Instant::now();
        let mut opts = opts.clone();
        opts.set_defaults();

        let _read = self.throttle.acquire(1);
        let wait = queued.elapsed();
        let started = Instant::now();

        let shards = self.snapshot();
        let child = if opts.max_wall_time.is_zero() {
            ctx.child()
        } else {
            ctx.with_timeout(opts.max_wall_time)
        };

        let (tx, rx) = mpsc::channel::<Result<SearchResult>>();
        let q = Arc::new(q.clone());
        let opts = Arc::new(opts);
        for shard in shards.iter().cloned() {
            let tx = tx.clone();
            let q = q.clone();
            let opts = opts.clone();
            let child = child.clone();
            let gate = self.query_throttle.clone();
            std::thread::spawn(move || {
                let _permit = gate.acquire(1);
                let msg = run_shard_search(shard, &child, &q, &opts);
                let _ = tx.send(msg);
            });
        }
        drop(tx);

        let mut agg = SearchResult::default();
        agg.stats.wait = wait;
        let mut first_err = None;
        for _ in 0..shards.len() {
            let Ok(msg) = rx.recv() else { break };
            match msg {
                Ok(sr) => {
                    if !sr.files.is_empty() {
                        agg.repo_urls.extend(sr.repo_urls);
                        agg.line_fragments.extend(sr.line_fragments);
                    }
                    agg.stats.add(&sr.stats);
                    agg.files.extend(sr.files);
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
            if agg.stats.match_count > opts.total_max_match_count {
                child.cancel();
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        sort_files_by_score(&mut agg.files);
        agg.stats.duration = started.elapsed();
        Ok(agg)
    }

    fn list(&self, ctx: &SearchContext, q: &Query) -> Result<RepoList> {
        let _read = self.throttle.acquire(1);
        let shards = self.snapshot();

        let (tx, rx) = mpsc::channel::<Result<RepoList>>();
        let q = Arc::new(q.clone());
        for shard in shards.iter().cloned() {
            let tx = tx.clone();
            let q = q.clone();
            let ctx = ctx.clone();
            let gate = self.query_throttle.clone();
            std::thread::spawn(move || {
                let _permit = gate.acquire(1);
                let ident = shard.ident();
                let msg = match catch_unwind(AssertUnwindSafe(|| shard.list(&ctx, &q))) {
                    Ok(r) => r,
                    Err(payload) => {
                        error!("crashed shard {}: {}", ident, panic_message(&payload));
                        Ok(RepoList {
                            repos: Vec::new(),
                            crashes: 1,
                        })
                    }
                };
                let _ = tx.send(msg);
            });
        }
        drop(tx);

        let mut crashes = 0usize;
        let mut uniq: BTreeMap<String, RepoListEntry> = BTreeMap::new();
        let mut first_err = None;
        for _ in 0..shards.len() {
            let Ok(msg) = rx.recv() else { break };
            match msg {
                Ok(rl) => {
                    crashes += rl.crashes;
                    for entry in rl.repos {
                        match uniq.entry(entry.repository.name.clone()) {
                            std::collections::btree_map::Entry::Occupied(mut prev) => {
                                prev.get_mut().stats.add(&entry.stats)
                            }
                            std::collections::btree_map::Entry::Vacant(slot) => {
                                slot.insert(entry);
                            }
                        }
                    }
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        Ok(RepoList {
            repos: uniq.into_values().collect(),
            crashes,
        })
    }

    /// Close every shard. Takes all permits, so it waits for in-flight
    /// searches.
    fn close(&self) {
        let _all = self.throttle.acquire(self.throttle.capacity());
        let mut shards = self.shards.lock();
        for (_, s) in shards.drain() {
            s.close();
        }
    }

    fn ident(&self) -> String {
        "sharded-searcher".to_string()
    }
}

/// Run one shard's search with crash isolation: a panic becomes an empty
/// result with `stats.crashes = 1` and the other shards are unaffected.
fn run_shard_search(
    shard: Arc<dyn Searcher>,
    ctx: &SearchContext,
    q: &Query,
    opts: &SearchOptions,
) -> Result<SearchResult> {
    let ident = shard.ident();
    match catch_unwind(AssertUnwindSafe(|| shard.search(ctx, q, opts))) {
        Ok(r) => r,
        Err(payload) => {
            error!("crashed shard {}: {}", ident, panic_message(&payload));
            let mut crashed = SearchResult::default();
            crashed.stats = Stats {
                crashes: 1,
                ..Default::default()
            };
            Ok(crashed)
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
