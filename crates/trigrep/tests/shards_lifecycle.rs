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

//! Sharded searcher and watcher behavior: crash isolation, replacement under
//! load, cancellation, and directory lifecycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use trigrep::shard::shard_file_name;
use trigrep::{
    Document, DirectorySearcher, Query, RepoList, Repository, SearchContext, SearchOptions,
    SearchResult, Searcher, Shard, ShardBuilder, ShardedSearcher,
};

fn shard_blob(repo: &str, docs: &[(&str, &[u8])]) -> Vec<u8> {
    let mut b = ShardBuilder::new(Repository {
        name: repo.to_string(),
        ..Default::default()
    });
    for (name, content) in docs {
        b.add(Document {
            name: name.to_string(),
            content: content.to_vec(),
            branches: vec!["main".to_string()],
            sections: Vec::new(),
        })
        .unwrap();
    }
    let mut blob = Vec::new();
    b.finish(&mut blob).unwrap();
    blob
}

fn shard(repo: &str, docs: &[(&str, &[u8])]) -> Arc<Shard> {
    Arc::new(Shard::from_bytes("mem-shard", shard_blob(repo, docs)).unwrap())
}

/// Crash-test stub: panics on every operation.
struct PanickingSearcher;

impl Searcher for PanickingSearcher {
    fn search(
        &self,
        _ctx: &SearchContext,
        _q: &Query,
        _opts: &SearchOptions,
    ) -> anyhow::Result<SearchResult> {
        panic!("deliberate test crash");
    }

    fn list(&self, _ctx: &SearchContext, _q: &Query) -> anyhow::Result<RepoList> {
        panic!("deliberate test crash");
    }

    fn ident(&self) -> String {
        "panicking-stub".to_string()
    }
}

#[test]
fn crash_isolation() {
    let ss = ShardedSearcher::new();
    ss.replace("a.trigrep", Some(Arc::new(PanickingSearcher)));
    ss.replace(
        "b.trigrep",
        Some(shard("repo-b", &[("f.txt", b"water everywhere")])),
    );

    let q = Query::parse("water").unwrap();
    let res = ss
        .search(&SearchContext::new(), &q, &SearchOptions::default())
        .unwrap();
    assert_eq!(res.stats.crashes, 1);
    assert_eq!(res.files.len(), 1);
    assert_eq!(res.files[0].file_name, "f.txt");
    // The crashing shard stays installed.
    assert_eq!(ss.shard_count(), 2);

    let list = ss
        .list(&SearchContext::new(), &Query::Const(true))
        .unwrap();
    assert_eq!(list.crashes, 1);
    assert_eq!(list.repos.len(), 1);
    assert_eq!(list.repos[0].repository.name, "repo-b");
}

#[test]
fn aggregation_across_shards() {
    let ss = ShardedSearcher::new();
    ss.replace("a", Some(shard("repo-a", &[("a.txt", b"shared water")])));
    ss.replace("b", Some(shard("repo-b", &[("b.txt", b"more water here")])));

    let q = Query::parse("water").unwrap();
    let res = ss
        .search(&SearchContext::new(), &q, &SearchOptions::default())
        .unwrap();
    assert_eq!(res.files.len(), 2);
    assert_eq!(res.stats.file_count, 2);

    let list = ss
        .list(&SearchContext::new(), &Query::Const(true))
        .unwrap();
    let names: Vec<&str> = list
        .repos
        .iter()
        .map(|r| r.repository.name.as_str())
        .collect();
    assert_eq!(names, vec!["repo-a", "repo-b"]);
}

#[test]
fn eviction_and_swap() {
    let ss = ShardedSearcher::new();
    ss.replace("a", Some(shard("repo", &[("old.txt", b"water old")])));
    ss.replace("a", Some(shard("repo", &[("new.txt", b"water new")])));
    let q = Query::parse("water").unwrap();
    let res = ss
        .search(&SearchContext::new(), &q, &SearchOptions::default())
        .unwrap();
    assert_eq!(res.files.len(), 1);
    assert_eq!(res.files[0].file_name, "new.txt");

    ss.replace("a", None);
    let res = ss
        .search(&SearchContext::new(), &q, &SearchOptions::default())
        .unwrap();
    assert!(res.files.is_empty());
    assert_eq!(ss.shard_count(), 0);
}

#[test]
fn replace_races_with_searches() {
    let ss = Arc::new(ShardedSearcher::new());
    ss.replace("a", Some(shard("repo", &[("f.txt", b"water base")])));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let ss = ss.clone();
        handles.push(std::thread::spawn(move || {
            let q = Query::parse("water").unwrap();
            for _ in 0..50 {
                let res = ss
                    .search(&SearchContext::new(), &q, &SearchOptions::default())
                    .unwrap();
                // Either generation of the shard, never a torn state.
                assert!(res.files.len() <= 1);
                assert_eq!(res.stats.crashes, 0);
            }
        }));
    }
    for i in 0..50 {
        let name = format!("g{}.txt", i);
        ss.replace("a", Some(shard("repo", &[(name.as_str(), b"water spin")])));
    }
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn cancellation_returns_partial_results() {
    let docs: Vec<(String, Vec<u8>)> = (0..100_000)
        .map(|i| (format!("f{}.txt", i), format!("water line {}\n", i).into_bytes()))
        .collect();
    let doc_refs: Vec<(&str, &[u8])> = docs
        .iter()
        .map(|(n, c)| (n.as_str(), c.as_slice()))
        .collect();
    let ss = ShardedSearcher::new();
    ss.replace("big", Some(shard("repo", &doc_refs)));

    let q = Query::parse("water").unwrap();
    let opts = SearchOptions {
        max_wall_time: Duration::from_millis(50),
        ..Default::default()
    };
    let started = Instant::now();
    let res = ss.search(&SearchContext::new(), &q, &opts).unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(5), "took {:?}", elapsed);
    assert!(res.stats.match_count >= 1);
    assert!(res.stats.match_count <= opts_shard_cap());
    assert!(res.stats.files_skipped > 0, "{:?}", res.stats);
}

fn opts_shard_cap() -> usize {
    let mut o = SearchOptions::default();
    o.set_defaults();
    o.shard_max_match_count
}

#[test]
fn total_match_cap_cancels_remaining_shards() {
    let ss = ShardedSearcher::new();
    for s in 0..4 {
        let docs: Vec<(String, Vec<u8>)> = (0..500)
            .map(|i| (format!("s{}f{}.txt", s, i), b"water\n".to_vec()))
            .collect();
        let doc_refs: Vec<(&str, &[u8])> = docs
            .iter()
            .map(|(n, c)| (n.as_str(), c.as_slice()))
            .collect();
        ss.replace(&format!("s{}", s), Some(shard("repo", &doc_refs)));
    }
    let q = Query::parse("water").unwrap();
    let opts = SearchOptions {
        total_max_match_count: 100,
        ..Default::default()
    };
    let res = ss.search(&SearchContext::new(), &q, &opts).unwrap();
    // Every shard respects its own caps; the global cap stops the fan-out,
    // so the total stays well under the uncapped 2000.
    assert!(res.stats.match_count >= 100);
    assert!(res.stats.crashes == 0);
}

#[test]
fn directory_searcher_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let shard_path = dir.path().join(shard_file_name("repo", 0));
    std::fs::write(&shard_path, shard_blob("repo", &[("f.txt", b"water here")])).unwrap();
    // Files with foreign extensions are ignored.
    std::fs::write(dir.path().join("notes.txt"), b"not a shard").unwrap();
    // A corrupt shard file is skipped without breaking startup.
    std::fs::write(
        dir.path().join(shard_file_name("broken", 0)),
        b"garbage bytes",
    )
    .unwrap();

    let ds = DirectorySearcher::new(dir.path()).unwrap();
    assert_eq!(ds.shard_count(), 1);

    let q = Query::parse("water").unwrap();
    let res = ds
        .search(&SearchContext::new(), &q, &SearchOptions::default())
        .unwrap();
    assert_eq!(res.files.len(), 1);

    // Eviction: the shard disappears from disk, then from the searcher.
    std::fs::remove_file(&shard_path).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while ds.shard_count() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(ds.shard_count(), 0);

    // Reappearance loads it again.
    std::fs::write(&shard_path, shard_blob("repo", &[("g.txt", b"water back")])).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while ds.shard_count() == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(ds.shard_count(), 1);
    let res = ds
        .search(&SearchContext::new(), &q, &SearchOptions::default())
        .unwrap();
    assert_eq!(res.files[0].file_name, "g.txt");

    ds.close();
}

#[test]
fn directory_searcher_requires_directory() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope");
    assert!(DirectorySearcher::new(&missing).is_err());
}
