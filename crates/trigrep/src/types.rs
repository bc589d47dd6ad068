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

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::query::Query;

/// A branch of the indexed repository, with the version (commit) that was
/// indexed for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoBranch {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Describes the repository a shard covers. Serialized as JSON into the
/// shard's leading section so any format version can at least identify
/// itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    #[serde(default)]
    pub url: String,
    /// Go-template style URL patterns, e.g. `{{.Version}}` / `{{.Path}}`.
    #[serde(default)]
    pub commit_url_template: String,
    #[serde(default)]
    pub file_url_template: String,
    #[serde(default)]
    pub line_fragment_template: String,
    #[serde(default)]
    pub branches: Vec<RepoBranch>,
    /// Nested repositories (e.g. submodules) keyed by path prefix.
    #[serde(default)]
    pub sub_repo_map: BTreeMap<String, Repository>,
}

/// An ordered, non-overlapping byte range of a document, typically a symbol
/// definition produced by an external parser.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentSection {
    pub start: u32,
    pub end: u32,
}

/// A file to be ingested into a shard.
#[derive(Debug, Clone, Default)]
pub struct Document {
    pub name: String,
    pub content: Vec<u8>,
    /// Branches the document exists in. Empty means "all declared branches
    /// so far" is NOT implied; the builder records an empty mask only for
    /// shards built without branch information.
    pub branches: Vec<String>,
    pub sections: Vec<DocumentSection>,
}

/// Caps and toggles for a single search request.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Wall-clock budget for the whole request; zero disables the deadline.
    pub max_wall_time: Duration,
    /// Maximum line matches gathered per shard before it starts skipping.
    pub shard_max_match_count: usize,
    /// Global cap; remaining shards are cancelled once it is exceeded.
    pub total_max_match_count: usize,
    /// Per-shard cap on files scoring above the importance threshold.
    pub shard_max_important_match: usize,
    pub total_max_important_match: usize,
    /// Return the whole file content for every matched file.
    pub whole: bool,
    /// Only report how many documents would be considered.
    pub estimate_doc_count: bool,
}

impl SearchOptions {
    pub fn set_defaults(&mut self) {
        if self.shard_max_match_count == 0 {
            // Cap the total number of matches so overly broad searches do
            // not take down the machine.
            self.shard_max_match_count = 100_000;
        }
        if self.total_max_match_count == 0 {
            self.total_max_match_count = 10 * self.shard_max_match_count;
        }
        if self.shard_max_important_match == 0 {
            self.shard_max_important_match = 10;
        }
        if self.total_max_important_match == 0 {
            self.total_max_important_match = 10 * self.shard_max_important_match;
        }
    }
}

/// Counters accumulated while searching. Merged across shards with
/// [`Stats::add`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    /// Total line matches returned.
    pub match_count: usize,
    /// Files with at least one match.
    pub file_count: usize,
    pub files_considered: usize,
    pub files_loaded: usize,
    /// Files passed over because a cap or the deadline was hit.
    pub files_skipped: usize,
    pub shard_files_considered: usize,
    pub bytes_loaded: u64,
    /// Trigram candidates before verification.
    pub ngram_matches: usize,
    /// Shards whose search panicked.
    pub crashes: usize,
    pub duration: Duration,
    /// Time spent queueing for a search permit.
    pub wait: Duration,
}

impl Stats {
    pub fn add(&mut self, o: &Stats) {
        self.match_count += o.match_count;
        self.file_count += o.file_count;
        self.files_considered += o.files_considered;
        self.files_loaded += o.files_loaded;
        self.files_skipped += o.files_skipped;
        self.shard_files_considered += o.shard_files_considered;
        self.bytes_loaded += o.bytes_loaded;
        self.ngram_matches += o.ngram_matches;
        self.crashes += o.crashes;
        self.duration += o.duration;
        self.wait += o.wait;
    }
}

/// One verified match, resolved to a line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineMatch {
    /// Original-case bytes of the full line (or the file name for
    /// name-only matches).
    pub line: Vec<u8>,
    pub line_start: usize,
    pub line_end: usize,
    /// 1-based.
    pub line_number: usize,
    /// Offset of the match within `line`.
    pub line_off: usize,
    pub match_length: usize,
    /// Offset of the match within the file (or name).
    pub offset: u32,
    pub score: f64,
    pub file_name: bool,
}

/// All matches within one file, scored.
#[derive(Debug, Clone, Default)]
pub struct FileMatch {
    pub score: f64,
    pub repository: String,
    pub file_name: String,
    /// Branch names this match applies to.
    pub branches: Vec<String>,
    /// Indexed version (commit) of the first matching branch.
    pub version: String,
    pub language: String,
    pub sub_repository_name: String,
    pub sub_repository_path: String,
    pub lines: Vec<LineMatch>,
    /// Full original-case content, present only with `SearchOptions::whole`.
    pub content: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub stats: Stats,
    pub files: Vec<FileMatch>,
    /// Repo name => file URL template.
    pub repo_urls: BTreeMap<String, String>,
    /// Repo name => line fragment template.
    pub line_fragments: BTreeMap<String, String>,
}

/// Sort by score, descending; stable so equal scores keep their order.
pub fn sort_files_by_score(files: &mut [FileMatch]) {
    files.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
}

pub fn sort_lines_by_score(lines: &mut [LineMatch]) {
    lines.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
}

/// Aggregate size counters for one repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoStats {
    pub documents: usize,
    pub content_bytes: u64,
    pub shards: usize,
}

impl RepoStats {
    pub fn add(&mut self, o: &RepoStats) {
        self.documents += o.documents;
        self.content_bytes += o.content_bytes;
        self.shards += o.shards;
    }
}

#[derive(Debug, Clone, Default)]
pub struct RepoListEntry {
    pub repository: Repository,
    pub index_format_version: u32,
    pub stats: RepoStats,
}

#[derive(Debug, Clone, Default)]
pub struct RepoList {
    pub repos: Vec<RepoListEntry>,
    pub crashes: usize,
}

/// Cancellation scope for one request: a cancel flag chained to the flags of
/// every ancestor context, plus an optional deadline. Cancelling a context
/// cancels its descendants but never its ancestors. Cloning shares the
/// scope.
#[derive(Debug, Clone, Default)]
pub struct SearchContext {
    /// Own flag first, ancestors after it.
    flags: Vec<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl SearchContext {
    pub fn new() -> SearchContext {
        SearchContext {
            flags: vec![Arc::new(AtomicBool::new(false))],
            deadline: None,
        }
    }

    /// Derive an independently cancellable child.
    pub fn child(&self) -> SearchContext {
        let mut flags = Vec::with_capacity(self.flags.len() + 1);
        flags.push(Arc::new(AtomicBool::new(false)));
        flags.extend(self.flags.iter().cloned());
        SearchContext {
            flags,
            deadline: self.deadline,
        }
    }

    /// Derive a child whose deadline is no later than the parent's.
    pub fn with_timeout(&self, timeout: Duration) -> SearchContext {
        let mut ctx = self.child();
        let own = Instant::now() + timeout;
        ctx.deadline = match self.deadline {
            Some(parent) if parent < own => Some(parent),
            _ => Some(own),
        };
        ctx
    }

    pub fn cancel(&self) {
        if let Some(own) = self.flags.first() {
            own.store(true, Ordering::Relaxed);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flags.iter().any(|f| f.load(Ordering::Relaxed)) {
            return true;
        }
        match self.deadline {
            Some(d) => Instant::now() >= d,
            None => false,
        }
    }
}

/// The common face of anything that can answer queries: a single shard, the
/// sharded fan-out, or a decorator wrapping either. Decorators compose by
/// containment.
pub trait Searcher: Send + Sync {
    fn search(
        &self,
        ctx: &SearchContext,
        q: &Query,
        opts: &SearchOptions,
    ) -> anyhow::Result<SearchResult>;

    fn list(&self, ctx: &SearchContext, q: &Query) -> anyhow::Result<RepoList>;

    /// Release resources; called once when the searcher is retired.
    fn close(&self) {}

    /// Identifier used in logs (typically the shard file name).
    fn ident(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_defaults() {
        let mut opts = SearchOptions::default();
        opts.set_defaults();
        assert_eq!(opts.shard_max_match_count, 100_000);
        assert_eq!(opts.total_max_match_count, 1_000_000);
        assert_eq!(opts.shard_max_important_match, 10);
        assert_eq!(opts.total_max_important_match, 100);
    }

    #[test]
    fn context_deadline_and_cancel() {
        let ctx = SearchContext::new();
        assert!(!ctx.is_cancelled());
        let child = ctx.with_timeout(Duration::from_secs(3600));
        assert!(!child.is_cancelled());
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!ctx.is_cancelled());

        let expired = ctx.with_timeout(Duration::ZERO);
        assert!(expired.is_cancelled());
    }

    #[test]
    fn cancel_propagates_to_children_only() {
        let parent = SearchContext::new();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());

        let parent = SearchContext::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn repository_json_round_trip() {
        let repo = Repository {
            name: "corpus".to_string(),
            url: "https://example.com/corpus".to_string(),
            branches: vec![RepoBranch {
                name: "main".to_string(),
                version: "deadbeef".to_string(),
            }],
            ..Default::default()
        };
        let blob = serde_json::to_vec(&repo).unwrap();
        let back: Repository = serde_json::from_slice(&blob).unwrap();
        assert_eq!(repo, back);
    }
}
