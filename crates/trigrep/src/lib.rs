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

//! Positional-trigram code search engine.
//!
//! Shards are immutable index files holding trigram postings (absolute byte
//! offsets into a concatenated, case-folded content region), per-file branch
//! bitmasks, newline tables and a JSON repository descriptor. They are built
//! with [`ShardBuilder`], opened read-only (memory-mapped) with
//! [`Shard::open`] and served by [`ShardedSearcher`] /
//! [`DirectorySearcher`].

pub mod index;
pub mod ngram;
pub mod query;
pub mod shard;
pub mod shards;
pub mod types;

mod contentprovider;
mod matchtree;

pub use crate::index::CorpusBuilder;
pub use crate::query::Query;
pub use crate::shard::{BuildError, Shard, ShardBuilder};
pub use crate::shards::{DirectorySearcher, ShardLoadEvent, ShardWatcher, ShardedSearcher};
pub use crate::types::{
    Document, DocumentSection, FileMatch, LineMatch, RepoList, Repository, SearchContext,
    SearchOptions, SearchResult, Searcher, Stats,
};
