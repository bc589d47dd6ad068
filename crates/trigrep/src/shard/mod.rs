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

//! On-disk shard format: builder, writer and memory-mapped reader.
//!
//! A shard is a little-endian file of sections followed by a TOC of
//! `(offset, size)` pairs and a trailing `u32` pointing at the TOC. All
//! offsets are 32-bit, capping a shard at 4 GiB. The first section is a JSON
//! repository descriptor so that any reader can identify a shard regardless
//! of format version.

pub(crate) mod codec;

mod builder;
pub use builder::{
    BuildError, ShardBuilder, DEFAULT_MAX_TRIGRAM_COUNT, DEFAULT_SHARD_MAX_BYTES, MAX_BRANCHES,
};

mod writer;

mod reader;
pub use reader::{IndexData, Shard};

mod searcher;

/// Bumped whenever the on-disk layout changes.
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// File extension of shard files in an index directory.
pub const SHARD_EXTENSION: &str = "trigrep";

/// Number of `(offset, size)` pairs in the TOC, in declared order:
/// unaryData, fileContents, caseBits, fileNames, nameCaseBits, fileSections,
/// newlines, ngramText, postings, nameNgramText, namePostings, branchMasks,
/// subRepos.
pub(crate) const SECTION_COUNT: usize = 13;

/// `<repo>_v<version>.<nnnnn>.<ext>`, e.g. `corpus_v1.00000.trigrep`.
pub fn shard_file_name(repo: &str, shard_num: usize) -> String {
    let safe: String = repo
        .chars()
        .map(|c| if c == '/' || c.is_whitespace() { '_' } else { c })
        .collect();
    format!(
        "{}_v{}.{:05}.{}",
        safe, INDEX_FORMAT_VERSION, shard_num, SHARD_EXTENSION
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_names() {
        assert_eq!(shard_file_name("corpus", 0), "corpus_v1.00000.trigrep");
        assert_eq!(
            shard_file_name("org/repo", 12),
            "org_repo_v1.00012.trigrep"
        );
    }
}
