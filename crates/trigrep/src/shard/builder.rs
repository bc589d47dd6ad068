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

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt::{self, Display};
use std::io::Write;

use crate::ngram::{ngrams, split_case, NGram, NGRAM_SIZE};
use crate::types::{Document, DocumentSection, RepoBranch, Repository};

/// Hard ceiling imposed by 32-bit offsets.
const MAX_REGION: u64 = u32::MAX as u64;

/// Default point at which a shard is closed out, keeping per-shard search
/// work bounded. A parallelism knob, not a correctness limit.
pub const DEFAULT_SHARD_MAX_BYTES: u64 = 100 << 20;

/// Documents with more distinct trigrams than this are treated as non-text
/// and skipped. Heuristic; tunable because it may drop legitimate large
/// files.
pub const DEFAULT_MAX_TRIGRAM_COUNT: usize = 20_000;

/// A branch mask is a `u32`, so a shard can tell at most 32 branches apart.
pub const MAX_BRANCHES: usize = 32;

#[derive(Debug)]
pub enum BuildError {
    /// Two symbol sections of one document overlap.
    SectionsOverlap { doc: String },
    /// Adding the document would exceed the per-shard branch limit.
    TooManyBranches { doc: String, branch: String },
    /// Adding the document would push the content region past the shard
    /// ceiling; the caller should close this shard and start a new one.
    TooLarge { doc: String, size: usize },
}

impl Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::SectionsOverlap { doc } => {
                write!(f, "{}: symbol sections overlap", doc)
            }
            BuildError::TooManyBranches { doc, branch } => write!(
                f,
                "{}: branch {:?} would exceed {} branches per shard",
                doc, branch, MAX_BRANCHES
            ),
            BuildError::TooLarge { doc, size } => {
                write!(f, "{}: {} content bytes do not fit this shard", doc, size)
            }
        }
    }
}

impl Error for BuildError {}

/// NUL/control-byte sniff over the head of the buffer, plus UTF-8 validity.
pub(crate) fn is_text(buf: &[u8]) -> bool {
    if std::str::from_utf8(buf).is_err() {
        return false;
    }
    let sample = &buf[..buf.len().min(4096)];
    if sample.contains(&0) {
        return false;
    }
    let non_print = sample
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t')
        .count();
    sample.is_empty() || (non_print as f64 / sample.len() as f64) < 0.30
}

/// A stored string: case-folded bytes, the parallel case bitmap, and the
/// absolute offset of its first byte within the concatenated region.
pub(crate) struct SearchableString {
    pub data: Vec<u8>,
    pub case_bits: Vec<u8>,
    pub offset: u32,
}

impl SearchableString {
    fn new(raw: &[u8], offset: u32, postings: &mut HashMap<NGram, Vec<u32>>) -> SearchableString {
        let (data, case_bits) = split_case(raw);
        for (i, ng) in ngrams(&data).enumerate() {
            postings.entry(ng).or_default().push(offset + i as u32);
        }
        SearchableString {
            data,
            case_bits,
            offset,
        }
    }
}

/// Accumulates documents for one shard and serializes them with
/// [`ShardBuilder::finish`]. Postings stay keyed by trigram in insertion
/// order and are sorted only at write time.
pub struct ShardBuilder {
    pub(crate) repo: Repository,
    pub(crate) files: Vec<SearchableString>,
    pub(crate) file_names: Vec<SearchableString>,
    pub(crate) doc_sections: Vec<Vec<DocumentSection>>,
    pub(crate) branch_masks: Vec<u32>,
    pub(crate) sub_repo_ids: Vec<u32>,
    pub(crate) content_postings: HashMap<NGram, Vec<u32>>,
    pub(crate) name_postings: HashMap<NGram, Vec<u32>>,
    /// Branch name => bit position, in first-observation order.
    pub(crate) branch_ids: Vec<String>,
    pub(crate) sub_repo_paths: Vec<String>,
    content_end: u32,
    name_end: u32,
    shard_max_bytes: u64,
    max_trigram_count: usize,
}

impl ShardBuilder {
    pub fn new(repo: Repository) -> ShardBuilder {
        let sub_repo_paths = repo.sub_repo_map.keys().cloned().collect();
        ShardBuilder {
            repo,
            files: Vec::new(),
            file_names: Vec::new(),
            doc_sections: Vec::new(),
            branch_masks: Vec::new(),
            sub_repo_ids: Vec::new(),
            content_postings: HashMap::new(),
            name_postings: HashMap::new(),
            branch_ids: Vec::new(),
            sub_repo_paths,
            content_end: 0,
            name_end: 0,
            shard_max_bytes: DEFAULT_SHARD_MAX_BYTES,
            max_trigram_count: DEFAULT_MAX_TRIGRAM_COUNT,
        }
    }

    pub fn shard_max_bytes(mut self, n: u64) -> ShardBuilder {
        self.shard_max_bytes = n.min(MAX_REGION);
        self
    }

    pub fn max_trigram_count(mut self, n: usize) -> ShardBuilder {
        self.max_trigram_count = n;
        self
    }

    /// Register a branch name; the first registration picks its bit. Useful
    /// to pin the default branch to bit zero before adding documents.
    pub fn add_branch(&mut self, branch: &str) -> Result<u32, BuildError> {
        if let Some(pos) = self.branch_ids.iter().position(|b| b == branch) {
            return Ok(1 << pos);
        }
        if self.branch_ids.len() >= MAX_BRANCHES {
            return Err(BuildError::TooManyBranches {
                doc: String::new(),
                branch: branch.to_string(),
            });
        }
        self.branch_ids.push(branch.to_string());
        Ok(1 << (self.branch_ids.len() - 1))
    }

    /// Content and name bytes ingested so far. Names count too, so shards of
    /// many empty files still rotate.
    pub fn content_size(&self) -> u64 {
        self.content_end as u64 + self.name_end as u64
    }

    pub fn doc_count(&self) -> usize {
        self.files.len()
    }

    /// Ingest one document. Non-text content and trigram-cardinality
    /// outliers are skipped silently; structural problems are errors.
    pub fn add(&mut self, doc: Document) -> Result<(), BuildError> {
        let added = doc.content.len() as u64 + doc.name.len() as u64;
        if self.content_size() + added > self.shard_max_bytes.min(MAX_REGION) {
            return Err(BuildError::TooLarge {
                doc: doc.name,
                size: doc.content.len(),
            });
        }

        if !is_text(&doc.content) {
            return Ok(());
        }
        if doc.content.len() >= NGRAM_SIZE {
            let mut distinct: HashSet<NGram> = HashSet::new();
            for ng in ngrams(&doc.content) {
                distinct.insert(ng);
                if distinct.len() > self.max_trigram_count {
                    // Probably not text.
                    return Ok(());
                }
            }
        }

        let mut sections = doc.sections;
        sections.sort_by_key(|s| s.start);
        for w in sections.windows(2) {
            if w[0].end > w[1].start {
                return Err(BuildError::SectionsOverlap { doc: doc.name });
            }
        }

        // Every document carries at least one branch bit; branch-less
        // corpora fall back to a synthetic HEAD.
        let head = [String::from("HEAD")];
        let branches: &[String] = if doc.branches.is_empty() {
            &head
        } else {
            &doc.branches
        };
        let mut mask = 0u32;
        for br in branches {
            mask |= self.add_branch(br).map_err(|e| match e {
                BuildError::TooManyBranches { branch, .. } => BuildError::TooManyBranches {
                    doc: doc.name.clone(),
                    branch,
                },
                other => other,
            })?;
        }

        self.files.push(SearchableString::new(
            &doc.content,
            self.content_end,
            &mut self.content_postings,
        ));
        self.file_names.push(SearchableString::new(
            doc.name.as_bytes(),
            self.name_end,
            &mut self.name_postings,
        ));
        self.content_end += doc.content.len() as u32;
        self.name_end += doc.name.len() as u32;
        self.doc_sections.push(sections);
        self.branch_masks.push(mask);
        self.sub_repo_ids.push(self.sub_repo_id(&doc.name));
        Ok(())
    }

    /// Sub-repo ids are 1-based positions in the sorted path list; 0 is the
    /// outer repository.
    fn sub_repo_id(&self, name: &str) -> u32 {
        let mut best = 0u32;
        let mut best_len = 0usize;
        for (i, p) in self.sub_repo_paths.iter().enumerate() {
            if name.starts_with(p.as_str())
                && name[p.len()..].starts_with('/')
                && p.len() >= best_len
            {
                best = i as u32 + 1;
                best_len = p.len();
            }
        }
        best
    }

    /// Serialize the shard. Sections are written in declared order, then the
    /// TOC, then the TOC offset.
    pub fn finish<W: Write>(&self, w: W) -> anyhow::Result<()> {
        super::writer::write_shard(self, w)
    }

    /// The branch list for the descriptor, in bit order, versions taken from
    /// the configured repository.
    pub(crate) fn branch_list(&self) -> Vec<RepoBranch> {
        self.branch_ids
            .iter()
            .map(|name| RepoBranch {
                name: name.clone(),
                version: self
                    .repo
                    .branches
                    .iter()
                    .find(|b| &b.name == name)
                    .map(|b| b.version.clone())
                    .unwrap_or_default(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(name: &str, content: &[u8]) -> Document {
        Document {
            name: name.to_string(),
            content: content.to_vec(),
            branches: vec!["main".to_string()],
            sections: Vec::new(),
        }
    }

    #[test]
    fn postings_are_positional() {
        let mut b = ShardBuilder::new(Repository::default());
        b.add(doc("a.txt", b"abcabc")).unwrap();
        b.add(doc("b.txt", b"xabc")).unwrap();
        let posting = &b.content_postings[&NGram::from_bytes(b"abc")];
        // Offsets are absolute within the concatenated content region.
        assert_eq!(posting, &vec![0, 3, 7]);
        for offsets in b.content_postings.values() {
            assert!(offsets.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn boundary_sizes() {
        let mut b = ShardBuilder::new(Repository::default());
        b.add(doc("three", b"abc")).unwrap();
        b.add(doc("two", b"ab")).unwrap();
        // A 3-byte file yields one trigram; a 2-byte file yields none at all.
        let total: usize = b.content_postings.values().map(|v| v.len()).sum();
        assert_eq!(total, 1);
        assert_eq!(b.doc_count(), 2);
    }

    #[test]
    fn branch_limits() {
        let mut b = ShardBuilder::new(Repository::default());
        for i in 0..32 {
            b.add_branch(&format!("b{}", i)).unwrap();
        }
        assert!(matches!(
            b.add_branch("b32"),
            Err(BuildError::TooManyBranches { .. })
        ));
        // Known branches keep working at the limit.
        assert_eq!(b.add_branch("b0").unwrap(), 1);
        assert_eq!(b.add_branch("b31").unwrap(), 1 << 31);
    }

    #[test]
    fn branch_masks_accumulate() {
        let mut b = ShardBuilder::new(Repository::default());
        let mut d = doc("f", b"to carry water");
        d.branches = vec!["master".to_string(), "stable".to_string()];
        b.add(d).unwrap();
        b.add(doc("g", b"other")).unwrap(); // "main" gets bit 2
        assert_eq!(b.branch_masks, vec![0b011, 0b100]);
        assert_eq!(b.branch_ids, vec!["master", "stable", "main"]);
    }

    #[test]
    fn overlapping_sections_rejected() {
        let mut b = ShardBuilder::new(Repository::default());
        let mut d = doc("f", b"fn main() {}");
        d.sections = vec![
            DocumentSection { start: 3, end: 7 },
            DocumentSection { start: 5, end: 9 },
        ];
        assert!(matches!(
            b.add(d),
            Err(BuildError::SectionsOverlap { .. })
        ));
        assert_eq!(b.doc_count(), 0);
    }

    #[test]
    fn binary_and_outlier_documents_skipped() {
        let mut b = ShardBuilder::new(Repository::default());
        b.add(doc("bin", b"ab\x00cd")).unwrap();
        assert_eq!(b.doc_count(), 0);

        let mut b = ShardBuilder::new(Repository::default()).max_trigram_count(4);
        b.add(doc("wide", b"abcdefghij")).unwrap();
        assert_eq!(b.doc_count(), 0);
        b.add(doc("narrow", b"aaaaaaaaaa")).unwrap();
        assert_eq!(b.doc_count(), 1);
    }

    #[test]
    fn shard_rotation_signal() {
        let mut b = ShardBuilder::new(Repository::default()).shard_max_bytes(16);
        b.add(doc("a", b"0123456789")).unwrap();
        assert!(matches!(
            b.add(doc("b", b"0123456789")),
            Err(BuildError::TooLarge { .. })
        ));
        // The failed add must not have mutated the builder.
        assert_eq!(b.doc_count(), 1);
    }

    #[test]
    fn case_folding_in_region() {
        let mut b = ShardBuilder::new(Repository::default());
        b.add(doc("f", b"FoO Bar")).unwrap();
        assert_eq!(&b.files[0].data, b"foo bar");
        assert!(b
            .content_postings
            .contains_key(&NGram::from_bytes(b"foo")));
        assert!(!b.content_postings.contains_key(&NGram::from_bytes(b"FoO")));
    }
}
