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

//! The execution tree built from a normalized query against one shard.
//!
//! The tree does two jobs: it evaluates boolean combinations, and it skips
//! documents — if a pattern's trigrams intersect nowhere, no document needs
//! to be inspected. Iteration walks documents in strictly increasing id
//! order:
//!
//! - `next_doc` reports the smallest id at which a node could still match,
//! - `prepare` positions every node at a document and clears per-doc state,
//! - `eval` returns the tri-state truth; "unsure" answers become sure once
//!   the content provider has run the deferred verification for an atom.

use anyhow::Result;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::index::language_for_path;
use crate::ngram::{lower_byte, NGram, NGRAM_SIZE};
use crate::query::regexp::{compile_bytes, lower_hir, parse_regexp};
use crate::query::{query_from_regexp, Query};
use crate::shard::IndexData;

pub(crate) const NO_DOC: u32 = u32::MAX;

/// An occurrence that may still need byte/case/section verification.
/// Offsets are absolute within the shard's content (or name) region.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CandidateMatch {
    pub doc: u32,
    pub offset: u32,
    pub length: u32,
    pub file_name: bool,
}

pub(crate) struct SubstrMatchTree {
    pub pattern: Vec<u8>,
    pub pattern_lowered: Vec<u8>,
    pub case_sensitive: bool,
    pub file_name: bool,
    /// True when the trigram intersection alone proves the match (pattern is
    /// exactly one trigram, case-insensitive).
    pub covers_content: bool,
    /// Candidate starts must fall inside a symbol section.
    pub symbol_only: bool,
    cands: Vec<CandidateMatch>,
    next: usize,
    pub current: Vec<CandidateMatch>,
    pub cont_evaluated: bool,
    decided: Option<bool>,
}

pub(crate) struct RegexMatchTree {
    pub re: regex::bytes::Regex,
    pub case_sensitive: bool,
    pub file_name: bool,
    pub symbol_only: bool,
    pub found: Vec<CandidateMatch>,
    pub evaluated: bool,
    first_done: bool,
    doc_id: u32,
    decided: Option<bool>,
}

pub(crate) struct BruteForceMatchTree {
    first_done: bool,
    doc_id: u32,
}

pub(crate) struct DocMatchTree {
    docs: Vec<u32>,
    next: usize,
    current: usize,
    decided: Option<bool>,
}

pub(crate) struct BranchMatchTree<'a> {
    pub mask: u32,
    masks: &'a [u32],
    first_done: bool,
    doc_id: u32,
}

pub(crate) struct AndMatchTree<'a> {
    pub children: Vec<MatchTree<'a>>,
    decided: Option<bool>,
}

pub(crate) struct OrMatchTree<'a> {
    pub children: Vec<MatchTree<'a>>,
    decided: Option<bool>,
}

pub(crate) struct NotMatchTree<'a> {
    pub child: Box<MatchTree<'a>>,
    decided: Option<bool>,
}

pub(crate) enum MatchTree<'a> {
    Substr(SubstrMatchTree),
    Regex(RegexMatchTree),
    BruteForce(BruteForceMatchTree),
    Doc(DocMatchTree),
    Branch(BranchMatchTree<'a>),
    And(AndMatchTree<'a>),
    Or(OrMatchTree<'a>),
    Not(NotMatchTree<'a>),
    /// Participates in deciding, but its matches are never gathered (regex
    /// pre-filters, subtrees under `Not`).
    NoVisit(Box<MatchTree<'a>>),
}

impl<'a> MatchTree<'a> {
    pub fn next_doc(&self) -> u32 {
        match self {
            MatchTree::Substr(t) => t.cands.get(t.next).map_or(NO_DOC, |c| c.doc),
            MatchTree::Regex(t) => {
                if t.first_done {
                    t.doc_id + 1
                } else {
                    0
                }
            }
            MatchTree::BruteForce(t) => {
                if t.first_done {
                    t.doc_id + 1
                } else {
                    0
                }
            }
            MatchTree::Doc(t) => t.docs.get(t.next).copied().unwrap_or(NO_DOC),
            MatchTree::Branch(t) => {
                let start = if t.first_done { t.doc_id + 1 } else { 0 };
                (start..t.masks.len() as u32)
                    .find(|&d| t.masks[d as usize] & t.mask != 0)
                    .unwrap_or(NO_DOC)
            }
            MatchTree::And(t) => t.children.iter().map(|c| c.next_doc()).max().unwrap_or(0),
            MatchTree::Or(t) => t
                .children
                .iter()
                .map(|c| c.next_doc())
                .min()
                .unwrap_or(NO_DOC),
            MatchTree::Not(_) => 0,
            MatchTree::NoVisit(c) => c.next_doc(),
        }
    }

    pub fn prepare(&mut self, doc: u32) {
        match self {
            MatchTree::Substr(t) => {
                while t.next < t.cands.len() && t.cands[t.next].doc < doc {
                    t.next += 1;
                }
                let start = t.next;
                while t.next < t.cands.len() && t.cands[t.next].doc == doc {
                    t.next += 1;
                }
                t.current = t.cands[start..t.next].to_vec();
                t.cont_evaluated = false;
                t.decided = None;
            }
            MatchTree::Regex(t) => {
                t.found.clear();
                t.evaluated = false;
                t.doc_id = doc;
                t.first_done = true;
                t.decided = None;
            }
            MatchTree::BruteForce(t) => {
                t.doc_id = doc;
                t.first_done = true;
            }
            MatchTree::Doc(t) => {
                while t.next < t.docs.len() && t.docs[t.next] < doc {
                    t.next += 1;
                }
                let start = t.next;
                while t.next < t.docs.len() && t.docs[t.next] == doc {
                    t.next += 1;
                }
                t.current = t.next - start;
                t.decided = None;
            }
            MatchTree::Branch(t) => {
                t.doc_id = doc;
                t.first_done = true;
            }
            MatchTree::And(t) => {
                t.decided = None;
                for c in &mut t.children {
                    c.prepare(doc);
                }
            }
            MatchTree::Or(t) => {
                t.decided = None;
                for c in &mut t.children {
                    c.prepare(doc);
                }
            }
            MatchTree::Not(t) => {
                t.decided = None;
                t.child.prepare(doc);
            }
            MatchTree::NoVisit(c) => c.prepare(doc),
        }
    }

    fn decided(&self) -> Option<bool> {
        match self {
            MatchTree::Substr(t) => t.decided,
            MatchTree::Regex(t) => t.decided,
            MatchTree::BruteForce(_) => Some(true),
            MatchTree::Doc(t) => t.decided,
            MatchTree::Branch(t) => Some(t.masks[t.doc_id as usize] & t.mask != 0),
            MatchTree::And(t) => t.decided,
            MatchTree::Or(t) => t.decided,
            MatchTree::Not(t) => t.decided,
            MatchTree::NoVisit(c) => c.decided(),
        }
    }

    /// Tri-state evaluation with memoization of sure answers; the memo is
    /// cleared by `prepare`.
    pub fn eval(&mut self) -> (bool, bool) {
        if let Some(v) = self.decided() {
            return (v, true);
        }
        let (v, sure) = match self {
            MatchTree::Substr(t) => {
                if t.current.is_empty() {
                    (false, true)
                } else {
                    (true, t.covers_content || t.cont_evaluated)
                }
            }
            MatchTree::Regex(t) => {
                if !t.evaluated {
                    (false, false)
                } else {
                    (!t.found.is_empty(), true)
                }
            }
            MatchTree::BruteForce(_) => (true, true),
            MatchTree::Doc(t) => (t.current > 0, true),
            MatchTree::Branch(t) => (t.masks[t.doc_id as usize] & t.mask != 0, true),
            MatchTree::And(t) => {
                let mut sure = true;
                let mut verdict = (true, true);
                for c in &mut t.children {
                    let (v, ok) = c.eval();
                    if ok && !v {
                        verdict = (false, true);
                        break;
                    }
                    if !ok {
                        sure = false;
                    }
                }
                if verdict == (false, true) {
                    verdict
                } else {
                    (true, sure)
                }
            }
            MatchTree::Or(t) => {
                // No short-circuit: every decided child doubles as a
                // ranking signal for atom counting.
                let mut matched = false;
                let mut sure = true;
                for c in &mut t.children {
                    let (v, ok) = c.eval();
                    if ok {
                        matched = matched || v;
                    } else {
                        sure = false;
                    }
                }
                (matched, sure)
            }
            MatchTree::Not(t) => {
                let (v, ok) = t.child.eval();
                (!v, ok)
            }
            MatchTree::NoVisit(c) => return c.eval(),
        };
        if sure {
            match self {
                MatchTree::Substr(t) => t.decided = Some(v),
                MatchTree::Regex(t) => t.decided = Some(v),
                MatchTree::Doc(t) => t.decided = Some(v),
                MatchTree::And(t) => t.decided = Some(v),
                MatchTree::Or(t) => t.decided = Some(v),
                MatchTree::Not(t) => t.decided = Some(v),
                _ => {}
            }
        }
        (v, sure)
    }

    /// Apply `f` to every leaf, including those under `Not` / `NoVisit`.
    pub fn for_each_atom_mut(&mut self, f: &mut impl FnMut(&mut MatchTree<'a>)) {
        match self {
            MatchTree::And(t) => {
                for c in &mut t.children {
                    c.for_each_atom_mut(f);
                }
            }
            MatchTree::Or(t) => {
                for c in &mut t.children {
                    c.for_each_atom_mut(f);
                }
            }
            MatchTree::Not(t) => t.child.for_each_atom_mut(f),
            MatchTree::NoVisit(c) => c.for_each_atom_mut(f),
            leaf => f(leaf),
        }
    }

    pub fn for_each_atom(&self, f: &mut impl FnMut(&MatchTree<'a>)) {
        match self {
            MatchTree::And(t) => {
                for c in &t.children {
                    c.for_each_atom(f);
                }
            }
            MatchTree::Or(t) => {
                for c in &t.children {
                    c.for_each_atom(f);
                }
            }
            MatchTree::Not(t) => t.child.for_each_atom(f),
            MatchTree::NoVisit(c) => c.for_each_atom(f),
            leaf => f(leaf),
        }
    }

    /// Visit the leaves that contributed to a positive verdict. Negated and
    /// no-visit subtrees never contribute matches.
    pub fn visit_matches(&self, f: &mut impl FnMut(&MatchTree<'a>)) {
        match self {
            MatchTree::And(t) => {
                for c in &t.children {
                    if c.decided() == Some(true) {
                        c.visit_matches(f);
                    }
                }
            }
            MatchTree::Or(t) => {
                for c in &t.children {
                    if c.decided() == Some(true) {
                        c.visit_matches(f);
                    }
                }
            }
            MatchTree::Not(_) | MatchTree::NoVisit(_) => {}
            leaf => f(leaf),
        }
    }

    /// Total candidate count before any per-document consumption.
    pub fn pending_candidates(&self) -> usize {
        match self {
            MatchTree::Substr(t) => t.cands.len(),
            _ => 0,
        }
    }
}

/// Per-request cache of decoded posting lists, dropped when the request
/// ends. Queries with repeated atoms (or a shared first/last trigram) decode
/// each posting once.
pub(crate) struct PostingCache {
    lru: LruCache<(NGram, bool), Arc<Vec<u32>>>,
}

impl PostingCache {
    pub fn new() -> PostingCache {
        PostingCache {
            lru: LruCache::new(NonZeroUsize::new(256).expect("nonzero")),
        }
    }

    fn postings(&mut self, d: &IndexData, ng: NGram, file_name: bool) -> Result<Arc<Vec<u32>>> {
        if let Some(hit) = self.lru.get(&(ng, file_name)) {
            return Ok(hit.clone());
        }
        let decoded = Arc::new(d.postings(ng, file_name)?);
        self.lru.put((ng, file_name), decoded.clone());
        Ok(decoded)
    }
}

/// Build the execution tree for a query that has already been simplified
/// against this shard.
pub(crate) fn new_match_tree<'a>(
    d: &'a IndexData,
    q: &Query,
    cache: &mut PostingCache,
) -> Result<MatchTree<'a>> {
    build(d, q, cache, false)
}

fn build<'a>(
    d: &'a IndexData,
    q: &Query,
    cache: &mut PostingCache,
    symbol_only: bool,
) -> Result<MatchTree<'a>> {
    match q {
        Query::And(children) => Ok(MatchTree::And(AndMatchTree {
            children: children
                .iter()
                .map(|c| build(d, c, cache, symbol_only))
                .collect::<Result<_>>()?,
            decided: None,
        })),
        Query::Or(children) => Ok(MatchTree::Or(OrMatchTree {
            children: children
                .iter()
                .map(|c| build(d, c, cache, symbol_only))
                .collect::<Result<_>>()?,
            decided: None,
        })),
        Query::Not(child) => Ok(MatchTree::Not(NotMatchTree {
            child: Box::new(build(d, child, cache, symbol_only)?),
            decided: None,
        })),
        Query::Const(true) => Ok(brute_force()),
        Query::Const(false) => Ok(no_docs()),
        Query::Repo(pattern) => {
            if d.repo.name.contains(pattern.as_str()) {
                Ok(brute_force())
            } else {
                Ok(no_docs())
            }
        }
        Query::Branch(name) => match d.branch_bit(name) {
            Some(bit) => Ok(MatchTree::Branch(BranchMatchTree {
                mask: bit,
                masks: &d.branch_masks,
                first_done: false,
                doc_id: 0,
            })),
            None => Ok(no_docs()),
        },
        Query::Language(lang) => {
            let docs = (0..d.doc_count())
                .filter(|&doc| {
                    language_for_path(&String::from_utf8_lossy(d.file_name(doc)))
                        .is_some_and(|l| l == lang.as_str())
                })
                .collect();
            Ok(MatchTree::Doc(DocMatchTree {
                docs,
                next: 0,
                current: 0,
                decided: None,
            }))
        }
        Query::Symbol(inner) => build(d, inner, cache, true),
        Query::Substring {
            pattern,
            case_sensitive,
            file_name,
        } => new_substring_tree(d, pattern, *case_sensitive, *file_name, symbol_only, cache),
        Query::Regexp {
            pattern,
            case_sensitive,
            file_name,
        } => {
            let hir = parse_regexp(pattern)?;
            let re = if *case_sensitive {
                compile_bytes(&hir)?
            } else {
                compile_bytes(&lower_hir(&hir))?
            };
            let node = MatchTree::Regex(RegexMatchTree {
                re,
                case_sensitive: *case_sensitive,
                file_name: *file_name,
                symbol_only,
                found: Vec::new(),
                evaluated: false,
                first_done: false,
                doc_id: 0,
                decided: None,
            });
            let prefilter = query_from_regexp(&hir, *case_sensitive, *file_name);
            if prefilter == Query::Const(true) {
                Ok(node)
            } else {
                Ok(MatchTree::And(AndMatchTree {
                    children: vec![
                        MatchTree::NoVisit(Box::new(build(d, &prefilter, cache, symbol_only)?)),
                        node,
                    ],
                    decided: None,
                }))
            }
        }
    }
}

fn brute_force<'a>() -> MatchTree<'a> {
    MatchTree::BruteForce(BruteForceMatchTree {
        first_done: false,
        doc_id: 0,
    })
}

fn no_docs<'a>() -> MatchTree<'a> {
    MatchTree::Doc(DocMatchTree {
        docs: Vec::new(),
        next: 0,
        current: 0,
        decided: None,
    })
}

fn new_substring_tree<'a>(
    d: &'a IndexData,
    pattern: &str,
    case_sensitive: bool,
    file_name: bool,
    symbol_only: bool,
    cache: &mut PostingCache,
) -> Result<MatchTree<'a>> {
    let raw = pattern.as_bytes().to_vec();
    let lowered: Vec<u8> = raw.iter().map(|&b| lower_byte(b)).collect();

    if raw.len() < NGRAM_SIZE {
        // Nothing to anchor in the index; verify with a scan per document.
        let escaped = regex::escape(pattern);
        let hir = parse_regexp(&escaped)?;
        let re = if case_sensitive {
            compile_bytes(&hir)?
        } else {
            compile_bytes(&lower_hir(&hir))?
        };
        return Ok(MatchTree::Regex(RegexMatchTree {
            re,
            case_sensitive,
            file_name,
            symbol_only,
            found: Vec::new(),
            evaluated: false,
            first_done: false,
            doc_id: 0,
            decided: None,
        }));
    }

    let first = NGram::from_bytes(&lowered[..NGRAM_SIZE]);
    let last = NGram::from_bytes(&lowered[lowered.len() - NGRAM_SIZE..]);
    let first_posting = cache.postings(d, first, file_name)?;

    let distance = (lowered.len() - NGRAM_SIZE) as u32;
    let offsets: Vec<u32> = if distance == 0 {
        first_posting.to_vec()
    } else {
        let last_posting = cache.postings(d, last, file_name)?;
        intersect_at_distance(&first_posting, &last_posting, distance)
    };

    let len = lowered.len() as u32;
    let mut cands = Vec::with_capacity(offsets.len());
    for off in offsets {
        let doc = d.doc_for_offset(off, file_name);
        if off + len > d.doc_end(doc, file_name) {
            // Spans a file boundary; an artifact of the concatenated region.
            continue;
        }
        cands.push(CandidateMatch {
            doc,
            offset: off,
            length: len,
            file_name,
        });
    }

    Ok(MatchTree::Substr(SubstrMatchTree {
        covers_content: lowered.len() == NGRAM_SIZE && !case_sensitive,
        pattern: raw,
        pattern_lowered: lowered,
        case_sensitive,
        file_name,
        symbol_only,
        cands,
        next: 0,
        current: Vec::new(),
        cont_evaluated: false,
        decided: None,
    }))
}

/// Offsets in `first` with a partner in `last` exactly `distance` ahead.
/// Both inputs are sorted; the scan is linear.
fn intersect_at_distance(first: &[u32], last: &[u32], distance: u32) -> Vec<u32> {
    let mut out = Vec::new();
    let mut j = 0usize;
    for &f in first {
        let want = match f.checked_add(distance) {
            Some(w) => w,
            None => break,
        };
        while j < last.len() && last[j] < want {
            j += 1;
        }
        if j == last.len() {
            break;
        }
        if last[j] == want {
            out.push(f);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::{Shard, ShardBuilder};
    use crate::types::{Document, Repository};

    fn shard(docs: &[(&str, &[u8])]) -> Shard {
        let mut b = ShardBuilder::new(Repository {
            name: "corpus".to_string(),
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
        Shard::from_bytes("t", blob).unwrap()
    }

    fn substring_candidates(s: &Shard, pattern: &str) -> Vec<(u32, u32)> {
        let mut cache = PostingCache::new();
        let mt = new_match_tree(&s.data, &Query::substring(pattern), &mut cache).unwrap();
        match mt {
            MatchTree::Substr(t) => t.cands.iter().map(|c| (c.doc, c.offset)).collect(),
            _ => panic!("expected substring tree"),
        }
    }

    #[test]
    fn trigram_intersection_at_distance() {
        let s = shard(&[
            ("a", b"needle in haystack, another needle"),
            ("b", b"no nee here, and no dle either"),
        ]);
        assert_eq!(substring_candidates(&s, "needle"), vec![(0, 0), (0, 28)]);
    }

    #[test]
    fn candidates_do_not_span_documents() {
        // "endst" would appear if doc 0's tail fused with doc 1's head.
        let s = shard(&[("a", b"the end"), ("b", b"start here")]);
        assert!(substring_candidates(&s, "endstart").is_empty());
        assert!(substring_candidates(&s, "ndsta").is_empty());
    }

    #[test]
    fn iteration_order_and_skipping() {
        let s = shard(&[("a", b"xxx"), ("b", b"needle body"), ("c", b"xxx")]);
        let mut cache = PostingCache::new();
        let mut mt = new_match_tree(&s.data, &Query::substring("needle"), &mut cache).unwrap();
        assert_eq!(mt.next_doc(), 1);
        mt.prepare(1);
        let (v, sure) = mt.eval();
        assert!(v);
        // One-trigram-plus patterns still need content verification.
        assert!(!sure);
        assert_eq!(mt.next_doc(), NO_DOC);
    }

    #[test]
    fn and_takes_max_or_takes_min() {
        let s = shard(&[
            ("a", b"alpha only"),
            ("b", b"alpha and beta"),
            ("c", b"beta only"),
        ]);
        let mut cache = PostingCache::new();
        let q = Query::And(vec![Query::substring("alpha"), Query::substring("beta")]);
        let mt = new_match_tree(&s.data, &q, &mut cache).unwrap();
        assert_eq!(mt.next_doc(), 1);

        let q = Query::Or(vec![Query::substring("alpha"), Query::substring("beta")]);
        let mt = new_match_tree(&s.data, &q, &mut cache).unwrap();
        assert_eq!(mt.next_doc(), 0);
    }

    #[test]
    fn unknown_branch_matches_nothing() {
        let s = shard(&[("a", b"contents")]);
        let mut cache = PostingCache::new();
        let mt = new_match_tree(&s.data, &Query::Branch("release".into()), &mut cache).unwrap();
        assert_eq!(mt.next_doc(), NO_DOC);

        let mt = new_match_tree(&s.data, &Query::Branch("main".into()), &mut cache).unwrap();
        assert_eq!(mt.next_doc(), 0);
    }

    #[test]
    fn short_pattern_falls_back_to_scan() {
        let s = shard(&[("a", b"ab ab")]);
        let mut cache = PostingCache::new();
        let mt = new_match_tree(&s.data, &Query::substring("ab"), &mut cache).unwrap();
        assert!(matches!(mt, MatchTree::Regex(_)));
        // Brute-force iteration visits every document.
        assert_eq!(mt.next_doc(), 0);
    }
}
