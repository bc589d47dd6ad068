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

//! Search driver for one shard: walks the match tree over the document
//! stream, runs the staged evaluation (names, then substrings, then
//! regexes), gathers candidates and scores files.

use anyhow::{bail, Result};
use log::error;
use std::time::Instant;

use super::reader::{IndexData, Shard};
use crate::contentprovider::ContentProvider;
use crate::index::language_for_path;
use crate::matchtree::{new_match_tree, CandidateMatch, MatchTree, PostingCache};
use crate::ngram::to_original;
use crate::query::Query;
use crate::types::{
    sort_files_by_score, sort_lines_by_score, FileMatch, RepoList, RepoListEntry, RepoStats,
    Repository, SearchContext, SearchOptions, SearchResult, Searcher,
};

pub(crate) const SCORE_FACTOR_ATOM_MATCH: f64 = 400.0;
pub(crate) const SCORE_IMPORTANT_THRESHOLD: f64 = 2_000.0;

impl Searcher for Shard {
    fn search(
        &self,
        ctx: &SearchContext,
        q: &Query,
        opts: &SearchOptions,
    ) -> Result<SearchResult> {
        self.data.search(ctx, q, opts)
    }

    fn list(&self, _ctx: &SearchContext, q: &Query) -> Result<RepoList> {
        self.data.list(q)
    }

    fn ident(&self) -> String {
        self.data.shard_name().to_string()
    }
}

impl IndexData {
    pub(crate) fn search(
        &self,
        ctx: &SearchContext,
        q: &Query,
        opts: &SearchOptions,
    ) -> Result<SearchResult> {
        let started = Instant::now();
        let mut opts = opts.clone();
        opts.set_defaults();

        let mut res = SearchResult::default();
        let doc_count = self.doc_count();
        if doc_count == 0 {
            return Ok(res);
        }

        let q = self.simplify(q.clone());
        if q == Query::Const(false) {
            return Ok(res);
        }
        if opts.estimate_doc_count {
            res.stats.shard_files_considered = doc_count as usize;
            res.stats.duration = started.elapsed();
            return Ok(res);
        }

        let mut cache = PostingCache::new();
        let mut mt = new_match_tree(self, &q, &mut cache)?;

        let mut total_atoms = 0usize;
        mt.for_each_atom(&mut |leaf| {
            total_atoms += 1;
            res.stats.ngram_matches += leaf.pending_candidates();
        });

        let mut cp = ContentProvider::new(self);
        let mut important = 0usize;
        let mut last_doc: i64 = -1;
        let mut cancelled = false;

        loop {
            if !cancelled && ctx.is_cancelled() {
                cancelled = true;
            }

            let mut doc = mt.next_doc();
            if (doc as i64) <= last_doc {
                doc = (last_doc + 1) as u32;
            }
            if doc >= doc_count {
                break;
            }
            last_doc = doc as i64;

            res.stats.files_considered += 1;
            mt.prepare(doc);
            if cancelled
                || res.stats.match_count >= opts.shard_max_match_count
                || important >= opts.shard_max_important_match
            {
                res.stats.files_skipped += 1;
                continue;
            }

            cp.set_document(doc);

            let (v, sure) = mt.eval();
            if sure && !v {
                continue;
            }

            // Names are already in memory; verify those atoms first.
            self.eval_substr_atoms(&mut mt, &mut cp, &mut res, true)?;
            let (v, sure) = mt.eval();
            if sure && !v {
                continue;
            }

            self.eval_substr_atoms(&mut mt, &mut cp, &mut res, false)?;
            let (v, sure) = mt.eval();
            if sure && !v {
                continue;
            }

            self.eval_regex_atoms(&mut mt, &mut cp, &mut res)?;

            let (v, sure) = mt.eval();
            if !sure {
                error!(
                    "undecided match tree: shard {}, doc {}, query {}",
                    self.shard_name(),
                    doc,
                    q
                );
                bail!(
                    "internal error: match tree did not decide doc {} of {}",
                    doc,
                    self.shard_name()
                );
            }
            if !v {
                continue;
            }

            let mut atom_match_count = 0usize;
            mt.visit_matches(&mut |_| atom_match_count += 1);

            // Document order strictly dominates in-file ordering.
            let mut score = 10.0 * doc as f64 / doc_count as f64;
            score +=
                atom_match_count as f64 / total_atoms.max(1) as f64 * SCORE_FACTOR_ATOM_MATCH;

            let mut cands = gather_matches(&mt);
            if cands.is_empty() {
                // Only non-gathered atoms (e.g. branch restrictions)
                // matched: report the file itself.
                cands.push(CandidateMatch {
                    doc,
                    offset: self.doc_start(doc, true),
                    length: self.doc_end(doc, true) - self.doc_start(doc, true),
                    file_name: true,
                });
            }
            let mut lines = cp.fill_matches(&cands, &mut res.stats)?;

            let mut max_line_score = 0.0f64;
            let n = lines.len();
            for (i, lm) in lines.iter_mut().enumerate() {
                if lm.score > max_line_score {
                    max_line_score = lm.score;
                }
                // In-file order as a tie break below the boundary bonus.
                lm.score += 1.0 - (i as f64 / n as f64);
            }
            score += max_line_score;
            if score > SCORE_IMPORTANT_THRESHOLD {
                important += 1;
            }
            sort_lines_by_score(&mut lines);

            let file_name =
                String::from_utf8_lossy(&to_original(self.file_name(doc), self.name_case_bits(doc), 0))
                    .into_owned();
            let (sub_name, sub_path, version) = self.sub_repo_info(doc);
            let mut fm = FileMatch {
                score,
                repository: self.repo.name.clone(),
                language: language_for_path(&file_name).unwrap_or_default().to_string(),
                file_name,
                branches: gather_branches(self, &mt, doc),
                version,
                sub_repository_name: sub_name,
                sub_repository_path: sub_path,
                lines,
                content: None,
            };
            if opts.whole {
                fm.content = Some(cp.whole_original(&mut res.stats));
            }

            res.stats.match_count += fm.lines.len();
            res.stats.file_count += 1;
            res.files.push(fm);
        }

        sort_files_by_score(&mut res.files);
        add_repo(&mut res, &self.repo);
        for sub in self.repo.sub_repo_map.values() {
            add_repo(&mut res, sub);
        }
        res.stats.duration = started.elapsed();
        Ok(res)
    }

    fn eval_substr_atoms(
        &self,
        mt: &mut MatchTree<'_>,
        cp: &mut ContentProvider<'_>,
        res: &mut SearchResult,
        file_name: bool,
    ) -> Result<()> {
        let mut first_err = None;
        mt.for_each_atom_mut(&mut |leaf| {
            if let MatchTree::Substr(st) = leaf {
                if st.file_name == file_name {
                    if let Err(e) = cp.eval_content_matches(st, &mut res.stats) {
                        first_err.get_or_insert(e);
                    }
                }
            }
        });
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn eval_regex_atoms(
        &self,
        mt: &mut MatchTree<'_>,
        cp: &mut ContentProvider<'_>,
        res: &mut SearchResult,
    ) -> Result<()> {
        let mut first_err = None;
        mt.for_each_atom_mut(&mut |leaf| {
            if let MatchTree::Regex(rt) = leaf {
                if let Err(e) = cp.eval_regex_matches(rt, &mut res.stats) {
                    first_err.get_or_insert(e);
                }
            }
        });
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn sub_repo_info(&self, doc: u32) -> (String, String, String) {
        let version = self.version_for_doc(doc);
        match self.sub_repo_ids[doc as usize] {
            0 => (String::new(), String::new(), version),
            id => {
                let path = self.sub_repo_paths[id as usize].clone();
                let name = self
                    .repo
                    .sub_repo_map
                    .get(&path)
                    .map(|r| r.name.clone())
                    .unwrap_or_default();
                (name, path, version)
            }
        }
    }

    pub(crate) fn list(&self, q: &Query) -> Result<RepoList> {
        let q = self.simplify(q.clone());
        let mut list = RepoList::default();
        if q == Query::Const(true) {
            let bounds = self.boundaries(false);
            list.repos.push(RepoListEntry {
                repository: self.repo.clone(),
                index_format_version: self.index_format_version,
                stats: RepoStats {
                    documents: self.doc_count() as usize,
                    content_bytes: bounds.last().copied().unwrap_or(0) as u64,
                    shards: 1,
                },
            });
        }
        Ok(list)
    }
}

fn add_repo(res: &mut SearchResult, repo: &Repository) {
    res.repo_urls
        .insert(repo.name.clone(), repo.file_url_template.clone());
    res.line_fragments
        .insert(repo.name.clone(), repo.line_fragment_template.clone());
}

/// Collect candidates from the matched leaves. Never mixes name and content
/// matches: content wins. The result is offset-sorted and non-overlapping;
/// touching candidates fuse into their union interval.
fn gather_matches(mt: &MatchTree<'_>) -> Vec<CandidateMatch> {
    let mut cands: Vec<CandidateMatch> = Vec::new();
    mt.visit_matches(&mut |leaf| match leaf {
        MatchTree::Substr(st) => cands.extend(st.current.iter().copied()),
        MatchTree::Regex(rt) => cands.extend(rt.found.iter().copied()),
        _ => {}
    });

    if cands.iter().any(|c| !c.file_name) {
        cands.retain(|c| !c.file_name);
    }
    cands.sort_by_key(|c| c.offset);

    let mut out: Vec<CandidateMatch> = Vec::with_capacity(cands.len());
    for c in cands {
        if let Some(last) = out.last_mut() {
            let last_end = last.offset + last.length;
            if last_end >= c.offset {
                let end = c.offset + c.length;
                if end > last_end {
                    last.length = end - last.offset;
                }
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn gather_branches(d: &IndexData, mt: &MatchTree<'_>, doc: u32) -> Vec<String> {
    let mut query_mask = 0u32;
    let mut found_branch_query = false;
    mt.visit_matches(&mut |leaf| {
        if let MatchTree::Branch(b) = leaf {
            found_branch_query = true;
            query_mask |= b.mask;
        }
    });
    if found_branch_query {
        d.branch_names(query_mask)
    } else {
        d.branch_names(d.branch_masks[doc as usize])
    }
}
