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

//! Lazy access to one document during evaluation: content, case bits,
//! newline table, symbol sections. Runs the deferred verification for
//! substring candidates, executes regex atoms, and resolves matches to
//! lines.

use anyhow::Result;

use crate::matchtree::{CandidateMatch, RegexMatchTree, SubstrMatchTree};
use crate::ngram::{case_bit, to_original};
use crate::shard::IndexData;
use crate::types::{DocumentSection, LineMatch, Stats};

pub(crate) const SCORE_WORD_MATCH: f64 = 50_000.0;
pub(crate) const SCORE_PARTIAL_WORD_MATCH: f64 = 5_000.0;

pub(crate) struct ContentProvider<'a> {
    d: &'a IndexData,
    doc: u32,
    loaded_content: bool,
    newlines: Option<Vec<u32>>,
    sections: Option<Vec<DocumentSection>>,
    original: Option<Vec<u8>>,
    original_name: Option<Vec<u8>>,
}

impl<'a> ContentProvider<'a> {
    pub fn new(d: &'a IndexData) -> ContentProvider<'a> {
        ContentProvider {
            d,
            doc: 0,
            loaded_content: false,
            newlines: None,
            sections: None,
            original: None,
            original_name: None,
        }
    }

    pub fn set_document(&mut self, doc: u32) {
        self.doc = doc;
        self.loaded_content = false;
        self.newlines = None;
        self.sections = None;
        self.original = None;
        self.original_name = None;
    }

    /// Case-folded bytes of the current document (or its name).
    fn data(&mut self, file_name: bool, stats: &mut Stats) -> &'a [u8] {
        if file_name {
            return self.d.file_name(self.doc);
        }
        let content = self.d.content(self.doc);
        if !self.loaded_content {
            self.loaded_content = true;
            stats.files_loaded += 1;
            stats.bytes_loaded += content.len() as u64;
        }
        content
    }

    fn case_bits(&self, file_name: bool) -> &'a [u8] {
        if file_name {
            self.d.name_case_bits(self.doc)
        } else {
            self.d.content_case_bits(self.doc)
        }
    }

    /// Original-case bytes, reconstructed on first use.
    fn original_data(&mut self, file_name: bool, stats: &mut Stats) -> &[u8] {
        let lowered = self.data(file_name, stats);
        let bits = self.case_bits(file_name);
        let slot = if file_name {
            &mut self.original_name
        } else {
            &mut self.original
        };
        slot.get_or_insert_with(|| to_original(lowered, bits, 0))
    }

    pub fn whole_original(&mut self, stats: &mut Stats) -> Vec<u8> {
        self.original_data(false, stats).to_vec()
    }

    fn newline_table(&mut self) -> Result<&[u32]> {
        if self.newlines.is_none() {
            self.newlines = Some(self.d.newlines(self.doc)?);
        }
        Ok(self.newlines.as_deref().unwrap_or(&[]))
    }

    fn section_table(&mut self) -> Result<&[DocumentSection]> {
        if self.sections.is_none() {
            self.sections = Some(self.d.sections(self.doc)?);
        }
        Ok(self.sections.as_deref().unwrap_or(&[]))
    }

    fn in_section(sections: &[DocumentSection], rel: u32) -> bool {
        let i = sections.partition_point(|s| s.end <= rel);
        sections.get(i).is_some_and(|s| s.start <= rel)
    }

    /// Filter a substring atom's candidates down to verified matches: byte
    /// equality on the folded data, case bits when case-sensitive, and
    /// section containment for symbol atoms.
    pub fn eval_content_matches(
        &mut self,
        t: &mut SubstrMatchTree,
        stats: &mut Stats,
    ) -> Result<()> {
        let symbol_check = t.symbol_only && !t.file_name;
        if !t.covers_content || t.symbol_only {
            let start = self.d.doc_start(self.doc, t.file_name);
            let data = self.data(t.file_name, stats);
            let bits = self.case_bits(t.file_name);
            let sections: Vec<DocumentSection> = if symbol_check {
                self.section_table()?.to_vec()
            } else {
                Vec::new()
            };

            let current = std::mem::take(&mut t.current);
            t.current = current
                .into_iter()
                .filter(|c| {
                    let rel = (c.offset - start) as usize;
                    let len = c.length as usize;
                    if !t.covers_content && data[rel..rel + len] != t.pattern_lowered[..] {
                        return false;
                    }
                    if t.case_sensitive {
                        let ok = t
                            .pattern
                            .iter()
                            .enumerate()
                            .all(|(i, &p)| p.is_ascii_uppercase() == case_bit(bits, rel + i));
                        if !ok {
                            return false;
                        }
                    }
                    if symbol_check && !Self::in_section(&sections, rel as u32) {
                        return false;
                    }
                    true
                })
                .collect();
        }
        t.cont_evaluated = true;
        Ok(())
    }

    /// Run a regex atom over the current document, once.
    pub fn eval_regex_matches(&mut self, t: &mut RegexMatchTree, stats: &mut Stats) -> Result<()> {
        let doc = self.doc;
        let start = self.d.doc_start(doc, t.file_name);
        let spans: Vec<(usize, usize)> = {
            let hay = if t.case_sensitive {
                self.original_data(t.file_name, stats)
            } else {
                self.data(t.file_name, stats)
            };
            t.re
                .find_iter(hay)
                .map(|m| (m.start(), m.end()))
                .filter(|(s, e)| e > s)
                .collect()
        };
        let sections = if t.symbol_only && !t.file_name {
            self.section_table()?.to_vec()
        } else {
            Vec::new()
        };

        t.found = spans
            .into_iter()
            .filter(|&(s, _)| {
                !(t.symbol_only && !t.file_name) || Self::in_section(&sections, s as u32)
            })
            .map(|(s, e)| CandidateMatch {
                doc,
                offset: start + s as u32,
                length: (e - s) as u32,
                file_name: t.file_name,
            })
            .collect();
        t.evaluated = true;
        Ok(())
    }

    /// Resolve verified candidates to scored line matches.
    pub fn fill_matches(
        &mut self,
        cands: &[CandidateMatch],
        stats: &mut Stats,
    ) -> Result<Vec<LineMatch>> {
        let mut out = Vec::with_capacity(cands.len());
        for c in cands {
            out.push(self.fill_match(c, stats)?);
        }
        Ok(out)
    }

    fn fill_match(&mut self, c: &CandidateMatch, stats: &mut Stats) -> Result<LineMatch> {
        let start = self.d.doc_start(self.doc, c.file_name);
        let rel = (c.offset - start) as usize;
        let len = c.length as usize;

        if c.file_name {
            let name = self.original_data(true, stats).to_vec();
            let line_end = name.len();
            let mut m = LineMatch {
                line: name,
                line_start: 0,
                line_end,
                line_number: 0,
                line_off: rel,
                match_length: len,
                offset: rel as u32,
                score: 0.0,
                file_name: true,
            };
            m.score = match_score(&m);
            return Ok(m);
        }

        let data = self.data(false, stats);
        let nl = self.newline_table()?.to_vec();
        // Number of newlines strictly before the match start.
        let idx = nl.partition_point(|&n| (n as usize) < rel);
        let line_number = idx + 1;
        let line_start = if idx == 0 { 0 } else { nl[idx - 1] as usize + 1 };
        let mut k = idx;
        let mut line_end = if k < nl.len() {
            nl[k] as usize
        } else {
            data.len()
        };
        // A match spanning line terminators extends the line until it ends.
        while rel + len > line_end && line_end < data.len() {
            k += 1;
            line_end = if k < nl.len() {
                nl[k] as usize
            } else {
                data.len()
            };
        }

        let bits = self.case_bits(false);
        let mut m = LineMatch {
            line: to_original(&data[line_start..line_end], bits, line_start),
            line_start,
            line_end,
            line_number,
            line_off: rel - line_start,
            match_length: len,
            offset: rel as u32,
            score: 0.0,
            file_name: false,
        };
        m.score = match_score(&m);
        Ok(m)
    }
}

fn byte_class(b: u8) -> bool {
    b.is_ascii_alphanumeric()
}

/// Word-boundary bonus: both edges on an alphanumeric/other boundary scores
/// a full word match, one edge a partial one.
pub(crate) fn match_score(m: &LineMatch) -> f64 {
    let line = &m.line;
    let off = m.line_off;
    let end = off + m.match_length;
    if off >= line.len() || end > line.len() {
        return 0.0;
    }
    let start_boundary = off == 0 || byte_class(line[off - 1]) != byte_class(line[off]);
    let end_boundary = end > 0 && (end == line.len() || byte_class(line[end - 1]) != byte_class(line[end]));
    if start_boundary && end_boundary {
        SCORE_WORD_MATCH
    } else if start_boundary || end_boundary {
        SCORE_PARTIAL_WORD_MATCH
    } else {
        0.0
    }
}
