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

//! Regex analysis: distilling a substring pre-filter query out of a pattern,
//! and case folding patterns for the case-insensitive index.
//!
//! The distilled query matches a *superset* of the pattern; the original
//! regex is always re-run against candidate documents, so the distiller may
//! give up (returning `Const(true)`) without affecting correctness.

use anyhow::Context;
use regex_syntax::hir::{
    Capture, Class, ClassBytes, ClassBytesRange, ClassUnicode, ClassUnicodeRange, Hir, HirKind,
    Repetition,
};

use crate::ngram::lower_byte;
use crate::query::{simplify, Query};

/// Patterns shorter than this distill to `Const(true)`: the index cannot
/// narrow candidates below trigram granularity.
pub const MIN_TEXT_SIZE: usize = 3;

pub(crate) fn parse_regexp(pattern: &str) -> anyhow::Result<Hir> {
    regex_syntax::Parser::new()
        .parse(pattern)
        .with_context(|| format!("parse regex {:?}", pattern))
}

/// Compile an HIR back into an executable byte regex.
pub fn compile_bytes(h: &Hir) -> anyhow::Result<regex::bytes::Regex> {
    let pattern = h.to_string();
    regex::bytes::Regex::new(&pattern).with_context(|| format!("compile regex {:?}", pattern))
}

/// Distill a substring query matching a superset of the regex. `Substring`
/// atoms inherit the `case_sensitive` / `file_name` flags of the enclosing
/// regex query.
pub fn query_from_regexp(h: &Hir, case_sensitive: bool, file_name: bool) -> Query {
    simplify(distill(h, case_sensitive, file_name))
}

fn distill(h: &Hir, case_sensitive: bool, file_name: bool) -> Query {
    match h.kind() {
        HirKind::Literal(lit) => match std::str::from_utf8(&lit.0) {
            Ok(s) if s.len() >= MIN_TEXT_SIZE => Query::Substring {
                pattern: s.to_string(),
                case_sensitive,
                file_name,
            },
            _ => Query::Const(true),
        },
        HirKind::Capture(c) => distill(&c.sub, case_sensitive, file_name),
        HirKind::Repetition(rep) if rep.min >= 1 => distill(&rep.sub, case_sensitive, file_name),
        HirKind::Concat(subs) => Query::And(
            subs.iter()
                .map(|s| distill(s, case_sensitive, file_name))
                .filter(|q| *q != Query::Const(true))
                .collect(),
        ),
        HirKind::Alternation(subs) => Query::Or(
            subs.iter()
                .map(|s| distill(s, case_sensitive, file_name))
                .collect(),
        ),
        // Classes, looks, optional repetitions: no required text.
        _ => Query::Const(true),
    }
}

/// Rewrite a pattern for matching against case-folded text: literal A-Z are
/// lowered, inclusion classes receive the lowered image of their `[A-Z]`
/// intersection, and exclusion classes (full-range classes with interior
/// holes) have their holes mirrored into lowercase.
///
/// Shorthand classes like `\S` or `\B` keep their meaning, which is why this
/// works on the HIR instead of the pattern string.
pub fn lower_hir(h: &Hir) -> Hir {
    match h.kind() {
        HirKind::Empty => Hir::empty(),
        HirKind::Literal(lit) => {
            let lowered: Vec<u8> = lit.0.iter().map(|&b| lower_byte(b)).collect();
            Hir::literal(lowered)
        }
        HirKind::Class(Class::Unicode(cls)) => {
            Hir::class(Class::Unicode(lower_unicode_class(cls)))
        }
        HirKind::Class(Class::Bytes(cls)) => Hir::class(Class::Bytes(lower_byte_class(cls))),
        HirKind::Look(l) => Hir::look(*l),
        HirKind::Repetition(rep) => Hir::repetition(Repetition {
            min: rep.min,
            max: rep.max,
            greedy: rep.greedy,
            sub: Box::new(lower_hir(&rep.sub)),
        }),
        HirKind::Capture(c) => Hir::capture(Capture {
            index: c.index,
            name: c.name.clone(),
            sub: Box::new(lower_hir(&c.sub)),
        }),
        HirKind::Concat(subs) => Hir::concat(subs.iter().map(lower_hir).collect()),
        HirKind::Alternation(subs) => Hir::alternation(subs.iter().map(lower_hir).collect()),
    }
}

const UPPER: (u32, u32) = ('A' as u32, 'Z' as u32);
const CASE_DELTA: u32 = 'a' as u32 - 'A' as u32;

fn lower_unicode_class(cls: &ClassUnicode) -> ClassUnicode {
    let ranges: Vec<(u32, u32)> = cls
        .ranges()
        .iter()
        .map(|r| (r.start() as u32, r.end() as u32))
        .collect();
    let lowered = lower_class_ranges(&ranges, char::MAX as u32);
    ClassUnicode::new(lowered.into_iter().filter_map(|(s, e)| {
        Some(ClassUnicodeRange::new(
            char::from_u32(s)?,
            char::from_u32(e)?,
        ))
    }))
}

fn lower_byte_class(cls: &ClassBytes) -> ClassBytes {
    let ranges: Vec<(u32, u32)> = cls
        .ranges()
        .iter()
        .map(|r| (r.start() as u32, r.end() as u32))
        .collect();
    let lowered = lower_class_ranges(&ranges, 0xff);
    ClassBytes::new(
        lowered
            .into_iter()
            .map(|(s, e)| ClassBytesRange::new(s as u8, e as u8)),
    )
}

fn lower_class_ranges(ranges: &[(u32, u32)], max_point: u32) -> Vec<(u32, u32)> {
    // A class covering the full range except interior holes is treated as an
    // exclusion class: the user wrote [^...]. Its holes must keep excluding
    // both cases. Unusual half-open exclusions like [^\x00-B] are not
    // detected, matching the limits of the heuristic.
    let is_exclusion = ranges.len() >= 2
        && ranges.first().is_some_and(|r| r.0 == 0)
        && ranges.last().is_some_and(|r| r.1 == max_point);
    if is_exclusion {
        lower_exclusion_class(ranges)
    } else {
        lower_inclusion_class(ranges)
    }
}

/// `[B-H]` gains `b-h`.
fn lower_inclusion_class(ranges: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let mut out = ranges.to_vec();
    for &(s, e) in ranges {
        if s > UPPER.1 || e < UPPER.0 {
            continue;
        }
        out.push((s.max(UPPER.0) + CASE_DELTA, e.min(UPPER.1) + CASE_DELTA));
    }
    normalize_ranges(out)
}

/// `[^B-H]` (full range minus `B-H`) additionally loses `b-h`.
fn lower_exclusion_class(ranges: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let mut holes_lowered: Vec<(u32, u32)> = Vec::new();
    for w in ranges.windows(2) {
        let (hole_s, hole_e) = (w[0].1 + 1, w[1].0.wrapping_sub(1));
        if hole_s > hole_e || hole_s > UPPER.1 || hole_e < UPPER.0 {
            continue;
        }
        holes_lowered.push((
            hole_s.max(UPPER.0) + CASE_DELTA,
            hole_e.min(UPPER.1) + CASE_DELTA,
        ));
    }

    let mut out: Vec<(u32, u32)> = Vec::with_capacity(ranges.len());
    for &(mut s, e) in ranges {
        let mut pieces: Vec<(u32, u32)> = Vec::new();
        for &(hs, he) in &holes_lowered {
            if he < s || hs > e {
                continue;
            }
            if hs > s {
                pieces.push((s, hs - 1));
            }
            s = he + 1;
            if s > e {
                break;
            }
        }
        if s <= e {
            pieces.push((s, e));
        }
        out.extend(pieces);
    }
    normalize_ranges(out)
}

fn normalize_ranges(mut ranges: Vec<(u32, u32)>) -> Vec<(u32, u32)> {
    ranges.sort_unstable();
    let mut out: Vec<(u32, u32)> = Vec::with_capacity(ranges.len());
    for (s, e) in ranges {
        match out.last_mut() {
            Some(last) if s <= last.1.saturating_add(1) => last.1 = last.1.max(e),
            _ => out.push((s, e)),
        }
    }
    out
}
