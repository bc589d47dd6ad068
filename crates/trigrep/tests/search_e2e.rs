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

//! End-to-end search behavior over in-memory shards.

use trigrep::{
    Document, DocumentSection, Query, Repository, SearchContext, SearchOptions, SearchResult,
    Searcher, Shard, ShardBuilder,
};

fn build_shard(docs: Vec<Document>) -> Shard {
    let mut b = ShardBuilder::new(Repository {
        name: "corpus".to_string(),
        file_url_template: "https://example.com/{{.Path}}".to_string(),
        line_fragment_template: "#L{{.LineNumber}}".to_string(),
        ..Default::default()
    });
    for d in docs {
        b.add(d).unwrap();
    }
    let mut blob = Vec::new();
    b.finish(&mut blob).unwrap();
    Shard::from_bytes("test-shard", blob).unwrap()
}

fn doc(name: &str, content: &[u8]) -> Document {
    Document {
        name: name.to_string(),
        content: content.to_vec(),
        branches: vec!["master".to_string()],
        sections: Vec::new(),
    }
}

fn search(shard: &Shard, query: &str) -> SearchResult {
    let q = Query::parse(query).unwrap();
    shard
        .search(&SearchContext::new(), &q, &SearchOptions::default())
        .unwrap()
}

#[test]
fn single_file_substring() {
    let shard = build_shard(vec![doc("f.txt", b"to carry water in the no later bla")]);
    let res = search(&shard, "water");

    assert_eq!(res.files.len(), 1);
    let f = &res.files[0];
    assert_eq!(f.file_name, "f.txt");
    assert_eq!(f.repository, "corpus");
    assert_eq!(f.lines.len(), 1);
    let l = &f.lines[0];
    assert_eq!(l.line_number, 1);
    assert_eq!(l.line_off, 9);
    assert_eq!(l.match_length, 5);
    assert_eq!(l.line, b"to carry water in the no later bla".to_vec());
    assert_eq!(res.stats.match_count, 1);
    assert_eq!(res.stats.file_count, 1);
}

#[test]
fn regex_with_distillation() {
    let shard = build_shard(vec![
        doc("a.c", b"int PathFragment = /usr/local/bin;"),
        doc("b.c", b"int Path = /tmp;"),
    ]);
    let res = search(&shard, "(Path|PathFragment).*=.*/usr/local");

    assert_eq!(res.files.len(), 1);
    assert_eq!(res.files[0].file_name, "a.c");
    assert!(!res.files[0].lines.is_empty());
}

#[test]
fn case_insensitive_and_sensitive() {
    let shard = build_shard(vec![doc("f", b"FoO Bar")]);

    let res = search(&shard, "foo");
    assert_eq!(res.files.len(), 1);
    let l = &res.files[0].lines[0];
    assert_eq!((l.offset, l.match_length), (0, 3));
    // The line is reported in its original case.
    assert_eq!(l.line, b"FoO Bar".to_vec());

    let res = search(&shard, "case:yes foo");
    assert_eq!(res.files.len(), 0);

    let res = search(&shard, "case:yes FoO");
    assert_eq!(res.files.len(), 1);
}

#[test]
fn branch_restriction() {
    let shard = build_shard(vec![Document {
        name: "f.txt".to_string(),
        content: b"to carry water in the no later bla".to_vec(),
        branches: vec!["master".to_string(), "stable".to_string()],
        sections: Vec::new(),
    }]);

    let res = search(&shard, "water branch:stable");
    assert_eq!(res.files.len(), 1);
    assert_eq!(res.files[0].branches, vec!["stable".to_string()]);

    let res = search(&shard, "water branch:release");
    assert_eq!(res.files.len(), 0);

    // Without a branch restriction, all branches of the file are reported.
    let res = search(&shard, "water");
    assert_eq!(
        res.files[0].branches,
        vec!["master".to_string(), "stable".to_string()]
    );
}

#[test]
fn substring_positions_are_exhaustive() {
    // No false negatives for patterns of length >= 3, across every
    // occurrence and file.
    let contents: Vec<(String, Vec<u8>)> = (0..20)
        .map(|i| {
            (
                format!("file{}.txt", i),
                format!("prefix needle {} needle suffix needleneedle\n", i).into_bytes(),
            )
        })
        .collect();
    let shard = build_shard(
        contents
            .iter()
            .map(|(n, c)| doc(n, c))
            .collect(),
    );
    let res = search(&shard, "needle");

    assert_eq!(res.files.len(), 20);
    let total: usize = res.files.iter().map(|f| f.lines.len()).sum();
    // Adjacent occurrences fuse into one non-overlapping interval.
    for f in &res.files {
        assert_eq!(f.lines.len(), 3);
    }
    assert_eq!(total, 60);
}

#[test]
fn short_patterns_brute_force() {
    let shard = build_shard(vec![doc("a", b"ababab"), doc("b", b"zzz")]);
    let res = search(&shard, "ab");
    assert_eq!(res.files.len(), 1);
    assert_eq!(res.files[0].file_name, "a");
    assert_eq!(res.files[0].lines.len(), 1);
    assert_eq!(res.stats.files_considered, 2);
}

#[test]
fn regex_matches_equal_find_all() {
    let content = b"wa water waater waaterr\nwater again water";
    let shard = build_shard(vec![doc("f", content)]);
    let q = Query::parse("wa+ter").unwrap();
    let res = shard
        .search(&SearchContext::new(), &q, &SearchOptions::default())
        .unwrap();

    let re = regex::bytes::Regex::new("wa+ter").unwrap();
    let expect: Vec<(usize, usize)> = re
        .find_iter(content)
        .map(|m| (m.start(), m.end() - m.start()))
        .collect();
    let mut got: Vec<(usize, usize)> = res.files[0]
        .lines
        .iter()
        .map(|l| {
            (
                l.line_start + l.line_off,
                l.match_length,
            )
        })
        .collect();
    got.sort_unstable();
    assert_eq!(got, expect);
}

#[test]
fn file_name_matches() {
    let shard = build_shard(vec![
        doc("src/water.rs", b"fn main() {}"),
        doc("src/fire.rs", b"fn main() {}"),
    ]);
    let res = search(&shard, "file:water");
    assert_eq!(res.files.len(), 1);
    assert_eq!(res.files[0].file_name, "src/water.rs");
    assert!(res.files[0].lines[0].file_name);
}

#[test]
fn content_beats_file_name() {
    // When both the name and the content match, only content matches are
    // reported.
    let shard = build_shard(vec![doc("water.txt", b"fresh water here")]);
    let q = Query::Or(vec![
        Query::Substring {
            pattern: "water".to_string(),
            case_sensitive: false,
            file_name: true,
        },
        Query::substring("water"),
    ]);
    let res = shard
        .search(&SearchContext::new(), &q, &SearchOptions::default())
        .unwrap();
    assert_eq!(res.files.len(), 1);
    assert_eq!(res.files[0].lines.len(), 1);
    assert!(res.files[0].lines.iter().all(|l| !l.file_name));
}

#[test]
fn negation() {
    let shard = build_shard(vec![
        doc("a", b"alpha beta"),
        doc("b", b"alpha gamma"),
    ]);
    let res = search(&shard, "alpha -beta");
    assert_eq!(res.files.len(), 1);
    assert_eq!(res.files[0].file_name, "b");
}

#[test]
fn language_filter() {
    let shard = build_shard(vec![
        doc("main.rs", b"let water = 1;"),
        doc("main.py", b"water = 1"),
    ]);
    let res = search(&shard, "water lang:rust");
    assert_eq!(res.files.len(), 1);
    assert_eq!(res.files[0].file_name, "main.rs");
    assert_eq!(res.files[0].language, "rust");
}

#[test]
fn symbol_restriction() {
    let content = b"fn water_pump() {}\n// just a water comment\n";
    let pump = content
        .windows(10)
        .position(|w| w == b"water_pump")
        .unwrap() as u32;
    let shard = build_shard(vec![Document {
        name: "m.rs".to_string(),
        content: content.to_vec(),
        branches: vec!["master".to_string()],
        sections: vec![DocumentSection {
            start: pump,
            end: pump + 10,
        }],
    }]);

    let res = search(&shard, "sym:water");
    assert_eq!(res.files.len(), 1);
    assert_eq!(res.files[0].lines.len(), 1);
    assert_eq!(res.files[0].lines[0].line_number, 1);

    // The same pattern without sym: also hits the comment line.
    let res = search(&shard, "water");
    assert_eq!(res.files[0].lines.len(), 2);
}

#[test]
fn whole_and_estimate() {
    let shard = build_shard(vec![doc("f", b"Water line\nsecond\n")]);

    let q = Query::parse("water").unwrap();
    let mut opts = SearchOptions {
        whole: true,
        ..Default::default()
    };
    let res = shard.search(&SearchContext::new(), &q, &opts).unwrap();
    assert_eq!(
        res.files[0].content.as_deref(),
        Some(b"Water line\nsecond\n".as_slice())
    );

    opts.whole = false;
    opts.estimate_doc_count = true;
    let res = shard.search(&SearchContext::new(), &q, &opts).unwrap();
    assert!(res.files.is_empty());
    assert_eq!(res.stats.shard_files_considered, 1);
}

#[test]
fn repo_filter_and_list() {
    let shard = build_shard(vec![doc("f", b"water")]);

    let res = search(&shard, "water repo:corp");
    assert_eq!(res.files.len(), 1);
    let res = search(&shard, "water repo:unrelated");
    assert_eq!(res.files.len(), 0);

    let list = shard
        .list(&SearchContext::new(), &Query::parse("repo:corp").unwrap())
        .unwrap();
    assert_eq!(list.repos.len(), 1);
    assert_eq!(list.repos[0].repository.name, "corpus");
    assert_eq!(list.repos[0].stats.documents, 1);

    let list = shard
        .list(&SearchContext::new(), &Query::parse("repo:nope").unwrap())
        .unwrap();
    assert!(list.repos.is_empty());
}

#[test]
fn match_cap_skips_files() {
    let docs: Vec<Document> = (0..100)
        .map(|i| doc(&format!("f{}", i), b"one water line\n"))
        .collect();
    let shard = build_shard(docs);
    let q = Query::parse("water").unwrap();
    let opts = SearchOptions {
        shard_max_match_count: 10,
        ..Default::default()
    };
    let res = shard.search(&SearchContext::new(), &q, &opts).unwrap();
    assert_eq!(res.stats.match_count, 10);
    assert!(res.stats.files_skipped > 0);
    assert_eq!(
        res.stats.files_skipped + res.files.len(),
        100,
        "every document is either matched or accounted as skipped"
    );
}

#[test]
fn result_urls_are_reported() {
    let shard = build_shard(vec![doc("f", b"water")]);
    let res = search(&shard, "water");
    assert_eq!(
        res.repo_urls.get("corpus").map(String::as_str),
        Some("https://example.com/{{.Path}}")
    );
    assert_eq!(
        res.line_fragments.get("corpus").map(String::as_str),
        Some("#L{{.LineNumber}}")
    );
}

#[test]
fn multiline_match_extends_line() {
    let shard = build_shard(vec![doc("f", b"first line\nsecond line\nthird\n")]);
    let q = Query::parse("line.second").unwrap();
    let res = shard
        .search(&SearchContext::new(), &q, &SearchOptions::default())
        .unwrap();
    // `.` does not cross newlines; use an explicit class instead.
    assert_eq!(res.files.len(), 0);

    let q = Query::parse("line[\\n]second").unwrap();
    let res = shard
        .search(&SearchContext::new(), &q, &SearchOptions::default())
        .unwrap();
    assert_eq!(res.files.len(), 1);
    let l = &res.files[0].lines[0];
    assert_eq!(l.line_number, 1);
    // The line window is extended to cover the whole match.
    assert_eq!(l.line, b"first line\nsecond line".to_vec());
}
