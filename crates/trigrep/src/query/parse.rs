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

use std::error::Error;
use std::fmt::{self, Display};

use super::ast::{map, simplify, Query};

/// Typed errors for the query surface syntax.
#[derive(Debug)]
pub enum QueryError {
    /// A regex atom failed to parse.
    InvalidRegex(String, String),
    /// A `key:` token with an empty value.
    EmptyField(String),
}

impl Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::InvalidRegex(pat, err) => write!(f, "invalid regex {:?}: {}", pat, err),
            QueryError::EmptyField(key) => write!(f, "empty value for {}:", key),
        }
    }
}

impl Error for QueryError {}

fn looks_like_regex(s: &str) -> bool {
    s.bytes().any(|b| {
        matches!(
            b,
            b'[' | b']' | b'(' | b')' | b'|' | b'?' | b'+' | b'*' | b'^' | b'$' | b'\\' | b'{'
        )
    })
}

// Split on whitespace, honoring single and double quotes.
fn tokenize(input: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();
    let mut in_s = false;
    let mut in_d = false;
    for ch in input.chars() {
        match ch {
            '\'' if !in_d => in_s = !in_s,
            '"' if !in_s => in_d = !in_d,
            c if c.is_whitespace() && !in_s && !in_d => {
                if !buf.is_empty() {
                    out.push(std::mem::take(&mut buf));
                }
            }
            c => buf.push(c),
        }
    }
    if !buf.is_empty() {
        out.push(buf);
    }
    out
}

impl Query {
    /// Parse the whitespace-separated surface syntax:
    /// bare tokens match content (substring, or regex when metacharacters are
    /// present), `repo:` / `branch:` / `lang:` / `file:` / `sym:` restrict,
    /// `case:yes` makes pattern atoms case sensitive, and a leading `-`
    /// negates a single atom. Quotes group words into one pattern.
    pub fn parse(input: &str) -> Result<Query, QueryError> {
        let mut atoms: Vec<Query> = Vec::new();
        let mut case_sensitive = false;

        for tok in tokenize(input) {
            let (negated, tok) = match tok.strip_prefix('-') {
                Some(rest) if !rest.is_empty() => (true, rest.to_string()),
                _ => (false, tok),
            };

            let atom = match tok.split_once(':') {
                Some((k @ ("repo" | "branch" | "lang" | "file" | "sym" | "case"), "")) => {
                    return Err(QueryError::EmptyField(k.to_string()))
                }
                Some(("repo", v)) => Query::Repo(v.to_string()),
                Some(("branch", v)) => Query::Branch(v.to_string()),
                Some(("lang", v)) => Query::Language(v.to_lowercase()),
                Some(("file", v)) => pattern_atom(v, true)?,
                Some(("sym", v)) => Query::Symbol(Box::new(pattern_atom(v, false)?)),
                Some(("case", v)) => {
                    case_sensitive = matches!(v, "yes" | "true" | "sensitive");
                    continue;
                }
                _ => pattern_atom(&tok, false)?,
            };

            atoms.push(if negated {
                Query::Not(Box::new(atom))
            } else {
                atom
            });
        }

        let q = Query::And(atoms);
        let q = if case_sensitive {
            map(q, &|node| match node {
                Query::Substring {
                    pattern, file_name, ..
                } => Query::Substring {
                    pattern,
                    case_sensitive: true,
                    file_name,
                },
                Query::Regexp {
                    pattern, file_name, ..
                } => Query::Regexp {
                    pattern,
                    case_sensitive: true,
                    file_name,
                },
                other => other,
            })
        } else {
            q
        };
        Ok(simplify(q))
    }
}

fn pattern_atom(pattern: &str, file_name: bool) -> Result<Query, QueryError> {
    if looks_like_regex(pattern) {
        if let Err(e) = regex_syntax::Parser::new().parse(pattern) {
            return Err(QueryError::InvalidRegex(pattern.to_string(), e.to_string()));
        }
        Ok(Query::Regexp {
            pattern: pattern.to_string(),
            case_sensitive: false,
            file_name,
        })
    } else {
        Ok(Query::Substring {
            pattern: pattern.to_string(),
            case_sensitive: false,
            file_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_tokens_and_filters() {
        let q = Query::parse("water branch:stable").unwrap();
        assert_eq!(
            q,
            Query::And(vec![
                Query::substring("water"),
                Query::Branch("stable".to_string()),
            ])
        );
    }

    #[test]
    fn regex_detection() {
        let q = Query::parse("wat.*er").unwrap();
        assert_eq!(q, Query::regexp("wat.*er"));
    }

    #[test]
    fn case_flag_applies_to_patterns() {
        let q = Query::parse("case:yes Water file:Main").unwrap();
        assert_eq!(
            q,
            Query::And(vec![
                Query::Substring {
                    pattern: "Water".to_string(),
                    case_sensitive: true,
                    file_name: false,
                },
                Query::Substring {
                    pattern: "Main".to_string(),
                    case_sensitive: true,
                    file_name: true,
                },
            ])
        );
    }

    #[test]
    fn negation_and_quotes() {
        let q = Query::parse("\"hello world\" -repo:vendor").unwrap();
        assert_eq!(
            q,
            Query::And(vec![
                Query::substring("hello world"),
                Query::Not(Box::new(Query::Repo("vendor".to_string()))),
            ])
        );
    }

    #[test]
    fn symbol_atom() {
        let q = Query::parse("sym:main").unwrap();
        assert_eq!(q, Query::Symbol(Box::new(Query::substring("main"))));
    }

    #[test]
    fn errors() {
        assert!(matches!(
            Query::parse("repo:"),
            Err(QueryError::EmptyField(_))
        ));
        assert!(matches!(
            Query::parse("fo[o"),
            Err(QueryError::InvalidRegex(..))
        ));
    }

    #[test]
    fn empty_input_matches_everything() {
        assert_eq!(Query::parse("").unwrap(), Query::Const(true));
    }
}
