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

use std::fmt;

/// A boolean search expression. Queries are transient per request; shards
/// partially evaluate them (`Repo` leaves become constants) before building
/// an execution tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    And(Vec<Query>),
    Or(Vec<Query>),
    Not(Box<Query>),
    Const(bool),
    Substring {
        pattern: String,
        case_sensitive: bool,
        file_name: bool,
    },
    Regexp {
        pattern: String,
        case_sensitive: bool,
        file_name: bool,
    },
    /// Substring match against the repository name.
    Repo(String),
    /// Restrict to documents on the named branch.
    Branch(String),
    /// Restrict to documents whose file name maps to this language.
    Language(String),
    /// Restrict the inner query's matches to symbol sections.
    Symbol(Box<Query>),
}

impl Query {
    pub fn substring(pattern: &str) -> Query {
        Query::Substring {
            pattern: pattern.to_string(),
            case_sensitive: false,
            file_name: false,
        }
    }

    pub fn regexp(pattern: &str) -> Query {
        Query::Regexp {
            pattern: pattern.to_string(),
            case_sensitive: false,
            file_name: false,
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::And(cs) => {
                write!(f, "(and")?;
                for c in cs {
                    write!(f, " {}", c)?;
                }
                write!(f, ")")
            }
            Query::Or(cs) => {
                write!(f, "(or")?;
                for c in cs {
                    write!(f, " {}", c)?;
                }
                write!(f, ")")
            }
            Query::Not(c) => write!(f, "(not {})", c),
            Query::Const(v) => write!(f, "{}", v),
            Query::Substring {
                pattern,
                case_sensitive,
                file_name,
            } => write!(
                f,
                "{}{}substr:{:?}",
                if *file_name { "file_" } else { "" },
                if *case_sensitive { "case_" } else { "" },
                pattern
            ),
            Query::Regexp {
                pattern,
                case_sensitive,
                file_name,
            } => write!(
                f,
                "{}{}regex:{:?}",
                if *file_name { "file_" } else { "" },
                if *case_sensitive { "case_" } else { "" },
                pattern
            ),
            Query::Repo(p) => write!(f, "repo:{:?}", p),
            Query::Branch(b) => write!(f, "branch:{:?}", b),
            Query::Language(l) => write!(f, "lang:{:?}", l),
            Query::Symbol(q) => write!(f, "sym({})", q),
        }
    }
}

/// Apply `f` to every node, children first.
pub fn map(q: Query, f: &impl Fn(Query) -> Query) -> Query {
    let mapped = match q {
        Query::And(cs) => Query::And(cs.into_iter().map(|c| map(c, f)).collect()),
        Query::Or(cs) => Query::Or(cs.into_iter().map(|c| map(c, f)).collect()),
        Query::Not(c) => Query::Not(Box::new(map(*c, f))),
        Query::Symbol(c) => Query::Symbol(Box::new(map(*c, f))),
        leaf => leaf,
    };
    f(mapped)
}

/// Normalize a query: double negation and constant elimination, flattening
/// of nested conjunctions/disjunctions, identity and duplicate removal, and
/// `Substring("")` to `Const(true)`. Children are normalized first, so one
/// pass reaches a fixed point.
pub fn simplify(q: Query) -> Query {
    match q {
        Query::Not(c) => match simplify(*c) {
            Query::Not(inner) => *inner,
            Query::Const(v) => Query::Const(!v),
            other => Query::Not(Box::new(other)),
        },
        Query::And(cs) => simplify_compound(cs, true),
        Query::Or(cs) => simplify_compound(cs, false),
        Query::Substring { pattern, .. } if pattern.is_empty() => Query::Const(true),
        Query::Regexp {
            pattern,
            case_sensitive,
            file_name,
        } => {
            // (?s)(?m)-free universal patterns collapse to a constant.
            if pattern.is_empty() || pattern == ".*" {
                Query::Const(true)
            } else {
                Query::Regexp {
                    pattern,
                    case_sensitive,
                    file_name,
                }
            }
        }
        Query::Symbol(c) => match simplify(*c) {
            Query::Const(false) => Query::Const(false),
            other => Query::Symbol(Box::new(other)),
        },
        leaf => leaf,
    }
}

fn simplify_compound(children: Vec<Query>, is_and: bool) -> Query {
    // `identity` disappears from the child list; `absorbing` swallows the
    // whole node.
    let (identity, absorbing) = (is_and, !is_and);

    let mut flat: Vec<Query> = Vec::with_capacity(children.len());
    for c in children {
        match simplify(c) {
            Query::And(sub) if is_and => flat.extend(sub),
            Query::Or(sub) if !is_and => flat.extend(sub),
            Query::Const(v) if v == absorbing => return Query::Const(absorbing),
            Query::Const(v) if v == identity => {}
            other => flat.push(other),
        }
    }

    let mut uniq: Vec<Query> = Vec::with_capacity(flat.len());
    for c in flat {
        if !uniq.contains(&c) {
            uniq.push(c);
        }
    }

    match uniq.len() {
        0 => Query::Const(identity),
        1 => uniq.into_iter().next().unwrap(),
        _ => {
            if is_and {
                Query::And(uniq)
            } else {
                Query::Or(uniq)
            }
        }
    }
}
