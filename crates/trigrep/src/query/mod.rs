//! Boolean query model: the expression tree, its normalization passes, the
//! regex distiller and the string surface syntax.

mod ast;
mod parse;
pub(crate) mod regexp;

pub use ast::{map, simplify, Query};
pub use parse::QueryError;
pub use regexp::{compile_bytes, lower_hir, query_from_regexp};
