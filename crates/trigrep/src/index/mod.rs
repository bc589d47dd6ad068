//! Corpus-level indexing: walking a directory tree, rotating shards at the
//! size ceiling, and publishing shard files atomically.

mod builder;
pub use builder::{BuildStats, CorpusBuilder, SectionParser};

/// Map a file name to a language by extension. Used for `lang:` queries and
/// result annotation; shards do not store a language table.
pub(crate) fn language_for_path(path: &str) -> Option<&'static str> {
    let ext = path.rsplit_once('.').map(|(_, e)| e)?;
    let lang = match ext.to_ascii_lowercase().as_str() {
        "rs" => "rust",
        "go" => "go",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" => "javascript",
        "py" => "python",
        "java" => "java",
        "cs" => "csharp",
        "c" | "h" => "c",
        "cpp" | "cc" | "cxx" | "hpp" | "hxx" => "cpp",
        "rb" => "ruby",
        "php" => "php",
        "sh" | "bash" => "shell",
        "md" => "markdown",
        "yml" | "yaml" => "yaml",
        "toml" => "toml",
        "json" => "json",
        _ => return None,
    };
    Some(lang)
}
