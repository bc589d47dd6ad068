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

use anyhow::{bail, Context, Result};
use log::{info, warn};
use rayon::prelude::*;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::shard::{shard_file_name, BuildError, ShardBuilder, SHARD_EXTENSION};
use crate::types::{Document, DocumentSection, RepoBranch, Repository};

/// Annotates documents with symbol sections. The actual parser (ctags or
/// similar) lives outside this crate; indexing works without one.
pub trait SectionParser: Send + Sync {
    fn sections(&self, name: &str, content: &[u8]) -> Vec<DocumentSection>;
}

#[derive(Debug, Clone, Default)]
pub struct BuildStats {
    pub shards: Vec<PathBuf>,
    pub documents: usize,
    pub skipped: usize,
}

/// Walks a directory tree and builds the shard files for it. Shards are
/// written to a temp file and renamed into place, so readers only ever see
/// complete shards.
pub struct CorpusBuilder {
    root: PathBuf,
    index_dir: PathBuf,
    name: Option<String>,
    branches: Vec<RepoBranch>,
    file_size_max: u64,
    shard_size_max: u64,
    parallelism: usize,
    incremental: bool,
    require_symbols: bool,
    max_trigram_count: usize,
    section_parser: Option<Box<dyn SectionParser>>,
    repository: Option<Repository>,
}

impl CorpusBuilder {
    pub fn new(root: impl Into<PathBuf>, index_dir: impl Into<PathBuf>) -> CorpusBuilder {
        CorpusBuilder {
            root: root.into(),
            index_dir: index_dir.into(),
            name: None,
            branches: Vec::new(),
            file_size_max: 1 << 20,
            shard_size_max: crate::shard::DEFAULT_SHARD_MAX_BYTES,
            parallelism: 0,
            incremental: false,
            require_symbols: false,
            max_trigram_count: crate::shard::DEFAULT_MAX_TRIGRAM_COUNT,
            section_parser: None,
            repository: None,
        }
    }

    pub fn name(mut self, name: &str) -> CorpusBuilder {
        self.name = Some(name.to_string());
        self
    }

    pub fn branch(mut self, name: &str, version: &str) -> CorpusBuilder {
        self.branches.push(RepoBranch {
            name: name.to_string(),
            version: version.to_string(),
        });
        self
    }

    pub fn file_size_max(mut self, n: u64) -> CorpusBuilder {
        self.file_size_max = n;
        self
    }

    pub fn shard_size_max(mut self, n: u64) -> CorpusBuilder {
        self.shard_size_max = n;
        self
    }

    /// Worker threads for reading file contents; 0 uses the default pool.
    pub fn parallelism(mut self, n: usize) -> CorpusBuilder {
        self.parallelism = n;
        self
    }

    /// Skip the build entirely when the existing first shard is newer than
    /// every input file.
    pub fn incremental(mut self, on: bool) -> CorpusBuilder {
        self.incremental = on;
        self
    }

    /// Drop documents for which the section parser produced no symbols.
    pub fn require_symbols(mut self, on: bool) -> CorpusBuilder {
        self.require_symbols = on;
        self
    }

    pub fn max_trigram_count(mut self, n: usize) -> CorpusBuilder {
        self.max_trigram_count = n;
        self
    }

    pub fn section_parser(mut self, p: Box<dyn SectionParser>) -> CorpusBuilder {
        self.section_parser = Some(p);
        self
    }

    /// Override the repository descriptor (URL templates, sub-repos).
    pub fn repository(mut self, repo: Repository) -> CorpusBuilder {
        self.repository = Some(repo);
        self
    }

    pub fn build(self) -> Result<BuildStats> {
        if !self.root.is_dir() {
            bail!("repository root {} does not exist", self.root.display());
        }
        std::fs::create_dir_all(&self.index_dir)
            .with_context(|| format!("create index directory {}", self.index_dir.display()))?;

        let repo_name = match &self.name {
            Some(n) => n.clone(),
            None => self
                .root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "corpus".to_string()),
        };

        let mut stats = BuildStats::default();
        let mut pending = self.walk(&mut stats)?;
        pending.sort_by(|a, b| a.0.cmp(&b.0));

        if self.incremental && self.up_to_date(&repo_name, &pending) {
            info!("index for {} is up to date", repo_name);
            stats.shards = existing_shards(&self.index_dir, &repo_name)?;
            return Ok(stats);
        }

        let contents = self.read_contents(pending)?;

        let mut repo = self.repository.clone().unwrap_or_default();
        repo.name = repo_name.clone();
        if repo.branches.is_empty() {
            repo.branches = if self.branches.is_empty() {
                vec![RepoBranch {
                    name: "HEAD".to_string(),
                    version: String::new(),
                }]
            } else {
                self.branches.clone()
            };
        }
        let branch_names: Vec<String> = repo.branches.iter().map(|b| b.name.clone()).collect();

        let new_builder = |repo: &Repository| {
            ShardBuilder::new(repo.clone())
                .shard_max_bytes(self.shard_size_max)
                .max_trigram_count(self.max_trigram_count)
        };

        let mut builder = new_builder(&repo);
        let mut shard_num = 0usize;
        for (rel, content) in contents {
            let sections = match &self.section_parser {
                Some(p) => p.sections(&rel, &content),
                None => Vec::new(),
            };
            if self.require_symbols && sections.is_empty() {
                stats.skipped += 1;
                continue;
            }
            // Rotate before the region would overflow the shard ceiling.
            let added = content.len() as u64 + rel.len() as u64;
            if builder.doc_count() > 0 && builder.content_size() + added > self.shard_size_max {
                stats
                    .shards
                    .push(self.publish(&builder, &repo_name, shard_num)?);
                shard_num += 1;
                builder = new_builder(&repo);
            }
            match builder.add(Document {
                name: rel,
                content,
                branches: branch_names.clone(),
                sections,
            }) {
                Ok(()) => stats.documents += 1,
                Err(BuildError::TooLarge { doc, size }) => {
                    warn!("{}: {} bytes exceed the shard ceiling, skipped", doc, size);
                    stats.skipped += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        if builder.doc_count() > 0 || stats.shards.is_empty() {
            stats
                .shards
                .push(self.publish(&builder, &repo_name, shard_num)?);
            shard_num += 1;
        }

        remove_stale_shards(&self.index_dir, &repo_name, shard_num)?;
        Ok(stats)
    }

    /// Collect `(relative path, absolute path, mtime)` for candidate files.
    fn walk(&self, stats: &mut BuildStats) -> Result<Vec<(String, PathBuf, SystemTime)>> {
        let mut out = Vec::new();
        let walker = ignore::WalkBuilder::new(&self.root)
            .hidden(true)
            .git_ignore(true)
            .build();
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("walk: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if meta.len() > self.file_size_max {
                stats.skipped += 1;
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .into_owned();
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            out.push((rel, entry.path().to_path_buf(), mtime));
        }
        Ok(out)
    }

    fn up_to_date(&self, repo_name: &str, pending: &[(String, PathBuf, SystemTime)]) -> bool {
        let first = self.index_dir.join(shard_file_name(repo_name, 0));
        let Ok(meta) = std::fs::metadata(&first) else {
            return false;
        };
        let Ok(shard_time) = meta.modified() else {
            return false;
        };
        pending.iter().all(|(_, _, mtime)| *mtime <= shard_time)
    }

    fn read_contents(
        &self,
        pending: Vec<(String, PathBuf, SystemTime)>,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let read_all = |pending: Vec<(String, PathBuf, SystemTime)>| {
            pending
                .into_par_iter()
                .map(|(rel, abs, _)| {
                    let content = std::fs::read(&abs).unwrap_or_else(|e| {
                        warn!("read {}: {}", abs.display(), e);
                        Vec::new()
                    });
                    (rel, content)
                })
                .collect::<Vec<_>>()
        };
        if self.parallelism > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.parallelism)
                .build()
                .context("build reader thread pool")?;
            Ok(pool.install(|| read_all(pending)))
        } else {
            Ok(read_all(pending))
        }
    }

    /// Write a finished shard next to its final location, then rename it
    /// into place.
    fn publish(&self, builder: &ShardBuilder, repo_name: &str, num: usize) -> Result<PathBuf> {
        let final_path = self.index_dir.join(shard_file_name(repo_name, num));
        let tmp_path = final_path.with_extension(format!("{}.tmp", SHARD_EXTENSION));
        let file = File::create(&tmp_path)
            .with_context(|| format!("create {}", tmp_path.display()))?;
        let mut buf = BufWriter::new(file);
        builder.finish(&mut buf)?;
        let file = buf.into_inner().context("flush shard")?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("publish {}", final_path.display()))?;
        info!(
            "wrote {} ({} documents)",
            final_path.display(),
            builder.doc_count()
        );
        Ok(final_path)
    }
}

fn existing_shards(index_dir: &Path, repo_name: &str) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for num in 0.. {
        let p = index_dir.join(shard_file_name(repo_name, num));
        if !p.exists() {
            break;
        }
        out.push(p);
    }
    Ok(out)
}

/// A rebuild that shrinks the shard count must drop the leftovers, or
/// searches would see stale documents.
fn remove_stale_shards(index_dir: &Path, repo_name: &str, first_stale: usize) -> Result<()> {
    for num in first_stale.. {
        let p = index_dir.join(shard_file_name(repo_name, num));
        if !p.exists() {
            break;
        }
        warn!("removing stale shard {}", p.display());
        std::fs::remove_file(&p)?;
    }
    Ok(())
}
