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

use clap::Parser;
use std::path::PathBuf;

use trigrep::CorpusBuilder;

#[derive(Parser, Debug)]
#[command(
    name = "trigrep-index",
    about = "Index a directory tree into trigram search shards"
)]
struct Args {
    /// Repository root to index
    repo: PathBuf,

    /// Directory the shard files are published into
    #[arg(long, default_value = ".")]
    index_dir: PathBuf,

    /// Skip files larger than this many bytes
    #[arg(long, default_value_t = 1 << 20)]
    file_size_max: u64,

    /// Close out a shard when its content region reaches this many bytes
    #[arg(long, default_value_t = 100 << 20)]
    shard_size_max: u64,

    /// Reader threads; 0 picks a default
    #[arg(long, default_value_t = 0)]
    parallelism: usize,

    /// Skip the build when the existing shards are newer than every input
    #[arg(long)]
    incremental: bool,

    /// Only index documents that carry symbol sections
    #[arg(long)]
    require_symbols: bool,

    /// Repository name; defaults to the root directory's basename
    #[arg(long)]
    name: Option<String>,

    /// Branch to record, as NAME or NAME:VERSION; repeatable
    #[arg(long)]
    branch: Vec<String>,

    /// Version recorded for branches given without one
    #[arg(long)]
    commit: Option<String>,

    /// Trigram-cardinality cutoff for the not-text heuristic
    #[arg(long, default_value_t = 20_000)]
    max_trigram_count: usize,
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut b = CorpusBuilder::new(&args.repo, &args.index_dir)
        .file_size_max(args.file_size_max)
        .shard_size_max(args.shard_size_max)
        .parallelism(args.parallelism)
        .incremental(args.incremental)
        .require_symbols(args.require_symbols)
        .max_trigram_count(args.max_trigram_count);
    if let Some(name) = &args.name {
        b = b.name(name);
    }
    for spec in &args.branch {
        let (name, version) = match spec.split_once(':') {
            Some((n, v)) => (n, v.to_string()),
            None => (spec.as_str(), args.commit.clone().unwrap_or_default()),
        };
        b = b.branch(name, &version);
    }

    let stats = b.build()?;
    println!(
        "indexed {} documents ({} skipped) into {} shard(s)",
        stats.documents,
        stats.skipped,
        stats.shards.len()
    );
    for s in &stats.shards {
        println!("  {}", s.display());
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let args = match Args::try_parse() {
        Ok(a) => a,
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };
    if let Err(e) = run(args) {
        eprintln!("trigrep-index: {:#}", e);
        std::process::exit(1);
    }
}
