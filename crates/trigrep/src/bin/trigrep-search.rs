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
use log::{info, warn};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use trigrep::{DirectorySearcher, Query, SearchContext, SearchOptions, SearchResult, Searcher};

#[derive(Parser, Debug)]
#[command(
    name = "trigrep-search",
    about = "Query a directory of trigram search shards"
)]
struct Args {
    /// Query, e.g. 'water branch:stable'; omit with --listen
    query: Option<String>,

    /// Directory holding the shard files
    #[arg(long)]
    index_dir: PathBuf,

    /// Serve a line protocol (one query in, one JSON result out) on this
    /// address instead of running a single query
    #[arg(long)]
    listen: Option<String>,

    /// Per-request wall-clock budget in milliseconds; 0 disables
    #[arg(long, default_value_t = 0)]
    max_wall_time_ms: u64,

    /// Print whole file contents for every match
    #[arg(long)]
    whole: bool,
}

fn options(args: &Args) -> SearchOptions {
    SearchOptions {
        max_wall_time: Duration::from_millis(args.max_wall_time_ms),
        whole: args.whole,
        ..Default::default()
    }
}

fn result_json(q: &str, res: &SearchResult) -> serde_json::Value {
    serde_json::json!({
        "query": q,
        "stats": {
            "match_count": res.stats.match_count,
            "file_count": res.stats.file_count,
            "files_considered": res.stats.files_considered,
            "files_skipped": res.stats.files_skipped,
            "ngram_matches": res.stats.ngram_matches,
            "crashes": res.stats.crashes,
            "duration_ms": res.stats.duration.as_millis() as u64,
        },
        "files": res.files.iter().map(|f| serde_json::json!({
            "repository": f.repository,
            "file_name": f.file_name,
            "branches": f.branches,
            "version": f.version,
            "language": f.language,
            "score": f.score,
            "lines": f.lines.iter().map(|l| serde_json::json!({
                "line_number": l.line_number,
                "line_off": l.line_off,
                "match_length": l.match_length,
                "line": String::from_utf8_lossy(&l.line),
                "file_name": l.file_name,
            })).collect::<Vec<_>>(),
        })).collect::<Vec<_>>(),
    })
}

fn serve(listener: TcpListener, searcher: Arc<DirectorySearcher>, opts: SearchOptions) {
    for conn in listener.incoming() {
        let conn = match conn {
            Ok(c) => c,
            Err(e) => {
                warn!("accept: {}", e);
                continue;
            }
        };
        let searcher = searcher.clone();
        let opts = opts.clone();
        std::thread::spawn(move || handle_conn(conn, &searcher, &opts));
    }
}

fn handle_conn(conn: TcpStream, searcher: &DirectorySearcher, opts: &SearchOptions) {
    let peer = conn
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    let mut out = match conn.try_clone() {
        Ok(c) => c,
        Err(e) => {
            warn!("{}: clone stream: {}", peer, e);
            return;
        }
    };
    for line in BufReader::new(conn).lines() {
        let Ok(line) = line else { return };
        let reply = match Query::parse(line.trim()) {
            Ok(q) => match searcher.search(&SearchContext::new(), &q, opts) {
                Ok(res) => result_json(line.trim(), &res),
                Err(e) => serde_json::json!({"error": format!("{:#}", e)}),
            },
            Err(e) => serde_json::json!({"error": e.to_string()}),
        };
        if writeln!(out, "{}", reply).is_err() {
            return;
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let searcher = Arc::new(DirectorySearcher::new(&args.index_dir)?);
    info!(
        "serving {} shard(s) from {}",
        searcher.shard_count(),
        args.index_dir.display()
    );

    if let Some(addr) = &args.listen {
        let listener = TcpListener::bind(addr)?;
        info!("listening on {}", addr);
        serve(listener, searcher, options(&args));
        return Ok(());
    }

    let Some(query) = &args.query else {
        anyhow::bail!("either a query or --listen is required");
    };
    let q = Query::parse(query)?;
    let res = searcher.search(&SearchContext::new(), &q, &options(&args))?;
    for f in &res.files {
        for l in &f.lines {
            println!(
                "{}:{}:{}",
                f.file_name,
                l.line_number,
                String::from_utf8_lossy(&l.line)
            );
        }
        if let Some(content) = &f.content {
            println!("{}", String::from_utf8_lossy(content));
        }
    }
    eprintln!(
        "{} matches in {} files ({} considered, {:?})",
        res.stats.match_count,
        res.stats.file_count,
        res.stats.files_considered,
        res.stats.duration
    );
    searcher.close();
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
        eprintln!("trigrep-search: {:#}", e);
        std::process::exit(1);
    }
}
