use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use super::builder::ShardBuilder;
use super::codec::{to_deltas, SectionWriter, SimpleSection};
use super::{INDEX_FORMAT_VERSION, SECTION_COUNT};
use crate::ngram::NGram;
use crate::types::Repository;

/// The leading JSON section. Kept first in the file so readers of any
/// version can identify a shard before deciding whether they understand it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct UnaryData {
    pub repository: Repository,
    pub index_format_version: u32,
    /// Unix seconds at which the shard was finalized.
    pub index_time: u64,
}

pub(crate) fn write_shard<W: Write>(b: &ShardBuilder, out: W) -> Result<()> {
    let mut w = SectionWriter::new(BufWriter::with_capacity(1 << 20, out));
    let mut toc: Vec<SimpleSection> = Vec::with_capacity(SECTION_COUNT);

    let mut repository = b.repo.clone();
    repository.branches = b.branch_list();
    let unary = UnaryData {
        repository,
        index_format_version: INDEX_FORMAT_VERSION,
        index_time: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    };
    toc.push(w.simple(&serde_json::to_vec(&unary)?)?);

    toc.push(w.compound(b.files.iter().map(|f| f.data.as_slice()))?);
    toc.push(w.compound(b.files.iter().map(|f| f.case_bits.as_slice()))?);
    toc.push(w.compound(b.file_names.iter().map(|f| f.data.as_slice()))?);
    toc.push(w.compound(b.file_names.iter().map(|f| f.case_bits.as_slice()))?);

    let sections: Vec<Vec<u8>> = b
        .doc_sections
        .iter()
        .map(|secs| {
            let flat: Vec<u32> = secs.iter().flat_map(|s| [s.start, s.end]).collect();
            to_deltas(&flat)
        })
        .collect();
    toc.push(w.compound(sections.iter().map(|s| s.as_slice()))?);

    let newlines: Vec<Vec<u8>> = b
        .files
        .iter()
        .map(|f| to_deltas(&newline_indices(&f.data)))
        .collect();
    toc.push(w.compound(newlines.iter().map(|n| n.as_slice()))?);

    let (ngram_text, postings) = marshal_postings(&b.content_postings);
    toc.push(w.simple(&ngram_text)?);
    toc.push(w.compound(postings.iter().map(|p| p.as_slice()))?);

    let (name_ngram_text, name_postings) = marshal_postings(&b.name_postings);
    toc.push(w.simple(&name_ngram_text)?);
    toc.push(w.compound(name_postings.iter().map(|p| p.as_slice()))?);

    let mut masks = Vec::with_capacity(b.branch_masks.len() * 4);
    for m in &b.branch_masks {
        masks.extend_from_slice(&m.to_le_bytes());
    }
    toc.push(w.simple(&masks)?);

    toc.push(w.simple(&to_deltas(&b.sub_repo_ids))?);

    if toc.len() != SECTION_COUNT {
        bail!("internal: wrote {} sections, expected {}", toc.len(), SECTION_COUNT);
    }

    let toc_off = w.offset();
    w.u32(toc.len() as u32)?;
    for s in &toc {
        w.u32(s.off)?;
        w.u32(s.sz)?;
    }
    w.u32(toc_off)?;

    w.into_inner().flush()?;
    Ok(())
}

/// Sorted flat ngram bytes plus the aligned delta-encoded posting blobs.
fn marshal_postings(
    postings: &std::collections::HashMap<NGram, Vec<u32>>,
) -> (Vec<u8>, Vec<Vec<u8>>) {
    let mut keys: Vec<NGram> = postings.keys().copied().collect();
    keys.sort_unstable();
    let mut text = Vec::with_capacity(keys.len() * 3);
    let mut blobs = Vec::with_capacity(keys.len());
    for k in keys {
        text.extend_from_slice(&k.to_bytes());
        blobs.push(to_deltas(&postings[&k]));
    }
    (text, blobs)
}

fn newline_indices(data: &[u8]) -> Vec<u32> {
    data.iter()
        .enumerate()
        .filter(|(_, &b)| b == b'\n')
        .map(|(i, _)| i as u32)
        .collect()
}
