use anyhow::{bail, Context, Result};
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use super::codec::{from_deltas, read_u32, CompoundReader, SimpleSection};
use super::writer::UnaryData;
use super::{INDEX_FORMAT_VERSION, SECTION_COUNT};
use crate::ngram::NGram;
use crate::query::{map, simplify, Query};
use crate::types::{DocumentSection, Repository};

enum Backing {
    Mmap(Mmap),
    Heap(Vec<u8>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Mmap(m) => m,
            Backing::Heap(v) => v,
        }
    }
}

/// A decoded, immutable view of one shard file. The file is memory-mapped
/// when possible; accessors hand out zero-copy slices into it.
pub struct IndexData {
    backing: Backing,
    name: String,
    pub(crate) repo: Repository,
    pub(crate) index_format_version: u32,
    pub(crate) index_time: u64,
    contents: CompoundReader,
    case_bits: CompoundReader,
    names: CompoundReader,
    name_case_bits: CompoundReader,
    file_sections: CompoundReader,
    newlines: CompoundReader,
    /// ngram => item index into the postings compound section.
    ngram_index: HashMap<NGram, u32>,
    name_ngram_index: HashMap<NGram, u32>,
    postings: CompoundReader,
    name_postings: CompoundReader,
    pub(crate) branch_masks: Vec<u32>,
    pub(crate) sub_repo_ids: Vec<u32>,
    /// `""` for the outer repo, then the sorted sub-repo paths.
    pub(crate) sub_repo_paths: Vec<String>,
}

/// An open shard; implements [`crate::types::Searcher`] over its single
/// repository.
pub struct Shard {
    pub(crate) data: IndexData,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard").finish_non_exhaustive()
    }
}

impl Shard {
    pub fn open(path: impl AsRef<Path>) -> Result<Shard> {
        Ok(Shard {
            data: IndexData::open(path.as_ref())?,
        })
    }

    /// Open a shard from an in-memory buffer (tests, network transports).
    pub fn from_bytes(name: &str, data: Vec<u8>) -> Result<Shard> {
        Ok(Shard {
            data: IndexData::parse(Backing::Heap(data), name.to_string())?,
        })
    }

    pub fn repository(&self) -> &Repository {
        &self.data.repo
    }

    /// Unix seconds at which the shard was finalized.
    pub fn index_time(&self) -> u64 {
        self.data.index_time
    }

    pub fn doc_count(&self) -> u32 {
        self.data.doc_count()
    }
}

impl IndexData {
    fn open(path: &Path) -> Result<IndexData> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let file = File::open(path).with_context(|| format!("open shard {}", path.display()))?;
        let backing = match unsafe { Mmap::map(&file) } {
            Ok(m) => Backing::Mmap(m),
            Err(_) => Backing::Heap(
                std::fs::read(path).with_context(|| format!("read shard {}", path.display()))?,
            ),
        };
        IndexData::parse(backing, name)
    }

    fn parse(backing: Backing, name: String) -> Result<IndexData> {
        let data = backing.bytes();
        if data.len() < 8 {
            bail!("{}: shard file too small ({} bytes)", name, data.len());
        }
        let toc_off = read_u32(data, data.len() - 4)? as usize;
        if toc_off + 4 > data.len() - 4 {
            bail!("{}: TOC offset {} out of bounds", name, toc_off);
        }
        let count = read_u32(data, toc_off)? as usize;
        if data.len() - 4 - toc_off != 4 + count * 8 {
            bail!("{}: TOC size does not match its {} entries", name, count);
        }
        let mut sections = Vec::with_capacity(count);
        for i in 0..count {
            let off = read_u32(data, toc_off + 4 + i * 8)?;
            let sz = read_u32(data, toc_off + 8 + i * 8)?;
            if (off as usize) + (sz as usize) > toc_off {
                bail!("{}: section {} overruns the TOC", name, i);
            }
            sections.push(SimpleSection { off, sz });
        }

        // The descriptor is always section zero, across all format versions.
        let Some(unary_sec) = sections.first() else {
            bail!("{}: empty TOC", name);
        };
        let unary: UnaryData = serde_json::from_slice(&data[unary_sec.range()])
            .with_context(|| format!("{}: parse repository descriptor", name))?;
        if unary.index_format_version != INDEX_FORMAT_VERSION {
            bail!(
                "{}: unsupported index format version {} (this build reads {})",
                name,
                unary.index_format_version,
                INDEX_FORMAT_VERSION
            );
        }
        if count != SECTION_COUNT {
            bail!("{}: expected {} sections, found {}", name, SECTION_COUNT, count);
        }

        let contents = CompoundReader::parse(data, sections[1])?;
        let case_bits = CompoundReader::parse(data, sections[2])?;
        let names = CompoundReader::parse(data, sections[3])?;
        let name_case_bits = CompoundReader::parse(data, sections[4])?;
        let file_sections = CompoundReader::parse(data, sections[5])?;
        let newlines = CompoundReader::parse(data, sections[6])?;
        let postings = CompoundReader::parse(data, sections[8])?;
        let name_postings = CompoundReader::parse(data, sections[10])?;

        let ngram_index = parse_ngram_text(data, sections[7], postings.len())
            .with_context(|| format!("{}: content ngrams", name))?;
        let name_ngram_index = parse_ngram_text(data, sections[9], name_postings.len())
            .with_context(|| format!("{}: name ngrams", name))?;

        let doc_count = contents.len();
        for (what, r) in [
            ("caseBits", &case_bits),
            ("fileNames", &names),
            ("nameCaseBits", &name_case_bits),
            ("fileSections", &file_sections),
            ("newlines", &newlines),
        ] {
            if r.len() != doc_count {
                bail!(
                    "{}: {} holds {} items for {} documents",
                    name,
                    what,
                    r.len(),
                    doc_count
                );
            }
        }

        let mask_sec = sections[11];
        if mask_sec.sz as usize != doc_count * 4 {
            bail!("{}: branchMasks size {} for {} documents", name, mask_sec.sz, doc_count);
        }
        let mut branch_masks = Vec::with_capacity(doc_count);
        for d in 0..doc_count {
            branch_masks.push(read_u32(data, mask_sec.off as usize + d * 4)?);
        }

        let sub_repo_ids = from_deltas(&data[sections[12].range()])?;
        if sub_repo_ids.len() != doc_count {
            bail!("{}: subRepos holds {} ids for {} documents", name, sub_repo_ids.len(), doc_count);
        }

        let mut sub_repo_paths = vec![String::new()];
        sub_repo_paths.extend(unary.repository.sub_repo_map.keys().cloned());
        for &id in &sub_repo_ids {
            if id as usize >= sub_repo_paths.len() {
                bail!("{}: sub-repo id {} beyond {:?}", name, id, sub_repo_paths);
            }
        }

        Ok(IndexData {
            backing,
            name,
            repo: unary.repository,
            index_format_version: unary.index_format_version,
            index_time: unary.index_time,
            contents,
            case_bits,
            names,
            name_case_bits,
            file_sections,
            newlines,
            ngram_index,
            name_ngram_index,
            postings,
            name_postings,
            branch_masks,
            sub_repo_ids,
            sub_repo_paths,
        })
    }

    pub(crate) fn shard_name(&self) -> &str {
        &self.name
    }

    pub(crate) fn doc_count(&self) -> u32 {
        self.contents.len() as u32
    }

    pub(crate) fn content(&self, doc: u32) -> &[u8] {
        self.contents.item(self.backing.bytes(), doc as usize)
    }

    pub(crate) fn content_case_bits(&self, doc: u32) -> &[u8] {
        self.case_bits.item(self.backing.bytes(), doc as usize)
    }

    pub(crate) fn file_name(&self, doc: u32) -> &[u8] {
        self.names.item(self.backing.bytes(), doc as usize)
    }

    pub(crate) fn name_case_bits(&self, doc: u32) -> &[u8] {
        self.name_case_bits.item(self.backing.bytes(), doc as usize)
    }

    pub(crate) fn newlines(&self, doc: u32) -> Result<Vec<u32>> {
        from_deltas(self.newlines.item(self.backing.bytes(), doc as usize))
    }

    pub(crate) fn sections(&self, doc: u32) -> Result<Vec<DocumentSection>> {
        let flat = from_deltas(self.file_sections.item(self.backing.bytes(), doc as usize))?;
        if flat.len() % 2 != 0 {
            bail!("{}: odd symbol section table for doc {}", self.name, doc);
        }
        Ok(flat
            .chunks_exact(2)
            .map(|c| DocumentSection {
                start: c[0],
                end: c[1],
            })
            .collect())
    }

    /// Decode the posting list for a trigram; empty when absent.
    pub(crate) fn postings(&self, ng: NGram, file_name: bool) -> Result<Vec<u32>> {
        let (index, compound) = if file_name {
            (&self.name_ngram_index, &self.name_postings)
        } else {
            (&self.ngram_index, &self.postings)
        };
        match index.get(&ng) {
            Some(&i) => from_deltas(compound.item(self.backing.bytes(), i as usize)),
            None => Ok(Vec::new()),
        }
    }

    /// Region boundaries: entry `d` is the offset of document `d`'s first
    /// byte in the concatenated (content or name) region.
    pub(crate) fn boundaries(&self, file_name: bool) -> &[u32] {
        if file_name {
            self.names.boundaries()
        } else {
            self.contents.boundaries()
        }
    }

    /// Document owning an absolute region offset.
    pub(crate) fn doc_for_offset(&self, off: u32, file_name: bool) -> u32 {
        let bounds = self.boundaries(file_name);
        (bounds[1..].partition_point(|&b| b <= off)) as u32
    }

    pub(crate) fn doc_start(&self, doc: u32, file_name: bool) -> u32 {
        self.boundaries(file_name)[doc as usize]
    }

    pub(crate) fn doc_end(&self, doc: u32, file_name: bool) -> u32 {
        self.boundaries(file_name)[doc as usize + 1]
    }

    /// Bit for a branch name, if this shard knows the branch.
    pub(crate) fn branch_bit(&self, branch: &str) -> Option<u32> {
        self.repo
            .branches
            .iter()
            .position(|b| b.name == branch)
            .map(|i| 1 << i)
    }

    pub(crate) fn branch_names(&self, mask: u32) -> Vec<String> {
        self.repo
            .branches
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, b)| b.name.clone())
            .collect()
    }

    /// Version of the first branch in the document's mask.
    pub(crate) fn version_for_doc(&self, doc: u32) -> String {
        let mask = self.branch_masks[doc as usize];
        if mask == 0 {
            return String::new();
        }
        let idx = mask.trailing_zeros() as usize;
        let branches = match self.sub_repo_ids[doc as usize] {
            0 => &self.repo.branches,
            id => {
                let path = &self.sub_repo_paths[id as usize];
                match self.repo.sub_repo_map.get(path) {
                    Some(sub) => &sub.branches,
                    None => &self.repo.branches,
                }
            }
        };
        branches
            .get(idx)
            .map(|b| b.version.clone())
            .unwrap_or_default()
    }

    /// Partially evaluate a query against this shard's repository: `Repo`
    /// leaves become constants, then the tree is re-simplified. A
    /// `Const(false)` result means the shard can be skipped outright.
    pub(crate) fn simplify(&self, q: Query) -> Query {
        let repo_name = self.repo.name.clone();
        let mapped = map(q, &|node| match node {
            Query::Repo(pat) => Query::Const(repo_name.contains(&pat)),
            other => other,
        });
        simplify(mapped)
    }
}

fn parse_ngram_text(
    data: &[u8],
    sec: SimpleSection,
    posting_items: usize,
) -> Result<HashMap<NGram, u32>> {
    if sec.sz % 3 != 0 {
        bail!("ngram text size {} not a multiple of 3", sec.sz);
    }
    let count = (sec.sz / 3) as usize;
    if count != posting_items {
        bail!("{} ngrams for {} posting lists", count, posting_items);
    }
    let base = sec.off as usize;
    let mut index = HashMap::with_capacity(count);
    let mut prev: Option<NGram> = None;
    for i in 0..count {
        let ng = NGram::from_bytes(&data[base + i * 3..base + i * 3 + 3]);
        if prev.is_some_and(|p| p >= ng) {
            bail!("ngram text not sorted at entry {}", i);
        }
        prev = Some(ng);
        index.insert(ng, i as u32);
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardBuilder;
    use crate::types::Document;

    fn build_bytes(docs: &[(&str, &[u8])]) -> Vec<u8> {
        let mut b = ShardBuilder::new(Repository {
            name: "corpus".to_string(),
            ..Default::default()
        });
        for (name, content) in docs {
            b.add(Document {
                name: name.to_string(),
                content: content.to_vec(),
                branches: vec!["main".to_string()],
                sections: Vec::new(),
            })
            .unwrap();
        }
        let mut out = Vec::new();
        b.finish(&mut out).unwrap();
        out
    }

    #[test]
    fn round_trip_content_and_postings() {
        let shard = Shard::from_bytes(
            "t",
            build_bytes(&[("a.txt", b"Water flows\n"), ("b.txt", b"dry land\n")]),
        )
        .unwrap();
        let d = &shard.data;
        assert_eq!(d.doc_count(), 2);
        assert_eq!(d.content(0), b"water flows\n");
        assert_eq!(d.file_name(1), b"b.txt");

        let posting = d.postings(NGram::from_bytes(b"wat"), false).unwrap();
        assert_eq!(posting, vec![0]);
        // All postings point at their trigram in the lowered region.
        for (&ng, &item) in &d.ngram_index {
            let offs = from_deltas(d.postings.item(d.backing.bytes(), item as usize)).unwrap();
            assert!(!offs.is_empty());
            for off in offs {
                let doc = d.doc_for_offset(off, false);
                let rel = (off - d.doc_start(doc, false)) as usize;
                let content = d.content(doc);
                assert_eq!(NGram::from_bytes(&content[rel..rel + 3]), ng);
            }
        }
        // Content region length equals the sum of file lengths.
        let bounds = d.boundaries(false);
        assert_eq!(*bounds.last().unwrap() as usize, "water flows\n".len() + "dry land\n".len());
    }

    #[test]
    fn doc_offset_mapping() {
        let shard = Shard::from_bytes(
            "t",
            build_bytes(&[("a", b"aaaa"), ("b", b""), ("c", b"bbbb")]),
        )
        .unwrap();
        let d = &shard.data;
        assert_eq!(d.doc_for_offset(0, false), 0);
        assert_eq!(d.doc_for_offset(3, false), 0);
        // Offset 4 belongs to the first non-empty doc starting there.
        assert_eq!(d.doc_for_offset(4, false), 2);
        assert_eq!(d.doc_start(2, false), 4);
        assert_eq!(d.doc_end(2, false), 8);
    }

    #[test]
    fn rejects_foreign_versions() {
        let mut blob = build_bytes(&[("a", b"abc")]);
        // Corrupt the version inside the JSON descriptor.
        let needle = b"\"index_format_version\":1";
        let pos = blob
            .windows(needle.len())
            .position(|w| w == needle)
            .unwrap();
        blob[pos + needle.len() - 1] = b'9';
        let err = Shard::from_bytes("t", blob).unwrap_err();
        assert!(err.to_string().contains("format version"), "{}", err);
    }

    #[test]
    fn rejects_truncation() {
        let blob = build_bytes(&[("a", b"abc")]);
        for cut in [1usize, 4, blob.len() / 2] {
            let trunc = blob[..blob.len() - cut].to_vec();
            assert!(Shard::from_bytes("t", trunc).is_err(), "cut {}", cut);
        }
    }

    #[test]
    fn simplify_repo_queries() {
        let shard = Shard::from_bytes("t", build_bytes(&[("a", b"abc")])).unwrap();
        let q = Query::And(vec![Query::Repo("corp".into()), Query::substring("abc")]);
        assert_eq!(shard.data.simplify(q), Query::substring("abc"));
        let q = Query::Repo("elsewhere".into());
        assert_eq!(shard.data.simplify(q), Query::Const(false));
    }
}
