//! Full-text inverted index
//!
//! Each term maps to a posting list: a sequence of fixed-capacity blocks of
//! `(doc-id, frequency, field-mask, offsets)` entries. Lists are append-only
//! because doc-ids only grow. Blocks are reference counted so that a reader
//! holds a cheap snapshot of the list while writers keep appending: a write
//! clones the block table and at most the tail block it touches.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::pipeline::scorer::{bm25_idf, idf, CorpusStats};
use crate::query::iterators::{IndexIterator, ReadStatus, Record, TermHit};
use crate::types::{DocId, DOCID_EOF};

pub const BLOCK_CAPACITY: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub struct Posting {
    pub doc_id: DocId,
    pub freq: u32,
    pub field_mask: u128,
    pub offsets: Vec<u32>,
}

impl Posting {
    fn memory(&self) -> usize {
        std::mem::size_of::<Posting>() + self.offsets.len() * std::mem::size_of::<u32>()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    entries: Vec<Posting>,
}

impl Block {
    fn last_id(&self) -> DocId {
        self.entries.last().map(|p| p.doc_id).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PostingList {
    blocks: Vec<Arc<Block>>,
    num_docs: usize,
    memory: usize,
}

impl PostingList {
    pub fn num_docs(&self) -> usize {
        self.num_docs
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn memory(&self) -> usize {
        self.memory
    }

    pub fn last_doc_id(&self) -> DocId {
        self.blocks.last().map(|b| b.last_id()).unwrap_or(0)
    }

    /// Append an entry; ids must be strictly increasing.
    fn append(&mut self, posting: Posting) -> bool {
        if posting.doc_id <= self.last_doc_id() {
            return false;
        }
        self.memory += posting.memory();
        self.num_docs += 1;
        match self.blocks.last_mut() {
            Some(block) if block.entries.len() < BLOCK_CAPACITY => {
                Arc::make_mut(block).entries.push(posting)
            }
            _ => self.blocks.push(Arc::new(Block {
                entries: vec![posting],
            })),
        }
        true
    }

    /// Remove entries for `dead` (sorted) ids. Returns bytes freed.
    fn remove(&mut self, dead: &[DocId]) -> usize {
        let mut freed = 0;
        let mut survivors: Vec<Posting> = Vec::new();
        let mut touched = false;
        for block in &self.blocks {
            let hit = block
                .entries
                .iter()
                .any(|p| dead.binary_search(&p.doc_id).is_ok());
            touched |= hit;
            for p in &block.entries {
                if hit && dead.binary_search(&p.doc_id).is_ok() {
                    freed += p.memory();
                } else {
                    survivors.push(p.clone());
                }
            }
        }
        if !touched {
            return 0;
        }
        self.num_docs = survivors.len();
        self.memory -= freed.min(self.memory);
        self.blocks = survivors
            .chunks(BLOCK_CAPACITY)
            .map(|chunk| Arc::new(Block {
                entries: chunk.to_vec(),
            }))
            .collect();
        freed
    }

    pub fn doc_ids(&self) -> Vec<DocId> {
        self.blocks
            .iter()
            .flat_map(|b| b.entries.iter().map(|p| p.doc_id))
            .collect()
    }
}

/// Term dictionary plus posting lists
#[derive(Debug, Default)]
pub struct InvertedIndex {
    terms: BTreeMap<String, Arc<PostingList>>,
    num_records: usize,
}

/// Expansion result for prefix, suffix, infix and fuzzy terms
#[derive(Debug, Default)]
pub struct Expansion {
    pub terms: Vec<(String, Arc<PostingList>)>,
    /// More terms matched than the expansion cap allowed
    pub truncated: bool,
}

impl InvertedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, term: &str, posting: Posting) {
        let list = self.terms.entry(term.to_string()).or_default();
        if Arc::make_mut(list).append(posting) {
            self.num_records += 1;
        }
    }

    pub fn get(&self, term: &str) -> Option<Arc<PostingList>> {
        self.terms.get(term).cloned()
    }

    pub fn num_terms(&self) -> usize {
        self.terms.len()
    }

    pub fn num_records(&self) -> usize {
        self.num_records
    }

    pub fn memory_usage(&self) -> usize {
        self.terms
            .iter()
            .map(|(t, l)| t.len() + l.memory() + std::mem::size_of::<PostingList>())
            .sum()
    }

    /// Terms starting with `prefix`, at most `limit` of them.
    pub fn prefix(&self, prefix: &str, limit: usize) -> Expansion {
        let mut out = Expansion::default();
        for (term, list) in self.terms.range(prefix.to_string()..) {
            if !term.starts_with(prefix) {
                break;
            }
            if is_stem_entry(term) {
                continue;
            }
            if out.terms.len() >= limit {
                out.truncated = true;
                break;
            }
            out.terms.push((term.clone(), list.clone()));
        }
        out
    }

    /// Terms accepted by `pred`, at most `limit` of them.
    pub fn matching(&self, limit: usize, pred: impl Fn(&str) -> bool) -> Expansion {
        let mut out = Expansion::default();
        for (term, list) in &self.terms {
            if is_stem_entry(term) || !pred(term) {
                continue;
            }
            if out.terms.len() >= limit {
                out.truncated = true;
                break;
            }
            out.terms.push((term.clone(), list.clone()));
        }
        out
    }

    /// Drop entries of retired documents. Returns bytes freed.
    pub fn collect_garbage(&mut self, dead: &[DocId]) -> usize {
        let mut freed = 0;
        let mut removed_records = 0;
        self.terms.retain(|term, list| {
            let before = list.num_docs();
            let bytes = Arc::make_mut(list).remove(dead);
            freed += bytes;
            removed_records += before - list.num_docs();
            if list.num_docs() == 0 {
                freed += term.len() + std::mem::size_of::<PostingList>();
                false
            } else {
                true
            }
        });
        self.num_records -= removed_records.min(self.num_records);
        freed
    }

    pub fn clear(&mut self) {
        self.terms.clear();
        self.num_records = 0;
    }
}

fn is_stem_entry(term: &str) -> bool {
    term.starts_with(crate::analysis::STEM_PREFIX)
}

/// Levenshtein distance, giving up once it exceeds `max`.
pub fn edit_distance_within(a: &str, b: &str, max: usize) -> bool {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > max {
        return false;
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for i in 1..=a.len() {
        cur[0] = i;
        let mut row_min = cur[0];
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            cur[j] = (prev[j] + 1).min(cur[j - 1] + 1).min(prev[j - 1] + cost);
            row_min = row_min.min(cur[j]);
        }
        if row_min > max {
            return false;
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()] <= max
}

/// Iterator over one posting list, optionally restricted to a field mask
pub struct TermIterator {
    list: Arc<PostingList>,
    block: usize,
    entry: usize,
    current: DocId,
    mask: u128,
    term: Arc<str>,
    idf: f64,
    bm25_idf: f64,
    weight: f64,
    record: Record,
}

impl TermIterator {
    pub fn new(
        term: &str,
        list: Arc<PostingList>,
        mask: u128,
        weight: f64,
        stats: &CorpusStats,
    ) -> Self {
        let df = list.num_docs() as u64;
        Self {
            idf: idf(stats.num_docs, df),
            bm25_idf: bm25_idf(stats.num_docs, df),
            list,
            block: 0,
            entry: 0,
            current: 0,
            mask,
            term: Arc::from(term),
            weight,
            record: Record::Virtual { weight },
        }
    }

    fn posting(&self) -> Option<&Posting> {
        self.list.blocks.get(self.block)?.entries.get(self.entry)
    }

    fn step(&mut self) {
        self.entry += 1;
        if let Some(block) = self.list.blocks.get(self.block) {
            if self.entry >= block.entries.len() {
                self.block += 1;
                self.entry = 0;
            }
        }
    }

    /// Settle on the first entry from the cursor whose field mask matches.
    fn settle(&mut self) -> ReadStatus {
        loop {
            let Some(posting) = self.posting() else {
                self.current = DOCID_EOF;
                return ReadStatus::Eof;
            };
            if posting.field_mask & self.mask != 0 {
                let hit = TermHit {
                    term: self.term.clone(),
                    idf: self.idf,
                    bm25_idf: self.bm25_idf,
                    freq: posting.freq,
                    field_mask: posting.field_mask,
                    offsets: posting.offsets.clone(),
                };
                self.current = posting.doc_id;
                self.record = Record::Term {
                    hit,
                    weight: self.weight,
                };
                return ReadStatus::Ok;
            }
            self.step();
        }
    }
}

impl IndexIterator for TermIterator {
    fn read(&mut self) -> ReadStatus {
        if self.current == DOCID_EOF {
            return ReadStatus::Eof;
        }
        if self.current != 0 {
            self.step();
        }
        self.settle()
    }

    fn skip_to(&mut self, target: DocId) -> ReadStatus {
        if self.current == DOCID_EOF {
            return ReadStatus::Eof;
        }
        if self.current != 0 && self.current >= target {
            return if self.current == target {
                ReadStatus::Ok
            } else {
                ReadStatus::NotFound
            };
        }
        let blocks = &self.list.blocks;
        let offset = blocks[self.block.min(blocks.len())..].partition_point(|b| b.last_id() < target);
        self.block += offset;
        if offset > 0 {
            self.entry = 0;
        }
        if let Some(block) = blocks.get(self.block) {
            self.entry += block.entries[self.entry..].partition_point(|p| p.doc_id < target);
        }
        match self.settle() {
            ReadStatus::Ok if self.current == target => ReadStatus::Ok,
            ReadStatus::Ok => ReadStatus::NotFound,
            other => other,
        }
    }

    fn current_id(&self) -> DocId {
        self.current
    }

    fn record(&self) -> &Record {
        &self.record
    }

    fn estimate(&self) -> usize {
        self.list.num_docs()
    }

    fn rewind(&mut self) {
        self.block = 0;
        self.entry = 0;
        self.current = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::iterators::tests::drain;

    fn posting(doc_id: DocId, mask: u128) -> Posting {
        Posting {
            doc_id,
            freq: 1,
            field_mask: mask,
            offsets: vec![1],
        }
    }

    fn index_with(ids: impl Iterator<Item = DocId>) -> InvertedIndex {
        let mut index = InvertedIndex::new();
        for id in ids {
            index.add("hello", posting(id, if id % 2 == 0 { 0b01 } else { 0b10 }));
        }
        index
    }

    #[test]
    fn test_blocks_keep_ids_increasing() {
        let mut index = index_with(1..=300);
        let list = index.get("hello").unwrap();
        assert_eq!(list.num_blocks(), 3);
        assert_eq!(list.num_docs(), 300);
        index.add("hello", posting(5, 1));
        assert_eq!(index.get("hello").unwrap().num_docs(), 300);
    }

    #[test]
    fn test_snapshot_unaffected_by_appends() {
        let mut index = index_with(1..=10);
        let snapshot = index.get("hello").unwrap();
        index.add("hello", posting(11, 1));
        assert_eq!(snapshot.num_docs(), 10);
        assert_eq!(index.get("hello").unwrap().num_docs(), 11);
    }

    #[test]
    fn test_skip_to_across_blocks_with_mask() {
        let index = index_with(1..=300);
        let stats = CorpusStats {
            num_docs: 300,
            avg_doc_len: 1.0,
        };
        let mut it = TermIterator::new("hello", index.get("hello").unwrap(), 0b01, 1.0, &stats);
        assert_eq!(it.skip_to(201), ReadStatus::NotFound);
        assert_eq!(it.current_id(), 202);
        assert_eq!(it.skip_to(250), ReadStatus::Ok);
        let rest = drain(&mut it);
        assert_eq!(rest.first(), Some(&252));
        assert_eq!(rest.last(), Some(&300));
    }

    #[test]
    fn test_collect_garbage() {
        let mut index = index_with(1..=4);
        let freed = index.collect_garbage(&[2, 3]);
        assert!(freed > 0);
        assert_eq!(index.get("hello").unwrap().doc_ids(), vec![1, 4]);
        assert_eq!(index.collect_garbage(&[2, 3]), 0);
        index.collect_garbage(&[1, 4]);
        assert_eq!(index.num_terms(), 0);
    }

    #[test]
    fn test_expansions() {
        let mut index = InvertedIndex::new();
        for term in ["hello", "help", "helm", "+hel", "world"] {
            index.add(term, posting(1, 1));
        }
        let exp = index.prefix("hel", 2);
        assert_eq!(exp.terms.len(), 2);
        assert!(exp.truncated);
        let fuzzy = index.matching(10, |t| edit_distance_within(t, "word", 1));
        assert_eq!(fuzzy.terms[0].0, "world");
    }
}
