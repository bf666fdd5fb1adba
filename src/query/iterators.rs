//! Iterator tree
//!
//! Every node is a pull-based state machine over ascending doc-ids:
//! `read` advances to the next match and `skip_to` seeks to the first match
//! at or after a target. Leaves own snapshots of the index data they
//! iterate, so a tree stays valid after the index lock is released.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::types::{DocId, DOCID_EOF};

/// Result of advancing an iterator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Positioned on a match (for `skip_to`: exactly at the target)
    Ok,
    /// `skip_to` only: positioned on the first match after the target
    NotFound,
    Eof,
    /// The iterator gave up because the query deadline passed
    TimedOut,
}

/// One term occurrence in a document
#[derive(Debug, Clone, PartialEq)]
pub struct TermHit {
    pub term: Arc<str>,
    pub idf: f64,
    pub bm25_idf: f64,
    pub freq: u32,
    pub field_mask: u128,
    pub offsets: Vec<u32>,
}

/// Match information carried with the current doc-id
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Term { hit: TermHit, weight: f64 },
    /// Match without term statistics (tag, numeric, geo, wildcard, not)
    Virtual { weight: f64 },
    /// Vector match with its distance to the query, exposed under `name`
    Metric {
        distance: f64,
        weight: f64,
        name: Arc<str>,
    },
    Union { children: Vec<Record>, weight: f64 },
    Intersect { children: Vec<Record>, weight: f64 },
}

impl Default for Record {
    fn default() -> Self {
        Record::Virtual { weight: 1.0 }
    }
}

impl Record {
    pub fn weight(&self) -> f64 {
        match self {
            Record::Term { weight, .. }
            | Record::Virtual { weight }
            | Record::Metric { weight, .. }
            | Record::Union { weight, .. }
            | Record::Intersect { weight, .. } => *weight,
        }
    }

    /// Sorted, deduplicated term positions under this record.
    pub fn offsets(&self) -> Vec<u32> {
        match self {
            Record::Term { hit, .. } => hit.offsets.clone(),
            Record::Union { children, .. } | Record::Intersect { children, .. } => {
                let mut all: Vec<u32> = children.iter().flat_map(|c| c.offsets()).collect();
                all.sort_unstable();
                all.dedup();
                all
            }
            _ => Vec::new(),
        }
    }

    /// First vector distance found in the record tree.
    pub fn distance(&self) -> Option<f64> {
        match self {
            Record::Metric { distance, .. } => Some(*distance),
            Record::Union { children, .. } | Record::Intersect { children, .. } => {
                children.iter().find_map(|c| c.distance())
            }
            _ => None,
        }
    }

    /// Every named distance in the tree.
    pub fn distances(&self, out: &mut Vec<(Arc<str>, f64)>) {
        match self {
            Record::Metric { distance, name, .. } => out.push((name.clone(), *distance)),
            Record::Union { children, .. } | Record::Intersect { children, .. } => {
                for child in children {
                    child.distances(out);
                }
            }
            _ => {}
        }
    }

    /// Every term hit in the tree, depth first.
    pub fn term_hits<'a>(&'a self, out: &mut Vec<&'a TermHit>) {
        match self {
            Record::Term { hit, .. } => out.push(hit),
            Record::Union { children, .. } | Record::Intersect { children, .. } => {
                for child in children {
                    child.term_hits(out);
                }
            }
            _ => {}
        }
    }
}

/// Pull-based doc-id iterator
pub trait IndexIterator: Send {
    /// Advance to the next match.
    fn read(&mut self) -> ReadStatus;

    /// Advance to the first match `>= target`. Does not move when already there.
    fn skip_to(&mut self, target: DocId) -> ReadStatus;

    /// Current doc-id: 0 before the first read, `DOCID_EOF` when exhausted.
    fn current_id(&self) -> DocId;

    fn record(&self) -> &Record;

    /// Upper bound on the number of matches, used to order intersections.
    fn estimate(&self) -> usize;

    /// Restart from the beginning.
    fn rewind(&mut self);

    fn at_eof(&self) -> bool {
        self.current_id() == DOCID_EOF
    }
}

pub type BoxedIterator = Box<dyn IndexIterator>;

/// Shared `skip_to` contract for iterators that are already positioned.
fn settled(current: DocId, target: DocId) -> Option<ReadStatus> {
    if current == DOCID_EOF {
        Some(ReadStatus::Eof)
    } else if current != 0 && current == target {
        Some(ReadStatus::Ok)
    } else if current != 0 && current > target {
        Some(ReadStatus::NotFound)
    } else {
        None
    }
}

/// Yields nothing
#[derive(Debug, Default)]
pub struct EmptyIterator {
    record: Record,
}

impl EmptyIterator {
    pub fn boxed() -> BoxedIterator {
        Box::<EmptyIterator>::default()
    }
}

impl IndexIterator for EmptyIterator {
    fn read(&mut self) -> ReadStatus {
        ReadStatus::Eof
    }

    fn skip_to(&mut self, _target: DocId) -> ReadStatus {
        ReadStatus::Eof
    }

    fn current_id(&self) -> DocId {
        DOCID_EOF
    }

    fn record(&self) -> &Record {
        &self.record
    }

    fn estimate(&self) -> usize {
        0
    }

    fn rewind(&mut self) {}
}

/// Iterates a sorted id list, optionally with a distance per id.
///
/// Backs tag, numeric, geo, geoshape, wildcard, id-filter and vector range
/// leaves. The list is materialized when the leaf is opened.
#[derive(Debug)]
pub struct IdListIterator {
    ids: Vec<DocId>,
    distances: Option<(Vec<f64>, Arc<str>)>,
    pos: usize,
    current: DocId,
    record: Record,
    weight: f64,
    timed_out: bool,
}

impl IdListIterator {
    /// `ids` need not be sorted; duplicates are removed.
    pub fn new(mut ids: Vec<DocId>, weight: f64) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Self {
            ids,
            distances: None,
            pos: 0,
            current: 0,
            record: Record::Virtual { weight },
            weight,
            timed_out: false,
        }
    }

    /// Ids with a distance each, e.g. the result of a vector range query.
    pub fn with_distances(mut pairs: Vec<(DocId, f64)>, weight: f64, name: &str) -> Self {
        pairs.sort_by_key(|p| p.0);
        pairs.dedup_by_key(|p| p.0);
        let (ids, distances) = pairs.into_iter().unzip();
        let name: Arc<str> = Arc::from(name);
        Self {
            ids,
            record: Record::Metric {
                distance: 0.0,
                weight,
                name: name.clone(),
            },
            distances: Some((distances, name)),
            pos: 0,
            current: 0,
            weight,
            timed_out: false,
        }
    }

    /// Report a timeout once the list is exhausted.
    pub fn mark_timed_out(mut self) -> Self {
        self.timed_out = true;
        self
    }

    pub fn boxed(self) -> BoxedIterator {
        Box::new(self)
    }

    fn set_current(&mut self) -> ReadStatus {
        match self.ids.get(self.pos) {
            Some(&id) => {
                self.current = id;
                if let Some((distances, name)) = &self.distances {
                    self.record = Record::Metric {
                        distance: distances[self.pos],
                        weight: self.weight,
                        name: name.clone(),
                    };
                }
                ReadStatus::Ok
            }
            None => {
                self.current = DOCID_EOF;
                if self.timed_out {
                    ReadStatus::TimedOut
                } else {
                    ReadStatus::Eof
                }
            }
        }
    }
}

impl IndexIterator for IdListIterator {
    fn read(&mut self) -> ReadStatus {
        if self.current == DOCID_EOF {
            return ReadStatus::Eof;
        }
        if self.current != 0 {
            self.pos += 1;
        }
        self.set_current()
    }

    fn skip_to(&mut self, target: DocId) -> ReadStatus {
        if let Some(status) = settled(self.current, target) {
            return status;
        }
        let rest = &self.ids[self.pos..];
        self.pos += rest.partition_point(|&id| id < target);
        match self.set_current() {
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
        self.ids.len()
    }

    fn rewind(&mut self) {
        self.pos = 0;
        self.current = 0;
    }
}

/// Yields ids present in every child
pub struct IntersectIterator {
    children: Vec<BoxedIterator>,
    current: DocId,
    record: Record,
    weight: f64,
    slop: Option<u32>,
    in_order: bool,
}

impl IntersectIterator {
    /// Children are reordered cheapest first; ties keep their given order.
    pub fn new(
        mut children: Vec<BoxedIterator>,
        weight: f64,
        slop: Option<u32>,
        in_order: bool,
    ) -> Self {
        // Reordering would break the positional contract of in-order matching.
        if !in_order {
            children.sort_by_key(|c| c.estimate());
        }
        Self {
            children,
            current: 0,
            record: Record::Intersect {
                children: Vec::new(),
                weight,
            },
            weight,
            slop,
            in_order,
        }
    }

    fn advance(&mut self, mut target: DocId) -> ReadStatus {
        if self.children.is_empty() {
            self.current = DOCID_EOF;
            return ReadStatus::Eof;
        }
        'outer: loop {
            for child in self.children.iter_mut() {
                let id = child.current_id();
                if id == DOCID_EOF {
                    self.current = DOCID_EOF;
                    return ReadStatus::Eof;
                }
                if id == 0 || id < target {
                    match child.skip_to(target) {
                        ReadStatus::Ok => {}
                        ReadStatus::NotFound => {
                            target = child.current_id();
                            continue 'outer;
                        }
                        ReadStatus::Eof => {
                            self.current = DOCID_EOF;
                            return ReadStatus::Eof;
                        }
                        ReadStatus::TimedOut => {
                            self.current = DOCID_EOF;
                            return ReadStatus::TimedOut;
                        }
                    }
                } else if id > target {
                    target = id;
                    continue 'outer;
                }
            }

            if self.proximity_ok() {
                self.current = target;
                self.record = Record::Intersect {
                    children: self.children.iter().map(|c| c.record().clone()).collect(),
                    weight: self.weight,
                };
                return ReadStatus::Ok;
            }
            target += 1;
        }
    }

    fn proximity_ok(&self) -> bool {
        let Some(slop) = self.slop else {
            return true;
        };
        let lists: Vec<Vec<u32>> = self
            .children
            .iter()
            .map(|c| c.record().offsets())
            .filter(|o| !o.is_empty())
            .collect();
        if lists.len() < 2 {
            return true;
        }
        within_slop(&lists, slop, self.in_order)
    }
}

impl IndexIterator for IntersectIterator {
    fn read(&mut self) -> ReadStatus {
        if self.current == DOCID_EOF {
            return ReadStatus::Eof;
        }
        self.advance(self.current + 1)
    }

    fn skip_to(&mut self, target: DocId) -> ReadStatus {
        if let Some(status) = settled(self.current, target) {
            return status;
        }
        match self.advance(target.max(self.current + 1)) {
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
        self.children.iter().map(|c| c.estimate()).min().unwrap_or(0)
    }

    fn rewind(&mut self) {
        self.current = 0;
        for child in self.children.iter_mut() {
            child.rewind();
        }
    }
}

/// Whether one position from each list fits in a window of `slop` gaps.
pub fn within_slop(lists: &[Vec<u32>], slop: u32, in_order: bool) -> bool {
    let n = lists.len() as i64;
    if in_order {
        'starts: for &start in &lists[0] {
            let mut last = start;
            for list in &lists[1..] {
                let idx = list.partition_point(|&p| p <= last);
                match list.get(idx) {
                    Some(&p) => last = p,
                    // Later starts cannot do better.
                    None => break 'starts,
                }
            }
            if (last as i64 - start as i64 - (n - 1)) <= slop as i64 {
                return true;
            }
        }
        return false;
    }

    let mut merged: Vec<(u32, usize)> = lists
        .iter()
        .enumerate()
        .flat_map(|(i, l)| l.iter().map(move |&p| (p, i)))
        .collect();
    merged.sort_unstable();
    let mut counts = vec![0usize; lists.len()];
    let mut covered = 0;
    let mut left = 0;
    for right in 0..merged.len() {
        let (_, list) = merged[right];
        if counts[list] == 0 {
            covered += 1;
        }
        counts[list] += 1;
        while covered == lists.len() {
            let span = merged[right].0 as i64 - merged[left].0 as i64 - (n - 1);
            if span <= slop as i64 {
                return true;
            }
            let (_, l) = merged[left];
            counts[l] -= 1;
            if counts[l] == 0 {
                covered -= 1;
            }
            left += 1;
        }
    }
    false
}

/// Yields ids present in any child
pub struct UnionIterator {
    children: Vec<BoxedIterator>,
    heap: Option<BinaryHeap<Reverse<(DocId, usize)>>>,
    use_heap: bool,
    started: bool,
    current: DocId,
    record: Record,
    weight: f64,
    timed_out: bool,
}

impl UnionIterator {
    /// Unions wider than `heap_threshold` children track the minimum with a heap.
    pub fn new(children: Vec<BoxedIterator>, weight: f64, heap_threshold: usize) -> Self {
        let use_heap = children.len() > heap_threshold;
        Self {
            children,
            heap: None,
            use_heap,
            started: false,
            current: 0,
            record: Record::Union {
                children: Vec::new(),
                weight,
            },
            weight,
            timed_out: false,
        }
    }

    pub fn uses_heap(&self) -> bool {
        self.use_heap
    }

    fn start(&mut self) {
        self.started = true;
        let mut heap = BinaryHeap::with_capacity(self.children.len());
        for (idx, child) in self.children.iter_mut().enumerate() {
            match child.read() {
                ReadStatus::Ok | ReadStatus::NotFound => heap.push(Reverse((child.current_id(), idx))),
                ReadStatus::TimedOut => self.timed_out = true,
                ReadStatus::Eof => {}
            }
        }
        if self.use_heap {
            self.heap = Some(heap);
        }
    }

    /// Move every child below `target` up to it.
    fn catch_up(&mut self, target: DocId) {
        if let Some(heap) = self.heap.as_mut() {
            while let Some(&Reverse((id, idx))) = heap.peek() {
                if id >= target {
                    break;
                }
                heap.pop();
                match self.children[idx].skip_to(target) {
                    ReadStatus::Ok | ReadStatus::NotFound => {
                        heap.push(Reverse((self.children[idx].current_id(), idx)))
                    }
                    ReadStatus::TimedOut => self.timed_out = true,
                    ReadStatus::Eof => {}
                }
            }
        } else {
            for child in self.children.iter_mut() {
                let id = child.current_id();
                if id != DOCID_EOF && (id == 0 || id < target) {
                    if child.skip_to(target) == ReadStatus::TimedOut {
                        self.timed_out = true;
                    }
                }
            }
        }
    }

    fn settle(&mut self) -> ReadStatus {
        let min = match &self.heap {
            Some(heap) => heap.peek().map(|Reverse((id, _))| *id),
            None => self
                .children
                .iter()
                .map(|c| c.current_id())
                .filter(|&id| id != 0 && id != DOCID_EOF)
                .min(),
        };
        let Some(min) = min else {
            self.current = DOCID_EOF;
            return if self.timed_out {
                ReadStatus::TimedOut
            } else {
                ReadStatus::Eof
            };
        };
        self.current = min;
        self.record = Record::Union {
            children: self
                .children
                .iter()
                .filter(|c| c.current_id() == min)
                .map(|c| c.record().clone())
                .collect(),
            weight: self.weight,
        };
        ReadStatus::Ok
    }
}

impl IndexIterator for UnionIterator {
    fn read(&mut self) -> ReadStatus {
        if self.current == DOCID_EOF {
            return ReadStatus::Eof;
        }
        if !self.started {
            self.start();
        } else {
            self.catch_up(self.current + 1);
        }
        self.settle()
    }

    fn skip_to(&mut self, target: DocId) -> ReadStatus {
        if let Some(status) = settled(self.current, target) {
            return status;
        }
        if !self.started {
            self.start();
        }
        self.catch_up(target);
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
        self.children.iter().map(|c| c.estimate()).sum()
    }

    fn rewind(&mut self) {
        self.current = 0;
        self.started = false;
        self.heap = None;
        self.timed_out = false;
        for child in self.children.iter_mut() {
            child.rewind();
        }
    }
}

/// Yields ids in `1..=max_id` that the child does not match
pub struct NotIterator {
    child: BoxedIterator,
    max_id: DocId,
    current: DocId,
    record: Record,
}

impl NotIterator {
    pub fn new(child: BoxedIterator, max_id: DocId, weight: f64) -> Self {
        Self {
            child,
            max_id,
            current: 0,
            record: Record::Virtual { weight },
        }
    }

    fn advance(&mut self, mut candidate: DocId) -> ReadStatus {
        loop {
            if candidate > self.max_id {
                self.current = DOCID_EOF;
                return ReadStatus::Eof;
            }
            let child_id = self.child.current_id();
            if child_id != DOCID_EOF && (child_id == 0 || child_id < candidate) {
                if self.child.skip_to(candidate) == ReadStatus::TimedOut {
                    self.current = DOCID_EOF;
                    return ReadStatus::TimedOut;
                }
            }
            if self.child.current_id() == candidate {
                candidate += 1;
                continue;
            }
            self.current = candidate;
            return ReadStatus::Ok;
        }
    }
}

impl IndexIterator for NotIterator {
    fn read(&mut self) -> ReadStatus {
        if self.current == DOCID_EOF {
            return ReadStatus::Eof;
        }
        self.advance(self.current + 1)
    }

    fn skip_to(&mut self, target: DocId) -> ReadStatus {
        if let Some(status) = settled(self.current, target) {
            return status;
        }
        match self.advance(target.max(self.current + 1)) {
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
        self.max_id as usize
    }

    fn rewind(&mut self) {
        self.current = 0;
        self.child.rewind();
    }
}

/// Matches every id in `1..=max_id`, carrying the child's record when it matches
pub struct OptionalIterator {
    child: BoxedIterator,
    max_id: DocId,
    current: DocId,
    record: Record,
    weight: f64,
}

impl OptionalIterator {
    pub fn new(child: BoxedIterator, max_id: DocId, weight: f64) -> Self {
        Self {
            child,
            max_id,
            current: 0,
            record: Record::Virtual { weight: 0.0 },
            weight,
        }
    }

    fn land(&mut self, target: DocId) -> ReadStatus {
        if target > self.max_id {
            self.current = DOCID_EOF;
            return ReadStatus::Eof;
        }
        let child_id = self.child.current_id();
        if child_id != DOCID_EOF && (child_id == 0 || child_id < target) {
            // A timed-out child only loses its score contribution.
            let _ = self.child.skip_to(target);
        }
        self.current = target;
        self.record = if self.child.current_id() == target {
            Record::Union {
                children: vec![self.child.record().clone()],
                weight: self.weight,
            }
        } else {
            Record::Virtual { weight: 0.0 }
        };
        ReadStatus::Ok
    }
}

impl IndexIterator for OptionalIterator {
    fn read(&mut self) -> ReadStatus {
        if self.current == DOCID_EOF {
            return ReadStatus::Eof;
        }
        self.land(self.current + 1)
    }

    fn skip_to(&mut self, target: DocId) -> ReadStatus {
        if let Some(status) = settled(self.current, target) {
            return status;
        }
        self.land(target.max(self.current + 1))
    }

    fn current_id(&self) -> DocId {
        self.current
    }

    fn record(&self) -> &Record {
        &self.record
    }

    fn estimate(&self) -> usize {
        self.max_id as usize
    }

    fn rewind(&mut self) {
        self.current = 0;
        self.child.rewind();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn ids(list: &[DocId]) -> BoxedIterator {
        IdListIterator::new(list.to_vec(), 1.0).boxed()
    }

    pub(crate) fn drain(it: &mut dyn IndexIterator) -> Vec<DocId> {
        let mut out = Vec::new();
        while it.read() == ReadStatus::Ok {
            out.push(it.current_id());
        }
        out
    }

    #[test]
    fn test_id_list_skip_to() {
        let mut it = IdListIterator::new(vec![5, 1, 9, 5], 1.0);
        assert_eq!(it.skip_to(5), ReadStatus::Ok);
        assert_eq!(it.skip_to(6), ReadStatus::NotFound);
        assert_eq!(it.current_id(), 9);
        assert_eq!(it.skip_to(3), ReadStatus::NotFound);
        assert_eq!(it.skip_to(10), ReadStatus::Eof);
        assert!(it.at_eof());
    }

    #[test]
    fn test_intersect() {
        let mut it = IntersectIterator::new(vec![ids(&[1, 3, 5, 7]), ids(&[3, 4, 7, 8])], 1.0, None, false);
        assert_eq!(drain(&mut it), vec![3, 7]);
    }

    #[test]
    fn test_intersect_with_empty_child() {
        let mut it = IntersectIterator::new(vec![ids(&[1, 2]), EmptyIterator::boxed()], 1.0, None, false);
        assert_eq!(drain(&mut it), Vec::<DocId>::new());
    }

    #[test]
    fn test_union_flat_and_heap_agree() {
        for threshold in [0, 100] {
            let mut it = UnionIterator::new(vec![ids(&[1, 4]), ids(&[2, 4, 9]), ids(&[])], 1.0, threshold);
            assert_eq!(it.uses_heap(), threshold == 0);
            assert_eq!(drain(&mut it), vec![1, 2, 4, 9]);
        }
    }

    #[test]
    fn test_union_skip_to() {
        let mut it = UnionIterator::new(vec![ids(&[1, 4]), ids(&[2, 9])], 1.0, 0);
        assert_eq!(it.skip_to(3), ReadStatus::NotFound);
        assert_eq!(it.current_id(), 4);
        assert_eq!(it.skip_to(9), ReadStatus::Ok);
        assert_eq!(it.read(), ReadStatus::Eof);
    }

    #[test]
    fn test_not() {
        let mut it = NotIterator::new(ids(&[2, 3]), 5, 1.0);
        assert_eq!(drain(&mut it), vec![1, 4, 5]);
    }

    #[test]
    fn test_optional_never_filters() {
        let mut it = IntersectIterator::new(
            vec![ids(&[2, 4]), Box::new(OptionalIterator::new(ids(&[4]), 10, 1.0))],
            1.0,
            None,
            false,
        );
        assert_eq!(it.read(), ReadStatus::Ok);
        assert_eq!(it.current_id(), 2);
        assert_eq!(it.read(), ReadStatus::Ok);
        assert_eq!(it.current_id(), 4);
        assert_eq!(it.read(), ReadStatus::Eof);
    }

    #[test]
    fn test_within_slop() {
        let a = vec![1, 10];
        let b = vec![2, 20];
        assert!(within_slop(&[a.clone(), b.clone()], 0, true));
        assert!(!within_slop(&[b.clone(), a.clone()], 0, true));
        assert!(within_slop(&[b, a], 0, false));
        assert!(!within_slop(&[vec![1], vec![5]], 2, false));
        assert!(within_slop(&[vec![1], vec![5]], 3, false));
    }
}
