//! Numeric range tree
//!
//! Leaves partition the value axis into half-open ranges and hold
//! `(doc-id, value)` entries in ascending doc-id order. A leaf that grows
//! past its capacity splits at its median value. Every indexed value lives
//! in exactly one leaf, so the leaves together cover all documents with a
//! value for the field.

use crate::types::DocId;

const LEAF_CAPACITY: usize = 512;

#[derive(Debug, Clone, Default)]
struct Leaf {
    entries: Vec<(DocId, f64)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumericRange {
    pub min: f64,
    pub max: f64,
    pub min_inclusive: bool,
    pub max_inclusive: bool,
}

impl NumericRange {
    pub fn inclusive(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            min_inclusive: true,
            max_inclusive: true,
        }
    }

    pub fn contains(&self, v: f64) -> bool {
        let above = if self.min_inclusive { v >= self.min } else { v > self.min };
        let below = if self.max_inclusive { v <= self.max } else { v < self.max };
        above && below
    }
}

#[derive(Debug, Clone)]
pub struct NumericIndex {
    /// Lower bound of each leaf; the first is always -inf
    bounds: Vec<f64>,
    leaves: Vec<Leaf>,
    num_entries: usize,
}

impl Default for NumericIndex {
    fn default() -> Self {
        Self {
            bounds: vec![f64::NEG_INFINITY],
            leaves: vec![Leaf::default()],
            num_entries: 0,
        }
    }
}

impl NumericIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn leaf_for(&self, value: f64) -> usize {
        self.bounds.partition_point(|b| *b <= value).saturating_sub(1)
    }

    pub fn insert(&mut self, doc_id: DocId, value: f64) {
        let idx = self.leaf_for(value);
        self.leaves[idx].entries.push((doc_id, value));
        self.num_entries += 1;
        if self.leaves[idx].entries.len() > LEAF_CAPACITY {
            self.split(idx);
        }
    }

    fn split(&mut self, idx: usize) {
        let mut values: Vec<f64> = self.leaves[idx].entries.iter().map(|e| e.1).collect();
        values.sort_by(f64::total_cmp);
        let median = values[values.len() / 2];
        // A leaf of identical values cannot be split.
        if median <= values[0] {
            return;
        }
        let (low, high): (Vec<_>, Vec<_>) = self.leaves[idx]
            .entries
            .iter()
            .partition(|e| e.1 < median);
        self.leaves[idx].entries = low;
        self.leaves.insert(idx + 1, Leaf { entries: high });
        self.bounds.insert(idx + 1, median);
    }

    fn overlapping(&self, range: &NumericRange) -> impl Iterator<Item = &Leaf> {
        let first = self.leaf_for(range.min);
        let last = self.leaf_for(range.max);
        self.leaves[first..=last.max(first)].iter()
    }

    /// Ids with a value in `range`, ascending and deduplicated.
    pub fn range(&self, range: &NumericRange) -> Vec<DocId> {
        if range.min > range.max {
            return Vec::new();
        }
        let mut ids: Vec<DocId> = self
            .overlapping(range)
            .flat_map(|leaf| leaf.entries.iter())
            .filter(|(_, v)| range.contains(*v))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Entries in the leaves a range touches, without filtering.
    pub fn estimate(&self, range: &NumericRange) -> usize {
        if range.min > range.max {
            return 0;
        }
        self.overlapping(range).map(|leaf| leaf.entries.len()).sum()
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    pub fn num_leaves(&self) -> usize {
        self.leaves.len()
    }

    pub fn memory_usage(&self) -> usize {
        self.num_entries * std::mem::size_of::<(DocId, f64)>()
            + self.bounds.len() * std::mem::size_of::<f64>()
    }

    /// Remove entries of `dead` (sorted) ids; empty leaves merge into their
    /// left neighbor. Returns bytes freed.
    pub fn collect_garbage(&mut self, dead: &[DocId]) -> usize {
        let mut removed = 0;
        for leaf in self.leaves.iter_mut() {
            let before = leaf.entries.len();
            leaf.entries.retain(|(id, _)| dead.binary_search(id).is_err());
            removed += before - leaf.entries.len();
        }
        let mut i = 1;
        while i < self.leaves.len() {
            if self.leaves[i].entries.is_empty() {
                self.leaves.remove(i);
                self.bounds.remove(i);
            } else {
                i += 1;
            }
        }
        self.num_entries -= removed;
        removed * std::mem::size_of::<(DocId, f64)>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_with_exclusive_bounds() {
        let mut index = NumericIndex::new();
        for i in 1..=10 {
            index.insert(i, i as f64);
        }
        assert_eq!(index.range(&NumericRange::inclusive(3.0, 5.0)), vec![3, 4, 5]);
        let exclusive = NumericRange {
            min: 3.0,
            max: 5.0,
            min_inclusive: false,
            max_inclusive: false,
        };
        assert_eq!(index.range(&exclusive), vec![4]);
        assert!(index.range(&NumericRange::inclusive(5.0, 3.0)).is_empty());
    }

    #[test]
    fn test_splits_cover_all_entries() {
        let mut index = NumericIndex::new();
        for i in 1..=5000u64 {
            index.insert(i, ((i * 7919) % 1000) as f64);
        }
        assert!(index.num_leaves() > 1);
        let all = index.range(&NumericRange::inclusive(f64::NEG_INFINITY, f64::INFINITY));
        assert_eq!(all.len(), 5000);
        let some = index.range(&NumericRange::inclusive(100.0, 199.0));
        assert_eq!(some.len(), 500);
    }

    #[test]
    fn test_identical_values_do_not_split() {
        let mut index = NumericIndex::new();
        for i in 1..=2000 {
            index.insert(i, 42.0);
        }
        assert_eq!(index.num_leaves(), 1);
        assert_eq!(index.range(&NumericRange::inclusive(42.0, 42.0)).len(), 2000);
    }

    #[test]
    fn test_collect_garbage() {
        let mut index = NumericIndex::new();
        for i in 1..=3 {
            index.insert(i, i as f64);
        }
        assert!(index.collect_garbage(&[2]) > 0);
        assert_eq!(index.range(&NumericRange::inclusive(0.0, 10.0)), vec![1, 3]);
        assert_eq!(index.collect_garbage(&[2]), 0);
    }
}
