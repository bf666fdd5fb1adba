//! Brute-force vector index

use std::collections::HashMap;

use parking_lot::RwLock;

use super::distance::distance;
use super::{Neighbor, SearchParams, TopK, VectorBackend, VectorInfo};
use crate::query::timeout::{Partial, TimeoutCheck};
use crate::schema::VectorOptions;
use crate::types::{DistanceMetric, DocId};
use crate::Result;

#[derive(Debug, Default)]
struct FlatData {
    labels: Vec<DocId>,
    /// Row-major, `labels.len() * dim` values
    data: Vec<f32>,
    positions: HashMap<DocId, usize>,
}

#[derive(Debug)]
pub struct FlatIndex {
    dim: usize,
    metric: DistanceMetric,
    inner: RwLock<FlatData>,
}

impl FlatIndex {
    pub fn new(options: &VectorOptions) -> Self {
        let cap = options.initial_cap;
        Self {
            dim: options.dim,
            metric: options.metric,
            inner: RwLock::new(FlatData {
                labels: Vec::with_capacity(cap),
                data: Vec::with_capacity(cap * options.dim),
                positions: HashMap::with_capacity(cap),
            }),
        }
    }

    pub fn contains(&self, label: DocId) -> bool {
        self.inner.read().positions.contains_key(&label)
    }
}

impl VectorBackend for FlatIndex {
    fn insert(&self, label: DocId, vector: Vec<f32>) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(&pos) = inner.positions.get(&label) {
            let start = pos * self.dim;
            inner.data[start..start + self.dim].copy_from_slice(&vector);
            return Ok(());
        }
        let pos = inner.labels.len();
        inner.labels.push(label);
        inner.data.extend_from_slice(&vector);
        inner.positions.insert(label, pos);
        Ok(())
    }

    fn delete(&self, label: DocId) -> bool {
        let mut inner = self.inner.write();
        let Some(pos) = inner.positions.remove(&label) else {
            return false;
        };
        let last = inner.labels.len() - 1;
        if pos != last {
            let moved = inner.labels[last];
            inner.labels.swap(pos, last);
            let (dim, src) = (self.dim, last * self.dim);
            inner.data.copy_within(src..src + dim, pos * dim);
            inner.positions.insert(moved, pos);
        }
        inner.labels.pop();
        let len = inner.labels.len() * self.dim;
        inner.data.truncate(len);
        true
    }

    fn knn(
        &self,
        query: &[f32],
        k: usize,
        _params: &SearchParams,
        check: &mut TimeoutCheck,
    ) -> Partial<Vec<Neighbor>> {
        let inner = self.inner.read();
        let mut top = TopK::new(k);
        for (i, label) in inner.labels.iter().enumerate() {
            if check.tick() {
                return Partial::truncated(top.into_sorted());
            }
            let v = &inner.data[i * self.dim..(i + 1) * self.dim];
            top.push(Neighbor::new(*label, distance(self.metric, query, v)));
        }
        Partial::complete(top.into_sorted())
    }

    fn range(
        &self,
        query: &[f32],
        radius: f32,
        _params: &SearchParams,
        check: &mut TimeoutCheck,
    ) -> Partial<Vec<Neighbor>> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        for (i, label) in inner.labels.iter().enumerate() {
            if check.tick() {
                return Partial::truncated(out);
            }
            let d = distance(self.metric, query, &inner.data[i * self.dim..(i + 1) * self.dim]);
            if d <= radius {
                out.push(Neighbor::new(*label, d));
            }
        }
        Partial::complete(out)
    }

    fn distance_to(&self, label: DocId, query: &[f32]) -> Option<f32> {
        let inner = self.inner.read();
        let pos = *inner.positions.get(&label)?;
        Some(distance(
            self.metric,
            query,
            &inner.data[pos * self.dim..(pos + 1) * self.dim],
        ))
    }

    fn vector(&self, label: DocId) -> Option<Vec<f32>> {
        let inner = self.inner.read();
        let pos = *inner.positions.get(&label)?;
        Some(inner.data[pos * self.dim..(pos + 1) * self.dim].to_vec())
    }

    fn size(&self) -> usize {
        self.inner.read().labels.len()
    }

    fn memory(&self) -> usize {
        let inner = self.inner.read();
        inner.data.capacity() * std::mem::size_of::<f32>()
            + inner.labels.capacity() * std::mem::size_of::<DocId>()
            + inner.positions.capacity() * std::mem::size_of::<(DocId, usize)>()
    }

    fn info(&self) -> VectorInfo {
        VectorInfo {
            algorithm: "FLAT".to_string(),
            size: self.size(),
            memory: self.memory(),
            ..Default::default()
        }
    }

    fn collect_garbage(&self) -> usize {
        let mut inner = self.inner.write();
        let before = inner.data.capacity() + inner.labels.capacity() * 2;
        inner.data.shrink_to_fit();
        inner.labels.shrink_to_fit();
        let after = inner.data.capacity() + inner.labels.capacity() * 2;
        before.saturating_sub(after) * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::timeout::Deadline;
    use crate::schema::VectorAlgorithm;
    use crate::vector::tests::check;

    fn index(dim: usize) -> FlatIndex {
        let mut opts = VectorOptions::new(VectorAlgorithm::Flat);
        opts.dim = dim;
        FlatIndex::new(&opts)
    }

    #[test]
    fn test_knn_order_and_distances() {
        let index = index(2);
        for (label, y) in [(1, 0.1f32), (2, 0.2), (3, 0.3), (4, 0.4)] {
            index.insert(label, vec![0.1, y]).unwrap();
        }
        let found = index.knn(&[0.1, 0.1], 4, &SearchParams::default(), &mut check());
        assert!(!found.timed_out);
        let labels: Vec<DocId> = found.value.iter().map(|n| n.label).collect();
        assert_eq!(labels, vec![1, 2, 3, 4]);
        for (n, expected) in found.value.iter().zip([0.0, 0.01, 0.04, 0.09]) {
            assert!((n.distance - expected).abs() < 1e-6);
        }
        let fewer = index.knn(&[0.1, 0.1], 10, &SearchParams::default(), &mut check());
        assert_eq!(fewer.value.len(), 4);
    }

    #[test]
    fn test_delete_swaps_last_row() {
        let index = index(1);
        for i in 1..=3 {
            index.insert(i, vec![i as f32]).unwrap();
        }
        assert!(index.delete(1));
        assert!(!index.delete(1));
        assert_eq!(index.vector(3), Some(vec![3.0]));
        assert_eq!(index.size(), 2);
    }

    #[test]
    fn test_range_and_timeout() {
        let index = index(1);
        for i in 1..=100 {
            index.insert(i, vec![i as f32]).unwrap();
        }
        let hits = index.range(&[0.0], 9.0, &SearchParams::default(), &mut check());
        let mut labels: Vec<DocId> = hits.value.iter().map(|n| n.label).collect();
        labels.sort_unstable();
        assert_eq!(labels, vec![1, 2, 3]);

        let mut expired = TimeoutCheck::new(Deadline::expired(), 1);
        let partial = index.knn(&[0.0], 5, &SearchParams::default(), &mut expired);
        assert!(partial.timed_out);
    }
}
