//! Vector indexes
//!
//! Every backend implements [`VectorBackend`]: insert, delete, knn, range,
//! size, memory and info. Graph backends are always wrapped in a
//! [`tiered::TieredIndex`] whose flat frontend absorbs writes and migrates
//! them on the worker pool; with zero workers the migration runs in place.

pub mod distance;
pub mod element;
pub mod flat;
pub mod hnsw;
pub mod quantized;
pub mod tiered;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::query::timeout::{Partial, TimeoutCheck};
use crate::runtime::Settings;
use crate::schema::{VectorAlgorithm, VectorOptions};
use crate::types::{DistanceMetric, DocId};
use crate::workers::WorkerPool;
use crate::{Error, Result};

pub use flat::FlatIndex;
pub use hnsw::HnswIndex;
pub use tiered::TieredIndex;

/// One (label, distance) result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub label: DocId,
    pub distance: f32,
}

impl Neighbor {
    pub fn new(label: DocId, distance: f32) -> Self {
        Self { label, distance }
    }
}

impl Eq for Neighbor {}

impl Ord for Neighbor {
    /// Smaller distance first, then smaller label.
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.label.cmp(&other.label))
    }
}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Bounded max-heap keeping the `k` best neighbors
#[derive(Debug)]
pub struct TopK {
    k: usize,
    heap: BinaryHeap<Neighbor>,
}

impl TopK {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k.min(4096) + 1),
        }
    }

    pub fn push(&mut self, candidate: Neighbor) {
        if self.k == 0 {
            return;
        }
        if self.heap.len() < self.k {
            self.heap.push(candidate);
        } else if let Some(worst) = self.heap.peek() {
            if candidate < *worst {
                self.heap.pop();
                self.heap.push(candidate);
            }
        }
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.k
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn worst(&self) -> Option<f32> {
        self.heap.peek().map(|n| n.distance)
    }

    pub fn into_sorted(self) -> Vec<Neighbor> {
        self.heap.into_sorted_vec()
    }
}

/// Query-time overrides
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SearchParams {
    pub ef_runtime: Option<usize>,
    pub epsilon: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VectorInfo {
    pub algorithm: String,
    pub size: usize,
    pub memory: usize,
    pub marked_deleted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_level: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantized: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frontend_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_deletes: Option<usize>,
}

/// Capability set of a vector backend. Vectors arrive decoded and, for
/// cosine, normalized.
pub trait VectorBackend: Send + Sync {
    fn insert(&self, label: DocId, vector: Vec<f32>) -> Result<()>;

    /// Idempotent; true when a live entry existed.
    fn delete(&self, label: DocId) -> bool;

    /// `min(k, size)` neighbors in non-decreasing distance order.
    fn knn(
        &self,
        query: &[f32],
        k: usize,
        params: &SearchParams,
        check: &mut TimeoutCheck,
    ) -> Partial<Vec<Neighbor>>;

    /// Every neighbor with distance <= radius, unordered.
    fn range(
        &self,
        query: &[f32],
        radius: f32,
        params: &SearchParams,
        check: &mut TimeoutCheck,
    ) -> Partial<Vec<Neighbor>>;

    fn distance_to(&self, label: DocId, query: &[f32]) -> Option<f32>;

    fn vector(&self, label: DocId) -> Option<Vec<f32>>;

    fn size(&self) -> usize;

    fn memory(&self) -> usize;

    fn info(&self) -> VectorInfo;

    /// Reclaim entries marked deleted; returns bytes freed.
    fn collect_garbage(&self) -> usize;
}

/// A vector attribute's index: element decoding plus a backend
pub struct VectorIndex {
    options: VectorOptions,
    backend: Arc<dyn VectorBackend>,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("options", &self.options)
            .field("size", &self.backend.size())
            .finish()
    }
}

impl VectorIndex {
    pub fn new(options: VectorOptions, settings: &Settings, pool: &WorkerPool) -> Self {
        let backend: Arc<dyn VectorBackend> = match options.algorithm {
            VectorAlgorithm::Flat => Arc::new(FlatIndex::new(&options)),
            VectorAlgorithm::Hnsw => {
                let graph = Arc::new(HnswIndex::new(&options, None));
                Arc::new(TieredIndex::new(&options, graph, settings, pool.clone()))
            }
            VectorAlgorithm::SvsVamana => {
                let graph = Arc::new(HnswIndex::new(&options, options.compression));
                Arc::new(TieredIndex::new(&options, graph, settings, pool.clone()))
            }
        };
        Self { options, backend }
    }

    pub fn options(&self) -> &VectorOptions {
        &self.options
    }

    pub fn metric(&self) -> DistanceMetric {
        self.options.metric
    }

    fn prepare(&self, mut v: Vec<f32>) -> Vec<f32> {
        if self.options.metric == DistanceMetric::Cosine {
            distance::normalize(&mut v);
        }
        v
    }

    /// Decode a query blob into the form stored vectors are compared in.
    pub fn encode_query(&self, blob: &[u8]) -> Result<Vec<f32>> {
        let v = element::decode(blob, self.options.elem_type, self.options.dim)?;
        Ok(self.prepare(v))
    }

    pub fn add_blob(&self, label: DocId, blob: &[u8], max_element_bytes: usize) -> Result<()> {
        if blob.len() > max_element_bytes {
            return Err(Error::ElementTooLarge(format!(
                "vector of {} bytes exceeds the {} byte element limit",
                blob.len(),
                max_element_bytes
            )));
        }
        let v = element::decode(blob, self.options.elem_type, self.options.dim)?;
        self.backend.insert(label, self.prepare(v))
    }

    pub fn add_numbers(&self, label: DocId, values: &[f64], max_element_bytes: usize) -> Result<()> {
        if self.options.blob_size() > max_element_bytes {
            return Err(Error::ElementTooLarge(format!(
                "vector of {} bytes exceeds the {} byte element limit",
                self.options.blob_size(),
                max_element_bytes
            )));
        }
        let v = element::from_numbers(values, self.options.elem_type, self.options.dim)?;
        self.backend.insert(label, self.prepare(v))
    }

    pub fn delete(&self, label: DocId) -> bool {
        self.backend.delete(label)
    }

    pub fn knn(
        &self,
        query: &[f32],
        k: usize,
        params: &SearchParams,
        check: &mut TimeoutCheck,
    ) -> Partial<Vec<Neighbor>> {
        if k == 0 {
            return Partial::complete(Vec::new());
        }
        self.backend.knn(query, k, params, check)
    }

    pub fn range(
        &self,
        query: &[f32],
        radius: f64,
        params: &SearchParams,
        check: &mut TimeoutCheck,
    ) -> Result<Partial<Vec<Neighbor>>> {
        if radius < 0.0 || radius.is_nan() {
            return Err(Error::bad_argument(format!("Invalid vector range radius {radius}")));
        }
        Ok(self.backend.range(query, radius as f32, params, check))
    }

    pub fn distance_to(&self, label: DocId, query: &[f32]) -> Option<f32> {
        self.backend.distance_to(label, query)
    }

    pub fn size(&self) -> usize {
        self.backend.size()
    }

    pub fn memory(&self) -> usize {
        self.backend.memory()
    }

    pub fn info(&self) -> VectorInfo {
        self.backend.info()
    }

    pub fn collect_garbage(&self) -> usize {
        self.backend.collect_garbage()
    }

    pub fn batches(&self, query: Vec<f32>, params: SearchParams) -> BatchIterator {
        BatchIterator {
            backend: self.backend.clone(),
            query,
            params,
            seen: HashSet::new(),
            requested: 0,
            exhausted: false,
        }
    }
}

/// Successive batches of nearest neighbors, each batch further out than
/// the previous. Works over any backend by re-running knn with a growing
/// k and skipping labels already returned.
pub struct BatchIterator {
    backend: Arc<dyn VectorBackend>,
    query: Vec<f32>,
    params: SearchParams,
    seen: HashSet<DocId>,
    requested: usize,
    exhausted: bool,
}

impl BatchIterator {
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn returned(&self) -> usize {
        self.seen.len()
    }

    /// Up to `size` new neighbors, in distance order.
    pub fn next_batch(&mut self, size: usize, check: &mut TimeoutCheck) -> Partial<Vec<Neighbor>> {
        if self.exhausted || size == 0 {
            return Partial::complete(Vec::new());
        }
        self.requested += size;
        let found = self.backend.knn(&self.query, self.requested, &self.params, check);
        if !found.timed_out && found.value.len() < self.requested {
            self.exhausted = true;
        }
        let fresh: Vec<Neighbor> = found
            .value
            .into_iter()
            .filter(|n| self.seen.insert(n.label))
            .collect();
        if fresh.is_empty() && !found.timed_out {
            self.exhausted = true;
        }
        Partial {
            value: fresh,
            timed_out: found.timed_out,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::query::timeout::Deadline;
    use crate::types::VectorType;

    pub(crate) fn check() -> TimeoutCheck {
        TimeoutCheck::new(Deadline::none(), 64)
    }

    fn flat_options(dim: usize) -> VectorOptions {
        let mut opts = VectorOptions::new(VectorAlgorithm::Flat);
        opts.dim = dim;
        opts
    }

    #[test]
    fn test_top_k_keeps_smallest_with_label_tiebreak() {
        let mut top = TopK::new(2);
        top.push(Neighbor::new(5, 1.0));
        top.push(Neighbor::new(3, 1.0));
        top.push(Neighbor::new(9, 0.5));
        top.push(Neighbor::new(1, 2.0));
        let labels: Vec<DocId> = top.into_sorted().iter().map(|n| n.label).collect();
        assert_eq!(labels, vec![9, 3]);
    }

    #[test]
    fn test_blob_checks() {
        let pool = WorkerPool::new(0);
        let index = VectorIndex::new(flat_options(2), &Settings::default(), &pool);
        let err = index.add_blob(1, &[0u8; 4], usize::MAX).unwrap_err();
        assert!(matches!(err, Error::BadVectorSize { .. }));
        let err = index.add_blob(1, &[0u8; 8], 4).unwrap_err();
        assert!(matches!(err, Error::ElementTooLarge(_)));
        let blob = element::encode(&[1.0, 2.0], VectorType::Float32);
        index.add_blob(1, &blob, usize::MAX).unwrap();
        assert_eq!(index.size(), 1);
    }

    #[test]
    fn test_negative_radius_rejected() {
        let pool = WorkerPool::new(0);
        let index = VectorIndex::new(flat_options(2), &Settings::default(), &pool);
        assert!(index
            .range(&[0.0, 0.0], -1.0, &SearchParams::default(), &mut check())
            .is_err());
    }

    #[test]
    fn test_batches_cover_index_without_repeats() {
        let pool = WorkerPool::new(0);
        let index = VectorIndex::new(flat_options(1), &Settings::default(), &pool);
        for i in 1..=10u64 {
            index.add_numbers(i, &[i as f64], usize::MAX).unwrap();
        }
        let mut batches = index.batches(vec![0.0], SearchParams::default());
        let mut all = Vec::new();
        while !batches.is_exhausted() {
            let batch = batches.next_batch(3, &mut check());
            all.extend(batch.value.iter().map(|n| n.label));
        }
        assert_eq!(all, (1..=10).collect::<Vec<_>>());
    }
}
