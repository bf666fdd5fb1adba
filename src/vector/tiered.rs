//! Tiered vector index: flat write buffer in front of a graph backend
//!
//! Inserts land in the flat frontend and a low-priority job moves each one
//! into the backend. Once the frontend holds `tiered_buffer_limit` vectors
//! new inserts bypass it. Backend deletes are only marked; when
//! `swap_job_threshold` of them are pending the repair runs inline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::flat::FlatIndex;
use super::{Neighbor, SearchParams, VectorBackend, VectorInfo};
use crate::query::timeout::{Partial, TimeoutCheck};
use crate::runtime::Settings;
use crate::schema::VectorOptions;
use crate::types::DocId;
use crate::workers::{Priority, WorkerPool};
use crate::Result;

struct Tiers {
    frontend: FlatIndex,
    backend: Arc<dyn VectorBackend>,
    buffer_limit: usize,
    swap_job_threshold: usize,
    pending_deletes: AtomicUsize,
    migrated: AtomicU64,
    /// Serializes a label's move between tiers against its deletion
    migrate_lock: Mutex<()>,
}

impl Tiers {
    fn migrate(&self, label: DocId) {
        let _guard = self.migrate_lock.lock();
        let Some(vector) = self.frontend.vector(label) else {
            return;
        };
        match self.backend.insert(label, vector) {
            Ok(()) => {
                self.frontend.delete(label);
                self.migrated.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => tracing::warn!(label, error = %e, "vector migration failed"),
        }
    }
}

pub struct TieredIndex {
    tiers: Arc<Tiers>,
    pool: WorkerPool,
}

impl TieredIndex {
    pub fn new(
        options: &VectorOptions,
        backend: Arc<dyn VectorBackend>,
        settings: &Settings,
        pool: WorkerPool,
    ) -> Self {
        Self {
            tiers: Arc::new(Tiers {
                frontend: FlatIndex::new(options),
                backend,
                buffer_limit: settings.tiered_buffer_limit.max(1),
                swap_job_threshold: settings.swap_job_threshold.max(1),
                pending_deletes: AtomicUsize::new(0),
                migrated: AtomicU64::new(0),
                migrate_lock: Mutex::new(()),
            }),
            pool,
        }
    }

    pub fn frontend_size(&self) -> usize {
        self.tiers.frontend.size()
    }

    pub fn backend_size(&self) -> usize {
        self.tiers.backend.size()
    }

    pub fn migrated(&self) -> u64 {
        self.tiers.migrated.load(Ordering::Relaxed)
    }
}

/// Merge per-tier results, keeping the closer copy of a label seen in both.
fn merge(a: Vec<Neighbor>, b: Vec<Neighbor>) -> Vec<Neighbor> {
    let mut best: HashMap<DocId, Neighbor> = HashMap::with_capacity(a.len() + b.len());
    for n in a.into_iter().chain(b) {
        best.entry(n.label)
            .and_modify(|cur| {
                if n < *cur {
                    *cur = n;
                }
            })
            .or_insert(n);
    }
    let mut out: Vec<Neighbor> = best.into_values().collect();
    out.sort();
    out
}

impl VectorBackend for TieredIndex {
    fn insert(&self, label: DocId, vector: Vec<f32>) -> Result<()> {
        let tiers = &self.tiers;
        if tiers.frontend.size() >= tiers.buffer_limit {
            let _guard = tiers.migrate_lock.lock();
            return tiers.backend.insert(label, vector);
        }
        tiers.frontend.insert(label, vector)?;
        let job = self.tiers.clone();
        self.pool.submit(Priority::Low, move || job.migrate(label));
        Ok(())
    }

    fn delete(&self, label: DocId) -> bool {
        let tiers = &self.tiers;
        let _guard = tiers.migrate_lock.lock();
        let in_frontend = tiers.frontend.delete(label);
        let in_backend = tiers.backend.delete(label);
        if in_backend {
            let pending = tiers.pending_deletes.fetch_add(1, Ordering::Relaxed) + 1;
            if pending >= tiers.swap_job_threshold {
                let freed = tiers.backend.collect_garbage();
                tiers.pending_deletes.store(0, Ordering::Relaxed);
                tracing::debug!(pending, freed, "forced inline vector repair");
            }
        }
        in_frontend || in_backend
    }

    fn knn(
        &self,
        query: &[f32],
        k: usize,
        params: &SearchParams,
        check: &mut TimeoutCheck,
    ) -> Partial<Vec<Neighbor>> {
        let front = self.tiers.frontend.knn(query, k, params, check);
        if front.timed_out {
            return front;
        }
        let back = self.tiers.backend.knn(query, k, params, check);
        let mut merged = merge(front.value, back.value);
        merged.truncate(k);
        Partial {
            value: merged,
            timed_out: back.timed_out,
        }
    }

    fn range(
        &self,
        query: &[f32],
        radius: f32,
        params: &SearchParams,
        check: &mut TimeoutCheck,
    ) -> Partial<Vec<Neighbor>> {
        let front = self.tiers.frontend.range(query, radius, params, check);
        if front.timed_out {
            return front;
        }
        let back = self.tiers.backend.range(query, radius, params, check);
        Partial {
            value: merge(front.value, back.value),
            timed_out: back.timed_out,
        }
    }

    fn distance_to(&self, label: DocId, query: &[f32]) -> Option<f32> {
        self.tiers
            .frontend
            .distance_to(label, query)
            .or_else(|| self.tiers.backend.distance_to(label, query))
    }

    fn vector(&self, label: DocId) -> Option<Vec<f32>> {
        self.tiers
            .frontend
            .vector(label)
            .or_else(|| self.tiers.backend.vector(label))
    }

    fn size(&self) -> usize {
        self.frontend_size() + self.backend_size()
    }

    fn memory(&self) -> usize {
        self.tiers.frontend.memory() + self.tiers.backend.memory()
    }

    fn info(&self) -> VectorInfo {
        let backend = self.tiers.backend.info();
        VectorInfo {
            size: self.size(),
            memory: self.memory(),
            frontend_size: Some(self.frontend_size()),
            backend_size: Some(backend.size),
            pending_deletes: Some(self.tiers.pending_deletes.load(Ordering::Relaxed)),
            ..backend
        }
    }

    fn collect_garbage(&self) -> usize {
        let freed = self.tiers.backend.collect_garbage() + self.tiers.frontend.collect_garbage();
        self.tiers.pending_deletes.store(0, Ordering::Relaxed);
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::VectorAlgorithm;
    use crate::vector::hnsw::HnswIndex;
    use crate::vector::tests::check;

    fn tiered(pool: WorkerPool, settings: Settings) -> TieredIndex {
        let mut opts = VectorOptions::new(VectorAlgorithm::Hnsw);
        opts.dim = 1;
        let graph = Arc::new(HnswIndex::new(&opts, None));
        TieredIndex::new(&opts, graph, &settings, pool)
    }

    #[test]
    fn test_in_place_mode_migrates_immediately() {
        let index = tiered(WorkerPool::new(0), Settings::default());
        for i in 1..=20u64 {
            index.insert(i, vec![i as f32]).unwrap();
        }
        assert_eq!(index.frontend_size(), 0);
        assert_eq!(index.backend_size(), 20);
        assert_eq!(index.migrated(), 20);
    }

    #[test]
    fn test_background_migration_and_merged_knn() {
        let pool = WorkerPool::new(2);
        let index = tiered(pool.clone(), Settings::default());
        for i in 1..=50u64 {
            index.insert(i, vec![i as f32]).unwrap();
        }
        let found = index.knn(&[0.0], 5, &SearchParams::default(), &mut check()).value;
        let labels: Vec<DocId> = found.iter().map(|n| n.label).collect();
        assert_eq!(labels, vec![1, 2, 3, 4, 5]);
        pool.wait_idle();
        assert_eq!(index.frontend_size(), 0);
        assert_eq!(index.size(), 50);
        pool.shutdown();
    }

    #[test]
    fn test_swap_threshold_forces_repair() {
        let settings = Settings {
            swap_job_threshold: 3,
            ..Settings::default()
        };
        let index = tiered(WorkerPool::new(0), settings);
        for i in 1..=10u64 {
            index.insert(i, vec![i as f32]).unwrap();
        }
        index.delete(1);
        index.delete(2);
        assert_eq!(index.info().marked_deleted, 2);
        index.delete(3);
        assert_eq!(index.info().marked_deleted, 0);
        assert_eq!(index.info().pending_deletes, Some(0));
        assert_eq!(index.size(), 7);
    }

    #[test]
    fn test_full_buffer_writes_to_backend() {
        let pool = WorkerPool::new(1);
        let settings = Settings {
            tiered_buffer_limit: 1,
            ..Settings::default()
        };
        let index = tiered(pool.clone(), settings);
        for i in 1..=5u64 {
            index.insert(i, vec![i as f32]).unwrap();
        }
        pool.wait_idle();
        assert_eq!(index.size(), 5);
        assert!(index.delete(5));
        assert_eq!(index.size(), 4);
        pool.shutdown();
    }
}
