//! Garbage collection of tombstoned documents
//!
//! Deleting a document only tombstones its id. A collection cycle walks
//! every index slot (the shared text index and each attribute) whose
//! pending tombstones exceed the clean threshold, repairs it, and releases
//! the slot for those ids. An id is retired once no slot references it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::time;

use crate::engine::Engine;
use crate::index::doc_table::TEXT_SLOT;
use crate::index::IndexState;

/// Cumulative collector counters of one index
#[derive(Debug, Default)]
pub struct GcStats {
    bytes_collected: AtomicU64,
    cycles: AtomicU64,
    ms_run: AtomicU64,
    docs_not_collected: AtomicU64,
    last_run_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcSnapshot {
    pub bytes_collected: u64,
    pub cycles: u64,
    pub ms_run: u64,
    pub docs_not_collected: u64,
    pub last_run_ms: u64,
}

impl GcStats {
    pub fn record(&self, report: &CycleReport) {
        self.bytes_collected
            .fetch_add(report.bytes_collected as u64, Ordering::Relaxed);
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.ms_run.fetch_add(report.elapsed_ms, Ordering::Relaxed);
        self.last_run_ms.store(report.elapsed_ms, Ordering::Relaxed);
        self.docs_not_collected
            .store(report.docs_not_collected as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GcSnapshot {
        GcSnapshot {
            bytes_collected: self.bytes_collected.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
            ms_run: self.ms_run.load(Ordering::Relaxed),
            docs_not_collected: self.docs_not_collected.load(Ordering::Relaxed),
            last_run_ms: self.last_run_ms.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of one cycle over one index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub bytes_collected: usize,
    pub docs_retired: usize,
    /// Tombstones still pending after the cycle
    pub docs_not_collected: usize,
    pub slots_repaired: usize,
    pub elapsed_ms: u64,
    pub cancelled: bool,
}

/// Run one cycle. Slots with at most `threshold` pending tombstones are
/// left for a later cycle. `cancel` is checked between slots.
pub fn collect(state: &mut IndexState, threshold: usize, cancel: &AtomicBool) -> CycleReport {
    let started = Instant::now();
    let mut report = CycleReport::default();
    let mut pending: Vec<(u16, usize)> = state.docs.pending_by_slot().into_iter().collect();
    pending.sort_unstable();

    for (slot, count) in pending {
        if cancel.load(Ordering::Relaxed) {
            report.cancelled = true;
            break;
        }
        if count <= threshold {
            continue;
        }
        let dead = state.docs.tombstoned_in(slot);
        let freed = if slot == TEXT_SLOT {
            state.text.collect_garbage(&dead)
        } else {
            match state.fields.get_mut(slot as usize - 1) {
                Some(field) => field.collect_garbage(&dead),
                None => 0,
            }
        };
        report.bytes_collected += freed;
        report.docs_retired += state.docs.release_slot(slot, &dead);
        report.slots_repaired += 1;
    }

    report.docs_not_collected = state.docs.tombstone_count();
    report.elapsed_ms = started.elapsed().as_millis() as u64;
    report
}

/// Schedules collection cycles for every index of an engine
pub struct GcManager {
    interval: Duration,
    running: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
}

impl GcManager {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            running: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Flag checked by cycles between slots.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Spawn the periodic task. It exits on `stop` or once the engine is gone.
    pub fn start(&self, engine: Weak<Engine>) {
        if self.interval.is_zero() {
            tracing::info!("Garbage collection is disabled");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Garbage collector already running");
            return;
        }
        self.cancel.store(false, Ordering::SeqCst);

        let every = self.interval;
        let running = self.running.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tracing::info!(interval_ms = every.as_millis() as u64, "Starting garbage collector");
            let mut interval = time::interval(every);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                interval.tick().await;
                if !running.load(Ordering::Relaxed) {
                    tracing::info!("Garbage collector stopped");
                    break;
                }
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                let cancel = cancel.clone();
                let outcome = tokio::task::spawn_blocking(move || engine.run_gc(&cancel)).await;
                if let Err(e) = outcome {
                    tracing::error!(error = %e, "Garbage collection cycle failed");
                }
            }
            running.store(false, Ordering::SeqCst);
        });
    }

    /// Stop the task and cancel a cycle in progress.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.store(true, Ordering::SeqCst);
        tracing::info!("Stopping garbage collector");
    }
}

impl Drop for GcManager {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::{to_args, ArgCursor};
    use crate::index::doc_table::{field_slot, DocMeta};
    use crate::index::inverted::Posting;
    use crate::index::FieldIndex;
    use crate::runtime::Settings;
    use crate::schema::IndexDefinition;
    use crate::workers::WorkerPool;

    fn state() -> IndexState {
        let args = to_args(&["SCHEMA", "body", "TEXT", "t", "TAG"]);
        let def = IndexDefinition::parse("idx", &mut ArgCursor::new(&args)).unwrap();
        IndexState::new(def, &Settings::default(), &WorkerPool::new(0))
    }

    fn add(state: &mut IndexState, key: &str, term: &str, tag: &str) {
        let mut meta = DocMeta::new(key, 1.0);
        meta.id = state.docs.next_id();
        meta.slots = vec![TEXT_SLOT, field_slot(1)];
        state.text.add(
            term,
            Posting {
                doc_id: meta.id,
                freq: 1,
                field_mask: 1,
                offsets: vec![1],
            },
        );
        if let FieldIndex::Tag(t) = &mut state.fields[1] {
            t.insert(meta.id, &[tag.to_string()]);
        }
        state.docs.insert(meta);
    }

    #[test]
    fn test_cycle_retires_deleted_documents() {
        let mut state = state();
        add(&mut state, "a", "hello", "x");
        add(&mut state, "b", "hello", "y");
        state.docs.remove("b");

        let report = collect(&mut state, 0, &AtomicBool::new(false));
        assert!(report.bytes_collected > 0);
        assert_eq!(report.docs_retired, 1);
        assert_eq!(report.docs_not_collected, 0);
        assert_eq!(state.text.get("hello").unwrap().num_docs(), 1);
    }

    #[test]
    fn test_second_cycle_collects_nothing() {
        let mut state = state();
        add(&mut state, "a", "hello", "x");
        state.docs.remove("a");
        let cancel = AtomicBool::new(false);
        collect(&mut state, 0, &cancel);
        let again = collect(&mut state, 0, &cancel);
        assert_eq!(again.bytes_collected, 0);
        assert_eq!(again.docs_retired, 0);
    }

    #[test]
    fn test_threshold_defers_work() {
        let mut state = state();
        add(&mut state, "a", "hello", "x");
        add(&mut state, "b", "world", "x");
        state.docs.remove("a");
        let report = collect(&mut state, 1, &AtomicBool::new(false));
        assert_eq!(report.slots_repaired, 0);
        assert_eq!(report.docs_not_collected, 1);
    }

    #[test]
    fn test_cancelled_cycle_stops_early() {
        let mut state = state();
        add(&mut state, "a", "hello", "x");
        state.docs.remove("a");
        let report = collect(&mut state, 0, &AtomicBool::new(true));
        assert!(report.cancelled);
        assert_eq!(report.docs_not_collected, 1);
    }

    #[test]
    fn test_stats_accumulate() {
        let stats = GcStats::default();
        let report = CycleReport {
            bytes_collected: 10,
            elapsed_ms: 3,
            docs_not_collected: 2,
            ..Default::default()
        };
        stats.record(&report);
        stats.record(&CycleReport::default());
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_collected, 10);
        assert_eq!(snap.cycles, 2);
        assert_eq!(snap.ms_run, 3);
        assert_eq!(snap.docs_not_collected, 0);
    }
}
