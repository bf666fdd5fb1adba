//! Document table: external key ↔ dense internal id
//!
//! Ids are assigned monotonically starting at 1 and never reused. Deleting
//! a document removes it from the live set and leaves a tombstone listing
//! the index slots that still hold entries for it; the id is retired once
//! every slot has been repaired by the collector.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use roaring::RoaringTreemap;

use crate::types::{DocId, Value};

/// Slot of the shared full-text index
pub const TEXT_SLOT: u16 = 0;

/// Slot of the attribute at schema position `pos`.
pub fn field_slot(pos: usize) -> u16 {
    (pos + 1) as u16
}

/// Per-document metadata kept alongside the id mapping
#[derive(Debug, Clone)]
pub struct DocMeta {
    pub id: DocId,
    pub key: Arc<str>,
    pub score: f64,
    /// Highest weighted term frequency in the document
    pub max_freq: u32,
    /// Number of indexed tokens
    pub len: u32,
    pub payload: Option<Bytes>,
    /// Sortable values by schema position
    pub sortables: Vec<Option<Value>>,
    /// Index slots holding entries for this document
    pub slots: Vec<u16>,
}

impl DocMeta {
    pub fn new(key: &str, score: f64) -> Self {
        Self {
            id: 0,
            key: Arc::from(key),
            score,
            max_freq: 0,
            len: 0,
            payload: None,
            sortables: Vec::new(),
            slots: Vec::new(),
        }
    }

    pub fn sortable(&self, pos: usize) -> Option<&Value> {
        self.sortables.get(pos).and_then(|v| v.as_ref())
    }
}

#[derive(Debug, Default)]
pub struct DocTable {
    keys: DashMap<Arc<str>, DocId>,
    docs: DashMap<DocId, Arc<DocMeta>>,
    live: RwLock<RoaringTreemap>,
    tombstones: Mutex<HashMap<DocId, Vec<u16>>>,
    next_id: AtomicU64,
    total_len: AtomicU64,
    retired: AtomicU64,
}

impl DocTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next doc-id.
    pub fn next_id(&self) -> DocId {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Highest id ever assigned.
    pub fn max_doc_id(&self) -> DocId {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Publish a document. The previous document under the same key must
    /// already have been removed.
    pub fn insert(&self, meta: DocMeta) -> Arc<DocMeta> {
        let meta = Arc::new(meta);
        self.total_len.fetch_add(meta.len as u64, Ordering::Relaxed);
        self.keys.insert(meta.key.clone(), meta.id);
        self.docs.insert(meta.id, meta.clone());
        self.live.write().insert(meta.id);
        meta
    }

    /// Tombstone the document stored under `key`.
    pub fn remove(&self, key: &str) -> Option<Arc<DocMeta>> {
        let (_, id) = self.keys.remove(key)?;
        let (_, meta) = self.docs.remove(&id)?;
        self.live.write().remove(id);
        self.total_len.fetch_sub(meta.len as u64, Ordering::Relaxed);
        if meta.slots.is_empty() {
            self.retired.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tombstones.lock().insert(id, meta.slots.clone());
        }
        Some(meta)
    }

    pub fn lookup(&self, key: &str) -> Option<DocId> {
        self.keys.get(key).map(|id| *id)
    }

    pub fn get(&self, id: DocId) -> Option<Arc<DocMeta>> {
        self.docs.get(&id).map(|m| m.clone())
    }

    pub fn get_by_key(&self, key: &str) -> Option<Arc<DocMeta>> {
        self.lookup(key).and_then(|id| self.get(id))
    }

    pub fn is_live(&self, id: DocId) -> bool {
        self.live.read().contains(id)
    }

    pub fn num_docs(&self) -> u64 {
        self.live.read().len()
    }

    pub fn avg_doc_len(&self) -> f64 {
        let n = self.num_docs();
        if n == 0 {
            return 0.0;
        }
        self.total_len.load(Ordering::Relaxed) as f64 / n as f64
    }

    /// Snapshot of live ids in ascending order.
    pub fn live_ids(&self) -> Vec<DocId> {
        self.live.read().iter().collect()
    }

    pub fn keys(&self) -> Vec<Arc<str>> {
        self.keys.iter().map(|e| e.key().clone()).collect()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.lock().len()
    }

    pub fn retired_count(&self) -> u64 {
        self.retired.load(Ordering::Relaxed)
    }

    /// Tombstoned ids still referenced by `slot`.
    pub fn tombstoned_in(&self, slot: u16) -> Vec<DocId> {
        let mut ids: Vec<DocId> = self
            .tombstones
            .lock()
            .iter()
            .filter(|(_, slots)| slots.contains(&slot))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Pending tombstone count per slot.
    pub fn pending_by_slot(&self) -> HashMap<u16, usize> {
        let mut counts = HashMap::new();
        for slots in self.tombstones.lock().values() {
            for slot in slots {
                *counts.entry(*slot).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Record that `slot` no longer references `ids`; returns how many ids
    /// were retired as a result.
    pub fn release_slot(&self, slot: u16, ids: &[DocId]) -> usize {
        let mut tombstones = self.tombstones.lock();
        let mut retired = 0;
        for id in ids {
            let done = match tombstones.get_mut(id) {
                Some(slots) => {
                    slots.retain(|s| *s != slot);
                    slots.is_empty()
                }
                None => false,
            };
            if done {
                tombstones.remove(id);
                retired += 1;
            }
        }
        self.retired.fetch_add(retired as u64, Ordering::Relaxed);
        retired
    }

    /// Drop every document. Returns the keys that were live.
    pub fn clear(&self) -> Vec<Arc<str>> {
        let keys = self.keys();
        self.keys.clear();
        self.docs.clear();
        self.live.write().clear();
        self.tombstones.lock().clear();
        self.total_len.store(0, Ordering::Relaxed);
        keys
    }

    /// Approximate heap usage in bytes.
    pub fn memory_usage(&self) -> usize {
        self.docs
            .iter()
            .map(|m| {
                std::mem::size_of::<DocMeta>()
                    + m.key.len() * 2
                    + m.payload.as_ref().map(|p| p.len()).unwrap_or(0)
                    + m.sortables.len() * std::mem::size_of::<Option<Value>>()
            })
            .sum::<usize>()
            + self.live.read().serialized_size()
    }
}
