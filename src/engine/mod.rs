//! The search engine: index registry, keyspace and background services
//!
//! [`Engine`] ties the document store to the indexes that follow it. Writes
//! to the store are indexed synchronously by every index whose prefixes
//! match the key; index creation scans pre-existing keys on a low-priority
//! worker job.

pub mod index;
pub mod info;
pub mod ingest;
pub mod search;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time;

use crate::args::ArgCursor;
use crate::cursor::CursorTable;
use crate::gc::{self, GcManager};
use crate::runtime::{Counters, Runtime, Settings};
use crate::schema::{parse_attributes, IndexDefinition};
use crate::store::DocumentStore;
use crate::workers::{Priority, WorkerPool};
use crate::{Error, Result};

pub use index::{DocOverrides, IndexingError, SearchIndex};
pub use info::IndexInfo;
pub use ingest::{AddOutcome, AddRequest};
pub use search::{AggregateResult, CursorPage, SearchHit, SearchResult};

/// How often temporary indexes are checked for expiry
const EXPIRY_TICK: Duration = Duration::from_secs(1);

pub struct Engine {
    indexes: DashMap<String, Arc<SearchIndex>>,
    store: Arc<DocumentStore>,
    runtime: Arc<Runtime>,
    pool: WorkerPool,
    cursors: Arc<CursorTable>,
    gc: GcManager,
    generations: AtomicU64,
}

impl Engine {
    pub fn new(runtime: Arc<Runtime>) -> Arc<Self> {
        let settings = runtime.settings();
        let gc_interval = if settings.gc_enabled {
            Duration::from_millis(settings.gc_interval_ms)
        } else {
            Duration::ZERO
        };
        Arc::new(Self {
            indexes: DashMap::new(),
            store: Arc::new(DocumentStore::new()),
            pool: WorkerPool::new(settings.workers),
            cursors: Arc::new(CursorTable::new(settings.cursor_max_per_index)),
            gc: GcManager::new(gc_interval),
            runtime,
            generations: AtomicU64::new(0),
        })
    }

    /// Engine with a private runtime registry.
    pub fn with_settings(settings: Settings) -> Arc<Self> {
        Self::new(Arc::new(Runtime::new(settings)))
    }

    /// Start the collector, the cursor reaper and temporary-index expiry.
    /// Must be called from within a tokio runtime.
    pub fn start_background(self: &Arc<Self>) {
        let settings = self.runtime.settings();
        self.gc.start(Arc::downgrade(self));
        self.cursors
            .spawn_reaper(Duration::from_millis(settings.cursor_reaper_interval_ms));

        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = time::interval(EXPIRY_TICK);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.expire_temporary();
            }
        });
    }

    /// Stop background work; queued jobs still run to completion.
    pub fn shutdown(&self) {
        self.gc.stop();
        self.pool.shutdown();
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn settings(&self) -> Settings {
        self.runtime.settings()
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn cursors(&self) -> &Arc<CursorTable> {
        &self.cursors
    }

    /// Look up an index by name, marking it as used.
    pub fn index(&self, name: &str) -> Result<Arc<SearchIndex>> {
        let index = self
            .indexes
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::UnknownIndex(name.to_string()))?;
        index.touch();
        Ok(index)
    }

    /// `_LIST`
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// `CREATE`
    pub fn create_index(&self, name: &str, args: &mut ArgCursor<'_>) -> Result<()> {
        let def = IndexDefinition::parse(name, args)?;
        self.create(def)
    }

    pub fn create(&self, def: IndexDefinition) -> Result<()> {
        let name = def.name.clone();
        let settings = self.settings();
        let skip_scan = def.options.skip_initial_scan;
        let prefixes = def.options.prefixes.clone();
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let index = Arc::new(SearchIndex::new(def, generation, &settings, &self.pool));

        match self.indexes.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(Error::IndexExists(name)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(index.clone());
            }
        }
        tracing::info!(index = %name, generation, "Index created");

        if !skip_scan {
            let keys = self.store.keys_with_prefixes(&prefixes);
            if !keys.is_empty() {
                self.schedule_scan(index, keys);
            }
        }
        Ok(())
    }

    /// Index `keys` from the store on a low-priority job.
    fn schedule_scan(&self, index: Arc<SearchIndex>, keys: Vec<String>) {
        index.scan.begin(keys.len());
        let store = self.store.clone();
        let runtime = self.runtime.clone();
        self.pool.submit(Priority::Low, move || {
            let settings = runtime.settings();
            let mut indexed = 0usize;
            for key in &keys {
                if let Some(doc) = store.get(key) {
                    if index.follows(key, doc.kind())
                        && index
                            .index_document(key, &doc, &DocOverrides::default(), &settings)
                            .is_ok()
                    {
                        indexed += 1;
                    }
                }
                index.scan.advance();
            }
            index.scan.finish();
            Counters::add(&runtime.counters.documents_indexed, indexed as u64);
            tracing::info!(index = %index.name(), scanned = keys.len(), indexed, "Initial scan finished");
        });
    }

    /// Block until background indexing and repair jobs have drained.
    pub fn wait_for_indexing(&self) {
        self.pool.wait_idle();
    }

    /// `ALTER <name> SCHEMA ADD ...`
    ///
    /// Existing documents are re-indexed in doc-id order so the new
    /// attributes cover them and their relative order is kept.
    pub fn alter(&self, name: &str, args: &mut ArgCursor<'_>) -> Result<()> {
        let index = self.index(name)?;
        args.expect("SCHEMA")?;
        args.expect("ADD")?;
        let settings = self.settings();
        let keys: Vec<String> = {
            let mut state = index.write();
            let specs = parse_attributes(args, state.def.options.kind)?;
            if specs.is_empty() {
                return Err(Error::bad_argument("No fields provided"));
            }
            state.add_fields(specs, &settings, &self.pool)?;
            state
                .docs
                .live_ids()
                .into_iter()
                .filter_map(|id| state.docs.get(id))
                .map(|meta| meta.key.to_string())
                .filter(|key| self.store.contains(key))
                .collect()
        };
        tracing::info!(index = %name, rescan = keys.len(), "Index schema altered");
        if !keys.is_empty() {
            self.schedule_scan(index, keys);
        }
        Ok(())
    }

    /// `DROPINDEX <name> [DD]`
    pub fn drop_index(&self, name: &str, delete_documents: bool) -> Result<()> {
        let (_, index) = self
            .indexes
            .remove(name)
            .ok_or_else(|| Error::UnknownIndex(name.to_string()))?;
        let purged = self.cursors.purge_index(name);
        let keys = index.read().docs.clear();
        if delete_documents {
            for key in &keys {
                self.delete_key(key);
            }
        }
        tracing::info!(index = %name, documents = keys.len(), cursors = purged, delete_documents, "Index dropped");
        Ok(())
    }

    /// Drop temporary indexes idle past their lifetime.
    pub fn expire_temporary(&self) -> Vec<String> {
        let expired: Vec<String> = self
            .indexes
            .iter()
            .filter(|e| {
                let ttl = e.value().read().def.options.temporary_secs;
                ttl.is_some_and(|secs| e.value().idle_for() >= Duration::from_secs(secs))
            })
            .map(|e| e.key().clone())
            .collect();
        for name in &expired {
            if self.indexes.remove(name).is_some() {
                self.cursors.purge_index(name);
                tracing::info!(index = %name, "Temporary index expired");
            }
        }
        expired
    }

    /// One collection cycle over every index.
    pub fn run_gc(&self, cancel: &AtomicBool) {
        let settings = self.settings();
        if !settings.gc_enabled {
            return;
        }
        let indexes: Vec<Arc<SearchIndex>> = self.indexes.iter().map(|e| e.value().clone()).collect();
        for index in indexes {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            let report = gc::collect(&mut index.write(), settings.gc_clean_threshold, cancel);
            index.gc.record(&report);
            Counters::incr(&self.runtime.counters.gc_cycles);
            Counters::add(&self.runtime.counters.gc_bytes_collected, report.bytes_collected as u64);
            if report.bytes_collected > 0 {
                tracing::debug!(
                    index = %index.name(),
                    bytes = report.bytes_collected,
                    retired = report.docs_retired,
                    pending = report.docs_not_collected,
                    "Garbage collected"
                );
            }
        }
    }

    /// `CONFIG SET`, applying settings that need more than a stored value.
    pub fn config_set(&self, name: &str, value: &str) -> Result<()> {
        self.runtime.set(name, value)?;
        if name.eq_ignore_ascii_case("WORKERS") {
            self.pool.resize(self.settings().workers);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::args::to_args;

    pub(crate) fn engine() -> Arc<Engine> {
        Engine::with_settings(Settings::default())
    }

    pub(crate) fn create(engine: &Engine, name: &str, spec: &[&str]) {
        let args = to_args(spec);
        engine
            .create_index(name, &mut ArgCursor::new(&args))
            .unwrap();
    }

    #[test]
    fn test_create_rejects_duplicates() {
        let engine = engine();
        create(&engine, "idx", &["SCHEMA", "t", "TEXT"]);
        let args = to_args(&["SCHEMA", "t", "TEXT"]);
        let err = engine
            .create_index("idx", &mut ArgCursor::new(&args))
            .unwrap_err();
        assert!(matches!(err, Error::IndexExists(_)));
        assert_eq!(engine.list(), vec!["idx".to_string()]);
    }

    #[test]
    fn test_initial_scan_indexes_existing_keys() {
        let engine = engine();
        engine.hset("doc:1", vec![("t".into(), "hello".into())]).unwrap();
        engine.hset("other:1", vec![("t".into(), "hello".into())]).unwrap();
        create(&engine, "idx", &["PREFIX", "1", "doc:", "SCHEMA", "t", "TEXT"]);
        engine.wait_for_indexing();
        assert_eq!(engine.index("idx").unwrap().read().docs.num_docs(), 1);

        create(&engine, "lazy", &["SKIPINITIALSCAN", "SCHEMA", "t", "TEXT"]);
        assert_eq!(engine.index("lazy").unwrap().read().docs.num_docs(), 0);
    }

    #[test]
    fn test_drop_with_dd_deletes_documents() {
        let engine = engine();
        create(&engine, "idx", &["SCHEMA", "t", "TEXT"]);
        engine.hset("a", vec![("t".into(), "x".into())]).unwrap();
        engine.drop_index("idx", true).unwrap();
        assert!(engine.store().get("a").is_none());
        assert!(matches!(engine.index("idx"), Err(Error::UnknownIndex(_))));
        assert!(matches!(engine.drop_index("idx", false), Err(Error::UnknownIndex(_))));
    }

    #[test]
    fn test_temporary_index_expires() {
        let engine = engine();
        create(&engine, "tmp", &["TEMPORARY", "0", "SCHEMA", "t", "TEXT"]);
        create(&engine, "keep", &["SCHEMA", "t", "TEXT"]);
        assert_eq!(engine.expire_temporary(), vec!["tmp".to_string()]);
        assert_eq!(engine.list(), vec!["keep".to_string()]);
    }

    #[test]
    fn test_alter_reindexes_existing_documents() {
        let engine = engine();
        create(&engine, "idx", &["SCHEMA", "t", "TEXT"]);
        engine
            .hset("a", vec![("t".into(), "x".into()), ("n".into(), "3".into())])
            .unwrap();
        let args = to_args(&["SCHEMA", "ADD", "n", "NUMERIC"]);
        engine.alter("idx", &mut ArgCursor::new(&args)).unwrap();
        engine.wait_for_indexing();
        let index = engine.index("idx").unwrap();
        let state = index.read();
        let (_, _, numeric) = state.field("n").unwrap();
        assert_eq!(numeric.num_entries(), 1);
    }

    #[test]
    fn test_gc_cycle_updates_counters() {
        let engine = engine();
        engine.config_set("FORK_GC_CLEAN_THRESHOLD", "0").unwrap();
        create(&engine, "idx", &["SCHEMA", "t", "TEXT"]);
        engine.hset("a", vec![("t".into(), "hello".into())]).unwrap();
        engine.del(&["a".to_string()]);
        engine.run_gc(&AtomicBool::new(false));
        let snapshot = engine.index("idx").unwrap().gc.snapshot();
        assert_eq!(snapshot.cycles, 1);
        assert!(snapshot.bytes_collected > 0);
    }
}
