//! Process-wide runtime registry
//!
//! Live tunables sit behind a reader/writer lock so a query samples one
//! consistent snapshot at start; global counters are plain atomics. The
//! server initialises one registry at startup and tears it down on exit;
//! embedded engines may own private registries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::config::AppConfig;
use crate::pipeline::scorer::ScorerKind;
use crate::types::{format_number, TimeoutPolicy};
use crate::{Error, Result};

/// Runtime-tunable settings sampled per query
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub timeout_ms: u64,
    pub on_timeout: TimeoutPolicy,
    pub yield_every: usize,
    pub union_heap_threshold: usize,
    pub max_prefix_expansions: usize,
    pub min_prefix: usize,
    pub default_dialect: u32,
    pub default_scorer: ScorerKind,
    pub max_search_results: u64,
    pub max_aggregate_results: u64,
    pub cursor_max_idle_ms: u64,
    pub cursor_read_size: usize,
    pub cursor_reaper_interval_ms: u64,
    pub cursor_max_per_index: usize,
    pub gc_enabled: bool,
    pub gc_interval_ms: u64,
    pub gc_clean_threshold: usize,
    pub workers: usize,
    pub vector_memory_limit: usize,
    pub vector_block_fraction: f64,
    pub swap_job_threshold: usize,
    pub tiered_buffer_limit: usize,
    pub hybrid_batch_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for Settings {
    fn from(config: &AppConfig) -> Self {
        Self {
            timeout_ms: config.search.timeout_ms,
            on_timeout: TimeoutPolicy::parse(&config.search.on_timeout).unwrap_or_default(),
            yield_every: config.search.yield_every.max(1),
            union_heap_threshold: config.search.union_heap_threshold,
            max_prefix_expansions: config.search.max_prefix_expansions,
            min_prefix: config.search.min_prefix,
            default_dialect: config.search.default_dialect,
            default_scorer: ScorerKind::parse(&config.search.default_scorer)
                .unwrap_or(ScorerKind::TfIdf),
            max_search_results: config.search.max_search_results,
            max_aggregate_results: config.search.max_aggregate_results,
            cursor_max_idle_ms: config.cursor.max_idle_ms,
            cursor_read_size: config.cursor.read_size.max(1),
            cursor_reaper_interval_ms: config.cursor.reaper_interval_ms.max(1),
            cursor_max_per_index: config.cursor.max_per_index,
            gc_enabled: config.gc.enabled,
            gc_interval_ms: config.gc.run_interval_ms,
            gc_clean_threshold: config.gc.clean_threshold,
            workers: config.workers.threads,
            vector_memory_limit: config.vector.memory_limit_bytes,
            vector_block_fraction: config.vector.block_memory_fraction,
            swap_job_threshold: config.vector.swap_job_threshold,
            tiered_buffer_limit: config.vector.tiered_buffer_limit,
            hybrid_batch_size: config.vector.hybrid_batch_size,
        }
    }
}

impl Settings {
    /// Largest vector block, in bytes, a single element may require.
    pub fn max_block_bytes(&self) -> usize {
        (self.vector_memory_limit as f64 * self.vector_block_fraction) as usize
    }
}

/// Process-wide counters
#[derive(Debug, Default)]
pub struct Counters {
    pub queries: AtomicU64,
    pub query_errors: AtomicU64,
    pub timeouts: AtomicU64,
    pub cursors_created: AtomicU64,
    pub documents_indexed: AtomicU64,
    pub indexing_failures: AtomicU64,
    pub gc_cycles: AtomicU64,
    pub gc_bytes_collected: AtomicU64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("total_queries", self.queries.load(Ordering::Relaxed)),
            ("query_errors", self.query_errors.load(Ordering::Relaxed)),
            ("total_timeouts", self.timeouts.load(Ordering::Relaxed)),
            ("cursors_created", self.cursors_created.load(Ordering::Relaxed)),
            ("documents_indexed", self.documents_indexed.load(Ordering::Relaxed)),
            ("indexing_failures", self.indexing_failures.load(Ordering::Relaxed)),
            ("gc_cycles", self.gc_cycles.load(Ordering::Relaxed)),
            ("gc_bytes_collected", self.gc_bytes_collected.load(Ordering::Relaxed)),
        ]
    }
}

/// Registry of live settings and counters
#[derive(Debug, Default)]
pub struct Runtime {
    settings: RwLock<Settings>,
    pub counters: Counters,
}

/// Names accepted by `CONFIG GET|SET`
pub const TUNABLES: &[&str] = &[
    "TIMEOUT",
    "ON_TIMEOUT",
    "UNION_ITERATOR_HEAP",
    "MAXEXPANSIONS",
    "MINPREFIX",
    "WORKERS",
    "FORK_GC_CLEAN_THRESHOLD",
    "FORK_GC_RUN_INTERVAL",
    "CURSOR_MAX_IDLE",
    "CURSOR_READ_SIZE",
    "DEFAULT_DIALECT",
    "DEFAULT_SCORER",
    "MAXSEARCHRESULTS",
    "MAXAGGREGATERESULTS",
    "HYBRID_BATCH_SIZE",
    "SWAP_JOB_THRESHOLD",
];

impl Runtime {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
            counters: Counters::default(),
        }
    }

    /// Consistent copy of the current settings.
    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut Settings)) {
        f(&mut self.settings.write());
    }

    /// Read one tunable as its wire string.
    pub fn get(&self, name: &str) -> Result<String> {
        let s = self.settings.read();
        let value = match name.to_ascii_uppercase().as_str() {
            "TIMEOUT" => s.timeout_ms.to_string(),
            "ON_TIMEOUT" => s.on_timeout.as_str().to_string(),
            "UNION_ITERATOR_HEAP" => s.union_heap_threshold.to_string(),
            "MAXEXPANSIONS" => s.max_prefix_expansions.to_string(),
            "MINPREFIX" => s.min_prefix.to_string(),
            "WORKERS" => s.workers.to_string(),
            "FORK_GC_CLEAN_THRESHOLD" => s.gc_clean_threshold.to_string(),
            "FORK_GC_RUN_INTERVAL" => s.gc_interval_ms.to_string(),
            "CURSOR_MAX_IDLE" => s.cursor_max_idle_ms.to_string(),
            "CURSOR_READ_SIZE" => s.cursor_read_size.to_string(),
            "DEFAULT_DIALECT" => s.default_dialect.to_string(),
            "DEFAULT_SCORER" => s.default_scorer.as_str().to_string(),
            "MAXSEARCHRESULTS" => s.max_search_results.to_string(),
            "MAXAGGREGATERESULTS" => s.max_aggregate_results.to_string(),
            "HYBRID_BATCH_SIZE" => s.hybrid_batch_size.to_string(),
            "SWAP_JOB_THRESHOLD" => s.swap_job_threshold.to_string(),
            "VECTOR_BLOCK_FRACTION" => format_number(s.vector_block_fraction),
            other => return Err(Error::bad_argument(format!("Unknown configuration option `{other}`"))),
        };
        Ok(value)
    }

    /// Set one tunable from its wire string.
    pub fn set(&self, name: &str, value: &str) -> Result<()> {
        let parse_u64 = |v: &str| {
            v.parse::<u64>()
                .map_err(|_| Error::bad_argument(format!("Invalid value for {name}: `{v}`")))
        };
        let mut s = self.settings.write();
        match name.to_ascii_uppercase().as_str() {
            "TIMEOUT" => s.timeout_ms = parse_u64(value)?,
            "ON_TIMEOUT" => s.on_timeout = TimeoutPolicy::parse(value)?,
            "UNION_ITERATOR_HEAP" => s.union_heap_threshold = parse_u64(value)? as usize,
            "MAXEXPANSIONS" => s.max_prefix_expansions = parse_u64(value)?.max(1) as usize,
            "MINPREFIX" => s.min_prefix = parse_u64(value)? as usize,
            "WORKERS" => s.workers = parse_u64(value)? as usize,
            "FORK_GC_CLEAN_THRESHOLD" => s.gc_clean_threshold = parse_u64(value)? as usize,
            "FORK_GC_RUN_INTERVAL" => s.gc_interval_ms = parse_u64(value)?.max(1),
            "CURSOR_MAX_IDLE" => s.cursor_max_idle_ms = parse_u64(value)?,
            "CURSOR_READ_SIZE" => s.cursor_read_size = parse_u64(value)?.max(1) as usize,
            "DEFAULT_DIALECT" => {
                let d = parse_u64(value)? as u32;
                if !(1..=4).contains(&d) {
                    return Err(Error::InvalidDialect(format!("{d}")));
                }
                s.default_dialect = d;
            }
            "DEFAULT_SCORER" => s.default_scorer = ScorerKind::parse(value)?,
            "MAXSEARCHRESULTS" => s.max_search_results = parse_u64(value)?,
            "MAXAGGREGATERESULTS" => s.max_aggregate_results = parse_u64(value)?,
            "HYBRID_BATCH_SIZE" => s.hybrid_batch_size = parse_u64(value)? as usize,
            "SWAP_JOB_THRESHOLD" => s.swap_job_threshold = parse_u64(value)? as usize,
            other => return Err(Error::bad_argument(format!("Unknown configuration option `{other}`"))),
        }
        tracing::info!(option = %name, %value, "Configuration updated");
        Ok(())
    }
}

static GLOBAL: RwLock<Option<Arc<Runtime>>> = parking_lot::const_rwlock(None);

/// Install the process-wide registry. Replaces any previous one.
pub fn init(settings: Settings) -> Arc<Runtime> {
    let runtime = Arc::new(Runtime::new(settings));
    *GLOBAL.write() = Some(runtime.clone());
    runtime
}

/// The process-wide registry, if initialised.
pub fn global() -> Option<Arc<Runtime>> {
    GLOBAL.read().clone()
}

/// Drop the process-wide registry.
pub fn teardown() {
    GLOBAL.write().take();
}
