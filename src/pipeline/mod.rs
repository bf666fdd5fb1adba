//! Result processor pipeline
//!
//! A query runs as a chain of processors, each pulling rows from the one
//! before it. The chain starts at the index stage (or the hybrid stage for
//! KNN queries) and, depending on the command, continues through scoring,
//! grouping, apply/filter, sorting, paging, loading and highlighting.
//!
//! Processors share an [`ExecContext`] carrying the index snapshot, the
//! deadline and the warnings gathered so far.

pub mod apply;
pub mod grouper;
pub mod highlight;
pub mod index;
pub mod loader;
pub mod pager;
pub mod reducers;
pub mod scorer;
pub mod sorter;

use std::sync::Arc;

use crate::index::DocMeta;
use crate::pipeline::scorer::CorpusStats;
use crate::query::iterators::Record;
use crate::query::timeout::{Deadline, TimeoutCheck};
use crate::schema::IndexDefinition;
use crate::store::{Document, DocumentStore};
use crate::types::{DocId, TimeoutPolicy, Value};
use crate::{Error, Result};

pub const TIMEOUT_WARNING: &str = "Timeout limit was reached";
pub const MAX_EXPANSIONS_WARNING: &str = "Max prefix expansions limit was reached";

/// One result flowing through the pipeline
#[derive(Debug, Clone, Default)]
pub struct Row {
    /// 0 for rows produced by grouping
    pub doc_id: DocId,
    pub score: f64,
    pub meta: Option<Arc<DocMeta>>,
    pub record: Option<Record>,
    /// Loaded and computed values, in insertion order
    pub values: Vec<(String, Value)>,
    /// Values the sorter ordered this row by
    pub sort_keys: Vec<Value>,
}

impl Row {
    pub fn for_doc(meta: Arc<DocMeta>) -> Self {
        Self {
            doc_id: meta.id,
            meta: Some(meta),
            ..Default::default()
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.meta.as_deref().map(|m| &*m.key)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Set or replace a value.
    pub fn set(&mut self, name: &str, value: Value) {
        match self.values.iter_mut().find(|(k, _)| k == name) {
            Some(slot) => slot.1 = value,
            None => self.values.push((name.to_string(), value)),
        }
    }
}

/// State shared by every processor of one query
pub struct ExecContext {
    pub def: Arc<IndexDefinition>,
    pub store: Arc<DocumentStore>,
    pub stats: CorpusStats,
    pub check: TimeoutCheck,
    pub policy: TimeoutPolicy,
    /// Rows produced by the index stage, or groups once grouped
    pub total_results: usize,
    pub timed_out: bool,
    pub warnings: Vec<String>,
}

impl ExecContext {
    pub fn new(
        def: Arc<IndexDefinition>,
        store: Arc<DocumentStore>,
        stats: CorpusStats,
        check: TimeoutCheck,
        policy: TimeoutPolicy,
    ) -> Self {
        Self {
            def,
            store,
            stats,
            check,
            policy,
            total_results: 0,
            timed_out: false,
            warnings: Vec::new(),
        }
    }

    pub fn warn(&mut self, message: &str) {
        if !self.warnings.iter().any(|w| w == message) {
            self.warnings.push(message.to_string());
        }
    }

    /// Apply the timeout policy: fail the query, or flag it and stop producing.
    pub fn on_timeout(&mut self) -> Result<()> {
        match self.policy {
            TimeoutPolicy::Fail => Err(Error::Timeout),
            TimeoutPolicy::Return => {
                self.timed_out = true;
                self.warn(TIMEOUT_WARNING);
                Ok(())
            }
        }
    }

    pub fn document(&self, row: &Row) -> Option<Arc<Document>> {
        self.store.get(row.key()?)
    }

    /// Resolve a property for a row: computed values first, then the
    /// document key and score, then sortable copies, then the stored document.
    pub fn value(&self, row: &Row, name: &str) -> Option<Value> {
        if let Some(v) = row.get(name) {
            return Some(v.clone());
        }
        match name {
            "__key" => return row.key().map(Value::str),
            "__score" => return Some(Value::Number(row.score)),
            _ => {}
        }
        let field = self.def.schema.position(name);
        if let (Some(pos), Some(meta)) = (field, row.meta.as_ref()) {
            if let Some(v) = meta.sortable(pos) {
                return Some(v.clone());
            }
        }
        let path = field
            .map(|pos| self.def.schema.fields[pos].path.as_str())
            .unwrap_or(name);
        self.document(row)?.load(path)
    }
}

/// One pipeline stage
pub trait ResultProcessor: Send {
    /// Next row, or `None` once exhausted (or stopped by a timeout).
    fn next(&mut self, ctx: &mut ExecContext) -> Result<Option<Row>>;

    fn name(&self) -> &'static str;
}

pub type BoxedProcessor = Box<dyn ResultProcessor>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Ready,
    Producing,
    /// Stopped at a batch boundary with more rows pending
    Paused,
    Done,
    Error,
    TimedOut,
}

/// A processor chain plus its context
pub struct Pipeline {
    head: BoxedProcessor,
    pub ctx: ExecContext,
    state: PipelineState,
    lookahead: Option<Row>,
    stages: Vec<&'static str>,
}

impl Pipeline {
    pub fn new(source: BoxedProcessor, ctx: ExecContext) -> Self {
        let stages = vec![source.name()];
        Self {
            head: source,
            ctx,
            state: PipelineState::Ready,
            lookahead: None,
            stages,
        }
    }

    /// Stack a stage on top of the chain.
    pub fn push(mut self, stage: impl FnOnce(BoxedProcessor) -> BoxedProcessor) -> Self {
        let placeholder: BoxedProcessor = Box::new(RowSource::new(Vec::new()));
        let upstream = std::mem::replace(&mut self.head, placeholder);
        self.head = stage(upstream);
        self.stages.push(self.head.name());
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Stage names, source first.
    pub fn stages(&self) -> &[&'static str] {
        &self.stages
    }

    /// Install a fresh deadline, e.g. before a cursor read.
    pub fn set_deadline(&mut self, deadline: Deadline, every: usize) {
        self.ctx.check = TimeoutCheck::new(deadline, every);
    }

    /// Pull up to `max` rows (all when `None`).
    ///
    /// When `max` is reached the pipeline looks one row ahead so that a
    /// read ending exactly at the last row already reports `Done`.
    pub fn read(&mut self, max: Option<usize>) -> Result<Vec<Row>> {
        match self.state {
            PipelineState::Done | PipelineState::TimedOut => return Ok(Vec::new()),
            PipelineState::Error => return Err(Error::internal("pipeline already failed")),
            _ => {}
        }
        self.state = PipelineState::Producing;
        let mut rows = Vec::new();
        if let Some(row) = self.lookahead.take() {
            rows.push(row);
        }
        loop {
            let next = match self.head.next(&mut self.ctx) {
                Ok(next) => next,
                Err(e) => {
                    self.state = PipelineState::Error;
                    return Err(e);
                }
            };
            let Some(row) = next else {
                self.state = if self.ctx.timed_out {
                    PipelineState::TimedOut
                } else {
                    PipelineState::Done
                };
                break;
            };
            if max.is_some_and(|m| rows.len() >= m) {
                self.lookahead = Some(row);
                self.state = PipelineState::Paused;
                break;
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

/// Source over a fixed list of rows
pub struct RowSource {
    rows: std::vec::IntoIter<Row>,
}

impl RowSource {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

impl ResultProcessor for RowSource {
    fn next(&mut self, _ctx: &mut ExecContext) -> Result<Option<Row>> {
        Ok(self.rows.next())
    }

    fn name(&self) -> &'static str {
        "Rows"
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::schema::{IndexOptions, Schema};

    pub(crate) fn context() -> ExecContext {
        let def = IndexDefinition {
            name: "idx".into(),
            options: IndexOptions::default(),
            schema: Schema::default(),
        };
        ExecContext::new(
            Arc::new(def),
            Arc::new(DocumentStore::new()),
            CorpusStats::default(),
            TimeoutCheck::new(Deadline::none(), 1),
            TimeoutPolicy::Return,
        )
    }

    pub(crate) fn row(id: DocId, values: &[(&str, Value)]) -> Row {
        Row {
            doc_id: id,
            values: values.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            ..Default::default()
        }
    }

    pub(crate) fn source(rows: Vec<Row>) -> BoxedProcessor {
        Box::new(RowSource::new(rows))
    }

    #[test]
    fn test_read_in_batches_reports_done_on_last_row() {
        let rows = (1..=4).map(|i| row(i, &[])).collect();
        let mut pipeline = Pipeline::new(source(rows), context());
        assert_eq!(pipeline.read(Some(2)).unwrap().len(), 2);
        assert_eq!(pipeline.state(), PipelineState::Paused);
        assert_eq!(pipeline.read(Some(2)).unwrap().len(), 2);
        assert_eq!(pipeline.state(), PipelineState::Done);
        assert!(pipeline.read(Some(2)).unwrap().is_empty());
    }

    #[test]
    fn test_timeout_policy() {
        let mut ctx = context();
        ctx.on_timeout().unwrap();
        assert!(ctx.timed_out);
        assert_eq!(ctx.warnings, vec![TIMEOUT_WARNING.to_string()]);
        ctx.policy = TimeoutPolicy::Fail;
        assert!(matches!(ctx.on_timeout(), Err(Error::Timeout)));
    }

    #[test]
    fn test_value_prefers_row_then_score() {
        let ctx = context();
        let mut r = row(1, &[("a", Value::Number(1.0))]);
        r.score = 2.5;
        assert_eq!(ctx.value(&r, "a"), Some(Value::Number(1.0)));
        assert_eq!(ctx.value(&r, "__score"), Some(Value::Number(2.5)));
        assert_eq!(ctx.value(&r, "missing"), None);
    }
}
