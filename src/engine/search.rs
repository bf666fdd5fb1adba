//! SEARCH, AGGREGATE, CURSOR and EXPLAIN execution
//!
//! A query is planned under the index read lock into a self-contained
//! pipeline, which then runs without holding the lock. Aggregations opened
//! with a cursor park their pipeline in the cursor table between reads.

use std::time::Duration;

use super::{Engine, SearchIndex};
use crate::args::ArgCursor;
use crate::cursor::Cursor;
use crate::index::geo::GeoFilter;
use crate::index::numeric::NumericRange;
use crate::pipeline::apply::{Apply, Filter};
use crate::pipeline::grouper::Grouper;
use crate::pipeline::highlight::Highlighter;
use crate::pipeline::index::IndexStage;
use crate::pipeline::loader::Loader;
use crate::pipeline::pager::Pager;
use crate::pipeline::scorer::Scorer;
use crate::pipeline::sorter::Sorter;
use crate::pipeline::{BoxedProcessor, ExecContext, Pipeline, PipelineState, Row};
use crate::query::ast::NodeKind;
use crate::query::expr::Expr;
use crate::query::hybrid::{HybridStage, KnnRequest, ReportHandle};
use crate::query::parser::{self, ParseOptions};
use crate::query::planner::{self, PlanOptions, Planner};
use crate::query::request::{AggregateRequest, AggregateStep, LoadSpec, QueryArgs, SearchRequest, SortKey};
use crate::query::timeout::{Deadline, TimeoutCheck};
use crate::query::HybridReport;
use crate::runtime::{Counters, Settings};
use crate::schema::FieldKind;
use crate::types::{TimeoutPolicy, Value};
use crate::vector::SearchParams;
use crate::{Error, Result};

/// One document of a search reply
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub key: String,
    pub score: f64,
    pub payload: Option<String>,
    pub sort_keys: Vec<Value>,
    pub fields: Vec<(String, Value)>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub total: usize,
    pub hits: Vec<SearchHit>,
    pub warnings: Vec<String>,
    pub timed_out: bool,
    pub hybrid: Option<HybridReport>,
}

#[derive(Debug, Clone, Default)]
pub struct AggregateResult {
    pub total: usize,
    pub rows: Vec<Vec<(String, Value)>>,
    /// Set when the request asked for a cursor; 0 once exhausted
    pub cursor_id: Option<u64>,
    pub warnings: Vec<String>,
    pub timed_out: bool,
}

/// One `CURSOR READ` batch
#[derive(Debug, Clone, Default)]
pub struct CursorPage {
    pub total: usize,
    pub rows: Vec<Vec<(String, Value)>>,
    pub cursor_id: u64,
    pub warnings: Vec<String>,
}

/// Pipeline source plus the context it runs in
struct Plan {
    source: BoxedProcessor,
    ctx: ExecContext,
    hybrid: Option<ReportHandle>,
    knn_score: Option<String>,
}

/// Query-shaping inputs shared by SEARCH and AGGREGATE
struct QueryInputs<'a> {
    query: &'a str,
    args: &'a QueryArgs,
    numeric_filters: &'a [(String, NumericRange)],
    geo_filters: &'a [(String, GeoFilter)],
    in_keys: Option<&'a [String]>,
    in_fields: Option<&'a [String]>,
}

fn plan(
    engine: &Engine,
    index: &SearchIndex,
    inputs: &QueryInputs<'_>,
    settings: &Settings,
    deadline: Deadline,
) -> Result<Plan> {
    let args = inputs.args;
    let dialect = args.dialect.unwrap_or(settings.default_dialect);
    let parsed = parser::parse(
        inputs.query,
        ParseOptions {
            dialect,
            params: &args.params,
        },
    )?;
    let root = planner::with_filters(parsed.root, inputs.numeric_filters, inputs.geo_filters);
    let policy = args.on_timeout.unwrap_or(settings.on_timeout);

    let state = index.read();
    let options = PlanOptions {
        verbatim: args.verbatim,
        no_stopwords: args.no_stopwords,
        language: args.language.clone(),
        slop: args.slop,
        in_order: args.in_order,
        in_fields: inputs.in_fields.map(<[String]>::to_vec),
        max_expansions: settings.max_prefix_expansions,
        min_prefix: settings.min_prefix,
        union_heap_threshold: settings.union_heap_threshold,
    };
    let mut planner = Planner::new(&state, options, TimeoutCheck::new(deadline.clone(), settings.yield_every));
    let mut tree = planner.build(&root)?;
    if planner.truncated && policy == TimeoutPolicy::Fail {
        return Err(Error::Timeout);
    }
    if let Some(keys) = inputs.in_keys {
        tree = planner.restrict_to_keys(tree, keys);
    }
    let warnings = std::mem::take(&mut planner.warnings);

    let mut hybrid = None;
    let mut knn_score = None;
    let source: BoxedProcessor = match &parsed.knn {
        Some(knn) => {
            let (_, spec, field_index) = state
                .field(&knn.field)
                .ok_or_else(|| Error::unknown_field(knn.field.as_str()))?;
            if !matches!(spec.kind, FieldKind::Vector(_)) {
                return Err(Error::bad_argument(format!(
                    "Field `{}` is of type {}, not VECTOR",
                    knn.field,
                    spec.kind.type_name()
                )));
            }
            let vectors = field_index
                .as_vector()
                .ok_or_else(|| Error::bad_argument(format!("Field `{}` is not indexed", knn.field)))?
                .clone();
            let unfiltered = matches!(root.kind, NodeKind::Wildcard);
            let attrs = &knn.attrs;
            if unfiltered && (attrs.hybrid_policy.is_some() || attrs.batch_size.is_some()) {
                return Err(Error::PolicyMismatch(
                    "hybrid query attributes were sent for a non-hybrid query".to_string(),
                ));
            }
            let request = KnnRequest {
                query: vectors.encode_query(&knn.blob)?,
                vectors,
                k: knn.k,
                params: SearchParams {
                    ef_runtime: attrs.ef_runtime,
                    epsilon: None,
                },
                policy: attrs.hybrid_policy,
                batch_size: attrs.batch_size,
                default_batch_size: settings.hybrid_batch_size,
                score_name: knn.score_name(),
            };
            let filter = (!unfiltered).then_some(tree);
            let stage = HybridStage::new(request, filter, state.docs.clone());
            hybrid = Some(stage.report_handle());
            knn_score = Some(knn.score_name());
            Box::new(stage)
        }
        None => Box::new(IndexStage::new(tree, state.docs.clone())),
    };

    let mut ctx = ExecContext::new(
        state.def.clone(),
        engine.store.clone(),
        state.stats(),
        TimeoutCheck::new(deadline, settings.yield_every),
        policy,
    );
    for warning in &warnings {
        ctx.warn(warning);
    }
    Ok(Plan {
        source,
        ctx,
        hybrid,
        knn_score,
    })
}

fn deadline_for(args: &QueryArgs, settings: &Settings, injected: Option<Deadline>) -> Deadline {
    injected.unwrap_or_else(|| Deadline::from_millis(args.timeout_ms.unwrap_or(settings.timeout_ms)))
}

fn flat_row(row: Row) -> Vec<(String, Value)> {
    row.values
}

impl Engine {
    /// `SEARCH <index> <query> [options]`
    pub fn search(&self, index_name: &str, query: &str, args: &mut ArgCursor<'_>) -> Result<SearchResult> {
        let request = SearchRequest::parse(query, args)?;
        self.execute_search(index_name, &request, None)
    }

    /// Run a parsed search. `deadline` replaces the configured timeout.
    pub fn execute_search(
        &self,
        index_name: &str,
        request: &SearchRequest,
        deadline: Option<Deadline>,
    ) -> Result<SearchResult> {
        Counters::incr(&self.runtime.counters.queries);
        let outcome = self.run_search(index_name, request, deadline);
        self.count_outcome(outcome.as_ref().map(|r| r.timed_out));
        outcome
    }

    fn count_outcome(&self, outcome: std::result::Result<bool, &Error>) {
        let counters = &self.runtime.counters;
        match outcome {
            Ok(true) | Err(Error::Timeout) => Counters::incr(&counters.timeouts),
            Ok(false) => {}
            Err(_) => Counters::incr(&counters.query_errors),
        }
    }

    fn run_search(
        &self,
        index_name: &str,
        request: &SearchRequest,
        deadline: Option<Deadline>,
    ) -> Result<SearchResult> {
        let index = self.index(index_name)?;
        let settings = self.settings();
        let window = request.offset.saturating_add(request.limit);
        if window as u64 > settings.max_search_results {
            return Err(Error::bad_argument(format!(
                "LIMIT exceeds maximum of {}",
                settings.max_search_results
            )));
        }
        let inputs = QueryInputs {
            query: &request.query,
            args: &request.args,
            numeric_filters: &request.numeric_filters,
            geo_filters: &request.geo_filters,
            in_keys: request.in_keys.as_deref(),
            in_fields: request.in_fields.as_deref(),
        };
        let deadline = deadline_for(&request.args, &settings, deadline);
        let plan = plan(self, &index, &inputs, &settings, deadline)?;
        let highlight_enabled = plan.ctx.def.options.highlight_enabled();
        let scorer = request.args.scorer.unwrap_or(settings.default_scorer);

        let mut pipeline = Pipeline::new(plan.source, plan.ctx)
            .push(|up| Box::new(Scorer::new(up, scorer)));
        let sort_keys = match (&request.sort_by, &plan.knn_score) {
            (Some(key), _) => Some(vec![key.clone()]),
            (None, Some(score)) => Some(vec![SortKey {
                field: score.clone(),
                ascending: true,
            }]),
            (None, None) => None,
        };
        pipeline = match sort_keys {
            Some(keys) => pipeline.push(|up| Box::new(Sorter::by_fields(up, keys, Some(window)))),
            None => pipeline.push(|up| Box::new(Sorter::by_score(up, Some(window)))),
        };
        pipeline = pipeline.push(|up| Box::new(Pager::new(up, request.offset, request.limit)));
        if !request.no_content {
            pipeline = match &request.return_fields {
                Some(fields) => pipeline.push(|up| Box::new(Loader::fields(up, fields.clone()))),
                None => pipeline.push(|up| Box::new(Loader::new(up, LoadSpec::All))),
            };
            let wants_highlight = request.highlight.is_some() || request.summarize.is_some();
            if wants_highlight && highlight_enabled {
                let (hl, sum) = (request.highlight.clone(), request.summarize.clone());
                pipeline = pipeline.push(|up| Box::new(Highlighter::new(up, hl, sum)));
            }
        }

        let rows = pipeline.read(None)?;
        let hits = rows
            .into_iter()
            .map(|row| {
                let meta = row.meta.clone();
                let fields = if request.no_content {
                    Vec::new()
                } else {
                    match &request.return_fields {
                        Some(wanted) => wanted
                            .iter()
                            .filter_map(|f| row.get(&f.alias).map(|v| (f.alias.clone(), v.clone())))
                            .collect(),
                        None => row.values.clone(),
                    }
                };
                SearchHit {
                    key: row.key().unwrap_or_default().to_string(),
                    score: row.score,
                    payload: request
                        .with_payloads
                        .then(|| meta.as_ref().and_then(|m| m.payload.as_ref()))
                        .flatten()
                        .map(|p| String::from_utf8_lossy(p).into_owned()),
                    sort_keys: if request.with_sort_keys { row.sort_keys } else { Vec::new() },
                    fields,
                }
            })
            .collect();

        let ctx = &pipeline.ctx;
        let result = SearchResult {
            total: ctx.total_results,
            hits,
            warnings: ctx.warnings.clone(),
            timed_out: ctx.timed_out,
            hybrid: plan.hybrid.and_then(|h| h.lock().clone()),
        };
        tracing::debug!(
            index = %index_name,
            total = result.total,
            returned = result.hits.len(),
            timed_out = result.timed_out,
            "Search finished"
        );
        Ok(result)
    }

    /// `AGGREGATE <index> <query> [steps]`
    pub fn aggregate(&self, index_name: &str, query: &str, args: &mut ArgCursor<'_>) -> Result<AggregateResult> {
        let request = AggregateRequest::parse(query, args)?;
        self.execute_aggregate(index_name, &request, None)
    }

    pub fn execute_aggregate(
        &self,
        index_name: &str,
        request: &AggregateRequest,
        deadline: Option<Deadline>,
    ) -> Result<AggregateResult> {
        Counters::incr(&self.runtime.counters.queries);
        let outcome = self.run_aggregate(index_name, request, deadline);
        self.count_outcome(outcome.as_ref().map(|r| r.timed_out));
        outcome
    }

    fn run_aggregate(
        &self,
        index_name: &str,
        request: &AggregateRequest,
        deadline: Option<Deadline>,
    ) -> Result<AggregateResult> {
        let index = self.index(index_name)?;
        let settings = self.settings();
        for step in &request.steps {
            if let AggregateStep::Limit { offset, count } = step {
                if offset.saturating_add(*count) as u64 > settings.max_aggregate_results {
                    return Err(Error::bad_argument(format!(
                        "LIMIT exceeds maximum of {}",
                        settings.max_aggregate_results
                    )));
                }
            }
        }
        let inputs = QueryInputs {
            query: &request.query,
            args: &request.args,
            numeric_filters: &[],
            geo_filters: &[],
            in_keys: None,
            in_fields: None,
        };
        let timeout_ms = request.args.timeout_ms.unwrap_or(settings.timeout_ms);
        let deadline = deadline_for(&request.args, &settings, deadline);
        let plan = plan(self, &index, &inputs, &settings, deadline)?;
        let scorer = request.args.scorer.unwrap_or(settings.default_scorer);

        let mut pipeline = Pipeline::new(plan.source, plan.ctx).push(|up| Box::new(Scorer::new(up, scorer)));
        if request.add_scores {
            pipeline = pipeline.push(|up| {
                Box::new(Apply::new(up, Expr::Field("__score".to_string()), "__score".to_string()))
            });
        }
        if let Some(load) = &request.load {
            let load = load.clone();
            pipeline = pipeline.push(|up| Box::new(Loader::new(up, load)));
        }
        for step in &request.steps {
            let step = step.clone();
            pipeline = pipeline.push(|up| -> BoxedProcessor {
                match step {
                    AggregateStep::GroupBy { keys, reducers } => Box::new(Grouper::new(up, keys, reducers)),
                    AggregateStep::SortBy { keys, max } => Box::new(Sorter::by_fields(up, keys, max)),
                    AggregateStep::Apply { expr, alias } => Box::new(Apply::new(up, expr, alias)),
                    AggregateStep::Filter(expr) => Box::new(Filter::new(up, expr)),
                    AggregateStep::Limit { offset, count } => Box::new(Pager::new(up, offset, count)),
                }
            });
        }

        let Some(options) = request.cursor else {
            let rows = pipeline.read(None)?;
            let ctx = &pipeline.ctx;
            return Ok(AggregateResult {
                total: ctx.total_results,
                rows: rows.into_iter().map(flat_row).collect(),
                cursor_id: None,
                warnings: ctx.warnings.clone(),
                timed_out: ctx.timed_out,
            });
        };

        let count = options.count.unwrap_or(settings.cursor_read_size);
        let rows = pipeline.read(Some(count))?;
        let total = pipeline.ctx.total_results;
        let warnings = std::mem::take(&mut pipeline.ctx.warnings);
        let timed_out = pipeline.ctx.timed_out;
        let cursor_id = if pipeline.state() == PipelineState::Paused {
            let id = self.cursors.open(Cursor {
                index: index_name.to_string(),
                index_generation: index.generation(),
                pipeline,
                count,
                max_idle: Duration::from_millis(options.max_idle_ms.unwrap_or(settings.cursor_max_idle_ms)),
                timeout_ms,
            })?;
            Counters::incr(&self.runtime.counters.cursors_created);
            tracing::debug!(index = %index_name, cursor = id, "Cursor opened");
            id
        } else {
            0
        };
        Ok(AggregateResult {
            total,
            rows: rows.into_iter().map(flat_row).collect(),
            cursor_id: Some(cursor_id),
            warnings,
            timed_out,
        })
    }

    /// `CURSOR READ <index> <id> [COUNT n]`
    pub fn cursor_read(&self, index_name: &str, id: u64, count: Option<usize>) -> Result<CursorPage> {
        let index = self.index(index_name)?;
        let mut cursor = self.cursors.checkout(index_name, index.generation(), id)?;
        if matches!(
            cursor.pipeline.state(),
            PipelineState::TimedOut | PipelineState::Error
        ) {
            self.cursors.remove(id);
            return Ok(CursorPage::default());
        }

        let settings = self.settings();
        cursor
            .pipeline
            .set_deadline(Deadline::from_millis(cursor.timeout_ms), settings.yield_every);
        cursor.pipeline.ctx.timed_out = false;
        let count = count.unwrap_or(cursor.count).max(1);
        let rows = match cursor.pipeline.read(Some(count)) {
            Ok(rows) => rows,
            Err(e) => {
                self.cursors.remove(id);
                return Err(e);
            }
        };
        let total = cursor.pipeline.ctx.total_results;
        let warnings = std::mem::take(&mut cursor.pipeline.ctx.warnings);
        let next_id = if cursor.pipeline.state() == PipelineState::Paused {
            self.cursors.checkin(id, cursor);
            id
        } else {
            self.cursors.remove(id);
            0
        };
        Ok(CursorPage {
            total,
            rows: rows.into_iter().map(flat_row).collect(),
            cursor_id: next_id,
            warnings,
        })
    }

    /// `CURSOR DEL <index> <id>`
    pub fn cursor_del(&self, index_name: &str, id: u64) -> Result<()> {
        self.cursors.delete(index_name, id)
    }

    /// `EXPLAIN <index> <query> [options]`
    pub fn explain(&self, index_name: &str, query: &str, args: &mut ArgCursor<'_>) -> Result<String> {
        self.index(index_name)?;
        let request = SearchRequest::parse(query, args)?;
        let dialect = request.args.dialect.unwrap_or(self.settings().default_dialect);
        let parsed = parser::parse(
            query,
            ParseOptions {
                dialect,
                params: &request.args.params,
            },
        )?;
        let root = planner::with_filters(parsed.root, &request.numeric_filters, &request.geo_filters);
        Ok(planner::explain(&root, parsed.knn.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::args::to_args;
    use crate::engine::tests::{create, engine};
    use crate::engine::AddOutcome;
    use crate::query::HybridMode;
    use crate::types::TimeoutPolicy;

    fn search(engine: &Engine, query: &str, tokens: &[&str]) -> Result<SearchResult> {
        let args = to_args(tokens);
        engine.search("idx", query, &mut ArgCursor::new(&args))
    }

    fn aggregate(engine: &Engine, query: &str, tokens: &[&str]) -> Result<AggregateResult> {
        let args = to_args(tokens);
        engine.aggregate("idx", query, &mut ArgCursor::new(&args))
    }

    fn keys(result: &SearchResult) -> Vec<&str> {
        result.hits.iter().map(|h| h.key.as_str()).collect()
    }

    fn vector_blob(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn scenario_one() -> Arc<Engine> {
        let engine = engine();
        create(&engine, "idx", &["SCHEMA", "title", "TEXT", "WEIGHT", "10", "body", "TEXT"]);
        for tokens in [
            ["doc1", "0.5", "FIELDS", "title", "hello world", "body", "lorem ist ipsum"],
            ["doc2", "1.0", "FIELDS", "title", "hello another world", "body", "lorem ist ipsum lorem lorem"],
        ] {
            let args = to_args(&tokens);
            assert_eq!(engine.add("idx", &mut ArgCursor::new(&args)).unwrap(), AddOutcome::Added);
        }
        engine
    }

    #[test]
    fn test_weighted_title_ranks_higher_scored_doc_first() {
        let engine = scenario_one();
        let result = search(&engine, "hello", &["WITHSCORES"]).unwrap();
        assert_eq!(result.total, 2);
        assert_eq!(keys(&result), vec!["doc2", "doc1"]);
        assert!(result.hits[0].score > result.hits[1].score);

        let exact = search(&engine, "\"hello world\"", &["VERBATIM"]).unwrap();
        assert_eq!(keys(&exact), vec!["doc1"]);
    }

    #[test]
    fn test_return_and_nocontent() {
        let engine = scenario_one();
        let result = search(&engine, "hello", &["RETURN", "3", "title", "AS", "t"]).unwrap();
        assert_eq!(result.hits[0].fields, vec![("t".to_string(), Value::str("hello another world"))]);
        let bare = search(&engine, "hello", &["NOCONTENT"]).unwrap();
        assert!(bare.hits.iter().all(|h| h.fields.is_empty()));
    }

    #[test]
    fn test_sortby_limit_and_bad_limit() {
        let engine = engine();
        create(&engine, "idx", &["SCHEMA", "foo", "TEXT", "bar", "NUMERIC", "SORTABLE"]);
        for i in 0..100 {
            engine
                .hset(&i.to_string(), vec![("foo".into(), "hello".into()), ("bar".into(), i.to_string().into())])
                .unwrap();
        }
        let result = search(&engine, "hello", &["SORTBY", "bar", "ASC", "LIMIT", "0", "3"]).unwrap();
        assert_eq!(result.total, 100);
        assert_eq!(keys(&result), vec!["0", "1", "2"]);
        assert!(matches!(
            search(&engine, "hello", &["LIMIT", "0", "-1"]),
            Err(Error::BadArgument(_))
        ));
    }

    #[test]
    fn test_knn_orders_by_distance() {
        let engine = engine();
        create(
            &engine,
            "idx",
            &["SCHEMA", "v", "VECTOR", "FLAT", "6", "TYPE", "FLOAT32", "DIM", "2", "DISTANCE_METRIC", "L2"],
        );
        for (key, y) in [("a", 0.1f32), ("b", 0.2), ("c", 0.3), ("d", 0.4)] {
            engine
                .hset(key, vec![("v".into(), Bytes::from(vector_blob(&[0.1, y])))])
                .unwrap();
        }
        let blob = vector_blob(&[0.1, 0.1]);
        let mut request = SearchRequest::new("*=>[KNN 4 @v $q]");
        request.args.dialect = Some(2);
        request.args.params.insert("q".into(), Bytes::from(blob));
        let result = engine.execute_search("idx", &request, None).unwrap();
        assert_eq!(keys(&result), vec!["a", "b", "c", "d"]);
        let distances: Vec<f64> = result
            .hits
            .iter()
            .filter_map(|h| h.fields.iter().find(|(k, _)| k == "__v_score"))
            .filter_map(|(_, v)| v.as_number())
            .collect();
        for (got, want) in distances.iter().zip([0.0, 0.01, 0.04, 0.09]) {
            assert!((got - want).abs() < 1e-5, "{got} vs {want}");
        }
        assert_eq!(result.hybrid.unwrap().final_mode, HybridMode::Standard);
    }

    #[test]
    fn test_knn_on_non_vector_field() {
        let engine = scenario_one();
        let mut request = SearchRequest::new("*=>[KNN 4 @title $q]");
        request.args.dialect = Some(2);
        request.args.params.insert("q".into(), Bytes::from_static(&[0; 8]));
        assert!(matches!(
            engine.execute_search("idx", &request, None),
            Err(Error::BadArgument(_))
        ));
    }

    #[test]
    fn test_aggregate_groupby_count() {
        let engine = engine();
        create(&engine, "idx", &["SCHEMA", "brand", "TAG", "price", "NUMERIC"]);
        for (i, brand) in ["a", "b", "a", "a"].iter().enumerate() {
            engine
                .hset(&format!("p{i}"), vec![("brand".into(), Bytes::from(brand.to_string())), ("price".into(), "1".into())])
                .unwrap();
        }
        let result = aggregate(
            &engine,
            "*",
            &["GROUPBY", "1", "@brand", "REDUCE", "COUNT", "0", "AS", "n", "SORTBY", "2", "@n", "DESC"],
        )
        .unwrap();
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0][0], ("brand".to_string(), Value::str("a")));
        assert_eq!(result.rows[0][1].1.as_number(), Some(3.0));
    }

    #[test]
    fn test_cursor_reads_exhaust_results() {
        let engine = engine();
        create(&engine, "idx", &["SCHEMA", "t", "TEXT"]);
        for i in 0..10 {
            engine.hset(&format!("d{i}"), vec![("t".into(), "x".into())]).unwrap();
        }
        let first = aggregate(&engine, "*", &["LOAD", "1", "@t", "WITHCURSOR", "COUNT", "2"]).unwrap();
        assert_eq!(first.rows.len(), 2);
        let mut id = first.cursor_id.unwrap();
        assert_ne!(id, 0);
        let mut seen = first.rows.len();
        while id != 0 {
            let page = engine.cursor_read("idx", id, None).unwrap();
            seen += page.rows.len();
            id = page.cursor_id;
        }
        assert_eq!(seen, 10);
        assert_eq!(engine.cursors().stats("idx").index_total, 0);
    }

    #[test]
    fn test_cursor_del_and_missing_cursor() {
        let engine = engine();
        create(&engine, "idx", &["SCHEMA", "t", "TEXT"]);
        for i in 0..4 {
            engine.hset(&format!("d{i}"), vec![("t".into(), "x".into())]).unwrap();
        }
        let result = aggregate(&engine, "*", &["WITHCURSOR", "COUNT", "1"]).unwrap();
        let id = result.cursor_id.unwrap();
        engine.cursor_del("idx", id).unwrap();
        assert!(matches!(engine.cursor_read("idx", id, None), Err(Error::CursorNotFound(_))));
    }

    #[test]
    fn test_fail_policy_raises_timeout() {
        let engine = scenario_one();
        engine.runtime().update(|s| s.yield_every = 1);
        let mut request = SearchRequest::new("hello");
        request.args.on_timeout = Some(TimeoutPolicy::Fail);
        let err = engine
            .execute_search("idx", &request, Some(Deadline::expired()))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));

        request.args.on_timeout = Some(TimeoutPolicy::Return);
        let result = engine
            .execute_search("idx", &request, Some(Deadline::expired()))
            .unwrap();
        assert!(result.timed_out);
        assert!(result.warnings.iter().any(|w| w.contains("Timeout limit was reached")));
    }

    #[test]
    fn test_explain_with_filter() {
        let engine = scenario_one();
        let args = to_args(&["FILTER", "n", "1", "2"]);
        let text = engine.explain("idx", "hello", &mut ArgCursor::new(&args)).unwrap();
        assert_eq!(text, "INTERSECT {\n  hello\n  NUMERIC {1 <= @n <= 2}\n}\n");
    }

    #[test]
    fn test_unknown_index() {
        let engine = engine();
        assert!(matches!(search(&engine, "x", &[]), Err(Error::UnknownIndex(_))));
    }
}
