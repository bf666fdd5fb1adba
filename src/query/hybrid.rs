//! KNN execution, alone or combined with a filter
//!
//! A filtered KNN query runs in one of two modes:
//!
//! * `ADHOC_BF` walks the filter and computes the distance of every
//!   candidate, keeping the best `k`.
//! * `BATCHES` pulls successive batches of nearest neighbors from the
//!   vector index and keeps the ones the filter accepts, until `k` matched
//!   or the index is exhausted.
//!
//! The mode is chosen from the ratio of estimated filter matches to
//! indexed vectors, and a batched run switches to `ADHOC_BF` when the
//! observed hit rate turns out too low. Both modes produce the same top-k.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::index::DocTable;
use crate::pipeline::{ExecContext, ResultProcessor, Row};
use crate::query::ast::HybridPolicy;
use crate::query::iterators::{BoxedIterator, ReadStatus, Record};
use crate::query::timeout::{Partial, TimeoutCheck};
use crate::types::{DocId, Value};
use crate::vector::{Neighbor, SearchParams, TopK, VectorIndex};
use crate::Result;

/// Below this filter/vector ratio batches rarely hit; brute force instead.
pub const MIN_RATIO: f64 = 0.05;

pub const REASON_OVERRIDE: &str = "policy set by query";
pub const REASON_RATIO: &str = "filter ratio heuristic";
pub const REASON_LOW_HIT_RATE: &str = "low batch hit rate";
pub const REASON_NO_FILTER: &str = "no filter";
pub const REASON_EMPTY_FILTER: &str = "empty filter";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HybridMode {
    /// Plain KNN without a filter
    Standard,
    AdhocBf,
    Batches,
}

impl HybridMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HybridMode::Standard => "STANDARD_KNN",
            HybridMode::AdhocBf => "ADHOC_BF",
            HybridMode::Batches => "BATCHES",
        }
    }
}

impl From<HybridPolicy> for HybridMode {
    fn from(policy: HybridPolicy) -> Self {
        match policy {
            HybridPolicy::AdhocBf => HybridMode::AdhocBf,
            HybridPolicy::Batches => HybridMode::Batches,
        }
    }
}

/// How a KNN query was executed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HybridReport {
    pub initial_mode: HybridMode,
    pub final_mode: HybridMode,
    pub reason: String,
    pub batches: usize,
    pub batch_size: usize,
}

/// Shared slot the engine reads once the query has run
pub type ReportHandle = Arc<Mutex<Option<HybridReport>>>;

pub struct KnnRequest {
    pub vectors: Arc<VectorIndex>,
    pub query: Vec<f32>,
    pub k: usize,
    pub params: SearchParams,
    pub policy: Option<HybridPolicy>,
    /// Explicit batch size; otherwise the configured default or a size
    /// derived from the filter ratio
    pub batch_size: Option<usize>,
    pub default_batch_size: usize,
    pub score_name: String,
}

/// Pipeline source for KNN queries
pub struct HybridStage {
    request: KnnRequest,
    filter: Option<BoxedIterator>,
    docs: Arc<DocTable>,
    report: ReportHandle,
    output: Option<std::vec::IntoIter<Row>>,
}

impl HybridStage {
    /// `filter` is `None` for unfiltered KNN.
    pub fn new(request: KnnRequest, filter: Option<BoxedIterator>, docs: Arc<DocTable>) -> Self {
        Self {
            request,
            filter,
            docs,
            report: Arc::new(Mutex::new(None)),
            output: None,
        }
    }

    pub fn report_handle(&self) -> ReportHandle {
        self.report.clone()
    }

    fn execute(&mut self, check: &mut TimeoutCheck) -> Partial<Vec<Neighbor>> {
        let k = self.request.k;
        let Some(mut filter) = self.filter.take() else {
            self.publish(HybridMode::Standard, HybridMode::Standard, REASON_NO_FILTER, 0, 0);
            return self.request.vectors.knn(&self.request.query, k, &self.request.params, check);
        };

        if matches!(filter.read(), ReadStatus::Eof) {
            self.publish(HybridMode::AdhocBf, HybridMode::AdhocBf, REASON_EMPTY_FILTER, 0, 0);
            return Partial::complete(Vec::new());
        }
        filter.rewind();

        let size = self.request.vectors.size().max(1);
        let ratio = filter.estimate() as f64 / size as f64;
        let (initial, reason) = match self.request.policy {
            Some(policy) => (HybridMode::from(policy), REASON_OVERRIDE),
            None if ratio < MIN_RATIO => (HybridMode::AdhocBf, REASON_RATIO),
            None => (HybridMode::Batches, REASON_RATIO),
        };
        if initial == HybridMode::AdhocBf {
            self.publish(initial, initial, reason, 0, 0);
            return adhoc(&self.request, filter.as_mut(), check);
        }

        let batch_size = self.batch_size(ratio);
        let mut batches = self.request.vectors.batches(self.request.query.clone(), self.request.params);
        let mut top = TopK::new(k);
        let mut rounds = 0;
        let mut scanned = 0usize;
        let mut hits = 0usize;
        loop {
            if top.is_full() || batches.is_exhausted() {
                break;
            }
            let batch = batches.next_batch(batch_size, check);
            rounds += 1;
            let mut neighbors = batch.value;
            neighbors.sort_by_key(|n| n.label);
            filter.rewind();
            scanned += neighbors.len();
            for neighbor in neighbors {
                if matches!(filter.skip_to(neighbor.label), ReadStatus::Ok) {
                    hits += 1;
                    top.push(neighbor);
                }
            }
            if batch.timed_out {
                self.publish(initial, HybridMode::Batches, reason, rounds, batch_size);
                return Partial::truncated(top.into_sorted());
            }
            let observed = hits as f64 / scanned.max(1) as f64;
            if self.request.policy.is_none() && !top.is_full() && scanned >= batch_size && observed < MIN_RATIO {
                tracing::debug!(hits, scanned, "Switching hybrid query to ad-hoc brute force");
                self.publish(initial, HybridMode::AdhocBf, REASON_LOW_HIT_RATE, rounds, batch_size);
                filter.rewind();
                return adhoc(&self.request, filter.as_mut(), check);
            }
        }
        self.publish(initial, HybridMode::Batches, reason, rounds, batch_size);
        Partial::complete(top.into_sorted())
    }

    fn batch_size(&self, ratio: f64) -> usize {
        let k = self.request.k.max(1);
        if let Some(size) = self.request.batch_size {
            return size.max(1);
        }
        if self.request.default_batch_size > 0 {
            return self.request.default_batch_size;
        }
        let derived = (k as f64 / ratio.clamp(MIN_RATIO, 1.0)).ceil() as usize;
        derived.clamp(k, self.request.vectors.size().max(k))
    }

    fn publish(&self, initial: HybridMode, last: HybridMode, reason: &str, batches: usize, batch_size: usize) {
        *self.report.lock() = Some(HybridReport {
            initial_mode: initial,
            final_mode: last,
            reason: reason.to_string(),
            batches,
            batch_size,
        });
    }

    fn produce(&mut self, ctx: &mut ExecContext) -> Result<Vec<Row>> {
        let mut check = ctx.check.clone();
        let found = self.execute(&mut check);
        ctx.check = check;
        if found.timed_out {
            ctx.on_timeout()?;
        }
        let name: Arc<str> = Arc::from(self.request.score_name.as_str());
        let rows: Vec<Row> = found
            .value
            .into_iter()
            .filter_map(|n| {
                let meta = self.docs.get(n.label)?;
                let mut row = Row::for_doc(meta);
                let distance = n.distance as f64;
                row.set(&self.request.score_name, Value::Number(distance));
                row.record = Some(Record::Metric {
                    distance,
                    weight: 1.0,
                    name: name.clone(),
                });
                Some(row)
            })
            .collect();
        ctx.total_results += rows.len();
        Ok(rows)
    }
}

/// Brute force over the filter's matches.
fn adhoc(request: &KnnRequest, filter: &mut dyn crate::query::iterators::IndexIterator, check: &mut TimeoutCheck) -> Partial<Vec<Neighbor>> {
    let mut top = TopK::new(request.k);
    loop {
        if check.tick() {
            return Partial::truncated(top.into_sorted());
        }
        match filter.read() {
            ReadStatus::Ok | ReadStatus::NotFound => {}
            ReadStatus::Eof => break,
            ReadStatus::TimedOut => return Partial::truncated(top.into_sorted()),
        }
        let id: DocId = filter.current_id();
        if let Some(distance) = request.vectors.distance_to(id, &request.query) {
            top.push(Neighbor::new(id, distance));
        }
    }
    Partial::complete(top.into_sorted())
}

impl ResultProcessor for HybridStage {
    fn next(&mut self, ctx: &mut ExecContext) -> Result<Option<Row>> {
        if self.output.is_none() {
            let rows = self.produce(ctx)?;
            self.output = Some(rows.into_iter());
        }
        Ok(self.output.as_mut().and_then(Iterator::next))
    }

    fn name(&self) -> &'static str {
        "Vector"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::DocMeta;
    use crate::pipeline::tests::context;
    use crate::query::iterators::IdListIterator;
    use crate::runtime::Settings;
    use crate::schema::{VectorAlgorithm, VectorOptions};
    use crate::query::timeout::Deadline;
    use crate::types::{DistanceMetric, TimeoutPolicy};
    use crate::workers::WorkerPool;

    /// 100 one-dimensional vectors at 0..100; every 10th id passes the filter.
    fn fixture(algorithm: VectorAlgorithm) -> (Arc<VectorIndex>, Arc<DocTable>, Vec<DocId>) {
        let mut options = VectorOptions::new(algorithm);
        options.dim = 1;
        options.metric = DistanceMetric::L2;
        let vectors = Arc::new(VectorIndex::new(options, &Settings::default(), &WorkerPool::new(0)));
        let docs = Arc::new(DocTable::new());
        let mut filtered = Vec::new();
        for i in 0..100u64 {
            let mut meta = DocMeta::new(&format!("doc:{i}"), 1.0);
            meta.id = docs.next_id();
            vectors.add_numbers(meta.id, &[i as f64], usize::MAX).unwrap();
            if i % 10 == 0 {
                filtered.push(meta.id);
            }
            docs.insert(meta);
        }
        (vectors, docs, filtered)
    }

    fn request(vectors: &Arc<VectorIndex>, k: usize, policy: Option<HybridPolicy>) -> KnnRequest {
        KnnRequest {
            vectors: vectors.clone(),
            query: vec![42.0],
            k,
            params: SearchParams::default(),
            policy,
            batch_size: Some(10),
            default_batch_size: 0,
            score_name: "__v_score".into(),
        }
    }

    fn run(stage: &mut HybridStage) -> Vec<(String, f64)> {
        let mut ctx = context();
        let mut out = Vec::new();
        while let Some(row) = stage.next(&mut ctx).unwrap() {
            let Some(Value::Number(d)) = row.get("__v_score").cloned() else {
                panic!("missing distance");
            };
            out.push((row.key().unwrap_or_default().to_string(), d));
        }
        out
    }

    #[test]
    fn test_modes_agree() {
        let (vectors, docs, filtered) = fixture(VectorAlgorithm::Flat);
        let mut results = Vec::new();
        for policy in [Some(HybridPolicy::AdhocBf), Some(HybridPolicy::Batches), None] {
            let filter = IdListIterator::new(filtered.clone(), 1.0).boxed();
            let mut stage = HybridStage::new(request(&vectors, 3, policy), Some(filter), docs.clone());
            results.push(run(&mut stage));
        }
        assert_eq!(results[0], results[1]);
        assert_eq!(results[0], results[2]);
        let keys: Vec<_> = results[0].iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["doc:40", "doc:50", "doc:30"]);
    }

    #[test]
    fn test_low_hit_rate_switches_to_adhoc() {
        let (vectors, docs, _) = fixture(VectorAlgorithm::Flat);
        // Matches sit at the far end, so the nearest batches never hit.
        let filter = IdListIterator::new(vec![96, 97, 98, 99, 100], 1.0).boxed();
        let mut req = request(&vectors, 1, None);
        req.query = vec![0.0];
        let mut stage = HybridStage::new(req, Some(filter), docs);
        let handle = stage.report_handle();
        let rows = run(&mut stage);
        assert_eq!(rows, vec![("doc:95".to_string(), 95.0 * 95.0)]);
        let report = handle.lock().clone().unwrap();
        assert_eq!(report.initial_mode, HybridMode::Batches);
        assert_eq!(report.final_mode, HybridMode::AdhocBf);
        assert_eq!(report.reason, REASON_LOW_HIT_RATE);
    }

    #[test]
    fn test_timeout_fails_under_fail_policy() {
        let (vectors, docs, filtered) = fixture(VectorAlgorithm::Flat);
        let filter = IdListIterator::new(filtered, 1.0).boxed();
        let mut stage = HybridStage::new(request(&vectors, 3, Some(HybridPolicy::AdhocBf)), Some(filter), docs);
        let mut ctx = context();
        ctx.check = TimeoutCheck::new(Deadline::expired(), 1);
        ctx.policy = TimeoutPolicy::Fail;
        assert!(matches!(stage.next(&mut ctx), Err(crate::Error::Timeout)));
    }

    #[test]
    fn test_empty_filter_skips_vector_index() {
        let (vectors, docs, _) = fixture(VectorAlgorithm::Flat);
        let filter = IdListIterator::new(vec![], 1.0).boxed();
        let mut stage = HybridStage::new(request(&vectors, 5, None), Some(filter), docs);
        let handle = stage.report_handle();
        assert!(run(&mut stage).is_empty());
        assert_eq!(handle.lock().as_ref().unwrap().reason, REASON_EMPTY_FILTER);
    }

    #[test]
    fn test_unfiltered_knn_orders_by_distance() {
        let (vectors, docs, _) = fixture(VectorAlgorithm::Flat);
        let mut stage = HybridStage::new(request(&vectors, 3, None), None, docs);
        let rows = run(&mut stage);
        assert_eq!(rows[0], ("doc:42".to_string(), 0.0));
        assert_eq!(rows.len(), 3);
        assert!(rows[1].1 <= rows[2].1);
    }
}
