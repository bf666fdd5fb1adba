//! Filtered KNN: every execution mode must return the same neighbours

use std::sync::Arc;

use bytes::Bytes;
use hybridex::args::{to_args, ArgCursor};
use hybridex::engine::SearchResult;
use hybridex::query::request::SearchRequest;
use hybridex::query::HybridMode;
use hybridex::runtime::Settings;
use hybridex::{Engine, Error};

fn blob(values: &[f32]) -> Bytes {
    Bytes::from(values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>())
}

/// 100 documents on a line; every 10th one is tagged `other`.
fn dataset(algorithm: &str) -> Arc<Engine> {
    let engine = Engine::with_settings(Settings::default());
    let args = to_args(&[
        "SCHEMA", "t", "TEXT", "v", "VECTOR", algorithm, "6", "TYPE", "FLOAT32", "DIM", "2", "DISTANCE_METRIC", "L2",
    ]);
    engine.create_index("idx", &mut ArgCursor::new(&args)).unwrap();
    for i in 0..100 {
        let t = if i % 10 == 0 { "other" } else { "common" };
        engine
            .hset(
                &format!("doc:{i}"),
                vec![("t".into(), t.into()), ("v".into(), blob(&[i as f32, 0.0]))],
            )
            .unwrap();
    }
    engine
}

fn run(engine: &Engine, query: &str) -> Result<SearchResult, Error> {
    let mut request = SearchRequest::new(query);
    request.args.dialect = Some(2);
    request.limit = 100;
    request.args.params.insert("q".into(), blob(&[41.0, 0.0]));
    engine.execute_search("idx", &request, None)
}

fn neighbours(result: &SearchResult) -> Vec<(String, f64)> {
    result
        .hits
        .iter()
        .map(|h| {
            let d = h
                .fields
                .iter()
                .find(|(k, _)| k == "__v_score")
                .and_then(|(_, v)| v.as_number())
                .unwrap();
            (h.key.clone(), d)
        })
        .collect()
}

#[test]
fn test_adhoc_filter_returns_only_matching_docs() {
    let engine = dataset("FLAT");
    let result = run(&engine, "(@t:other)=>[KNN 10 @v $q HYBRID_POLICY ADHOC_BF]").unwrap();
    assert_eq!(result.hits.len(), 10);
    let rows = neighbours(&result);
    for (key, _) in &rows {
        let n: usize = key.trim_start_matches("doc:").parse().unwrap();
        assert_eq!(n % 10, 0, "{key} is not tagged other");
    }
    for pair in rows.windows(2) {
        assert!(pair[0].1 <= pair[1].1);
    }
    assert_eq!(result.hybrid.unwrap().final_mode, HybridMode::AdhocBf);
}

#[test]
fn test_modes_are_not_observable_in_results() {
    for algorithm in ["FLAT", "HNSW"] {
        let engine = dataset(algorithm);
        let adhoc = run(&engine, "(@t:other)=>[KNN 5 @v $q HYBRID_POLICY ADHOC_BF]").unwrap();
        let batches = run(&engine, "(@t:other)=>[KNN 5 @v $q HYBRID_POLICY BATCHES]").unwrap();
        let chosen = run(&engine, "(@t:other)=>[KNN 5 @v $q]").unwrap();

        assert_eq!(neighbours(&adhoc), neighbours(&batches), "{algorithm}");
        assert_eq!(neighbours(&adhoc), neighbours(&chosen), "{algorithm}");
        assert_eq!(adhoc.hits[0].key, "doc:40");
    }
}

#[test]
fn test_policy_on_unfiltered_knn_is_rejected() {
    let engine = dataset("FLAT");
    let err = run(&engine, "*=>[KNN 5 @v $q HYBRID_POLICY BATCHES]").unwrap_err();
    assert!(matches!(err, Error::PolicyMismatch(_)));
}

#[test]
fn test_empty_filter_yields_nothing() {
    let engine = dataset("FLAT");
    let result = run(&engine, "(@t:nobody)=>[KNN 5 @v $q]").unwrap();
    assert!(result.hits.is_empty());
}
