//! KNN and range queries over the vector backends

use std::sync::Arc;

use bytes::Bytes;
use hybridex::args::{to_args, ArgCursor};
use hybridex::engine::SearchResult;
use hybridex::query::request::SearchRequest;
use hybridex::runtime::Settings;
use hybridex::{Engine, Error};

fn blob(values: &[f32]) -> Bytes {
    Bytes::from(values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>())
}

fn engine_with(schema: &[&str]) -> Arc<Engine> {
    let engine = Engine::with_settings(Settings::default());
    let args = to_args(schema);
    engine.create_index("idx", &mut ArgCursor::new(&args)).unwrap();
    engine
}

fn knn(engine: &Engine, query: &str, vector: &[f32]) -> Result<SearchResult, Error> {
    let mut request = SearchRequest::new(query);
    request.args.dialect = Some(2);
    request.limit = 100;
    request.args.params.insert("q".into(), blob(vector));
    engine.execute_search("idx", &request, None)
}

fn distance(result: &SearchResult, i: usize, name: &str) -> f64 {
    result.hits[i]
        .fields
        .iter()
        .find(|(k, _)| k == name)
        .and_then(|(_, v)| v.as_number())
        .unwrap()
}

fn seed_line(engine: &Engine) {
    for (key, y) in [("a", 0.1f32), ("b", 0.2), ("c", 0.3), ("d", 0.4)] {
        engine.hset(key, vec![("v".into(), blob(&[0.1, y]))]).unwrap();
    }
}

#[test]
fn test_flat_knn_orders_by_l2_distance() {
    let engine = engine_with(&[
        "SCHEMA", "v", "VECTOR", "FLAT", "6", "TYPE", "FLOAT32", "DIM", "2", "DISTANCE_METRIC", "L2",
    ]);
    seed_line(&engine);

    let result = knn(&engine, "*=>[KNN 4 @v $q]", &[0.1, 0.1]).unwrap();
    let keys: Vec<_> = result.hits.iter().map(|h| h.key.as_str()).collect();
    assert_eq!(keys, vec!["a", "b", "c", "d"]);
    for (i, want) in [0.0, 0.01, 0.04, 0.09].into_iter().enumerate() {
        let got = distance(&result, i, "__v_score");
        assert!((got - want).abs() < 1e-5, "hit {i}: {got} vs {want}");
    }
}

#[test]
fn test_hnsw_float16_within_precision() {
    let engine = engine_with(&[
        "SCHEMA", "v", "VECTOR", "HNSW", "6", "TYPE", "FLOAT16", "DIM", "2", "DISTANCE_METRIC", "L2",
    ]);
    for (key, y) in [("a", 0.1f32), ("b", 0.2), ("c", 0.3), ("d", 0.4)] {
        let half: Vec<u8> = [0.1f32, y]
            .iter()
            .flat_map(|v| half::f16::from_f32(*v).to_le_bytes())
            .collect();
        engine.hset(key, vec![("v".into(), Bytes::from(half))]).unwrap();
    }
    let query: Vec<u8> = [0.1f32, 0.1]
        .iter()
        .flat_map(|v| half::f16::from_f32(*v).to_le_bytes())
        .collect();
    let mut request = SearchRequest::new("*=>[KNN 4 @v $q AS dist]");
    request.args.dialect = Some(2);
    request.args.params.insert("q".into(), Bytes::from(query));
    let result = engine.execute_search("idx", &request, None).unwrap();

    let keys: Vec<_> = result.hits.iter().map(|h| h.key.as_str()).collect();
    assert_eq!(keys, vec!["a", "b", "c", "d"]);
    for (i, want) in [0.0, 0.01, 0.04, 0.09].into_iter().enumerate() {
        assert!((distance(&result, i, "dist") - want).abs() < 1e-3);
    }
}

#[test]
fn test_knn_length_and_monotonic_distances() {
    let engine = engine_with(&[
        "SCHEMA", "v", "VECTOR", "HNSW", "6", "TYPE", "FLOAT32", "DIM", "4", "DISTANCE_METRIC", "COSINE",
    ]);
    let mut rng = fastrand::Rng::with_seed(7);
    for i in 0..200 {
        let v: Vec<f32> = (0..4).map(|_| rng.f32() + 0.01).collect();
        engine.hset(&format!("doc:{i}"), vec![("v".into(), blob(&v))]).unwrap();
    }

    for k in [0usize, 1, 10, 50] {
        let result = knn(&engine, &format!("*=>[KNN {k} @v $q]"), &[0.5, 0.2, 0.9, 0.1]).unwrap();
        assert_eq!(result.hits.len(), k);
        for i in 1..result.hits.len() {
            assert!(distance(&result, i - 1, "__v_score") <= distance(&result, i, "__v_score"));
        }
    }
}

#[test]
fn test_range_query_respects_radius() {
    let engine = engine_with(&[
        "SCHEMA", "v", "VECTOR", "FLAT", "6", "TYPE", "FLOAT32", "DIM", "2", "DISTANCE_METRIC", "L2",
    ]);
    seed_line(&engine);
    let result = knn(&engine, "@v:[VECTOR_RANGE 0.05 $q]", &[0.1, 0.1]).unwrap();
    let mut keys: Vec<_> = result.hits.iter().map(|h| h.key.clone()).collect();
    keys.sort();
    assert_eq!(keys, vec!["a", "b", "c"]);
}

#[test]
fn test_wrong_blob_size_and_dialect() {
    let engine = engine_with(&[
        "SCHEMA", "v", "VECTOR", "FLAT", "6", "TYPE", "FLOAT32", "DIM", "2", "DISTANCE_METRIC", "L2",
    ]);
    seed_line(&engine);

    let err = knn(&engine, "*=>[KNN 2 @v $q]", &[0.1, 0.1, 0.1]).unwrap_err();
    assert!(matches!(err, Error::BadVectorSize { expected: 8, actual: 12 }));

    let mut request = SearchRequest::new("*=>[KNN 2 @v $q]");
    request.args.dialect = Some(1);
    request.args.params.insert("q".into(), blob(&[0.1, 0.1]));
    assert!(engine.execute_search("idx", &request, None).is_err());
}

#[test]
fn test_deleted_vectors_leave_results() {
    let engine = engine_with(&[
        "SCHEMA", "v", "VECTOR", "FLAT", "6", "TYPE", "FLOAT32", "DIM", "2", "DISTANCE_METRIC", "L2",
    ]);
    seed_line(&engine);
    engine.del(&["a".to_string()]);
    let result = knn(&engine, "*=>[KNN 2 @v $q]", &[0.1, 0.1]).unwrap();
    let keys: Vec<_> = result.hits.iter().map(|h| h.key.as_str()).collect();
    assert_eq!(keys, vec!["b", "c"]);
}
