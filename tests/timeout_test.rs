//! Timeout policies on a large vector scan

use std::sync::Arc;

use bytes::Bytes;
use hybridex::args::{to_args, ArgCursor};
use hybridex::query::request::SearchRequest;
use hybridex::query::Deadline;
use hybridex::runtime::Settings;
use hybridex::types::TimeoutPolicy;
use hybridex::{Engine, Error};

const DOCS: usize = 80_000;

fn blob(values: &[f32]) -> Bytes {
    Bytes::from(values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>())
}

fn large_flat_index() -> Arc<Engine> {
    let engine = Engine::with_settings(Settings::default());
    let args = to_args(&[
        "SCHEMA", "v", "VECTOR", "FLAT", "6", "TYPE", "FLOAT32", "DIM", "4", "DISTANCE_METRIC", "L2",
    ]);
    engine.create_index("idx", &mut ArgCursor::new(&args)).unwrap();
    let mut rng = fastrand::Rng::with_seed(11);
    for i in 0..DOCS {
        let v: Vec<f32> = (0..4).map(|_| rng.f32()).collect();
        engine.hset(&format!("v:{i}"), vec![("v".into(), blob(&v))]).unwrap();
    }
    engine
}

fn knn_request(policy: TimeoutPolicy) -> SearchRequest {
    let mut request = SearchRequest::new("*=>[KNN 10 @v $q]");
    request.args.dialect = Some(2);
    request.args.on_timeout = Some(policy);
    request.args.params.insert("q".into(), blob(&[0.5, 0.5, 0.5, 0.5]));
    request
}

#[test]
fn test_timeout_policies_on_expired_deadline() {
    let engine = large_flat_index();

    let err = engine
        .execute_search("idx", &knn_request(TimeoutPolicy::Fail), Some(Deadline::expired()))
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));

    let partial = engine
        .execute_search("idx", &knn_request(TimeoutPolicy::Return), Some(Deadline::expired()))
        .unwrap();
    assert!(partial.timed_out);
    assert!(partial.hits.len() <= 10);
    assert!(partial.warnings.iter().any(|w| w.contains("Timeout limit was reached")));

    engine.runtime().update(|s| s.timeout_ms = 0);
    let complete = engine
        .execute_search("idx", &knn_request(TimeoutPolicy::Fail), None)
        .unwrap();
    assert!(!complete.timed_out);
    assert_eq!(complete.hits.len(), 10);

    let snapshot = engine.runtime().counters.snapshot();
    let timeouts = snapshot.iter().find(|(name, _)| *name == "total_timeouts").map(|(_, v)| *v);
    assert_eq!(timeouts, Some(2));
}
