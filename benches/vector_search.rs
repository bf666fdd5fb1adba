//! KNN benchmarks across vector backends and hybrid modes
//!
//! Run with: cargo bench --bench vector_search

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hybridex::args::{to_args, ArgCursor};
use hybridex::query::request::SearchRequest;
use hybridex::runtime::Settings;
use hybridex::Engine;

const DIM: usize = 64;
const DOCS: usize = 5000;

fn blob(values: &[f32]) -> Bytes {
    Bytes::from(values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>())
}

fn random_vector(rng: &mut fastrand::Rng) -> Vec<f32> {
    (0..DIM).map(|_| rng.f32() - 0.5).collect()
}

fn build(algorithm: &str) -> Arc<Engine> {
    let engine = Engine::with_settings(Settings::default());
    let dim = DIM.to_string();
    let args = to_args(&[
        "SCHEMA", "tag", "TAG", "v", "VECTOR", algorithm, "6", "TYPE", "FLOAT32", "DIM", dim.as_str(), "DISTANCE_METRIC", "L2",
    ]);
    engine
        .create_index("idx", &mut ArgCursor::new(&args))
        .expect("create index");
    let mut rng = fastrand::Rng::with_seed(4242);
    for i in 0..DOCS {
        // 1% of documents are rare, the rest common
        let tag = if i % 100 == 0 { "rare" } else { "common" };
        engine
            .hset(
                &format!("doc:{i}"),
                vec![("tag".into(), tag.into()), ("v".into(), blob(&random_vector(&mut rng)))],
            )
            .expect("hset");
    }
    engine
}

fn request(query: &str, vector: &Bytes) -> SearchRequest {
    let mut request = SearchRequest::new(query);
    request.args.dialect = Some(2);
    request.args.params.insert("q".into(), vector.clone());
    request
}

fn bench_knn(c: &mut Criterion) {
    let mut rng = fastrand::Rng::with_seed(7);
    let query = blob(&random_vector(&mut rng));

    let mut group = c.benchmark_group("knn");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(3));

    for algorithm in ["FLAT", "HNSW"] {
        let engine = build(algorithm);
        for k in [10, 100] {
            let req = request(&format!("*=>[KNN {k} @v $q]"), &query);
            group.bench_with_input(BenchmarkId::new(algorithm, k), &req, |b, req| {
                b.iter(|| {
                    let result = engine.execute_search("idx", req, None).expect("search");
                    black_box(result.hits.len())
                })
            });
        }
    }
    group.finish();
}

fn bench_hybrid(c: &mut Criterion) {
    let engine = build("HNSW");
    let mut rng = fastrand::Rng::with_seed(11);
    let query = blob(&random_vector(&mut rng));

    let mut group = c.benchmark_group("hybrid");
    group.sample_size(20);

    for (tag, policy) in [("rare", "ADHOC_BF"), ("rare", "BATCHES"), ("common", "ADHOC_BF"), ("common", "BATCHES")] {
        let req = request(&format!("(@tag:{{{tag}}})=>[KNN 10 @v $q HYBRID_POLICY {policy}]"), &query);
        group.bench_with_input(BenchmarkId::new(policy, tag), &req, |b, req| {
            b.iter(|| black_box(engine.execute_search("idx", req, None).expect("search").hits.len()))
        });
    }
    group.finish();
}

fn bench_concurrent(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let engine = build("HNSW");
    let mut rng = fastrand::Rng::with_seed(13);
    let query = blob(&random_vector(&mut rng));
    let req = Arc::new(request("*=>[KNN 10 @v $q]", &query));

    c.bench_function("knn_concurrent_8", |b| {
        b.to_async(&runtime).iter(|| {
            let engine = engine.clone();
            let req = req.clone();
            async move {
                let tasks: Vec<_> = (0..8)
                    .map(|_| {
                        let engine = engine.clone();
                        let req = req.clone();
                        tokio::task::spawn_blocking(move || engine.execute_search("idx", &req, None).map(|r| r.hits.len()))
                    })
                    .collect();
                for task in futures::future::join_all(tasks).await {
                    black_box(task.expect("join").expect("search"));
                }
            }
        })
    });
}

criterion_group!(benches, bench_knn, bench_hybrid, bench_concurrent);
criterion_main!(benches);
