//! Garbage collection of deleted documents

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use hybridex::args::{to_args, ArgCursor};
use hybridex::runtime::Settings;
use hybridex::Engine;

fn populated() -> Arc<Engine> {
    let engine = Engine::with_settings(Settings::default());
    let args = to_args(&["SCHEMA", "t", "TEXT", "n", "NUMERIC", "tag", "TAG"]);
    engine.create_index("idx", &mut ArgCursor::new(&args)).unwrap();
    for i in 0..20 {
        engine
            .hset(
                &format!("doc:{i}"),
                vec![
                    ("t".into(), format!("alpha word{i}").into()),
                    ("n".into(), i.to_string().into()),
                    ("tag".into(), if i % 2 == 0 { "even" } else { "odd" }.into()),
                ],
            )
            .unwrap();
    }
    engine
}

fn count(engine: &Engine, query: &str) -> usize {
    let args = to_args(&["NOCONTENT"]);
    engine.search("idx", query, &mut ArgCursor::new(&args)).unwrap().total
}

fn delete_evens(engine: &Engine) {
    let keys: Vec<String> = (0..20).step_by(2).map(|i| format!("doc:{i}")).collect();
    assert_eq!(engine.del(&keys), 10);
}

#[test]
fn test_collect_frees_deleted_entries() {
    let engine = populated();
    engine.config_set("FORK_GC_CLEAN_THRESHOLD", "0").unwrap();
    delete_evens(&engine);

    let before = engine.info("idx").unwrap();
    assert_eq!(before.gc_stats.bytes_collected, 0);

    engine.run_gc(&AtomicBool::new(false));
    let after = engine.info("idx").unwrap();
    assert!(after.gc_stats.bytes_collected > 0);
    assert_eq!(after.gc_stats.docs_not_collected, 0);
    assert_eq!(after.gc_stats.cycles, 1);

    assert_eq!(count(&engine, "alpha"), 10);
    assert_eq!(count(&engine, "@n:[0 9]"), 5);
    assert_eq!(count(&engine, "@tag:{even}"), 0);
    assert_eq!(count(&engine, "word4"), 0);
    assert_eq!(count(&engine, "word5"), 1);
}

#[test]
fn test_second_cycle_is_a_noop() {
    let engine = populated();
    engine.config_set("FORK_GC_CLEAN_THRESHOLD", "0").unwrap();
    delete_evens(&engine);

    engine.run_gc(&AtomicBool::new(false));
    let first = engine.info("idx").unwrap().gc_stats.bytes_collected;
    engine.run_gc(&AtomicBool::new(false));
    let second = engine.info("idx").unwrap().gc_stats;
    assert_eq!(second.bytes_collected, first);
    assert_eq!(second.cycles, 2);
    assert_eq!(count(&engine, "alpha"), 10);
}

#[test]
fn test_threshold_defers_small_batches() {
    let engine = populated();
    delete_evens(&engine);

    engine.run_gc(&AtomicBool::new(false));
    let stats = engine.info("idx").unwrap().gc_stats;
    assert_eq!(stats.bytes_collected, 0);
    assert_eq!(stats.docs_not_collected, 10);
    assert_eq!(count(&engine, "alpha"), 10);
}

#[test]
fn test_cancelled_cycle_leaves_tombstones() {
    let engine = populated();
    engine.config_set("FORK_GC_CLEAN_THRESHOLD", "0").unwrap();
    delete_evens(&engine);

    engine.run_gc(&AtomicBool::new(true));
    assert_eq!(engine.info("idx").unwrap().gc_stats.bytes_collected, 0);

    engine.run_gc(&AtomicBool::new(false));
    assert!(engine.info("idx").unwrap().gc_stats.bytes_collected > 0);
}
