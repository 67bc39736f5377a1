//! Smoke test: with the `tracing` feature on, collections emit their spans
//! and events without disturbing a collection cycle.
#![cfg(feature = "tracing")]

use ebb_gc::{GcConfig, GcReason, Heap, ObjectKind};

#[test]
fn test_collection_runs_under_a_subscriber() {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let mut heap = Heap::new(GcConfig::default());
    let obj = heap.allocate(ObjectKind::Plain, 2).unwrap();
    let id = heap.add_root(obj);
    for _ in 0..100 {
        heap.allocate(ObjectKind::Plain, 2).unwrap();
    }

    heap.idle_notification(5);
    heap.collect_garbage(GcReason::Testing);
    assert!(heap.root(id).is_some());
}
