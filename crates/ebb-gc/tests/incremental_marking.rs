//! Tests for the incremental marking controller through the public API.

use ebb_gc::gc::mark::{self, Color};
use ebb_gc::gc::{StepFlags, StepResult};
use ebb_gc::{GcConfig, GcReason, Heap, ObjectKind, TaggedWord};

fn force_completion() -> StepFlags {
    StepFlags {
        force: true,
        force_completion: true,
    }
}

#[test]
fn test_marking_starts_stopped() {
    let heap = Heap::new(GcConfig::default());
    assert!(heap.state_snapshot().incremental_marking_stopped);
}

#[test]
fn test_reachable_black_unreachable_white_at_completion() {
    let mut heap = Heap::new(GcConfig::default());
    let a = heap.allocate(ObjectKind::Plain, 2).unwrap();
    let b = heap.allocate(ObjectKind::Plain, 1).unwrap();
    let stray = heap.allocate(ObjectKind::Plain, 1).unwrap();
    heap.write_barrier(a, 0, TaggedWord::from_object(b));
    let _root = heap.add_root(a);

    assert!(heap.start_incremental_marking(GcReason::ExternalRequest));
    let result = heap.step(0, force_completion());
    assert_eq!(result, StepResult::Complete);

    assert_eq!(mark::color_of(a), Color::Black);
    assert_eq!(mark::color_of(b), Color::Black);
    assert_eq!(mark::color_of(stray), Color::White);
}

#[test]
fn test_write_barrier_keeps_invariant_during_marking() {
    let mut heap = Heap::new(GcConfig::default());
    let host = heap.allocate(ObjectKind::Plain, 1).unwrap();
    let _root = heap.add_root(host);

    heap.start_incremental_marking(GcReason::ExternalRequest);
    heap.step(0, force_completion()); // host is now black

    // A store into the already-scanned host must not hide the new value
    // from the cycle's atomic pause.
    let late = heap.allocate(ObjectKind::Plain, 1).unwrap();
    heap.write_barrier(host, 0, TaggedWord::from_object(late));
    heap.collect_garbage(GcReason::Testing);

    let moved_host = heap.root(_root).unwrap();
    assert!(
        moved_host.field(0).as_object().is_some(),
        "value stored into a black host must survive"
    );
}

#[test]
fn test_steps_are_bounded_not_whole_heap() {
    let mut config = GcConfig::default();
    config.incremental.min_step_bytes = 64;
    config.incremental.max_step_bytes = 64;
    let mut heap = Heap::new(config);

    // A long chain: one 64-byte step cannot mark it all.
    let head = heap.allocate(ObjectKind::Plain, 2).unwrap();
    let mut tail = head;
    for _ in 0..64 {
        let next = heap.allocate(ObjectKind::Plain, 2).unwrap();
        heap.write_barrier(tail, 0, TaggedWord::from_object(next));
        tail = next;
    }
    let _root = heap.add_root(head);

    heap.start_incremental_marking(GcReason::ExternalRequest);
    let result = heap.step(
        0,
        StepFlags {
            force: true,
            force_completion: false,
        },
    );
    match result {
        StepResult::Processed { bytes } => assert!(bytes <= 64 + head.size()),
        other => panic!("expected bounded progress, got {other:?}"),
    }
    assert_eq!(mark::color_of(tail), Color::White, "tail not reached yet");
}

#[test]
fn test_completion_requests_full_collection() {
    let mut heap = Heap::new(GcConfig::default());
    let obj = heap.allocate(ObjectKind::Plain, 1).unwrap();
    let _root = heap.add_root(obj);

    heap.start_incremental_marking(GcReason::ExternalRequest);
    assert_eq!(heap.step(0, force_completion()), StepResult::Complete);
    // The requested full collection finishes the cycle and stops marking.
    heap.collect_garbage(GcReason::IdleTask);
    assert!(heap.state_snapshot().incremental_marking_stopped);
}

#[test]
fn test_abort_discards_partial_marks() {
    let mut heap = Heap::new(GcConfig::default());
    let obj = heap.allocate(ObjectKind::Plain, 1).unwrap();
    let _root = heap.add_root(obj);

    heap.start_incremental_marking(GcReason::ExternalRequest);
    heap.step(
        0,
        StepFlags {
            force: true,
            force_completion: false,
        },
    );
    heap.abort_incremental_marking();

    assert!(heap.state_snapshot().incremental_marking_stopped);
    assert_eq!(mark::color_of(obj), Color::White, "marks were discarded");
}

#[test]
fn test_restart_after_abort_is_clean() {
    let mut heap = Heap::new(GcConfig::default());
    let obj = heap.allocate(ObjectKind::Plain, 1).unwrap();
    let id = heap.add_root(obj);

    heap.start_incremental_marking(GcReason::ExternalRequest);
    heap.abort_incremental_marking();
    assert!(heap.start_incremental_marking(GcReason::ExternalRequest));
    assert_eq!(heap.step(0, force_completion()), StepResult::Complete);
    heap.collect_garbage(GcReason::Testing);
    assert!(heap.root(id).is_some());
}

#[test]
fn test_state_machine_transitions_via_api() {
    let mut heap = Heap::new(GcConfig::default());
    let obj = heap.allocate(ObjectKind::Plain, 1).unwrap();
    let _root = heap.add_root(obj);

    // Stopped -> Marking
    heap.start_incremental_marking(GcReason::ExternalRequest);
    // Marking -> Complete
    assert_eq!(heap.step(0, force_completion()), StepResult::Complete);
    // Complete -> Stopped (via the finishing full collection)
    heap.collect_garbage(GcReason::IdleTask);
    assert!(heap.state_snapshot().incremental_marking_stopped);
}
