//! Tests for the pure idle-time scheduler and its estimators.

use ebb_gc::gc::{compute, estimate_marking_step_size, HeapStateSnapshot, IdleAction};
use ebb_gc::{GcConfig, GcReason, Heap, ObjectKind};

fn marking_ready() -> HeapStateSnapshot {
    HeapStateSnapshot {
        incremental_marking_stopped: false,
        can_start_incremental_marking: true,
        contexts_disposal_rate_ms: f64::INFINITY,
        ..HeapStateSnapshot::default()
    }
}

#[test]
fn test_scenario_a_zero_budget_no_disposals() {
    let state = HeapStateSnapshot {
        incremental_marking_stopped: true,
        contexts_disposed: 0,
        contexts_disposal_rate_ms: f64::INFINITY,
        ..HeapStateSnapshot::default()
    };
    assert_eq!(compute(0, &state), IdleAction::NoAction);
}

#[test]
fn test_scenario_b_unmeasured_speed_still_steps() {
    let state = HeapStateSnapshot {
        incremental_marking_speed: 0,
        ..marking_ready()
    };
    match compute(10, &state) {
        IdleAction::IncrementalStep { bytes } => assert!(bytes > 0),
        other => panic!("expected a step, got {other:?}"),
    }
}

#[test]
fn test_compute_is_deterministic_across_inputs() {
    let states = [
        marking_ready(),
        HeapStateSnapshot {
            sweeping_in_progress: true,
            ..marking_ready()
        },
        HeapStateSnapshot {
            contexts_disposed: 2,
            contexts_disposal_rate_ms: 5_000.0,
            idle_rounds_without_progress: 9,
            ..marking_ready()
        },
    ];
    for state in &states {
        for idle_ms in [0, 1, 7, 100] {
            let first = compute(idle_ms, state);
            assert_eq!(compute(idle_ms, state), first);
            assert_eq!(compute(idle_ms, state), first);
        }
    }
}

#[test]
fn test_step_size_never_exceeds_ceiling() {
    for idle_ms in [1u64, 4, 16, 1000, 100_000] {
        for speed in [0usize, 1, 1024, 96 * 1024, usize::MAX / 2] {
            let step = estimate_marking_step_size(idle_ms, speed);
            assert!(step <= 1024 * 1024, "step {step} above the hard cap");
        }
    }
}

#[test]
fn test_step_size_overflow_wraps_to_cap() {
    assert_eq!(
        estimate_marking_step_size(u64::MAX, usize::MAX),
        1024 * 1024
    );
}

#[test]
fn test_idle_notification_runs_the_returned_action() {
    let mut heap = Heap::new(GcConfig::default());
    let obj = heap.allocate(ObjectKind::Plain, 1).unwrap();
    let _root = heap.add_root(obj);

    let action = heap.idle_notification(10);
    assert!(matches!(action, IdleAction::IncrementalStep { .. }));
    // The step actually started an incremental cycle.
    let snapshot = heap.state_snapshot();
    assert!(!snapshot.incremental_marking_stopped || snapshot.sweeping_in_progress);
}

#[test]
fn test_disposal_signal_drives_full_collection_at_zero_budget() {
    let mut heap = Heap::new(GcConfig::default());
    let keep = heap.allocate(ObjectKind::Plain, 1).unwrap();
    let _root = heap.add_root(keep);
    for _ in 0..50 {
        heap.allocate(ObjectKind::Plain, 1).unwrap();
    }

    // Several disposals in quick succession make the signal actionable.
    for _ in 0..8 {
        heap.notify_context_disposed();
    }
    let before = heap.history().total_recorded();
    let action = heap.idle_notification(0);
    assert_eq!(action, IdleAction::FullCollection);
    assert_eq!(heap.history().total_recorded(), before + 1);
}

#[test]
fn test_disabled_marking_reports_done() {
    let mut config = GcConfig::default();
    config.incremental.enabled = false;
    let heap = Heap::new(config);
    let snapshot = heap.state_snapshot();
    assert_eq!(compute(5, &snapshot), IdleAction::Done);
}

#[test]
fn test_collection_resets_disposal_counter() {
    let mut heap = Heap::new(GcConfig::default());
    heap.notify_context_disposed();
    assert_eq!(heap.state_snapshot().contexts_disposed, 1);
    heap.collect_garbage(GcReason::Testing);
    assert_eq!(heap.state_snapshot().contexts_disposed, 0);
}
