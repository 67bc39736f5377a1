//! Young-generation collection tests: promotion, remembered-set use, and
//! interaction with an in-flight major marking cycle.

use ebb_gc::gc::mark::{self, Color};
use ebb_gc::gc::StepFlags;
use ebb_gc::heap::page_of;
use ebb_gc::{GcConfig, GcReason, Heap, ObjectKind, SpaceId, TaggedWord};

#[test]
fn test_scavenge_empties_young_space() {
    let mut heap = Heap::new(GcConfig::default());
    let keep = heap.allocate(ObjectKind::Plain, 1).unwrap();
    let id = heap.add_root(keep);
    for _ in 0..200 {
        heap.allocate(ObjectKind::Plain, 1).unwrap();
    }

    heap.scavenge();

    assert_eq!(heap.state_snapshot().new_space_size, 0);
    let moved = heap.root(id).unwrap();
    assert_eq!(page_of(moved).header().space(), SpaceId::Old);
}

#[test]
fn test_scavenge_keeps_objects_reachable_from_old_space() {
    let mut heap = Heap::new(GcConfig::default());
    let old_host = heap
        .allocate_in(SpaceId::Old, ObjectKind::Plain, 2)
        .unwrap();
    let _host_root = heap.add_root(old_host);

    let young = heap.allocate(ObjectKind::Plain, 1).unwrap();
    heap.write_barrier(young, 0, TaggedWord::from_immediate(3));
    heap.write_barrier(old_host, 0, TaggedWord::from_object(young));

    heap.scavenge();

    let promoted = old_host.field(0).as_object().expect("slot rewritten");
    assert_eq!(page_of(promoted).header().space(), SpaceId::Old);
    assert_eq!(promoted.field(0).immediate(), 3);
}

#[test]
fn test_scavenge_drops_unreachable_young() {
    let mut heap = Heap::new(GcConfig::default());
    let keep = heap.allocate(ObjectKind::Plain, 1).unwrap();
    let _root = heap.add_root(keep);
    for _ in 0..50 {
        heap.allocate(ObjectKind::Plain, 4).unwrap();
    }
    let before = heap.size_of_objects();

    heap.scavenge();

    assert!(
        heap.size_of_objects() < before,
        "unreachable young objects must not be promoted"
    );
}

#[test]
fn test_young_chains_survive_promotion() {
    let mut heap = Heap::new(GcConfig::default());
    let head = heap.allocate(ObjectKind::Plain, 2).unwrap();
    let mut tail = head;
    for i in 0..20 {
        let next = heap.allocate(ObjectKind::Plain, 2).unwrap();
        heap.write_barrier(next, 1, TaggedWord::from_immediate(i));
        heap.write_barrier(tail, 0, TaggedWord::from_object(next));
        tail = next;
    }
    let id = heap.add_root(head);

    heap.scavenge();

    let mut node = heap.root(id).unwrap();
    for i in 0..20 {
        node = node.field(0).as_object().expect("chain link survived");
        assert_eq!(node.field(1).immediate(), i);
        assert_eq!(page_of(node).header().space(), SpaceId::Old);
    }
}

#[test]
fn test_scavenge_during_marking_preserves_colors_and_worklist() {
    let mut heap = Heap::new(GcConfig::default());
    let a = heap.allocate(ObjectKind::Plain, 2).unwrap();
    let b = heap.allocate(ObjectKind::Plain, 1).unwrap();
    heap.write_barrier(a, 0, TaggedWord::from_object(b));
    let id = heap.add_root(a);

    heap.start_incremental_marking(GcReason::ExternalRequest);
    // Roots are grey and queued; nothing scanned yet.
    let promoted = heap.scavenge();
    assert!(promoted > 0);

    // The promoted copy carried its grey color along.
    let a_promoted = heap.root(id).unwrap();
    assert_eq!(page_of(a_promoted).header().space(), SpaceId::Old);
    assert_eq!(mark::color_of(a_promoted), Color::Grey);

    // Finishing the cycle still finds the whole graph through the
    // relocated worklist entries.
    heap.step(
        0,
        StepFlags {
            force: true,
            force_completion: true,
        },
    );
    assert_eq!(mark::color_of(a_promoted), Color::Black);
    let b_promoted = a_promoted.field(0).as_object().unwrap();
    assert_eq!(mark::color_of(b_promoted), Color::Black);

    heap.collect_garbage(GcReason::IdleTask);
    assert!(heap.root(id).is_some());
}

#[test]
fn test_promotion_counts_feed_the_controller() {
    let mut heap = Heap::new(GcConfig::default());
    let obj = heap.allocate(ObjectKind::Plain, 1).unwrap();
    let _root = heap.add_root(obj);

    heap.start_incremental_marking(GcReason::ExternalRequest);
    let promoted = heap.scavenge();
    assert!(promoted > 0);

    // The scavenge speed estimator saw the sample.
    assert!(heap.state_snapshot().scavenge_speed > 0 || promoted < 1024);
}
