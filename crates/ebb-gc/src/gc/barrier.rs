//! Mutator-side write barrier.
//!
//! Every pointer store goes through [`write_barrier`]. It performs the
//! store, keeps the old→new remembered set current, and while marking is
//! active upholds the tri-color invariant: a black host must never hold a
//! direct strong reference to a white value.

use crate::gc::mark::{self, Color};
use crate::heap::{page_of, Heap, SpaceId};
use crate::object::{ObjRef, ObjectKind, TaggedWord};

/// Store `value` into `host.field[slot_index]`, maintaining collector
/// invariants.
pub fn write_barrier(heap: &mut Heap, host: ObjRef, slot_index: usize, value: TaggedWord) {
    host.set_field_unbarriered(slot_index, value);

    let Some(target) = value.as_object() else {
        return; // immediates need no bookkeeping
    };

    let host_page = page_of(host);
    let target_page = page_of(target);

    // Generational bookkeeping: an old-space slot now points into the
    // nursery and must be visited by the next scavenge.
    if host_page.header().space() != SpaceId::Young
        && target_page.header().space() == SpaceId::Young
    {
        heap.remembered
            .record_old_to_new(host_page, host.slot(slot_index));
    }

    if !heap.marking.is_active() {
        return;
    }
    heap.marking.note_barrier_hit();

    let host_color = mark::color_of(host);
    if host_color != Color::Black {
        return; // grey hosts get rescanned anyway; white hosts are unreached
    }
    if mark::color_of(target) != Color::White {
        return;
    }

    // Black host, white value: restore the invariant the cheap way.
    // Hosts that support partial scanning are demoted and rescanned;
    // for everything else, enqueueing the single value is cheaper.
    if host.kind() == ObjectKind::ProgressBar {
        mark::regrey_and_push(&heap.deque, host);
    } else {
        mark::mark_grey_and_push(&heap.deque, target);
    }
}
