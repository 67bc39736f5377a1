//! Incremental marking controller.
//!
//! Splits the mark phase into bounded steps interleaved with mutator
//! execution. The mutator calls `Heap::step` at allocation checkpoints; each
//! step drains a byte budget from the marking deque, adapts speed to
//! allocation pressure, and drives completion once the worklist runs dry.

use std::time::Instant;

use crate::config::{
    FINALIZATION_PROGRESS_THRESHOLD, MAX_FINALIZATION_ROUNDS, MAX_MARKING_SPEED_FACTOR,
    OLD_SPACE_CRITICAL_FREE_FRACTION, PROMOTION_SPEED_UP_MULTIPLE,
};
use crate::gc::mark::{self, Color};
use crate::gc::remembered::{RememberedSet, SlotEntry};
use crate::gc::worklist::MarkingDeque;
use crate::heap::{Heap, PagePtr};
use crate::object::{ObjRef, ObjectKind, ScanTable, SlotAddr, SlotVisitor};
use crate::tracing::internal as trace;

/// Controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MarkingState {
    /// No incremental cycle underway.
    Stopped = 0,
    /// Waiting for a prior cycle's sweep to finish before starting.
    Sweeping = 1,
    /// Marking work is interleaving with the mutator.
    Marking = 2,
    /// The live set is fully marked; a full collection will finish the job.
    Complete = 3,
}

impl MarkingState {
    /// Decode a stored state value.
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Stopped),
            1 => Some(Self::Sweeping),
            2 => Some(Self::Marking),
            3 => Some(Self::Complete),
            _ => None,
        }
    }
}

/// Flags accepted by `Heap::step`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepFlags {
    /// Run even if the allocation threshold has not been reached.
    pub force: bool,
    /// Drain everything and finalize before returning.
    pub force_completion: bool,
}

/// Outcome of one step call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// No incremental cycle is active.
    Inactive,
    /// Still waiting on a prior sweep.
    WaitingForSweep,
    /// A bounded amount of marking ran.
    Processed {
        /// Bytes of objects scanned.
        bytes: usize,
    },
    /// Marking completed; a full collection is requested.
    Complete,
}

/// Incremental marking state and counters.
pub struct IncrementalMarking {
    state: MarkingState,
    allocated_since_step: usize,
    barrier_hits_since_step: usize,
    bytes_marked: usize,
    initial_live_bytes: usize,
    promoted_since_start: usize,
    speed_factor: usize,
    finalization_rounds: usize,
    full_collection_requested: bool,
}

impl IncrementalMarking {
    /// Fresh controller in `Stopped`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: MarkingState::Stopped,
            allocated_since_step: 0,
            barrier_hits_since_step: 0,
            bytes_marked: 0,
            initial_live_bytes: 0,
            promoted_since_start: 0,
            speed_factor: 1,
            finalization_rounds: 0,
            full_collection_requested: false,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> MarkingState {
        self.state
    }

    /// Whether the write barrier must uphold the tri-color invariant.
    /// True through `Complete` too: the live set stays pinned until the
    /// finishing collection's atomic pause.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.state, MarkingState::Marking | MarkingState::Complete)
    }

    /// Whether no incremental cycle is underway.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        matches!(self.state, MarkingState::Stopped)
    }

    /// Whether the controller finished marking and wants a full collection.
    #[must_use]
    pub const fn full_collection_requested(&self) -> bool {
        self.full_collection_requested
    }

    /// Bytes of objects scanned so far this cycle.
    #[must_use]
    pub const fn bytes_marked(&self) -> usize {
        self.bytes_marked
    }

    /// Current speed multiplier.
    #[must_use]
    pub const fn speed_factor(&self) -> usize {
        self.speed_factor
    }

    /// Account bytes the mutator allocated.
    pub fn note_allocated(&mut self, bytes: usize) {
        self.allocated_since_step += bytes;
    }

    /// Account one write-barrier invocation.
    pub fn note_barrier_hit(&mut self) {
        self.barrier_hits_since_step += 1;
    }

    /// Account bytes promoted out of the nursery during this cycle.
    pub fn note_promoted(&mut self, bytes: usize) {
        self.promoted_since_start += bytes;
    }

    /// Discard all controller state (cycle abort or completion).
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub(crate) fn set_state(&mut self, state: MarkingState) {
        self.state = state;
    }

    #[cfg(test)]
    pub(crate) fn set_active_for_test(&mut self) {
        self.state = MarkingState::Marking;
    }
}

impl Default for IncrementalMarking {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Marking visitor
// ============================================================================

/// Pushes every white child grey onto the deque and records slots that
/// point into movable regions, so fix-up can find them after evacuation.
pub(crate) struct MarkingVisitor<'a> {
    pub deque: &'a MarkingDeque,
    pub remembered: &'a mut RememberedSet,
    pub host_page: PagePtr,
}

impl SlotVisitor for MarkingVisitor<'_> {
    fn visit_slot(&mut self, slot: SlotAddr, value: ObjRef) {
        mark::mark_grey_and_push(self.deque, value);

        let target_page = crate::heap::page_of(value);
        if target_page.header().space() == crate::heap::SpaceId::Young {
            self.remembered.record_old_to_new(self.host_page, slot);
        } else if target_page
            .header()
            .has_flag(crate::heap::PAGE_EVACUATION_CANDIDATE)
        {
            self.remembered
                .record_old_to_old(self.host_page, SlotEntry::Untyped(slot.addr()));
        }
    }
}

// ============================================================================
// Controller driver functions
// ============================================================================

/// Begin an incremental cycle. Returns whether marking (or the wait on a
/// prior sweep) actually started.
pub fn start(heap: &mut Heap) -> bool {
    if !heap.config.incremental.enabled || !heap.marking.is_stopped() {
        return false;
    }
    if heap.sweeper.is_in_progress() {
        heap.marking.set_state(MarkingState::Sweeping);
        return true;
    }
    begin_marking(heap);
    true
}

fn begin_marking(heap: &mut Heap) {
    heap.marking.set_state(MarkingState::Marking);
    heap.marking.initial_live_bytes = heap.size_of_objects();
    // Candidates are chosen before any marking so the marker and the write
    // barrier can record every slot that points into them.
    crate::gc::gc::start_compaction(heap);
    mark_roots(heap);
}

/// Mark every registered root grey. This is one of the stop-the-world
/// points; with a single mutator thread it is simply a synchronous call.
pub(crate) fn mark_roots(heap: &mut Heap) {
    let Heap { roots, deque, .. } = heap;
    for obj in roots.iter() {
        mark::mark_grey_and_push(deque, obj);
    }
}

/// Advance marking by up to `budget` bytes, handling the sweep-wait and
/// completion transitions. Shared by the allocation-sampled [`step`] and the
/// idle scheduler's `IncrementalStep` action.
pub fn advance(heap: &mut Heap, budget: usize) -> StepResult {
    match heap.marking.state() {
        MarkingState::Stopped => return StepResult::Inactive,
        MarkingState::Sweeping => {
            if heap.sweeper.is_in_progress() && !heap.sweeper.is_completed() {
                return StepResult::WaitingForSweep;
            }
            crate::gc::sweep::finalize(heap);
            begin_marking(heap);
        }
        MarkingState::Complete => return StepResult::Complete,
        MarkingState::Marking => {}
    }

    let start_time = Instant::now();
    let processed = process_marking_deque(heap, budget);
    heap.speeds
        .incremental_marking
        .record(processed, start_time.elapsed());
    trace::log_incremental_step(budget, processed);
    heap.marking.bytes_marked += processed;

    if heap.deque.is_drained() {
        try_complete(heap)
    } else {
        StepResult::Processed { bytes: processed }
    }
}

/// One bounded marking step, driven by an allocation sample.
pub fn step(heap: &mut Heap, allocated: usize, flags: StepFlags) -> StepResult {
    heap.marking.note_allocated(allocated);

    if flags.force_completion {
        crate::gc::sweep::finalize(heap);
    }

    if heap.marking.state() == MarkingState::Marking
        && !flags.force
        && !flags.force_completion
        && heap.marking.allocated_since_step < heap.config.incremental.allocation_threshold
        && heap.marking.barrier_hits_since_step == 0
    {
        return StepResult::Processed { bytes: 0 };
    }

    let pressure = heap
        .marking
        .allocated_since_step
        .max(heap.marking.barrier_hits_since_step);
    let budget = if flags.force_completion {
        usize::MAX
    } else {
        (heap.marking.speed_factor.saturating_mul(pressure)).clamp(
            heap.config.incremental.min_step_bytes,
            heap.config.incremental.max_step_bytes,
        )
    };

    let mut result = advance(heap, budget);

    if let StepResult::Processed { bytes } = result {
        adapt_speed(heap, bytes);
    }
    heap.marking.allocated_since_step = 0;
    heap.marking.barrier_hits_since_step = 0;

    if flags.force_completion {
        // Completion must be guaranteed before returning: keep draining
        // through finalization rounds until the controller gives up.
        while matches!(result, StepResult::Processed { .. }) {
            result = advance(heap, usize::MAX);
        }
    }
    result
}

/// Raise the speed factor when marking risks losing the race against the
/// mutator.
fn adapt_speed(heap: &mut Heap, processed: usize) {
    let mut speed_up = false;

    // Deque progress lags allocation.
    if heap.marking.allocated_since_step > processed && !heap.deque.is_empty() {
        speed_up = true;
    }

    // Old space is nearly exhausted.
    let capacity = heap.spaces.old.capacity_bytes();
    if capacity > 0 {
        #[allow(clippy::cast_precision_loss)]
        let free_fraction = heap.spaces.old.pages().map(|p| p.header().free_bytes()).sum::<usize>()
            as f64
            / capacity as f64;
        if free_fraction < OLD_SPACE_CRITICAL_FREE_FRACTION {
            speed_up = true;
        }
    }

    // Promotion outpaced the starting live set.
    if heap.marking.initial_live_bytes > 0
        && heap.marking.promoted_since_start
            > PROMOTION_SPEED_UP_MULTIPLE * heap.marking.initial_live_bytes
    {
        speed_up = true;
    }

    if speed_up {
        heap.marking.speed_factor =
            (heap.marking.speed_factor * 2).min(MAX_MARKING_SPEED_FACTOR);
    }
}

/// Drain up to `budget` bytes of grey objects from the deque, blackening and
/// scanning each. Runs the refill protocol when the deque emptied while the
/// overflow flag is up. Returns bytes of objects scanned.
pub(crate) fn process_marking_deque(heap: &mut Heap, budget: usize) -> usize {
    let mut processed = 0usize;
    loop {
        while processed < budget {
            let Some(obj) = heap.deque.pop() else { break };
            processed += scan_object(
                &heap.scan_table,
                &heap.deque,
                &mut heap.remembered,
                &mut heap.collector.ephemerons,
                &mut heap.collector.weak_cells,
                obj,
            );
        }
        if processed >= budget {
            break;
        }
        // Deque drained within budget; recover unlisted grey objects.
        if heap.deque.overflowed() {
            let pages: Vec<_> = heap.spaces.all_pages().collect();
            heap.deque.refill(pages);
            if heap.deque.is_empty() {
                break;
            }
        } else {
            break;
        }
    }
    processed
}

/// Blacken one grey object and scan its strong slots. Returns the bytes
/// this object accounted for (0 if it was already black).
pub(crate) fn scan_object(
    scan_table: &ScanTable,
    deque: &MarkingDeque,
    remembered: &mut RememberedSet,
    ephemerons: &mut Vec<ObjRef>,
    weak_cells: &mut Vec<ObjRef>,
    obj: ObjRef,
) -> usize {
    // Overflow refills may list duplicates; only the grey→black winner scans.
    if mark::color_of(obj) != Color::Grey {
        return 0;
    }
    mark::blacken(obj);

    match obj.kind() {
        ObjectKind::Ephemeron => ephemerons.push(obj),
        ObjectKind::WeakCell => weak_cells.push(obj),
        _ => {}
    }

    let mut visitor = MarkingVisitor {
        deque,
        remembered,
        host_page: crate::heap::page_of(obj),
    };
    scan_table.scan_strong(obj, &mut visitor);
    obj.size()
}

/// Synchronous unbounded drain, used when completion must be guaranteed
/// immediately (e.g. right before a forced full collection).
pub fn hurry(heap: &mut Heap) {
    loop {
        process_marking_deque(heap, usize::MAX);
        if heap.deque.is_drained() {
            break;
        }
    }
}

/// The deque ran dry: run bounded finalization rounds and declare the cycle
/// complete once a round stops making progress.
fn try_complete(heap: &mut Heap) -> StepResult {
    let found = finalization_round(heap);
    heap.marking.finalization_rounds += 1;

    if found >= FINALIZATION_PROGRESS_THRESHOLD
        && heap.marking.finalization_rounds < MAX_FINALIZATION_ROUNDS
    {
        // Still discovering work; stay in Marking.
        return StepResult::Processed { bytes: found };
    }

    heap.marking.set_state(MarkingState::Complete);
    heap.marking.full_collection_requested = true;
    StepResult::Complete
}

/// Re-scan roots and advance the ephemeron fixpoint one round. Returns the
/// bytes of newly discovered objects.
pub(crate) fn finalization_round(heap: &mut Heap) -> usize {
    mark_roots(heap);
    let mut found = process_marking_deque(heap, usize::MAX);
    found += mark_ephemeron_values(heap);
    found
}

/// Mark the value of every ephemeron whose key is live; repeat until no
/// value flips. A value is marked only once its key is known live.
pub(crate) fn mark_ephemeron_values(heap: &mut Heap) -> usize {
    let mut found = 0usize;
    loop {
        let mut progressed = false;
        let ephemerons = std::mem::take(&mut heap.collector.ephemerons);
        for &eph in &ephemerons {
            let key_live = eph
                .field(crate::object::EPHEMERON_KEY)
                .as_object()
                .is_some_and(|k| mark::color_of(k) != Color::White);
            if key_live {
                if let Some(value) = eph.field(crate::object::EPHEMERON_VALUE).as_object() {
                    if mark::mark_grey_and_push(&heap.deque, value) {
                        progressed = true;
                    }
                }
            }
        }
        heap.collector.ephemerons = ephemerons;
        found += process_marking_deque(heap, usize::MAX);
        if !progressed {
            break;
        }
    }
    found
}
