//! Mark-compact orchestration: the cycle state machine and the public
//! collection entry points.
//!
//! A full cycle runs Idle → Prepare → MarkLive → ClearNonLive →
//! EvacuateAndSweep → Finish → Idle. All live-object discovery completes and
//! is globally visible before any evacuation or sweeping begins; the state
//! machine never overlaps them.

use std::collections::HashSet;
use std::time::Instant;

use crate::gc::evacuate;
use crate::gc::idle::{self, HeapStateSnapshot, IdleAction};
use crate::gc::incremental::{self, StepFlags, StepResult};
use crate::gc::mark::{self, Color};
use crate::gc::remembered::SlotEntry;
use crate::gc::sweep;
use crate::gc::worklist::MarkingDeque;
use crate::heap::{
    page_of, Heap, PagePtr, SpaceId, WeakRetention, PAGE_COMPACTION_ABORTED,
    PAGE_EVACUATION_CANDIDATE, PAGE_NEEDS_SWEEP, PAGE_RESCAN_ON_EVACUATION,
};
use crate::metrics::{CollectionKind, GcMetrics, PhaseTimer};
use crate::object::{
    ObjRef, ObjectKind, SlotAddr, SlotKind, SlotVisitor, TaggedWord, EPHEMERON_KEY,
    EPHEMERON_VALUE, WEAK_CELL_TARGET, WEAK_CELL_TOKEN,
};
use crate::tracing::internal as trace;

/// Why a collection was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcReason {
    /// An allocation could not be satisfied.
    AllocationFailure,
    /// The embedder asked for a collection.
    ExternalRequest,
    /// The embedder signalled memory pressure; compaction uses the
    /// reduce-memory profile and an in-flight incremental cycle is aborted.
    MemoryPressure,
    /// The idle scheduler acted on a context-disposal signal.
    ContextDisposal,
    /// The idle scheduler finished an incremental cycle.
    IdleTask,
    /// Test-driven collection.
    Testing,
}

/// Phases of one mark-compact cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    /// Between cycles.
    Idle,
    /// Sweep completion, abort handling, candidate selection.
    Prepare,
    /// Root marking, transitive closure, ephemerons, weak processing.
    MarkLive,
    /// Severing links from live objects to dead ones.
    ClearNonLive,
    /// Copying, fix-up, and sweeping.
    EvacuateAndSweep,
    /// Cache invalidation and bookkeeping.
    Finish,
}

/// Collector-owned cycle state.
pub struct MarkCompactCollector {
    phase: CyclePhase,
    cycle_id: u64,
    reduce_memory: bool,
    pub(crate) candidates: Vec<PagePtr>,
    pub(crate) ephemerons: Vec<ObjRef>,
    pub(crate) weak_cells: Vec<ObjRef>,
    pub(crate) promotions: Vec<(usize, usize)>,
}

impl MarkCompactCollector {
    /// Fresh collector in `Idle`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            phase: CyclePhase::Idle,
            cycle_id: 0,
            reduce_memory: false,
            candidates: Vec::new(),
            ephemerons: Vec::new(),
            weak_cells: Vec::new(),
            promotions: Vec::new(),
        }
    }

    /// Current cycle phase.
    #[must_use]
    pub const fn phase(&self) -> CyclePhase {
        self.phase
    }

    /// Monotonic id of the current or most recent cycle.
    #[must_use]
    pub const fn cycle_id(&self) -> u64 {
        self.cycle_id
    }

    /// (old, new) address pairs of the most recent promotion batch.
    #[must_use]
    pub fn promotions(&self) -> &[(usize, usize)] {
        &self.promotions
    }
}

impl Default for MarkCompactCollector {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Compaction setup
// ============================================================================

/// Select evacuation candidates for the cycle being started, if none are
/// selected yet. Runs before any marking so candidate-targeting slots get
/// recorded from the first mark on.
pub(crate) fn start_compaction(heap: &mut Heap) {
    if !heap.collector.candidates.is_empty() {
        return;
    }
    let profile = if heap.collector.reduce_memory {
        heap.config.reduce_memory_profile
    } else {
        heap.config.normal_profile
    };
    heap.collector.candidates = evacuate::select_candidates(heap, &profile);
}

/// Explicitly abandon an in-flight incremental cycle: all partial marks,
/// the worklist, and the candidate list are discarded. The old→new set
/// survives; it is generational bookkeeping, not cycle state.
pub fn abort_incremental_marking(heap: &mut Heap) {
    heap.deque.reset();
    heap.marking.reset();
    heap.remembered.clear_old_to_old();
    for page in heap.spaces.all_pages() {
        let header = page.header();
        header.colors.clear_all();
        header.clear_flag(
            PAGE_EVACUATION_CANDIDATE | PAGE_COMPACTION_ABORTED | PAGE_RESCAN_ON_EVACUATION,
        );
    }
    heap.collector.candidates.clear();
    heap.collector.ephemerons.clear();
    heap.collector.weak_cells.clear();
}

// ============================================================================
// Mark phase helpers
// ============================================================================

/// Consult the retain-as callback for weak cells whose target is dying.
/// Retained targets are treated as strongly reachable for this cycle.
fn process_weak_retention(heap: &mut Heap) {
    let Some(mut hook) = heap.hooks.weak_retain.take() else {
        return;
    };
    let cells = std::mem::take(&mut heap.collector.weak_cells);
    for &cell in &cells {
        if let Some(target) = cell.field(WEAK_CELL_TARGET).as_object() {
            if mark::color_of(target) == Color::White && hook(target) == WeakRetention::Retain {
                mark::mark_grey_and_push(&heap.deque, target);
            }
        }
    }
    heap.collector.weak_cells = cells;
    heap.hooks.weak_retain = Some(hook);
    incremental::hurry(heap);
}

/// Finish marking: transitive closure, ephemeron fixpoint, weak retention,
/// and intern-table pruning. Runs with the mutator stopped.
fn mark_live_objects(heap: &mut Heap) {
    if heap.marking.is_stopped() {
        // Non-incremental cycle: the whole mark runs in this pause.
        incremental::mark_roots(heap);
    }
    incremental::hurry(heap);

    // Atomic pause re-scan: roots may have changed since marking started.
    incremental::mark_roots(heap);
    incremental::hurry(heap);

    incremental::mark_ephemeron_values(heap);
    process_weak_retention(heap);
    incremental::mark_ephemeron_values(heap);

    heap.intern.prune(|obj| mark::color_of(obj) != Color::White);

    if cfg!(debug_assertions) {
        verify_marking(heap);
    }
}

// ============================================================================
// Clear phase
// ============================================================================

/// Null out links from live shapes to dead shapes (transition and
/// back-pointer edges are all weak).
fn clear_dead_shape_links(heap: &mut Heap) {
    let pages: Vec<PagePtr> = heap.spaces.all_pages().collect();
    for page in pages {
        let header = page.header();
        for index in 0..header.obj_count as usize {
            if header.colors.color(index) != Color::Black {
                continue;
            }
            let obj = header.object_at(index);
            if obj.kind() != ObjectKind::Shape {
                continue;
            }
            for i in 0..obj.field_count() {
                if let Some(target) = obj.field(i).as_object() {
                    if mark::color_of(target) == Color::White {
                        obj.set_field_unbarriered(i, TaggedWord::NULL);
                    }
                }
            }
        }
    }
}

/// Clear weak cells whose target died, notifying the observer hook rather
/// than retaining the target.
fn clear_dead_weak_cells(heap: &mut Heap) {
    let mut hook = heap.hooks.weak_cleared.take();
    let cells = std::mem::take(&mut heap.collector.weak_cells);
    for &cell in &cells {
        if let Some(target) = cell.field(WEAK_CELL_TARGET).as_object() {
            if mark::color_of(target) == Color::White {
                cell.set_field_unbarriered(WEAK_CELL_TARGET, TaggedWord::NULL);
                if let Some(h) = hook.as_mut() {
                    h(cell.field(WEAK_CELL_TOKEN).immediate());
                }
            }
        }
    }
    heap.collector.weak_cells = cells;
    heap.hooks.weak_cleared = hook;
}

/// Tell the embedder about every object that left the nursery, so external
/// resources keyed by address can follow their owner.
fn notify_promotions(heap: &mut Heap, promotions: &[(usize, usize)]) {
    if let Some(mut hook) = heap.hooks.promoted.take() {
        for &(old, new) in promotions {
            // SAFETY: promotion records always carry the copy's address.
            hook(old, unsafe { ObjRef::from_addr(new) });
        }
        heap.hooks.promoted = Some(hook);
    }
}

/// Null the fields of ephemerons whose key died.
fn clear_dead_ephemerons(heap: &mut Heap) {
    let ephemerons = std::mem::take(&mut heap.collector.ephemerons);
    for &eph in &ephemerons {
        let key_dead = eph
            .field(EPHEMERON_KEY)
            .as_object()
            .is_none_or(|k| mark::color_of(k) == Color::White);
        if key_dead {
            eph.set_field_unbarriered(EPHEMERON_KEY, TaggedWord::NULL);
            eph.set_field_unbarriered(EPHEMERON_VALUE, TaggedWord::NULL);
        }
    }
    heap.collector.ephemerons = ephemerons;
}

// ============================================================================
// Full collection
// ============================================================================

/// Run a complete mark-compact cycle.
///
/// # Panics
///
/// Panics when a nursery page cannot be promoted because no space is left
/// anywhere; that exhaustion is not a recoverable condition.
#[allow(clippy::too_many_lines)]
pub fn collect_garbage(heap: &mut Heap, reason: GcReason) -> GcMetrics {
    let cycle_start = Instant::now();
    let mut timer = PhaseTimer::new();
    heap.collector.cycle_id += 1;
    let _span = trace::cycle_span("mark_compact", heap.collector.cycle_id);

    let was_incremental = !heap.marking.is_stopped();
    let size_before = heap.size_of_objects();
    heap.collector.reduce_memory = reason == GcReason::MemoryPressure;

    // ---- Prepare ----
    heap.collector.phase = CyclePhase::Prepare;
    timer.start();
    sweep::finalize(heap);
    if reason == GcReason::MemoryPressure && !heap.marking.is_stopped() {
        // The profile changed under the cycle; restart non-incrementally.
        abort_incremental_marking(heap);
    }
    start_compaction(heap);
    let young_pages: Vec<PagePtr> = heap.spaces.young.pages().collect();
    for page in &young_pages {
        page.header().set_flag(PAGE_EVACUATION_CANDIDATE);
    }
    timer.end_prepare();

    // ---- MarkLiveObjects ----
    heap.collector.phase = CyclePhase::MarkLive;
    timer.start();
    mark_live_objects(heap);
    timer.end_mark();

    // ---- ClearNonLiveReferences ----
    heap.collector.phase = CyclePhase::ClearNonLive;
    timer.start();
    clear_dead_shape_links(heap);
    clear_dead_weak_cells(heap);
    clear_dead_ephemerons(heap);
    timer.end_clear();

    // ---- Evacuate + fix-up ----
    heap.collector.phase = CyclePhase::EvacuateAndSweep;
    timer.start();
    evacuate::invalidate_stale_slots(heap);
    if cfg!(debug_assertions) {
        // Every surviving entry must be an exact interior slot of a live
        // object; anything else is a collector defect.
        heap.remembered
            .debug_verify(evacuate::slot_lies_in_live_object);
    }

    let mut evacuating: Vec<PagePtr> = heap.collector.candidates.clone();
    evacuating.extend(young_pages.iter().copied());
    let evacuate_start = Instant::now();
    let outcome = evacuate::evacuate_pages(
        heap,
        &evacuating,
        evacuate::EvacuationMode::FullCycle,
        |page, index| page.header().colors.color(index) == Color::Black,
    );
    // Old-space pages recover from an abort by being swept in place; a
    // young page cannot (its objects must leave), so this is terminal.
    assert!(
        outcome
            .aborted
            .iter()
            .all(|p| p.header().space() != SpaceId::Young),
        "promotion during evacuation found no space anywhere"
    );
    heap.speeds
        .compaction
        .record(outcome.evacuated_bytes, evacuate_start.elapsed());

    let slots_fixed = evacuate::fix_up_pointers(heap);
    // Entries are consumed by fix-up; the next cycle records fresh ones.
    heap.remembered.clear_old_to_old();
    heap.remembered.clear_old_to_new();
    timer.end_evacuate();

    // ---- Release + sweep ----
    timer.start();
    let (released_young, released_old): (Vec<PagePtr>, Vec<PagePtr>) = outcome
        .released
        .iter()
        .copied()
        .partition(|p| p.header().space() == SpaceId::Young);
    heap.spaces.young.release_pages(&released_young);
    heap.spaces.old.release_pages(&released_old);
    heap.spaces.large.sweep();

    let sweep_pages: Vec<PagePtr> = heap.spaces.old.pages().collect();
    for page in &sweep_pages {
        let header = page.header();
        header.clear_flag(
            PAGE_EVACUATION_CANDIDATE | PAGE_COMPACTION_ABORTED | PAGE_RESCAN_ON_EVACUATION,
        );
        header.set_flag(PAGE_NEEDS_SWEEP);
    }
    heap.sweeper.start(sweep_pages);
    timer.end_sweep();

    // ---- Finish ----
    heap.collector.phase = CyclePhase::Finish;
    let deque_overflows = heap.deque.overflow_count();
    heap.deque.reset();
    heap.collector.candidates.clear();
    heap.collector.ephemerons.clear();
    heap.collector.weak_cells.clear();
    notify_promotions(heap, &outcome.promotions);
    heap.collector.promotions = outcome.promotions;
    heap.intern.drop_caches();
    heap.marking.reset();
    heap.contexts_disposed = 0;
    heap.first_disposal = None;

    let size_after = heap.size_of_objects();
    let metrics = GcMetrics {
        duration: cycle_start.elapsed(),
        kind: if was_incremental {
            CollectionKind::IncrementalFull
        } else {
            CollectionKind::Full
        },
        bytes_reclaimed: size_before.saturating_sub(size_after),
        bytes_surviving: size_after,
        bytes_evacuated: outcome.evacuated_bytes,
        candidates_selected: evacuating.len(),
        pages_evacuated: released_young.len() + released_old.len(),
        pages_aborted: outcome.aborted.len(),
        slots_fixed,
        deque_overflows,
        prepare_duration: timer.prepare,
        mark_duration: timer.mark,
        clear_duration: timer.clear,
        evacuate_duration: timer.evacuate,
        sweep_duration: timer.sweep,
    };
    heap.speeds
        .mark_compact
        .record(size_before, cycle_start.elapsed());
    heap.history.push(metrics);

    if let Some(mut hook) = heap.hooks.cycle_finished.take() {
        hook(&metrics);
        heap.hooks.cycle_finished = Some(hook);
    }
    heap.collector.phase = CyclePhase::Idle;
    metrics
}

// ============================================================================
// Scavenge
// ============================================================================

/// Collects young objects reachable from roots and the old→new set.
struct YoungReachability<'a> {
    live: &'a mut HashSet<usize>,
    worklist: &'a mut Vec<ObjRef>,
}

impl YoungReachability<'_> {
    fn consider(&mut self, obj: ObjRef) {
        if page_of(obj).header().space() == SpaceId::Young && self.live.insert(obj.addr()) {
            self.worklist.push(obj);
        }
    }
}

impl SlotVisitor for YoungReachability<'_> {
    fn visit_slot(&mut self, _slot: SlotAddr, value: ObjRef) {
        self.consider(value);
    }
}

/// Compute the set of live young object addresses. Scavenge liveness keeps
/// its own set so an in-flight major marking's colors are untouched; while
/// major marking is active, every non-white young object is kept alive too
/// (it may only be reachable from the marking worklist).
fn young_live_set(heap: &Heap) -> HashSet<usize> {
    let mut live = HashSet::new();
    let mut worklist = Vec::new();
    {
        let mut reach = YoungReachability {
            live: &mut live,
            worklist: &mut worklist,
        };
        for obj in heap.roots.iter() {
            reach.consider(obj);
        }
        heap.remembered.for_each_old_to_new(|entry| {
            // SAFETY: old→new slots are recorded inside live pages and none
            // has been released since.
            let slot = unsafe { SlotAddr::from_addr(entry.addr()) };
            if let Some(target) = slot.read().as_object() {
                reach.consider(target);
            }
        });
        if heap.marking.is_active() {
            for page in heap.spaces.young.pages() {
                let header = page.header();
                for index in 0..header.obj_count as usize {
                    if header.colors.color(index) != Color::White {
                        reach.consider(header.object_at(index));
                    }
                }
            }
        }
    }
    while let Some(obj) = worklist.pop() {
        let mut reach = YoungReachability {
            live: &mut live,
            worklist: &mut worklist,
        };
        // Weak edges are followed too: a minor cycle never clears weak
        // references, it only moves their targets.
        heap.scan_table.scan_all_pointers(obj, &mut reach);
    }
    live
}

/// Evacuate the entire young space, promoting live objects into old space.
/// Returns promoted bytes.
///
/// # Panics
///
/// Panics when promotion fails with no space anywhere; this exhaustion is
/// not a recoverable condition.
pub fn scavenge(heap: &mut Heap) -> usize {
    let start = Instant::now();
    let young_pages: Vec<PagePtr> = heap.spaces.young.pages().collect();
    if young_pages.is_empty() {
        return 0;
    }
    heap.collector.cycle_id += 1;
    let _span = trace::cycle_span("scavenge", heap.collector.cycle_id);

    for page in &young_pages {
        page.header().set_flag(PAGE_EVACUATION_CANDIDATE);
    }
    let live = young_live_set(heap);
    let mode = if heap.marking.is_active() {
        evacuate::EvacuationMode::ScavengeDuringMarking
    } else {
        evacuate::EvacuationMode::Scavenge
    };
    let outcome = evacuate::evacuate_pages(heap, &young_pages, mode, move |page, index| {
        live.contains(&page.header().slot_base(index))
    });
    assert!(
        outcome.aborted.is_empty(),
        "promotion during scavenge found no space anywhere"
    );

    let slots_fixed = evacuate::fix_up_pointers(heap);
    for page in &outcome.released {
        heap.remembered.remove_page(*page);
    }
    heap.remembered.clear_old_to_new();
    heap.spaces.young.release_pages(&outcome.released);

    heap.speeds
        .scavenge
        .record(outcome.promoted_bytes, start.elapsed());
    let promoted = outcome.promoted_bytes;
    notify_promotions(heap, &outcome.promotions);
    heap.collector.promotions = outcome.promotions;

    let metrics = GcMetrics {
        duration: start.elapsed(),
        kind: CollectionKind::Scavenge,
        bytes_evacuated: outcome.evacuated_bytes,
        bytes_surviving: heap.size_of_objects(),
        slots_fixed,
        ..GcMetrics::new()
    };
    heap.history.push(metrics);
    promoted
}

// ============================================================================
// Idle notification
// ============================================================================

/// Assemble the pure-data snapshot the idle scheduler consumes.
pub(crate) fn state_snapshot(heap: &Heap) -> HeapStateSnapshot {
    HeapStateSnapshot {
        contexts_disposed: heap.contexts_disposed,
        contexts_disposal_rate_ms: heap.context_disposal_rate_ms(),
        incremental_marking_stopped: heap.marking.is_stopped(),
        can_start_incremental_marking: heap.config.incremental.enabled,
        sweeping_in_progress: heap.sweeper.is_in_progress(),
        sweeping_completed: heap.sweeper.is_completed(),
        incremental_marking_speed: heap.speeds.incremental_marking.bytes_per_ms(),
        scavenge_speed: heap.speeds.scavenge.bytes_per_ms(),
        allocation_throughput: heap.speeds.allocation.bytes_per_ms(),
        new_space_size: heap.spaces.young.allocated_bytes(),
        new_space_capacity: heap.spaces.young.capacity_bytes(),
        size_of_objects: heap.size_of_objects(),
        idle_rounds_without_progress: heap.idle_rounds_without_progress,
    }
}

/// Execute the scheduler's decision for a donated idle budget.
pub fn idle_notification(heap: &mut Heap, idle_ms: u64) -> IdleAction {
    let snapshot = state_snapshot(heap);
    let action = idle::compute(idle_ms, &snapshot);
    trace::log_idle_decision(idle_ms, action.name());

    let progressed = match action {
        IdleAction::Done | IdleAction::NoAction => false,
        IdleAction::IncrementalStep { bytes } => {
            if heap.marking.is_stopped() {
                incremental::start(heap);
            }
            let result = incremental::advance(heap, bytes);
            if result == StepResult::Complete && heap.marking.full_collection_requested() {
                collect_garbage(heap, GcReason::IdleTask);
            }
            true
        }
        IdleAction::Scavenge => {
            scavenge(heap);
            true
        }
        IdleAction::FullCollection => {
            collect_garbage(heap, GcReason::ContextDisposal);
            true
        }
        IdleAction::FinalizeSweeping => {
            sweep::finalize(heap);
            true
        }
    };
    if progressed {
        heap.idle_rounds_without_progress = 0;
    } else {
        heap.idle_rounds_without_progress += 1;
    }
    action
}

// ============================================================================
// Debug verification
// ============================================================================

/// Full-heap marking verifier, debug builds only: no cell decodes to
/// `Impossible`, and no black object strongly references a white one.
pub(crate) fn verify_marking(heap: &Heap) {
    struct CheckWhite<'a> {
        host: ObjRef,
        deque: &'a MarkingDeque,
    }
    impl SlotVisitor for CheckWhite<'_> {
        fn visit_slot(&mut self, _slot: SlotAddr, value: ObjRef) {
            // A white child of a black host is legal only while grey
            // objects remain (the child may be queued behind them).
            if mark::color_of(value) == Color::White {
                assert!(
                    !self.deque.is_drained(),
                    "black object {:#x} references white object {:#x} after drain",
                    self.host.addr(),
                    value.addr()
                );
            }
        }
    }

    for page in heap.spaces.all_pages() {
        let header = page.header();
        for index in 0..header.obj_count as usize {
            let color = header.colors.color(index);
            assert!(
                color != Color::Impossible,
                "impossible color at {:#x}[{index}]",
                page.base()
            );
            if color == Color::Black {
                let obj = header.object_at(index);
                let mut check = CheckWhite {
                    host: obj,
                    deque: &heap.deque,
                };
                heap.scan_table.scan_strong(obj, &mut check);
            }
        }
    }
}

// ============================================================================
// Public heap API
// ============================================================================

impl Heap {
    /// Store `value` into `host.field[slot_index]` through the write
    /// barrier. This is the only store mutators may use.
    pub fn write_barrier(&mut self, host: ObjRef, slot_index: usize, value: TaggedWord) {
        crate::gc::barrier::write_barrier(self, host, slot_index, value);
    }

    /// Allocation-checkpoint entry: advance incremental marking against the
    /// bytes allocated since the last call.
    pub fn step(&mut self, allocated: usize, flags: StepFlags) -> StepResult {
        let now = Instant::now();
        if let Some(last) = self.last_step_time {
            self.speeds.allocation.record(allocated, now - last);
        }
        self.last_step_time = Some(now);
        incremental::step(self, allocated, flags)
    }

    /// Start incremental marking if it is enabled and stopped.
    pub fn start_incremental_marking(&mut self, _reason: GcReason) -> bool {
        incremental::start(self)
    }

    /// Run a full mark-compact collection now.
    pub fn collect_garbage(&mut self, reason: GcReason) -> GcMetrics {
        collect_garbage(self, reason)
    }

    /// Abandon an in-flight incremental cycle, discarding partial marks and
    /// the candidate list.
    pub fn abort_incremental_marking(&mut self) {
        abort_incremental_marking(self);
    }

    /// Promote all live young objects into old space.
    pub fn scavenge(&mut self) -> usize {
        scavenge(self)
    }

    /// Donate `idle_ms` of idle time; executes the scheduler's decision and
    /// returns it.
    pub fn idle_notification(&mut self, idle_ms: u64) -> IdleAction {
        idle_notification(self, idle_ms)
    }

    /// The pure-data snapshot fed to the idle scheduler.
    #[must_use]
    pub fn state_snapshot(&self) -> HeapStateSnapshot {
        state_snapshot(self)
    }

    /// Record a typed (raw-address) slot, e.g. an address embedded in a
    /// `Mixed` payload, so fix-up rewrites it when its target moves.
    pub fn record_typed_slot(&mut self, host: ObjRef, word_index: usize) {
        let slot = host.slot(word_index);
        self.remembered.record_old_to_old(
            page_of(host),
            SlotEntry::Typed(SlotKind::RawAddress, slot.addr()),
        );
    }
}
