//! Evacuation: candidate selection, live-object copying, and pointer fix-up.
//!
//! Candidate pages are chosen pre-cycle so marking and the write barrier can
//! record every slot that points into them. Evacuation copies each live
//! object to a fresh allocation, leaves a forwarding word at the old site,
//! and re-records the copy's outgoing pointers. Fix-up then rewrites every
//! recorded slot whose target moved. A page whose evacuation hits an
//! allocation failure is aborted and swept in place; it never loses its
//! fix-up path.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::config::{CompactionProfile, INITIAL_COMPACTION_SPEED};
use crate::gc::mark::{self, Color};
use crate::gc::remembered::SlotEntry;
use crate::heap::{
    new_small_page, page_of, page_of_addr, Heap, PagePtr, SpaceId, PAGE_COMPACTION_ABORTED,
    PAGE_EVACUATION_CANDIDATE, PAGE_POPULAR, PAGE_RESCAN_ON_EVACUATION,
};
use crate::object::{ObjRef, ScanTable, SlotAddr, SlotKind, SlotVisitor, TaggedWord};
use crate::tracing::internal as trace;

// ============================================================================
// Candidate selection
// ============================================================================

/// Select old-space evacuation candidates for this cycle.
///
/// Pages are ranked by free bytes descending and selected greedily while
/// they stay above the profile's fragmentation threshold and the cumulative
/// live-byte budget holds. Selection is skipped entirely when the estimated
/// net page reduction is below the profile floor, avoiding a
/// compact-then-expand oscillation.
pub fn select_candidates(heap: &mut Heap, profile: &CompactionProfile) -> Vec<PagePtr> {
    let mut ranked: Vec<PagePtr> = heap
        .spaces
        .old
        .pages()
        .filter(|p| {
            let header = p.header();
            !header.has_flag(PAGE_POPULAR) && header.capacity_bytes() > 0
        })
        .collect();
    ranked.sort_by(|a, b| b.header().free_bytes().cmp(&a.header().free_bytes()));

    let mut selected = Vec::new();
    let mut live_budget_used = 0usize;
    for page in ranked {
        let header = page.header();
        #[allow(clippy::cast_precision_loss)]
        let free_fraction = header.free_bytes() as f64 / header.capacity_bytes() as f64;
        if free_fraction < profile.free_fraction_threshold {
            break; // ranked descending: nothing below qualifies either
        }
        if live_budget_used + header.live_bytes() > profile.live_byte_budget {
            continue;
        }
        live_budget_used += header.live_bytes();
        selected.push(page);
    }

    // Net reduction check: copying must actually give whole pages back.
    // Copies consume fresh pages only for bytes that do not fit the free
    // space remaining on unselected pages.
    let free_elsewhere: usize = heap
        .spaces
        .old
        .pages()
        .filter(|p| !selected.contains(p))
        .map(|p| p.header().free_bytes())
        .sum();
    let page_payload = selected
        .first()
        .map_or(crate::heap::PAGE_SIZE, |p| p.header().capacity_bytes())
        .max(1);
    let pages_consumed = live_budget_used
        .saturating_sub(free_elsewhere)
        .div_ceil(page_payload);
    if selected.len().saturating_sub(pages_consumed) < profile.min_page_reduction {
        return Vec::new();
    }

    for page in &selected {
        page.header().set_flag(PAGE_EVACUATION_CANDIDATE);
    }
    trace::log_candidates(selected.len(), live_budget_used);
    selected
}

// ============================================================================
// Evacuation
// ============================================================================

/// Color discipline for freshly made copies.
///
/// Full-cycle copies are blackened: the post-cycle sweep of their pages
/// reads the bitmap and must keep them. A scavenge outside any major cycle
/// leaves copies white (their pages are not swept); a scavenge *during*
/// major marking carries each object's accumulated color over instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvacuationMode {
    /// Part of a full mark-compact cycle.
    FullCycle,
    /// Young-generation collection, no major marking active.
    Scavenge,
    /// Young-generation collection while major marking is active.
    ScavengeDuringMarking,
}

/// Aggregated result of evacuating a set of pages.
#[derive(Default)]
pub struct EvacuationOutcome {
    /// Bytes copied out of candidates.
    pub evacuated_bytes: usize,
    /// Bytes promoted out of the young space (subset of `evacuated_bytes`).
    pub promoted_bytes: usize,
    /// Fully evacuated pages, ready for release after fix-up.
    pub released: Vec<PagePtr>,
    /// Pages whose evacuation aborted; they will be swept in place.
    pub aborted: Vec<PagePtr>,
    /// (old address, new address) pairs for every promoted object.
    pub promotions: Vec<(usize, usize)>,
}

/// Shared source of fresh target pages for evacuation tasks.
struct PageSource {
    budget: Mutex<usize>,
    created: Mutex<Vec<PagePtr>>,
}

impl PageSource {
    fn request(&self, block_size: usize) -> Option<PagePtr> {
        {
            let mut budget = self.budget.lock();
            if *budget == 0 {
                return None;
            }
            *budget -= 1;
        }
        let page = new_small_page(SpaceId::Old, block_size);
        self.created.lock().push(page);
        Some(page)
    }
}

/// A task's private target pages, one per block size in flight.
struct LocalAllocator<'a> {
    source: &'a PageSource,
    current: HashMap<usize, PagePtr>,
}

impl<'a> LocalAllocator<'a> {
    fn new(source: &'a PageSource) -> Self {
        Self {
            source,
            current: HashMap::new(),
        }
    }

    fn allocate(&mut self, block_size: usize) -> Option<ObjRef> {
        if let Some(page) = self.current.get(&block_size) {
            if let Some(index) = page.header().free_list_alloc() {
                return Some(page.header().object_at(index as usize));
            }
        }
        let page = self.source.request(block_size)?;
        self.current.insert(block_size, page);
        let index = page.header().free_list_alloc()?;
        Some(page.header().object_at(index as usize))
    }
}

/// Records the outgoing pointers of a freshly made copy.
struct RecordVisitor<'a> {
    host_page: PagePtr,
    old_to_new: &'a mut Vec<(PagePtr, SlotAddr)>,
    old_to_old: &'a mut Vec<(PagePtr, SlotEntry)>,
}

impl SlotVisitor for RecordVisitor<'_> {
    fn visit_slot(&mut self, slot: SlotAddr, value: ObjRef) {
        let target_page = page_of(value);
        if target_page.header().space() == SpaceId::Young {
            self.old_to_new.push((self.host_page, slot));
        } else if target_page.header().has_flag(PAGE_EVACUATION_CANDIDATE) {
            self.old_to_old
                .push((self.host_page, SlotEntry::Untyped(slot.addr())));
        }
    }
}

/// Per-task evacuation results, merged back under the heap's lock.
#[derive(Default)]
struct TaskResult {
    evacuated_bytes: usize,
    promoted_bytes: usize,
    released: Vec<PagePtr>,
    aborted: Vec<PagePtr>,
    promotions: Vec<(usize, usize)>,
    old_to_new: Vec<(PagePtr, SlotAddr)>,
    old_to_old: Vec<(PagePtr, SlotEntry)>,
}

/// Copy the live objects of one page. On allocation failure the page is
/// aborted: already-copied objects keep their forwarding words but their
/// old slots are whitened so the in-place sweep reclaims them; still-live
/// objects stay black and stay put.
fn evacuate_page<L>(
    page: PagePtr,
    live: &L,
    mode: EvacuationMode,
    scan_table: &ScanTable,
    alloc: &mut LocalAllocator<'_>,
    out: &mut TaskResult,
) where
    L: Fn(PagePtr, usize) -> bool,
{
    let header = page.header();
    let promote = header.space() == SpaceId::Young;
    let block_size = header.block_size as usize;
    let mut copied: Vec<usize> = Vec::new();

    for index in 0..header.obj_count as usize {
        if !live(page, index) {
            continue;
        }
        let obj = header.object_at(index);
        let Some(copy) = alloc.allocate(block_size) else {
            // Abort this page: un-mark what we already copied and leave the
            // rest in place for the sweeper.
            for &done in &copied {
                header.colors.set_color(done, Color::White);
            }
            header.set_flag(PAGE_COMPACTION_ABORTED);
            trace::log_evacuation_abort(page.base(), copied.len());
            out.aborted.push(page);
            return;
        };

        let size = obj.size();
        // SAFETY: source and destination are distinct live slots of at
        // least `size` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(obj.addr() as *const u8, copy.addr() as *mut u8, size);
        }
        copy.clear_forwarding();
        obj.set_forwarding(copy);

        match mode {
            EvacuationMode::FullCycle => {
                // Stays black until the post-cycle sweep whitens its page.
                mark::blacken(copy);
            }
            EvacuationMode::ScavengeDuringMarking => {
                // Keep the tri-color state the major cycle accumulated.
                mark::transfer_color(obj, copy);
            }
            EvacuationMode::Scavenge => {}
        }
        if promote {
            out.promotions.push((obj.addr(), copy.addr()));
            out.promoted_bytes += size;
        }

        let mut visitor = RecordVisitor {
            host_page: page_of(copy),
            old_to_new: &mut out.old_to_new,
            old_to_old: &mut out.old_to_old,
        };
        scan_table.scan_all_pointers(copy, &mut visitor);

        out.evacuated_bytes += size;
        copied.push(index);
    }

    out.released.push(page);
}

/// Size the task pool from measured compaction throughput, core count,
/// candidate count, and the configured hard cap.
fn evacuation_task_count(heap: &Heap, candidates: usize, live_bytes: usize) -> usize {
    if candidates == 0 {
        return 0;
    }
    let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    let speed = {
        let measured = heap.speeds.compaction.bytes_per_ms();
        if measured == 0 {
            INITIAL_COMPACTION_SPEED
        } else {
            measured
        }
    };
    // One task per ~millisecond of estimated copy work.
    let wanted = (live_bytes / speed).max(1);
    wanted
        .min(candidates)
        .min(cores.saturating_sub(1).max(1))
        .min(heap.config.max_evacuation_tasks)
}

/// Evacuate `pages`, partitioned across a bounded set of tasks. Fresh target
/// pages and recorded slots are merged back into the heap under a lock.
pub fn evacuate_pages<L>(
    heap: &mut Heap,
    pages: &[PagePtr],
    mode: EvacuationMode,
    live: L,
) -> EvacuationOutcome
where
    L: Fn(PagePtr, usize) -> bool + Sync,
{
    let live_bytes: usize = pages.iter().map(|p| p.header().live_bytes()).sum();
    let tasks = evacuation_task_count(heap, pages.len(), live_bytes);

    let source = PageSource {
        budget: Mutex::new(
            heap.config
                .max_pages_per_space
                .saturating_sub(heap.spaces.old.page_count()),
        ),
        created: Mutex::new(Vec::new()),
    };
    let merged: Mutex<Vec<TaskResult>> = Mutex::new(Vec::new());
    let scan_table = &heap.scan_table;

    if tasks <= 1 {
        let mut alloc = LocalAllocator::new(&source);
        let mut result = TaskResult::default();
        for &page in pages {
            evacuate_page(page, &live, mode, scan_table, &mut alloc, &mut result);
        }
        merged.lock().push(result);
    } else {
        let partitions: Vec<Vec<PagePtr>> = {
            let mut parts = vec![Vec::new(); tasks];
            for (i, &page) in pages.iter().enumerate() {
                parts[i % tasks].push(page);
            }
            parts
        };
        std::thread::scope(|scope| {
            for part in partitions {
                let source = &source;
                let merged = &merged;
                let live = &live;
                scope.spawn(move || {
                    let mut alloc = LocalAllocator::new(source);
                    let mut result = TaskResult::default();
                    for page in part {
                        evacuate_page(page, live, mode, scan_table, &mut alloc, &mut result);
                    }
                    merged.lock().push(result);
                });
            }
        });
    }

    // Merge thread-local results.
    let mut outcome = EvacuationOutcome::default();
    for result in merged.into_inner() {
        outcome.evacuated_bytes += result.evacuated_bytes;
        outcome.promoted_bytes += result.promoted_bytes;
        outcome.released.extend(result.released);
        outcome.aborted.extend(result.aborted);
        outcome.promotions.extend(result.promotions);
        heap.remembered.merge_old_to_new(result.old_to_new);
        heap.remembered.merge_old_to_old(result.old_to_old);
    }
    for page in source.created.into_inner() {
        heap.spaces.old.adopt_page(page);
    }
    heap.marking.note_promoted(outcome.promoted_bytes);
    outcome
}

// ============================================================================
// Invalidation and fix-up
// ============================================================================

pub(crate) fn slot_lies_in_live_object(addr: usize) -> bool {
    // SAFETY: recorded slots were interior to live pages when recorded, and
    // invalidation runs before any page is released.
    let page = unsafe { page_of_addr(addr) };
    let header = page.header();
    let payload = page.base() + crate::heap::PageHeader::header_size(header.block_size as usize);
    if addr < payload {
        return false;
    }
    let index = if header.is_large() {
        0
    } else {
        (addr - payload) / (header.block_size as usize).max(1)
    };
    if index >= header.obj_count as usize {
        return false;
    }
    header.colors.color(index) == Color::Black
}

/// Drop remembered entries that can no longer be trusted: slots on pages
/// being vacated (their hosts re-recorded themselves when copied) and slots
/// that no longer lie inside a live object.
pub fn invalidate_stale_slots(heap: &mut Heap) {
    heap.remembered.retain(|_, entry| {
        // SAFETY: entries are only recorded for slots inside live pages and
        // no page has been released yet this cycle.
        let slot_page = unsafe { page_of_addr(entry.addr()) };
        let header = slot_page.header();
        if header.has_flag(PAGE_EVACUATION_CANDIDATE) || header.space() == SpaceId::Young {
            return false;
        }
        slot_lies_in_live_object(entry.addr())
    });
}

fn relocate(obj: ObjRef) -> ObjRef {
    obj.forwarded().unwrap_or(obj)
}

fn fix_slot(entry: SlotEntry) -> bool {
    match entry {
        SlotEntry::Untyped(addr) | SlotEntry::Typed(SlotKind::Tagged, addr) => {
            // SAFETY: invalidation kept only slots inside live objects.
            let slot = unsafe { SlotAddr::from_addr(addr) };
            let word = slot.read();
            if let Some(target) = word.as_object() {
                if let Some(moved) = target.forwarded() {
                    slot.write(TaggedWord::from_object(moved));
                    return true;
                }
            }
            false
        }
        SlotEntry::Typed(SlotKind::RawAddress, addr) => {
            // SAFETY: as above; the slot holds a raw object address.
            let slot = addr as *mut usize;
            let raw = unsafe { slot.read() };
            if raw == 0 {
                return false;
            }
            // SAFETY: typed raw entries always record object addresses.
            let target = unsafe { ObjRef::from_addr(raw) };
            if let Some(moved) = target.forwarded() {
                // SAFETY: see above.
                unsafe { slot.write(moved.addr()) };
                return true;
            }
            false
        }
    }
}

/// Rewrite every recorded slot, root, and degraded page after evacuation.
/// Returns the number of slots rewritten.
pub fn fix_up_pointers(heap: &mut Heap) -> usize {
    let mut fixed = 0usize;

    heap.remembered.for_each_old_to_new(|entry| {
        if fix_slot(entry) {
            fixed += 1;
        }
    });
    heap.remembered.for_each_old_to_old(|entry| {
        if fix_slot(entry) {
            fixed += 1;
        }
    });

    // Degraded pages lost slot precision, and aborted pages had their
    // precise entries invalidated wholesale: rescan every live object,
    // dispatching through the scan table so raw payload words are skipped.
    struct RescanVisitor<'a> {
        fixed: &'a mut usize,
    }
    impl SlotVisitor for RescanVisitor<'_> {
        fn visit_slot(&mut self, slot: SlotAddr, value: ObjRef) {
            if let Some(moved) = value.forwarded() {
                slot.write(TaggedWord::from_object(moved));
                *self.fixed += 1;
            }
        }
    }
    let rescan: Vec<PagePtr> = heap
        .spaces
        .old
        .pages()
        .filter(|p| {
            let header = p.header();
            header.has_flag(PAGE_RESCAN_ON_EVACUATION) || header.has_flag(PAGE_COMPACTION_ABORTED)
        })
        .collect();
    for page in rescan {
        let header = page.header();
        for index in 0..header.obj_count as usize {
            if header.colors.color(index) != Color::Black {
                continue;
            }
            let mut visitor = RescanVisitor { fixed: &mut fixed };
            heap.scan_table
                .scan_all_pointers(header.object_at(index), &mut visitor);
        }
    }

    // Roots.
    for word in heap.roots.slots_mut() {
        if let Some(obj) = word.as_object() {
            let moved = relocate(obj);
            if moved != obj {
                *word = TaggedWord::from_object(moved);
                fixed += 1;
            }
        }
    }

    // Intern table addresses.
    heap.intern.fix_up(relocate);

    // Collector worklists hold direct references too.
    heap.deque.update_after_move(relocate);
    for obj in &mut heap.collector.ephemerons {
        *obj = relocate(*obj);
    }
    for obj in &mut heap.collector.weak_cells {
        *obj = relocate(*obj);
    }

    fixed
}
