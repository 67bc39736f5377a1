//! Remembered sets: per-page buffers of slots pointing into movable regions.
//!
//! Two logical sets exist. Old→new records plain slot addresses whose target
//! lives in the young space. Old→old records slots targeting evacuation
//! candidates; entries are untyped tagged-word slots or typed `(kind, addr)`
//! pairs for pointers embedded in non-uniform encodings.
//!
//! Buffers are bounded and chain up to a cap. Overflow never corrupts data:
//! the page either degrades to rescan-on-evacuation or leaves the candidate
//! set, per the configured policy.

use std::collections::HashMap;

use crate::config::{OverflowPolicy, MAX_SLOTS_CHAIN_LENGTH, SLOTS_BUFFER_CAPACITY};
use crate::heap::{
    PagePtr, PAGE_EVACUATION_CANDIDATE, PAGE_POPULAR, PAGE_RESCAN_ON_EVACUATION,
};
use crate::object::{SlotAddr, SlotKind};

/// One recorded slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotEntry {
    /// An ordinary tagged-word slot.
    Untyped(usize),
    /// A slot whose encoding needs the kind tag to rewrite.
    Typed(SlotKind, usize),
}

impl SlotEntry {
    /// The recorded slot address.
    #[must_use]
    pub const fn addr(self) -> usize {
        match self {
            Self::Untyped(addr) | Self::Typed(_, addr) => addr,
        }
    }
}

/// Outcome of recording a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The slot was appended.
    Recorded,
    /// The chain was full; the overflow policy was applied to the page.
    Overflowed,
    /// The page already degraded; precise recording is off for it.
    Degraded,
}

/// A bounded append buffer, chaining to the previous buffer.
struct SlotsBuffer {
    entries: Vec<SlotEntry>,
    next: Option<Box<SlotsBuffer>>,
}

impl SlotsBuffer {
    fn new(next: Option<Box<Self>>) -> Box<Self> {
        Box::new(Self {
            entries: Vec::with_capacity(SLOTS_BUFFER_CAPACITY),
            next,
        })
    }
}

/// The chain of buffers for one page.
#[derive(Default)]
struct SlotSet {
    head: Option<Box<SlotsBuffer>>,
    chain_len: usize,
}

impl SlotSet {
    fn push(&mut self, entry: SlotEntry) -> Result<(), ()> {
        let needs_new = self
            .head
            .as_ref()
            .is_none_or(|b| b.entries.len() >= SLOTS_BUFFER_CAPACITY);
        if needs_new {
            if self.chain_len >= MAX_SLOTS_CHAIN_LENGTH {
                return Err(());
            }
            self.head = Some(SlotsBuffer::new(self.head.take()));
            self.chain_len += 1;
        }
        self.head
            .as_mut()
            .expect("chain head exists")
            .entries
            .push(entry);
        Ok(())
    }

    fn for_each<F: FnMut(SlotEntry)>(&self, f: &mut F) {
        let mut buffer = self.head.as_deref();
        while let Some(b) = buffer {
            for &entry in &b.entries {
                f(entry);
            }
            buffer = b.next.as_deref();
        }
    }

    fn retain<F: FnMut(SlotEntry) -> bool>(&mut self, f: &mut F) {
        let mut buffer = self.head.as_deref_mut();
        while let Some(b) = buffer {
            b.entries.retain(|&e| f(e));
            buffer = b.next.as_deref_mut();
        }
    }

    fn len(&self) -> usize {
        let mut n = 0;
        let mut buffer = self.head.as_deref();
        while let Some(b) = buffer {
            n += b.entries.len();
            buffer = b.next.as_deref();
        }
        n
    }
}

/// Both remembered sets, keyed by the recording page's base address.
pub struct RememberedSet {
    policy: OverflowPolicy,
    old_to_new: HashMap<usize, SlotSet>,
    old_to_old: HashMap<usize, SlotSet>,
}

impl RememberedSet {
    /// Empty sets with the given overflow policy.
    #[must_use]
    pub fn new(policy: OverflowPolicy) -> Self {
        Self {
            policy,
            old_to_new: HashMap::new(),
            old_to_old: HashMap::new(),
        }
    }

    /// The configured overflow policy.
    #[must_use]
    pub const fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    fn apply_overflow_policy(policy: OverflowPolicy, page: PagePtr) {
        match policy {
            OverflowPolicy::Degrade => {
                page.header().set_flag(PAGE_RESCAN_ON_EVACUATION);
            }
            OverflowPolicy::DropCandidate => {
                page.header().clear_flag(PAGE_EVACUATION_CANDIDATE);
                page.header().set_flag(PAGE_POPULAR);
            }
        }
    }

    fn record(
        map: &mut HashMap<usize, SlotSet>,
        policy: OverflowPolicy,
        page: PagePtr,
        entry: SlotEntry,
    ) -> RecordOutcome {
        if page.header().has_flag(PAGE_RESCAN_ON_EVACUATION) {
            return RecordOutcome::Degraded;
        }
        let set = map.entry(page.base()).or_default();
        if set.push(entry).is_ok() {
            RecordOutcome::Recorded
        } else {
            Self::apply_overflow_policy(policy, page);
            map.remove(&page.base());
            RecordOutcome::Overflowed
        }
    }

    /// Record a slot on `page` holding a pointer into the young space.
    pub fn record_old_to_new(&mut self, page: PagePtr, slot: SlotAddr) -> RecordOutcome {
        Self::record(
            &mut self.old_to_new,
            self.policy,
            page,
            SlotEntry::Untyped(slot.addr()),
        )
    }

    /// Record a slot on `page` holding a pointer into a candidate page.
    pub fn record_old_to_old(&mut self, page: PagePtr, entry: SlotEntry) -> RecordOutcome {
        Self::record(&mut self.old_to_old, self.policy, page, entry)
    }

    /// Visit every old→new entry.
    pub fn for_each_old_to_new<F: FnMut(SlotEntry)>(&self, mut f: F) {
        for set in self.old_to_new.values() {
            set.for_each(&mut f);
        }
    }

    /// Visit every old→old entry.
    pub fn for_each_old_to_old<F: FnMut(SlotEntry)>(&self, mut f: F) {
        for set in self.old_to_old.values() {
            set.for_each(&mut f);
        }
    }

    /// Drop entries failing the predicate `(recording_page_base, entry)`.
    /// The invalidation pass runs this after marking with "slot lies inside
    /// a live object" as the predicate.
    pub fn retain<F: FnMut(usize, SlotEntry) -> bool>(&mut self, mut f: F) {
        for (&base, set) in &mut self.old_to_new {
            set.retain(&mut |e| f(base, e));
        }
        for (&base, set) in &mut self.old_to_old {
            set.retain(&mut |e| f(base, e));
        }
    }

    /// Drop everything recorded for `page` (it died or was evacuated).
    pub fn remove_page(&mut self, page: PagePtr) {
        self.old_to_new.remove(&page.base());
        self.old_to_old.remove(&page.base());
    }

    /// Drop the old→new set (consumed by a scavenge).
    pub fn clear_old_to_new(&mut self) {
        self.old_to_new.clear();
    }

    /// Drop the old→old set (consumed by fix-up).
    pub fn clear_old_to_old(&mut self) {
        self.old_to_old.clear();
    }

    /// Total old→new entries.
    #[must_use]
    pub fn old_to_new_len(&self) -> usize {
        self.old_to_new.values().map(SlotSet::len).sum()
    }

    /// Total old→old entries.
    #[must_use]
    pub fn old_to_old_len(&self) -> usize {
        self.old_to_old.values().map(SlotSet::len).sum()
    }

    /// Merge entries harvested by an evacuation task.
    pub fn merge_old_to_old(&mut self, batch: Vec<(PagePtr, SlotEntry)>) {
        for (page, entry) in batch {
            let _ = self.record_old_to_old(page, entry);
        }
    }

    /// Merge old→new entries harvested by an evacuation task.
    pub fn merge_old_to_new(&mut self, batch: Vec<(PagePtr, SlotAddr)>) {
        for (page, slot) in batch {
            let _ = self.record_old_to_new(page, slot);
        }
    }

    /// Debug check: every recorded slot must satisfy `valid`.
    ///
    /// # Panics
    ///
    /// Panics (debug builds are the only callers) when a stale slot remains.
    pub fn debug_verify<F: Fn(usize) -> bool>(&self, valid: F) {
        let mut check = |entry: SlotEntry| {
            assert!(
                valid(entry.addr()),
                "remembered slot {:#x} does not lie in a live object",
                entry.addr()
            );
        };
        for set in self.old_to_new.values() {
            set.for_each(&mut check);
        }
        for set in self.old_to_old.values() {
            set.for_each(&mut check);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OverflowPolicy, MAX_SLOTS_CHAIN_LENGTH, SLOTS_BUFFER_CAPACITY};
    use crate::heap::{new_small_page, SpaceId, PAGE_RESCAN_ON_EVACUATION};
    use crate::object::SlotAddr;

    fn slot(addr: usize) -> SlotAddr {
        // SAFETY: test-only sentinel addresses; never dereferenced here.
        unsafe { SlotAddr::from_addr(addr) }
    }

    #[test]
    fn test_record_and_iterate() {
        let page = new_small_page(SpaceId::Old, 64);
        let mut set = RememberedSet::new(OverflowPolicy::Degrade);
        assert_eq!(
            set.record_old_to_new(page, slot(0x1008)),
            RecordOutcome::Recorded
        );
        assert_eq!(
            set.record_old_to_old(page, SlotEntry::Typed(SlotKind::RawAddress, 0x2010)),
            RecordOutcome::Recorded
        );

        let mut new_slots = Vec::new();
        set.for_each_old_to_new(|e| new_slots.push(e.addr()));
        assert_eq!(new_slots, vec![0x1008]);

        let mut old_slots = Vec::new();
        set.for_each_old_to_old(|e| old_slots.push(e));
        assert_eq!(
            old_slots,
            vec![SlotEntry::Typed(SlotKind::RawAddress, 0x2010)]
        );
    }

    #[test]
    fn test_chain_grows_to_cap_then_degrades() {
        let page = new_small_page(SpaceId::Old, 64);
        let mut set = RememberedSet::new(OverflowPolicy::Degrade);
        let capacity = SLOTS_BUFFER_CAPACITY * MAX_SLOTS_CHAIN_LENGTH;
        for i in 0..capacity {
            assert_eq!(
                set.record_old_to_old(page, SlotEntry::Untyped(0x1000 + i * 8)),
                RecordOutcome::Recorded
            );
        }
        assert_eq!(set.old_to_old_len(), capacity);

        // One more entry overflows the chain; the page degrades and its
        // precise entries are dropped in favor of a whole-page rescan.
        assert_eq!(
            set.record_old_to_old(page, SlotEntry::Untyped(0x9000)),
            RecordOutcome::Overflowed
        );
        assert!(page.header().has_flag(PAGE_RESCAN_ON_EVACUATION));
        assert_eq!(set.old_to_old_len(), 0);
        assert_eq!(
            set.record_old_to_old(page, SlotEntry::Untyped(0x9008)),
            RecordOutcome::Degraded
        );
    }

    #[test]
    fn test_drop_candidate_policy_unselects_page() {
        let page = new_small_page(SpaceId::Old, 64);
        page.header().set_flag(crate::heap::PAGE_EVACUATION_CANDIDATE);
        let mut set = RememberedSet::new(OverflowPolicy::DropCandidate);
        let capacity = SLOTS_BUFFER_CAPACITY * MAX_SLOTS_CHAIN_LENGTH;
        for i in 0..capacity {
            set.record_old_to_old(page, SlotEntry::Untyped(0x1000 + i * 8));
        }
        set.record_old_to_old(page, SlotEntry::Untyped(0x9000));
        assert!(!page.header().has_flag(crate::heap::PAGE_EVACUATION_CANDIDATE));
        assert!(page.header().has_flag(crate::heap::PAGE_POPULAR));
    }

    #[test]
    fn test_retain_invalidates_stale_slots() {
        let page = new_small_page(SpaceId::Old, 64);
        let mut set = RememberedSet::new(OverflowPolicy::Degrade);
        set.record_old_to_new(page, slot(0x1000));
        set.record_old_to_new(page, slot(0x2000));
        set.retain(|_, entry| entry.addr() != 0x1000);
        assert_eq!(set.old_to_new_len(), 1);
    }

    #[test]
    fn test_remove_page_drops_both_sets() {
        let page = new_small_page(SpaceId::Old, 64);
        let mut set = RememberedSet::new(OverflowPolicy::Degrade);
        set.record_old_to_new(page, slot(0x1000));
        set.record_old_to_old(page, SlotEntry::Untyped(0x2000));
        set.remove_page(page);
        assert_eq!(set.old_to_new_len(), 0);
        assert_eq!(set.old_to_old_len(), 0);
    }
}
