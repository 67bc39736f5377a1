//! Bounded marking deque with overflow recovery.
//!
//! The worklist of grey objects is a fixed-capacity ring. When it fills,
//! marking keeps going: objects stay grey in their page bitmaps but are no
//! longer listed, and the overflow flag is raised. Once the ring drains, a
//! full page sweep re-enqueues every grey-but-unlisted object; the flag
//! clears only when none remain. Marking terminates only when the deque is
//! empty **and** the flag is down.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::heap::PagePtr;
use crate::object::ObjRef;
use crate::tracing::internal as trace;

/// Bounded worklist of grey objects.
pub struct MarkingDeque {
    queue: ArrayQueue<ObjRef>,
    overflowed: AtomicBool,
    overflow_events: AtomicUsize,
}

impl MarkingDeque {
    /// Commit a deque with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0 (the worklist could never hold an object,
    /// which the refill protocol cannot recover from).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "marking deque capacity must be nonzero");
        Self {
            queue: ArrayQueue::new(capacity),
            overflowed: AtomicBool::new(false),
            overflow_events: AtomicUsize::new(0),
        }
    }

    /// Push a grey object. On a full ring the object is left unlisted and
    /// the overflow flag raised; existing entries are untouched.
    ///
    /// Returns whether the object was listed.
    pub fn push(&self, obj: ObjRef) -> bool {
        match self.queue.push(obj) {
            Ok(()) => true,
            Err(_) => {
                if !self.overflowed.swap(true, Ordering::AcqRel) {
                    trace::log_deque_overflow();
                }
                self.overflow_events.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop the next listed grey object.
    pub fn pop(&self) -> Option<ObjRef> {
        self.queue.pop()
    }

    /// Whether no objects are listed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Listed object count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether a push was dropped since the last successful refill.
    #[must_use]
    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    /// Times a push was dropped; feeds cycle metrics.
    #[must_use]
    pub fn overflow_count(&self) -> usize {
        self.overflow_events.load(Ordering::Relaxed)
    }

    /// Marking may stop only when nothing is listed and nothing is unlisted.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.is_empty() && !self.overflowed()
    }

    /// Re-enqueue grey-but-unlisted objects by sweeping page bitmaps.
    ///
    /// Lowers the overflow flag first, so a push failing mid-refill raises
    /// it again and a further round runs; the flag ends up cleared only when
    /// every grey object is listed.
    pub fn refill<I: IntoIterator<Item = PagePtr>>(&self, pages: I) {
        self.overflowed.store(false, Ordering::Release);
        'pages: for page in pages {
            let header = page.header();
            let count = header.obj_count as usize;
            let mut full = false;
            header.colors.for_each_grey(count, |index| {
                if !full && !self.push(header.object_at(index)) {
                    full = true;
                }
            });
            if full {
                break 'pages;
            }
        }
    }

    /// Drop all listed entries and lower the flag (cycle abort).
    pub fn reset(&self) {
        while self.queue.pop().is_some() {}
        self.overflowed.store(false, Ordering::Release);
        self.overflow_events.store(0, Ordering::Relaxed);
    }

    /// Rewrite every listed entry through `relocate` after objects moved
    /// (a scavenge can promote objects that are still queued for scanning).
    pub fn update_after_move<F: Fn(ObjRef) -> ObjRef>(&self, relocate: F) {
        let mut entries = Vec::with_capacity(self.len());
        while let Some(obj) = self.queue.pop() {
            entries.push(relocate(obj));
        }
        for obj in entries {
            let _ = self.queue.push(obj);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MarkingDeque;
    use crate::heap::{new_small_page, SpaceId};
    use crate::object::ObjRef;

    fn dummy_obj(addr: usize) -> ObjRef {
        // SAFETY: test-only sentinel addresses; never dereferenced here.
        unsafe { ObjRef::from_addr(addr) }
    }

    #[test]
    fn test_push_pop_fifo() {
        let deque = MarkingDeque::new(8);
        assert!(deque.push(dummy_obj(0x10)));
        assert!(deque.push(dummy_obj(0x20)));
        assert_eq!(deque.pop(), Some(dummy_obj(0x10)));
        assert_eq!(deque.pop(), Some(dummy_obj(0x20)));
        assert_eq!(deque.pop(), None);
        assert!(deque.is_drained());
    }

    #[test]
    fn test_overflow_preserves_existing_entries() {
        let deque = MarkingDeque::new(2);
        assert!(deque.push(dummy_obj(0x10)));
        assert!(deque.push(dummy_obj(0x20)));
        // Ring is full: further pushes are dropped, not corrupting.
        assert!(!deque.push(dummy_obj(0x30)));
        assert!(deque.overflowed());
        assert_eq!(deque.len(), 2);
        assert_eq!(deque.pop(), Some(dummy_obj(0x10)));
        assert_eq!(deque.pop(), Some(dummy_obj(0x20)));
        assert!(deque.is_empty());
        // Still not drained: an unlisted grey object may exist.
        assert!(!deque.is_drained());
    }

    #[test]
    fn test_refill_recovers_unlisted_grey_objects() {
        let page = new_small_page(SpaceId::Old, 64);
        let header = page.header();
        let a = header.free_list_alloc().unwrap() as usize;
        let b = header.free_list_alloc().unwrap() as usize;
        header.colors.mark_grey(a);
        header.colors.mark_grey(b);

        let deque = MarkingDeque::new(1);
        // Simulate overflow: only one of the two greys fit.
        assert!(deque.push(header.object_at(a)));
        assert!(!deque.push(header.object_at(b)));
        assert!(deque.overflowed());

        // Drain, then refill from the page bitmap.
        while deque.pop().is_some() {}
        deque.refill(std::iter::once(page));

        // Both greys are rediscovered (duplicates are benign: the marker
        // skips objects that already turned black).
        assert!(!deque.is_empty());
        let refound = deque.pop().unwrap();
        assert!(refound == header.object_at(a) || refound == header.object_at(b));
    }

    #[test]
    fn test_refill_clears_overflow_when_everything_fits() {
        let page = new_small_page(SpaceId::Old, 64);
        let header = page.header();
        let a = header.free_list_alloc().unwrap() as usize;
        header.colors.mark_grey(a);

        let deque = MarkingDeque::new(4);
        deque.refill(std::iter::once(page));
        assert!(!deque.overflowed());
        assert_eq!(deque.len(), 1);
    }

    #[test]
    fn test_reset_clears_flag_and_entries() {
        let deque = MarkingDeque::new(1);
        deque.push(dummy_obj(0x10));
        deque.push(dummy_obj(0x20));
        assert!(deque.overflowed());
        deque.reset();
        assert!(deque.is_empty());
        assert!(deque.is_drained());
    }
}
