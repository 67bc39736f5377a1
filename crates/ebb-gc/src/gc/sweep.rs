//! Lazy sweeping of non-candidate pages.
//!
//! After marking, every surviving page needs its free list rebuilt from the
//! mark bitmap. That work runs on a small pool of background tasks, one page
//! at a time, guarded by a per-page try-lock: the only contention is a
//! mutator that needs swept memory *now*, which sweeps the page inline
//! instead of waiting. Sweeping can always be forced to completion
//! synchronously.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::heap::{Heap, PagePtr, PAGE_NEEDS_SWEEP};

struct SweepShared {
    pending: Mutex<Vec<PagePtr>>,
    remaining: AtomicUsize,
    results: Sender<usize>,
}

impl SweepShared {
    /// Sweep queued pages until the queue is empty. Shared by background
    /// workers and the synchronous finalizer.
    fn drain(&self) {
        loop {
            let page = { self.pending.lock().pop() };
            let Some(page) = page else { break };
            let header = page.header();
            if header.try_lock_sweep() {
                let reclaimed = if header.has_flag(PAGE_NEEDS_SWEEP) {
                    header.sweep_in_place()
                } else {
                    0 // a mutator already swept it inline
                };
                header.unlock_sweep();
                let _ = self.results.send(reclaimed);
            }
            // On try-lock failure the mutator owns the page and finishes the
            // sweep itself; either way this page is no longer ours.
            self.remaining.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Background sweeping coordinator.
pub struct Sweeper {
    tasks: usize,
    shared: Option<Arc<SweepShared>>,
    results: Option<Receiver<usize>>,
    handles: Vec<JoinHandle<()>>,
    reclaimed_last_cycle: usize,
}

impl Sweeper {
    /// Coordinator with `tasks` background threads (0 = synchronous).
    #[must_use]
    pub const fn new(tasks: usize) -> Self {
        Self {
            tasks,
            shared: None,
            results: None,
            handles: Vec::new(),
            reclaimed_last_cycle: 0,
        }
    }

    /// Whether a sweep is outstanding.
    #[must_use]
    pub const fn is_in_progress(&self) -> bool {
        self.shared.is_some()
    }

    /// Whether all queued pages have been handed off or swept.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.shared
            .as_ref()
            .is_none_or(|s| s.remaining.load(Ordering::Acquire) == 0)
    }

    /// Bytes reclaimed by the most recently finalized sweep.
    #[must_use]
    pub const fn reclaimed_last_cycle(&self) -> usize {
        self.reclaimed_last_cycle
    }

    /// Queue `pages` for sweeping. The collector flags each page
    /// `PAGE_NEEDS_SWEEP` beforehand, so allocation cannot reuse it unswept
    /// and an inline mutator sweep is detectable here. With no task threads
    /// configured the sweep runs to completion on the caller.
    pub fn start(&mut self, pages: Vec<PagePtr>) {
        debug_assert!(!self.is_in_progress(), "previous sweep not finalized");
        if pages.is_empty() {
            return;
        }

        let (tx, rx) = unbounded();
        let shared = Arc::new(SweepShared {
            remaining: AtomicUsize::new(pages.len()),
            pending: Mutex::new(pages),
            results: tx,
        });
        self.results = Some(rx);

        let workers = self.tasks.min(shared.pending.lock().len());
        for _ in 0..workers {
            let shared = Arc::clone(&shared);
            self.handles.push(std::thread::spawn(move || shared.drain()));
        }
        self.shared = Some(shared);

        if self.tasks == 0 {
            self.force_complete();
        }
    }

    /// Finish all outstanding sweeping on the calling thread and collect
    /// the reclaimed-byte total.
    pub fn force_complete(&mut self) -> usize {
        let Some(shared) = self.shared.take() else {
            return 0;
        };
        shared.drain();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        drop(shared); // closes the results channel
        let reclaimed = self
            .results
            .take()
            .map_or(0, |rx| rx.try_iter().sum());
        self.reclaimed_last_cycle = reclaimed;
        reclaimed
    }

    /// Drop all outstanding work (heap teardown).
    pub fn shutdown(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.pending.lock().clear();
            shared.remaining.store(0, Ordering::Release);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        self.results = None;
    }
}

/// Force the outstanding sweep (if any) to completion.
pub fn finalize(heap: &mut Heap) -> usize {
    heap.sweeper.force_complete()
}
