//! An incremental, idle-time-scheduled mark-compact garbage collector.
//!
//! `ebb-gc` manages a paged heap with tri-color marking interleaved with
//! mutator execution, compaction by evacuating live objects out of
//! fragmented pages, and pointer fix-up for every reference into a moved
//! region.
//!
//! # Architecture
//!
//! - **Tri-color marking**: per-page bitmaps classify objects White, Grey or
//!   Black. A write barrier keeps a Black host from hiding a White value.
//! - **Incremental marking**: the mutator calls [`Heap::step`] at allocation
//!   checkpoints; each step drains a bounded byte budget from a fixed-size
//!   marking deque with overflow recovery.
//! - **Idle scheduling**: [`Heap::idle_notification`] maps a donated time
//!   budget and a heap snapshot to one action through a pure decision
//!   function ([`gc::compute`]).
//! - **Mark-compact cycles**: [`Heap::collect_garbage`] selects fragmented
//!   pages as evacuation candidates, marks, clears dead references,
//!   evacuates across a small task pool, rewrites recorded slots, and
//!   sweeps the rest in the background.
//!
//! # Quick start
//!
//! ```
//! use ebb_gc::{GcConfig, GcReason, Heap, ObjectKind, TaggedWord};
//!
//! let mut heap = Heap::new(GcConfig::default());
//! let list = heap.allocate(ObjectKind::Plain, 2).unwrap();
//! let item = heap.allocate(ObjectKind::Plain, 1).unwrap();
//! heap.write_barrier(list, 0, TaggedWord::from_object(item));
//! let root = heap.add_root(list);
//!
//! heap.collect_garbage(GcReason::ExternalRequest);
//!
//! // Objects may have moved; the root handle tracks them.
//! let list = heap.root(root).unwrap();
//! assert!(list.field(0).as_object().is_some());
//! ```
//!
//! # Threading
//!
//! A single mutator thread cooperates with the collector. Sweeping and
//! evacuation run on a bounded pool of background tasks over disjoint
//! pages; a per-page try-lock covers the only mutator/sweeper race.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod gc;
pub mod heap;
pub mod metrics;
pub mod object;

mod tracing;

// Re-export the public API surface.
pub use config::{CompactionProfile, GcConfig, IncrementalConfig, OverflowPolicy};
pub use gc::{
    CyclePhase, GcReason, HeapStateSnapshot, IdleAction, MarkingState, StepFlags, StepResult,
};
pub use heap::{Heap, HeapError, RootId, SpaceId, WeakRetention};
pub use metrics::{CollectionKind, GcHistory, GcMetrics};
pub use object::{ObjRef, ObjectKind, TaggedWord};
