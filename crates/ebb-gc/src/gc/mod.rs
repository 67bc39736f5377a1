//! Garbage collection internals.
//!
//! This module groups the pieces of the collector:
//! - tri-color bitmap and marking primitives
//! - bounded marking deque with overflow recovery
//! - mutator write barrier
//! - remembered sets for pointer fix-up
//! - incremental marking controller and the pure idle-time scheduler
//! - evacuation, sweeping, and the mark-compact cycle driver

#[allow(clippy::module_inception)]
mod gc;

pub mod barrier;
pub mod evacuate;
pub mod idle;
pub mod incremental;
pub mod mark;
pub mod remembered;
pub mod sweep;
pub mod worklist;

// Re-exports from gc
pub use gc::{
    abort_incremental_marking, collect_garbage, idle_notification, scavenge, CyclePhase, GcReason,
    MarkCompactCollector,
};

// Re-exports from idle
pub use idle::{compute, estimate_marking_step_size, HeapStateSnapshot, IdleAction};

// Re-exports from incremental
pub use incremental::{IncrementalMarking, MarkingState, StepFlags, StepResult};

// Re-exports from mark
pub use mark::{Color, ColorBitmap};

// Re-exports from worklist
pub use worklist::MarkingDeque;
