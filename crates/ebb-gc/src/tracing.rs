//! Structured tracing support.
//!
//! With the `tracing` feature enabled this module provides spans and events
//! for collection cycles and phases; without it, call sites compile against
//! no-op stubs.

#[cfg(feature = "tracing")]
pub mod internal {
    use tracing::{span, Level};

    /// Span covering one full collection cycle.
    pub fn cycle_span(kind: &str, cycle_id: u64) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_cycle", kind = kind, cycle_id).entered()
    }

    /// Log candidate selection results.
    pub fn log_candidates(selected: usize, live_budget_used: usize) {
        tracing::debug!(selected, live_budget_used, "candidates_selected");
    }

    /// Log an evacuation abort.
    pub fn log_evacuation_abort(page_base: usize, copied: usize) {
        tracing::debug!(page_base, copied, "evacuation_aborted");
    }

    /// Log a marking deque overflow.
    pub fn log_deque_overflow() {
        tracing::debug!("marking_deque_overflow");
    }

    /// Log the action an idle notification decided on.
    pub fn log_idle_decision(idle_ms: u64, action: &str) {
        tracing::debug!(idle_ms, action, "idle_decision");
    }

    /// Log the end of an incremental step.
    pub fn log_incremental_step(budget: usize, processed: usize) {
        tracing::trace!(budget, processed, "incremental_step");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub span guard when tracing is disabled.
    pub struct EnteredSpan;

    /// Stub when tracing is disabled.
    pub fn cycle_span(_kind: &str, _cycle_id: u64) -> EnteredSpan {
        EnteredSpan
    }

    /// Stub when tracing is disabled.
    pub fn log_candidates(_selected: usize, _live_budget_used: usize) {}

    /// Stub when tracing is disabled.
    pub fn log_evacuation_abort(_page_base: usize, _copied: usize) {}

    /// Stub when tracing is disabled.
    pub fn log_deque_overflow() {}

    /// Stub when tracing is disabled.
    pub fn log_idle_decision(_idle_ms: u64, _action: &str) {}

    /// Stub when tracing is disabled.
    pub fn log_incremental_step(_budget: usize, _processed: usize) {}
}
