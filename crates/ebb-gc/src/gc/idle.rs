//! Idle-time scheduling: a pure decision function from (idle budget, heap
//! statistics) to a single GC action.
//!
//! `compute` owns no state and touches no clock; everything it needs,
//! including the no-progress counter, arrives in the snapshot. Identical
//! inputs produce identical actions.

use crate::config::{
    CONSERVATIVE_TIME_RATIO, HIGH_CONTEXT_DISPOSAL_RATE_MS, INITIAL_MARKING_SPEED,
    INITIAL_SCAVENGE_SPEED, MAX_MARKING_STEP_BYTES, MAX_NO_PROGRESS_IDLE_ROUNDS,
    SCAVENGE_FILL_FRACTION,
};

/// Pure-data view of the heap, assembled by `Heap::state_snapshot`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStateSnapshot {
    /// Contexts the embedder disposed since the last full collection.
    pub contexts_disposed: usize,
    /// Milliseconds per disposal; `f64::INFINITY` when none happened.
    pub contexts_disposal_rate_ms: f64,
    /// Whether incremental marking is currently stopped.
    pub incremental_marking_stopped: bool,
    /// Whether incremental marking is allowed to start.
    pub can_start_incremental_marking: bool,
    /// Whether a background sweep is outstanding.
    pub sweeping_in_progress: bool,
    /// Whether that sweep has finished all queued pages.
    pub sweeping_completed: bool,
    /// Measured marking speed in bytes/ms; 0 while unmeasured.
    pub incremental_marking_speed: usize,
    /// Measured scavenge speed in bytes/ms; 0 while unmeasured.
    pub scavenge_speed: usize,
    /// Mutator allocation throughput in bytes/ms; 0 while unmeasured.
    pub allocation_throughput: usize,
    /// Bytes allocated in the young space.
    pub new_space_size: usize,
    /// Young space capacity in bytes.
    pub new_space_capacity: usize,
    /// Bytes allocated across all spaces.
    pub size_of_objects: usize,
    /// Consecutive idle rounds that made no progress.
    pub idle_rounds_without_progress: usize,
}

/// What to do with a donated slice of idle time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAction {
    /// Nothing useful left; the caller should stop donating idle time.
    Done,
    /// Nothing to do right now, but keep the idle notifications coming.
    NoAction,
    /// Run one bounded incremental marking step.
    IncrementalStep {
        /// Step budget in bytes.
        bytes: usize,
    },
    /// Run a young-generation collection.
    Scavenge,
    /// Run a full mark-compact collection.
    FullCollection,
    /// Finalize an already-completed background sweep.
    FinalizeSweeping,
}

impl IdleAction {
    /// Stable name for logging.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::NoAction => "no_action",
            Self::IncrementalStep { .. } => "incremental_step",
            Self::Scavenge => "scavenge",
            Self::FullCollection => "full_collection",
            Self::FinalizeSweeping => "finalize_sweeping",
        }
    }
}

/// A disposal signal is actionable when disposals arrive frequently enough
/// that collecting on their behalf is likely to reclaim entire subgraphs.
fn context_disposal_actionable(state: &HeapStateSnapshot) -> bool {
    state.contexts_disposed > 0
        && state.contexts_disposal_rate_ms < HIGH_CONTEXT_DISPOSAL_RATE_MS
}

fn backed_off(state: &HeapStateSnapshot) -> IdleAction {
    if state.idle_rounds_without_progress >= MAX_NO_PROGRESS_IDLE_ROUNDS {
        IdleAction::Done
    } else {
        IdleAction::NoAction
    }
}

fn should_do_scavenge(idle_ms: u64, state: &HeapStateSnapshot) -> bool {
    if state.new_space_size == 0 || state.new_space_capacity == 0 {
        return false;
    }
    #[allow(clippy::cast_precision_loss)]
    let fill = state.new_space_size as f64 / state.new_space_capacity as f64;
    let nearly_full = fill >= SCAVENGE_FILL_FRACTION;
    let fills_soon = state.allocation_throughput > 0
        && estimate_time_ms(
            state.new_space_capacity - state.new_space_size,
            state.allocation_throughput,
        ) <= idle_ms;
    (nearly_full || fills_soon)
        && estimate_scavenge_time_ms(state.new_space_size, state.scavenge_speed) <= idle_ms
}

/// Map an idle budget and a heap snapshot to one action.
#[must_use]
pub fn compute(idle_ms: u64, state: &HeapStateSnapshot) -> IdleAction {
    // 1. No budget: only a disposal-driven full collection is worth it.
    if idle_ms == 0 {
        if state.incremental_marking_stopped && context_disposal_actionable(state) {
            return IdleAction::FullCollection;
        }
        return IdleAction::NoAction;
    }

    // 2. Disposals happened but the signal is not confident yet.
    if state.contexts_disposed > 0 && !context_disposal_actionable(state) {
        return backed_off(state);
    }

    // 3. A scavenge that fits the budget beats starting marking work.
    if should_do_scavenge(idle_ms, state) {
        return IdleAction::Scavenge;
    }

    // 4. An outstanding sweep is either finalized or waited out.
    if state.sweeping_in_progress {
        if state.sweeping_completed {
            return IdleAction::FinalizeSweeping;
        }
        return backed_off(state);
    }

    // 5. Nothing incremental to drive.
    if state.incremental_marking_stopped && !state.can_start_incremental_marking {
        return IdleAction::Done;
    }

    // 6. Spend the budget on marking.
    IdleAction::IncrementalStep {
        bytes: estimate_marking_step_size(idle_ms, state.incremental_marking_speed),
    }
}

/// Bytes/ms-based duration estimate, saturating at `u64::MAX` on overflow.
fn estimate_time_ms(bytes: usize, speed: usize) -> u64 {
    if speed == 0 {
        return u64::MAX;
    }
    (bytes / speed) as u64
}

/// Marking step size for an idle budget.
///
/// Uses the measured speed when available, else the built-in initial speed;
/// discounts by the conservativeness ratio; clamps to the hard maximum and
/// substitutes the maximum on multiplication wraparound.
#[must_use]
pub fn estimate_marking_step_size(idle_ms: u64, speed: usize) -> usize {
    let speed = if speed == 0 { INITIAL_MARKING_SPEED } else { speed };
    let raw = idle_ms
        .checked_mul(speed as u64)
        .map_or(MAX_MARKING_STEP_BYTES, |v| {
            usize::try_from(v).unwrap_or(MAX_MARKING_STEP_BYTES)
        });
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let conservative = (raw as f64 * CONSERVATIVE_TIME_RATIO) as usize;
    conservative.min(MAX_MARKING_STEP_BYTES)
}

/// Estimated scavenge duration for the current young size.
#[must_use]
pub fn estimate_scavenge_time_ms(new_space_size: usize, speed: usize) -> u64 {
    let speed = if speed == 0 { INITIAL_SCAVENGE_SPEED } else { speed };
    estimate_time_ms(new_space_size, speed)
}
