//! Collector configuration and tunable constants.
//!
//! Every environment-tuned magic number lives here as a named default so the
//! embedder can override it without touching collector code.

/// Bytes the mutator may allocate between two `step()` samples.
pub const DEFAULT_STEP_ALLOCATION_THRESHOLD: usize = 64 * 1024;

/// Marking speed assumed before any measurement exists, in bytes per ms.
pub const INITIAL_MARKING_SPEED: usize = 96 * 1024;

/// Hard cap on a single incremental marking step, in bytes.
pub const MAX_MARKING_STEP_BYTES: usize = 1024 * 1024;

/// Fraction of an idle budget the scheduler is willing to plan for.
/// Leaves headroom for estimation error so the deadline is not overshot.
pub const CONSERVATIVE_TIME_RATIO: f64 = 0.75;

/// A context-disposal signal is actionable when disposals arrive at least
/// this often (measured in milliseconds per disposal).
pub const HIGH_CONTEXT_DISPOSAL_RATE_MS: f64 = 100.0;

/// Consecutive idle rounds without progress before the scheduler gives up
/// and returns `Done`.
pub const MAX_NO_PROGRESS_IDLE_ROUNDS: usize = 4;

/// Young space fill fraction above which an idle scavenge is considered.
pub const SCAVENGE_FILL_FRACTION: f64 = 0.8;

/// Scavenge speed assumed before any measurement exists, in bytes per ms.
pub const INITIAL_SCAVENGE_SPEED: usize = 256 * 1024;

/// Compaction speed assumed before any measurement exists, in bytes per ms.
pub const INITIAL_COMPACTION_SPEED: usize = 512 * 1024;

/// Upper bound on concurrent evacuation tasks.
pub const MAX_EVACUATION_TASKS: usize = 4;

/// Upper bound on background sweeper threads.
pub const MAX_SWEEPER_TASKS: usize = 2;

/// Capacity of one slots buffer in the remembered set.
pub const SLOTS_BUFFER_CAPACITY: usize = 128;

/// Maximum slots buffers chained per page before the overflow policy applies.
pub const MAX_SLOTS_CHAIN_LENGTH: usize = 4;

/// Bound on finalization rounds when incremental marking tries to complete.
pub const MAX_FINALIZATION_ROUNDS: usize = 8;

/// A finalization round that discovers fewer bytes than this has stalled.
pub const FINALIZATION_PROGRESS_THRESHOLD: usize = 16 * 1024;

/// Multiple of the starting live set; promoting more than this since cycle
/// start forces marking to speed up.
pub const PROMOTION_SPEED_UP_MULTIPLE: usize = 2;

/// Old-space free fraction below which marking speeds up.
pub const OLD_SPACE_CRITICAL_FREE_FRACTION: f64 = 0.1;

/// Maximum marking speed multiplier reached by repeated speed-ups.
pub const MAX_MARKING_SPEED_FACTOR: usize = 16;

/// What to do when a page's slots-buffer chain is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Forget exact slots for the page; rescan it when evacuation runs.
    /// Loses precision, never correctness.
    #[default]
    Degrade,
    /// Remove the page from the evacuation candidate set entirely.
    DropCandidate,
}

/// Thresholds steering evacuation candidate selection.
#[derive(Debug, Clone, Copy)]
pub struct CompactionProfile {
    /// A page qualifies when at least this fraction of its payload is free.
    pub free_fraction_threshold: f64,
    /// Cumulative live bytes the cycle is willing to copy.
    pub live_byte_budget: usize,
    /// Candidates are dropped entirely if the estimated number of pages
    /// reclaimed falls below this floor.
    pub min_page_reduction: usize,
}

impl CompactionProfile {
    /// Profile used for ordinary full collections.
    #[must_use]
    pub const fn normal() -> Self {
        Self {
            free_fraction_threshold: 0.15,
            live_byte_budget: 512 * 1024,
            min_page_reduction: 1,
        }
    }

    /// Profile used when the embedder signalled memory pressure: accepts
    /// more copying for a smaller footprint.
    #[must_use]
    pub const fn reduce_memory() -> Self {
        Self {
            free_fraction_threshold: 0.20,
            live_byte_budget: 1024 * 1024,
            min_page_reduction: 1,
        }
    }
}

/// Tunables for the incremental marking controller.
#[derive(Debug, Clone, Copy)]
pub struct IncrementalConfig {
    /// Whether incremental marking may start at all.
    pub enabled: bool,
    /// Bytes allocated between step samples.
    pub allocation_threshold: usize,
    /// Smallest useful step, in bytes.
    pub min_step_bytes: usize,
    /// Cap applied to every computed step, in bytes.
    pub max_step_bytes: usize,
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allocation_threshold: DEFAULT_STEP_ALLOCATION_THRESHOLD,
            min_step_bytes: 4 * 1024,
            max_step_bytes: MAX_MARKING_STEP_BYTES,
        }
    }
}

/// Top-level collector configuration.
#[derive(Debug, Clone, Copy)]
pub struct GcConfig {
    /// Page budget per space; allocation fails once it is exhausted.
    pub max_pages_per_space: usize,
    /// Capacity of the bounded marking deque, in objects.
    pub marking_deque_capacity: usize,
    /// Incremental marking tunables.
    pub incremental: IncrementalConfig,
    /// Candidate selection profile for ordinary cycles.
    pub normal_profile: CompactionProfile,
    /// Candidate selection profile under memory pressure.
    pub reduce_memory_profile: CompactionProfile,
    /// Remembered-set overflow handling.
    pub overflow_policy: OverflowPolicy,
    /// Upper bound on concurrent evacuation tasks.
    pub max_evacuation_tasks: usize,
    /// Background sweeper threads; 0 sweeps synchronously.
    pub sweeper_tasks: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            max_pages_per_space: 4096,
            marking_deque_capacity: 4096,
            incremental: IncrementalConfig::default(),
            normal_profile: CompactionProfile::normal(),
            reduce_memory_profile: CompactionProfile::reduce_memory(),
            overflow_policy: OverflowPolicy::default(),
            max_evacuation_tasks: MAX_EVACUATION_TASKS,
            sweeper_tasks: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_incremental() {
        let config = GcConfig::default();
        assert!(config.incremental.enabled);
        assert!(config.incremental.min_step_bytes <= config.incremental.max_step_bytes);
    }

    #[test]
    fn test_reduce_memory_profile_is_more_aggressive() {
        let normal = CompactionProfile::normal();
        let reduce = CompactionProfile::reduce_memory();
        assert!(reduce.free_fraction_threshold > normal.free_fraction_threshold);
        assert!(reduce.live_byte_budget > normal.live_byte_budget);
    }
}
