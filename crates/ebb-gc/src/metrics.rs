//! Collection metrics, speed estimation, and history.

use std::time::{Duration, Instant};

/// Why a collection ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CollectionKind {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// Young-generation scavenge.
    Scavenge = 1,
    /// Full mark-compact, marked atomically.
    Full = 2,
    /// Full mark-compact finalizing an incremental marking cycle.
    IncrementalFull = 3,
}

/// Statistics from one collection cycle.
#[derive(Debug, Clone, Copy)]
pub struct GcMetrics {
    /// Total cycle duration.
    pub duration: Duration,
    /// Kind of cycle.
    pub kind: CollectionKind,
    /// Bytes reclaimed (swept + evacuated pages released).
    pub bytes_reclaimed: usize,
    /// Bytes surviving the cycle.
    pub bytes_surviving: usize,
    /// Bytes copied out of evacuation candidates.
    pub bytes_evacuated: usize,
    /// Pages selected as evacuation candidates.
    pub candidates_selected: usize,
    /// Candidate pages fully evacuated and released.
    pub pages_evacuated: usize,
    /// Candidate pages whose evacuation aborted.
    pub pages_aborted: usize,
    /// Slots rewritten during pointer fix-up.
    pub slots_fixed: usize,
    /// Times the marking deque overflowed this cycle.
    pub deque_overflows: usize,
    /// Prepare-phase duration.
    pub prepare_duration: Duration,
    /// Mark-phase duration.
    pub mark_duration: Duration,
    /// Clear-phase duration.
    pub clear_duration: Duration,
    /// Evacuation (copy + fix-up) duration.
    pub evacuate_duration: Duration,
    /// Synchronous part of the sweep duration.
    pub sweep_duration: Duration,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// All-zero metrics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            kind: CollectionKind::None,
            bytes_reclaimed: 0,
            bytes_surviving: 0,
            bytes_evacuated: 0,
            candidates_selected: 0,
            pages_evacuated: 0,
            pages_aborted: 0,
            slots_fixed: 0,
            deque_overflows: 0,
            prepare_duration: Duration::ZERO,
            mark_duration: Duration::ZERO,
            clear_duration: Duration::ZERO,
            evacuate_duration: Duration::ZERO,
            sweep_duration: Duration::ZERO,
        }
    }
}

/// Helper for timing the phases of one cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Prepare-phase time.
    pub prepare: Duration,
    /// Mark-phase time.
    pub mark: Duration,
    /// Clear-phase time.
    pub clear: Duration,
    /// Evacuation time.
    pub evacuate: Duration,
    /// Synchronous sweep time.
    pub sweep: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// Fresh timer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            prepare: Duration::ZERO,
            mark: Duration::ZERO,
            clear: Duration::ZERO,
            evacuate: Duration::ZERO,
            sweep: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    fn take(&mut self) -> Duration {
        self.current_start.take().map_or(Duration::ZERO, |s| s.elapsed())
    }

    /// End the prepare phase.
    pub fn end_prepare(&mut self) {
        self.prepare = self.take();
    }

    /// End the mark phase.
    pub fn end_mark(&mut self) {
        self.mark = self.take();
    }

    /// End the clear phase.
    pub fn end_clear(&mut self) {
        self.clear = self.take();
    }

    /// End the evacuation phase.
    pub fn end_evacuate(&mut self) {
        self.evacuate = self.take();
    }

    /// End the synchronous sweep phase.
    pub fn end_sweep(&mut self) {
        self.sweep = self.take();
    }
}

// ============================================================================
// Speed tracking
// ============================================================================

/// Decaying average of a measured throughput in bytes per millisecond.
///
/// Returns 0 until the first sample arrives; estimator call sites substitute
/// their built-in initial constants for a zero rate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpeedTracker {
    rate: f64,
    samples: usize,
}

/// Weight of history versus the newest sample.
const SPEED_DECAY: f64 = 0.7;

impl SpeedTracker {
    /// Record a sample of `bytes` processed in `duration`.
    pub fn record(&mut self, bytes: usize, duration: Duration) {
        let ms = duration.as_secs_f64() * 1000.0;
        if ms <= 0.0 {
            return;
        }
        #[allow(clippy::cast_precision_loss)]
        let sample = bytes as f64 / ms;
        self.rate = if self.samples == 0 {
            sample
        } else {
            SPEED_DECAY.mul_add(self.rate, (1.0 - SPEED_DECAY) * sample)
        };
        self.samples += 1;
    }

    /// Measured rate in whole bytes per ms; 0 while unmeasured.
    #[must_use]
    pub fn bytes_per_ms(&self) -> usize {
        if self.rate.is_finite() && self.rate > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                self.rate as usize
            }
        } else {
            0
        }
    }

    /// Whether at least one sample was recorded.
    #[must_use]
    pub const fn is_measured(&self) -> bool {
        self.samples > 0
    }
}

/// All throughput estimators the schedulers consult.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcSpeeds {
    /// Mutator allocation throughput.
    pub allocation: SpeedTracker,
    /// Incremental marking speed.
    pub incremental_marking: SpeedTracker,
    /// Scavenge speed.
    pub scavenge: SpeedTracker,
    /// Evacuation/compaction speed.
    pub compaction: SpeedTracker,
    /// Full mark-compact speed.
    pub mark_compact: SpeedTracker,
}

// ============================================================================
// History
// ============================================================================

/// Ring size of retained cycle metrics.
const HISTORY_SIZE: usize = 64;

/// Fixed-size ring of recent collection metrics.
#[derive(Debug)]
pub struct GcHistory {
    buffer: Vec<GcMetrics>,
    total_recorded: usize,
}

impl GcHistory {
    /// Empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buffer: Vec::new(),
            total_recorded: 0,
        }
    }

    /// Record one cycle's metrics.
    pub fn push(&mut self, metrics: GcMetrics) {
        if self.buffer.len() < HISTORY_SIZE {
            self.buffer.push(metrics);
        } else {
            self.buffer[self.total_recorded % HISTORY_SIZE] = metrics;
        }
        self.total_recorded += 1;
    }

    /// Collections recorded since heap creation (may exceed the ring size).
    #[must_use]
    pub const fn total_recorded(&self) -> usize {
        self.total_recorded
    }

    /// The most recent metrics, if any collection ran.
    #[must_use]
    pub fn last(&self) -> Option<&GcMetrics> {
        if self.total_recorded == 0 {
            None
        } else {
            Some(&self.buffer[(self.total_recorded - 1) % HISTORY_SIZE])
        }
    }

    /// Up to `n` most recent metrics, newest last.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<GcMetrics> {
        let have = self.buffer.len();
        let n = n.min(have);
        let mut out = Vec::with_capacity(n);
        for back in (0..n).rev() {
            let idx = (self.total_recorded - 1 - back) % HISTORY_SIZE;
            out.push(self.buffer[idx]);
        }
        out
    }

    /// Average pause over the `n` most recent collections.
    #[must_use]
    pub fn average_pause(&self, n: usize) -> Duration {
        let recent = self.recent(n);
        if recent.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = recent.iter().map(|m| m.duration).sum();
        total / u32::try_from(recent.len()).unwrap_or(1)
    }

    /// Longest pause over the `n` most recent collections.
    #[must_use]
    pub fn max_pause(&self, n: usize) -> Duration {
        self.recent(n)
            .iter()
            .map(|m| m.duration)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

impl Default for GcHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_timer_captures_durations() {
        let mut timer = PhaseTimer::new();
        timer.start();
        std::thread::sleep(Duration::from_millis(1));
        timer.end_mark();
        assert!(timer.mark > Duration::ZERO);
        assert_eq!(timer.sweep, Duration::ZERO);
    }

    #[test]
    fn test_speed_tracker_starts_unmeasured() {
        let tracker = SpeedTracker::default();
        assert!(!tracker.is_measured());
        assert_eq!(tracker.bytes_per_ms(), 0);
    }

    #[test]
    fn test_speed_tracker_decays_toward_new_samples() {
        let mut tracker = SpeedTracker::default();
        tracker.record(1000, Duration::from_millis(1));
        let first = tracker.bytes_per_ms();
        assert_eq!(first, 1000);
        tracker.record(3000, Duration::from_millis(1));
        let second = tracker.bytes_per_ms();
        assert!(second > first);
        assert!(second < 3000);
    }

    #[test]
    fn test_history_ring_wraps() {
        let mut history = GcHistory::new();
        for i in 0..(HISTORY_SIZE + 5) {
            let mut m = GcMetrics::new();
            m.bytes_reclaimed = i;
            history.push(m);
        }
        assert_eq!(history.total_recorded(), HISTORY_SIZE + 5);
        assert_eq!(history.last().unwrap().bytes_reclaimed, HISTORY_SIZE + 4);
        assert_eq!(history.recent(3).len(), 3);
    }

    #[test]
    fn test_history_average_pause_empty_is_zero() {
        let history = GcHistory::new();
        assert_eq!(history.average_pause(10), Duration::ZERO);
        assert_eq!(history.max_pause(10), Duration::ZERO);
    }
}
