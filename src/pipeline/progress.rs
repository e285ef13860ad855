/// Progress Module
///
/// Per-height state tracking and pipeline-wide counters.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::models::{BlockHeight, HeightState};

#[derive(Debug, Default)]
struct TrackerState {
    /// Non-terminal heights only; bounded by queue capacities plus worker count
    in_flight: HashMap<BlockHeight, HeightState>,
    highest_dispatched: Option<BlockHeight>,
    written: u64,
    failed: Vec<BlockHeight>,
}

/// Tracks the `Pending → ... → Written | Failed` state machine of every dispatched height.
///
/// Heights are dispatched in increasing order, so anything at or below the highest dispatched
/// height that is not in flight has reached a terminal state.
#[derive(Debug, Default)]
pub struct HeightTracker {
    state: Mutex<TrackerState>,
}

impl HeightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a height as `Pending`. Returns false if it was already dispatched in this run.
    pub fn dispatch(&self, height: BlockHeight) -> bool {
        let mut state = self.lock();
        if state.highest_dispatched.is_some_and(|highest| height <= highest) {
            tracing::error!(height, "Refusing duplicate dispatch");
            return false;
        }
        state.highest_dispatched = Some(height);
        state.in_flight.insert(height, HeightState::Pending);
        true
    }

    /// Forget a `Pending` height that never made it into the task queue
    pub fn release(&self, height: BlockHeight) {
        let mut state = self.lock();
        if state.in_flight.get(&height) == Some(&HeightState::Pending) {
            state.in_flight.remove(&height);
            if state.highest_dispatched == Some(height) {
                state.highest_dispatched = height.checked_sub(1);
            }
        }
    }

    /// Move an in-flight height to a non-terminal state
    pub fn advance(&self, height: BlockHeight, next: HeightState) {
        debug_assert!(!next.is_terminal());
        if let Some(current) = self.lock().in_flight.get_mut(&height) {
            *current = next;
        }
    }

    pub fn mark_written(&self, height: BlockHeight) {
        self.finish(height, HeightState::Written);
    }

    pub fn mark_failed(&self, height: BlockHeight) {
        self.finish(height, HeightState::Failed);
    }

    fn finish(&self, height: BlockHeight, outcome: HeightState) {
        debug_assert!(outcome.is_terminal());
        let mut state = self.lock();
        let Some(previous) = state.in_flight.remove(&height) else {
            tracing::warn!(height, ?outcome, "Height finished but was not in flight");
            return;
        };

        match outcome {
            HeightState::Failed => state.failed.push(height),
            _ => state.written += 1,
        }
        tracing::trace!(height, ?previous, ?outcome, "Height finished");
    }

    /// Current state of a height, or None if it was never dispatched
    #[cfg(test)]
    pub fn state(&self, height: BlockHeight) -> Option<HeightState> {
        let state = self.lock();
        if let Some(current) = state.in_flight.get(&height) {
            return Some(*current);
        }
        match state.highest_dispatched {
            Some(highest) if height <= highest => {
                Some(if state.failed.contains(&height) { HeightState::Failed } else { HeightState::Written })
            }
            _ => None,
        }
    }

    pub fn written_count(&self) -> u64 {
        self.lock().written
    }

    /// Failed heights in ascending order, for manual replay
    pub fn failed_heights(&self) -> Vec<BlockHeight> {
        let mut failed = self.lock().failed.clone();
        failed.sort_unstable();
        failed
    }

    /// Heights still in a non-terminal state, in ascending order
    pub fn in_flight_heights(&self) -> Vec<BlockHeight> {
        let mut heights: Vec<_> = self.lock().in_flight.keys().copied().collect();
        heights.sort_unstable();
        heights
    }

    pub fn highest_dispatched(&self) -> Option<BlockHeight> {
        self.lock().highest_dispatched
    }
}

/// Pipeline-wide counters, shared by workers and writers
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub accounts_forwarded: AtomicU64,
    pub accounts_skipped: AtomicU64,
    pub accounts_written: AtomicU64,
    pub votes_written: AtomicU64,
    pub quads_added: AtomicU64,
    pub messages_dropped: AtomicU64,
    alert: AtomicBool,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message a writer gave up on and raise the alert condition
    pub fn record_drop(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
        self.alert.store(true, Ordering::SeqCst);
    }

    pub fn alert_raised(&self) -> bool {
        self.alert.load(Ordering::SeqCst)
    }
}

/// Final statistics of a run
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub start_height: BlockHeight,
    pub end_height: BlockHeight,
    pub blocks_dispatched: u64,
    pub blocks_written: u64,
    pub failed_heights: Vec<BlockHeight>,
    /// Heights dispatched but abandoned by a shutdown before reaching a terminal state
    pub unfinished_heights: Vec<BlockHeight>,
    pub accounts_forwarded: u64,
    pub accounts_skipped: u64,
    pub accounts_written: u64,
    pub votes_written: u64,
    pub quads_added: u64,
    pub messages_dropped: u64,
    pub alert_raised: bool,
    pub elapsed_time: Duration,
}

impl PipelineReport {
    pub fn collect(
        start_height: BlockHeight,
        end_height: BlockHeight,
        tracker: &HeightTracker,
        stats: &PipelineStats,
        elapsed_time: Duration,
    ) -> Self {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let blocks_dispatched =
            tracker.highest_dispatched().map(|highest| (highest + 1).saturating_sub(start_height)).unwrap_or(0);

        Self {
            start_height,
            end_height,
            blocks_dispatched,
            blocks_written: tracker.written_count(),
            failed_heights: tracker.failed_heights(),
            unfinished_heights: tracker.in_flight_heights(),
            accounts_forwarded: load(&stats.accounts_forwarded),
            accounts_skipped: load(&stats.accounts_skipped),
            accounts_written: load(&stats.accounts_written),
            votes_written: load(&stats.votes_written),
            quads_added: load(&stats.quads_added),
            messages_dropped: load(&stats.messages_dropped),
            alert_raised: stats.alert_raised(),
            elapsed_time,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.blocks_dispatched == 0 {
            0.0
        } else {
            (self.blocks_written as f64 / self.blocks_dispatched as f64) * 100.0
        }
    }

    pub fn blocks_per_second(&self) -> f64 {
        let secs = self.elapsed_time.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.blocks_written as f64 / secs
        }
    }
}
