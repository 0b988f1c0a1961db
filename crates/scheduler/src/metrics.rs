use std::time::Duration;

use serde::Serialize;

use crate::types::{ClassCounts, HealthStatus, Weights};

/// Incremental mean of durations, no sample storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningMean {
    count: u64,
    mean: Duration,
}

impl RunningMean {
    pub fn record(&mut self, duration: Duration) {
        self.count += 1;
        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        self.mean = if self.count == 1 {
            duration
        } else {
            let prev_nanos = self.mean.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / self.count as f64;
            Duration::from_nanos(avg_nanos.max(0.0) as u64)
        };
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> Duration {
        self.mean
    }

    pub fn mean_ms(&self) -> f64 {
        self.mean.as_secs_f64() * 1000.0
    }
}

/// Snapshot of scheduler state for dashboards and logs.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    /// Queued tasks per class.
    pub pending: ClassCounts,
    pub total_pending: usize,
    /// Delayed and repeating tasks waiting for their due time.
    pub scheduled: usize,
    pub total_processed: u64,
    pub total_failed: u64,
    pub processed_last_tick: usize,
    pub ticks: u64,
    pub registered_modules: usize,
    /// Global weights as configured.
    pub weights: Weights,
    /// Weights the next tick will use (global raised by module weights).
    pub effective_weights: Weights,
    pub uptime_secs: f64,
    pub health: HealthStatus,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub tick: u64,
    /// Tasks executed per class, successes and failures alike.
    pub executed: ClassCounts,
    pub failed: usize,
    /// Cancelled tasks dropped at dequeue without consuming credit.
    pub discarded: usize,
    /// Delayed or repeating tasks that became due and were enqueued.
    pub promoted: usize,
    /// Tasks still queued when the pass finished.
    pub rolled_over: ClassCounts,
    pub budget_exhausted: bool,
    /// Another drain pass was already in progress; nothing ran.
    pub skipped: bool,
    pub duration: Duration,
}

impl TickReport {
    pub(crate) fn skipped() -> Self {
        Self { skipped: true, ..Self::default() }
    }

    pub fn total_executed(&self) -> usize {
        self.executed.total()
    }
}
