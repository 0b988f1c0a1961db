use std::sync::atomic::Ordering;
use std::sync::TryLockError;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::metrics::TickReport;
use crate::task::TaskState;
use crate::types::{Priority, Weights};

use super::WorkScheduler;

/// Per-tick limits on work done by the drain pass.
struct Budget {
    started: Instant,
    max_tasks: usize,
    max_duration: Option<Duration>,
    executed: usize,
}

impl Budget {
    fn exhausted(&self) -> bool {
        (self.max_tasks != 0 && self.executed >= self.max_tasks)
            || self.max_duration.is_some_and(|d| self.started.elapsed() >= d)
    }
}

impl WorkScheduler {
    /// Run one drain pass on the calling thread.
    ///
    /// Classes drain in priority order, each up to its credit balance for this
    /// tick. Unused credits are lent one class forward (see `lendable`). A
    /// concurrent or reentrant call returns a skipped report without running
    /// anything.
    pub fn tick(&self) -> TickReport {
        let mut drain = match self.shared.drain.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                trace!("Drain pass already in progress, skipping");
                return TickReport::skipped();
            }
        };
        if self.is_shutdown() {
            let late = self.discard_queued();
            if late > 0 {
                debug!(late, "Discarded tasks queued after shutdown");
            }
            return TickReport::skipped();
        }

        drain.tick += 1;
        let started = Instant::now();
        let mut report = TickReport { tick: drain.tick, ..TickReport::default() };
        report.promoted = self.promote_due(started);

        let weights = self.effective_weights();
        let mut budget = Budget {
            started,
            max_tasks: self.shared.config.max_tasks_per_tick,
            max_duration: self.shared.config.max_tick_duration(),
            executed: 0,
        };

        let mut lent = 0;
        for priority in Priority::ALL {
            let had_backlog = !self.queue(priority).rx.is_empty();
            let credits = class_credits(weights, priority, lent);
            let used = self.drain_class(priority, credits, &mut budget, &mut report);
            lent = lendable(weights, priority, credits - used, had_backlog);
        }

        for p in Priority::ALL {
            report.rolled_over[p] = self.queue(p).rx.len();
        }
        report.duration = started.elapsed();

        let processed = report.total_executed();
        self.shared.ticks.fetch_add(1, Ordering::AcqRel);
        self.shared.last_tick_processed.store(processed, Ordering::Release);
        self.shared.monitoring.sample();

        if processed > 0 || report.discarded > 0 {
            trace!(
                tick = report.tick,
                high = report.executed[Priority::High],
                normal = report.executed[Priority::Normal],
                low = report.executed[Priority::Low],
                failed = report.failed,
                discarded = report.discarded,
                budget_exhausted = report.budget_exhausted,
                duration_us = report.duration.as_micros() as u64,
                "Drain pass complete"
            );
        }
        report
    }

    /// Move due delayed and repeating envelopes into their class queues.
    fn promote_due(&self, now: Instant) -> usize {
        let due = self.timers().pop_due(now);
        let mut promoted = 0;
        for envelope in due {
            if envelope.control.is_cancelled() {
                self.discard(envelope, TaskState::Cancelled);
                continue;
            }
            let priority = envelope.priority;
            if let Err(err) = self.queue(priority).tx.send(envelope) {
                self.discard(err.into_inner(), TaskState::Cancelled);
                continue;
            }
            promoted += 1;
        }
        promoted
    }

    /// Dequeue and run up to `credits` tasks of one class. Returns the
    /// credits spent.
    fn drain_class(&self, priority: Priority, credits: u32, budget: &mut Budget, report: &mut TickReport) -> u32 {
        let queue = self.queue(priority);
        let mut used = 0;
        while used < credits {
            if budget.exhausted() {
                report.budget_exhausted = true;
                break;
            }
            let Ok(envelope) = queue.rx.try_recv() else {
                break;
            };
            if envelope.control.is_cancelled() {
                self.discard(envelope, TaskState::Cancelled);
                report.discarded += 1;
                continue;
            }
            used += 1;
            budget.executed += 1;
            report.executed[priority] += 1;
            if !self.execute_envelope(envelope) {
                report.failed += 1;
            }
        }
        used
    }
}

/// Credits a class starts the pass with: its effective weight plus whatever
/// the previous class lent it.
fn class_credits(weights: Weights, priority: Priority, lent: u32) -> u32 {
    match priority {
        Priority::High => weights.high,
        Priority::Normal => weights.normal.saturating_add(lent),
        Priority::Low => weights.low.saturating_add(lent),
    }
}

/// Credits a class passes to the next one after draining.
///
/// HIGH lends its remainder only when it had queued work at the start of the
/// pass, so an idle HIGH never inflates NORMAL. NORMAL spends borrowed credits
/// first and lends what is left of its own weight. Credits move one class
/// forward and are not re-lent; LOW's remainder expires with the tick.
fn lendable(weights: Weights, priority: Priority, unused: u32, had_backlog: bool) -> u32 {
    match priority {
        Priority::High if had_backlog => unused,
        Priority::High => 0,
        Priority::Normal => unused.min(weights.normal),
        Priority::Low => 0,
    }
}
