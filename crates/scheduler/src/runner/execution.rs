use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::monitoring::TaskOutcome;
use crate::task::{guarded, Payload, TaskEnvelope, TaskPanic, TaskState};

use super::WorkScheduler;

impl WorkScheduler {
    /// Run one dequeued envelope on the calling thread and record its
    /// outcome. Returns `true` on success.
    ///
    /// Panics are caught and counted as failures; they never reach the caller.
    pub(super) fn execute_envelope(&self, envelope: TaskEnvelope) -> bool {
        envelope.control.set_state(TaskState::Running);
        let started = Instant::now();
        let (result, repeat) = match envelope.payload {
            Payload::Once(work) => (guarded(work), None),
            Payload::Repeating(work) => {
                let result = guarded(|| work());
                (result, Some(work))
            }
        };
        let duration = started.elapsed();
        envelope.control.record_execution();

        let success = result.is_ok();
        if let Some(module) = envelope.name.module() {
            module.on_complete(success, duration);
        }
        self.shared.total_processed.fetch_add(1, Ordering::AcqRel);
        if !success {
            self.shared.total_failed.fetch_add(1, Ordering::AcqRel);
        }

        let error = result.err().map(|err| {
            let kind = if err.is::<TaskPanic>() { "panic" } else { "task_failure" };
            let message = format!("{err:#}");
            warn!(
                task = %envelope.name,
                id = envelope.id,
                kind,
                retries_remaining = envelope.retries_remaining,
                error = %message,
                "Task failed"
            );
            (kind.to_string(), message)
        });
        if duration > self.shared.config.slow_task_threshold() {
            let queued = started.saturating_duration_since(envelope.submitted_at);
            debug!(task = %envelope.name, ?duration, ?queued, "Slow task");
        }
        self.shared.monitoring.record(TaskOutcome {
            module: envelope.name.module_name().map(str::to_string),
            task: envelope.name.to_string(),
            priority: envelope.priority,
            duration,
            error,
        });

        match repeat {
            Some(work) if !envelope.control.is_cancelled() && !self.is_shutdown() => {
                self.reschedule(TaskEnvelope { payload: Payload::Repeating(work), ..envelope });
            }
            Some(_) => {
                envelope.control.set_next_run(None);
                envelope.control.set_state(TaskState::Cancelled);
            }
            None => envelope
                .control
                .set_state(if success { TaskState::Completed } else { TaskState::Failed }),
        }
        success
    }

    /// Park a repeating envelope until its next due time.
    fn reschedule(&self, envelope: TaskEnvelope) {
        let Some(interval) = envelope.repeat_interval else {
            return;
        };
        let due = Instant::now() + interval;
        envelope.control.set_next_run(Some(due));
        envelope.control.set_state(TaskState::Queued);
        if let Some(module) = envelope.name.module() {
            module.on_submit();
        }
        self.timers().push(due, envelope);
    }

    /// Drive `tick()` every `tick_interval` on the calling thread until
    /// [`shutdown`](Self::shutdown) is called.
    pub fn run(&self) {
        let interval = self.shared.config.tick_interval();
        info!(?interval, weights = %self.weights(), "Scheduler loop starting");

        while !self.is_shutdown() {
            let report = self.tick();
            std::thread::sleep(interval.saturating_sub(report.duration));
        }

        info!(
            ticks = self.shared.ticks.load(Ordering::Acquire),
            processed = self.shared.total_processed.load(Ordering::Acquire),
            "Scheduler loop stopped"
        );
    }
}
