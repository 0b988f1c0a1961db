use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::SchedulerError;
use crate::task::{
    guarded, Payload, RepeatHandle, RepeatWork, TaskBatch, TaskControl, TaskEnvelope, TaskFuture,
    TaskHandle, TaskName, TaskState,
};
use crate::types::Priority;

use super::core::Shared;
use super::WorkScheduler;

/// Per-submission options beyond name, priority and payload.
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct EnqueueOptions {
    pub(super) delay: Option<Duration>,
    pub(super) repeat: Option<Duration>,
    pub(super) retries_remaining: u32,
    pub(super) timeout: Option<Duration>,
}

/// Result of handing an envelope to the scheduler.
pub(super) struct Submission {
    pub(super) handle: TaskHandle,
    pub(super) rejection: Option<SchedulerError>,
    /// Caller-facing deadline, counted from submission.
    pub(super) deadline: Option<Instant>,
}

type ReplySlot<T> = Option<oneshot::Sender<Result<T, SchedulerError>>>;

/// Single-use reply slot shared by every attempt of a task and its deadline.
type Reply<T> = Arc<Mutex<ReplySlot<T>>>;

/// Deliver `value` unless something already replied. Returns whether this
/// call consumed the slot.
fn reply<T>(slot: &Reply<T>, value: Result<T, SchedulerError>) -> bool {
    match slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
        Some(tx) => {
            // The caller may have dropped the future.
            let _ = tx.send(value);
            true
        }
        None => false,
    }
}

fn await_reply<T: Send + 'static>(
    task: String,
    rx: oneshot::Receiver<Result<T, SchedulerError>>,
    rejection: Option<SchedulerError>,
) -> TaskFuture<T> {
    if let Some(err) = rejection {
        return futures::future::ready(Err(err)).boxed();
    }
    async move {
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::Cancelled { task }),
        }
    }
    .boxed()
}

impl WorkScheduler {
    /// Build an envelope and queue it (or park it in the timer queue).
    /// Never blocks; rejected envelopes are dropped immediately.
    pub(super) fn enqueue(
        &self,
        name: TaskName,
        priority: Priority,
        payload: Payload,
        opts: EnqueueOptions,
    ) -> Submission {
        let now = Instant::now();
        let due = opts.delay.or(opts.repeat).map(|d| now + d);
        let envelope = TaskEnvelope {
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            name,
            priority,
            submitted_at: now,
            payload,
            retries_remaining: opts.retries_remaining,
            timeout_deadline: opts.timeout.map(|t| now + t),
            repeat_interval: opts.repeat,
            control: TaskControl::new(due),
        };
        let handle = envelope.handle();
        let deadline = envelope.timeout_deadline;

        if let Some(reason) = self.rejection_reason(&envelope) {
            warn!(task = %envelope.name, %priority, reason, "Submission rejected");
            envelope.control.set_state(TaskState::Rejected);
            let rejection = SchedulerError::SubmissionRejected {
                task: envelope.name.to_string(),
                reason: reason.to_string(),
            };
            return Submission { handle, rejection: Some(rejection), deadline: None };
        }

        if let Some(module) = envelope.name.module() {
            module.on_submit();
        }
        trace!(task = %envelope.name, id = envelope.id, %priority, "Task submitted");

        match due {
            Some(due) => self.timers().push(due, envelope),
            None => {
                if let Err(err) = self.queue(priority).tx.send(envelope) {
                    // Unreachable while `Shared` owns the receiver.
                    self.discard(err.into_inner(), TaskState::Rejected);
                }
                // Pairs with the swap in `shutdown`: a send that raced past
                // its drain is pulled back here.
                fence(Ordering::SeqCst);
                if self.shared.shutdown.load(Ordering::SeqCst) {
                    self.discard_queued();
                }
            }
        }
        self.check_overflow();
        Submission { handle, rejection: None, deadline }
    }

    fn rejection_reason(&self, envelope: &TaskEnvelope) -> Option<&'static str> {
        if self.is_shutdown() {
            return Some("scheduler is shutting down");
        }
        match envelope.name.module() {
            Some(module) if !module.is_enabled() => Some("module is disabled"),
            _ => None,
        }
    }

    fn check_overflow(&self) {
        let pending = self.pending().total();
        let threshold = self.shared.config.queue_critical_threshold;
        let warned = &self.shared.overflow_warned;
        if pending > threshold {
            if !warned.swap(true, Ordering::AcqRel) {
                warn!(pending, threshold, "Scheduler queue overflow");
            }
        } else if pending <= threshold / 2 {
            warned.store(false, Ordering::Release);
        }
    }

    // ── Fire-and-forget ─────────────────────────────────────────

    /// Queue `work` at NORMAL priority.
    pub fn execute<F>(&self, name: impl Into<TaskName>, work: F) -> TaskHandle
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.execute_with_priority(name, work, Priority::Normal)
    }

    pub fn execute_high_priority<F>(&self, name: impl Into<TaskName>, work: F) -> TaskHandle
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.execute_with_priority(name, work, Priority::High)
    }

    pub fn execute_low_priority<F>(&self, name: impl Into<TaskName>, work: F) -> TaskHandle
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.execute_with_priority(name, work, Priority::Low)
    }

    pub fn execute_with_priority<F>(&self, name: impl Into<TaskName>, work: F, priority: Priority) -> TaskHandle
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.enqueue(name.into(), priority, Payload::Once(Box::new(work)), EnqueueOptions::default())
            .handle
    }

    // ── Result-carrying ─────────────────────────────────────────

    /// Queue `work` at NORMAL priority and return a future for its result.
    pub fn submit<T, F>(&self, name: impl Into<TaskName>, work: F) -> TaskFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        self.submit_with_priority(name, work, Priority::Normal)
    }

    pub fn submit_with_priority<T, F>(&self, name: impl Into<TaskName>, work: F, priority: Priority) -> TaskFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        self.submit_inner(name.into(), work, priority, EnqueueOptions::default()).1
    }

    /// Like [`submit_with_priority`](Self::submit_with_priority) but also
    /// returns the task handle.
    pub fn submit_with_handle<T, F>(
        &self,
        name: impl Into<TaskName>,
        work: F,
        priority: Priority,
    ) -> (TaskHandle, TaskFuture<T>)
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        self.submit_inner(name.into(), work, priority, EnqueueOptions::default())
    }

    fn submit_inner<T, F>(
        &self,
        name: TaskName,
        work: F,
        priority: Priority,
        opts: EnqueueOptions,
    ) -> (TaskHandle, TaskFuture<T>)
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let slot: Reply<T> = Arc::new(Mutex::new(Some(tx)));
        let task = name.to_string();
        let label = task.clone();
        let body_slot = Arc::clone(&slot);
        let body = move || match guarded(work) {
            Ok(value) => {
                reply(&body_slot, Ok(value));
                Ok(())
            }
            Err(err) => {
                reply(
                    &body_slot,
                    Err(SchedulerError::TaskExecutionFailed { task: label, cause: format!("{err:#}") }),
                );
                Err(err)
            }
        };
        let timeout = opts.timeout;
        let submission = self.enqueue(name, priority, Payload::Once(Box::new(body)), opts);
        if let (Some(deadline), Some(timeout)) = (submission.deadline, timeout) {
            self.expire_at(deadline, Arc::downgrade(&slot), task.clone(), timeout);
        }
        let future = await_reply(task, rx, submission.rejection);
        (submission.handle, future)
    }

    /// Resolve `slot` with `TimeoutExceeded` at `deadline` unless the task
    /// has replied first. The slot is held weakly so a discarded task still
    /// resolves to `Cancelled` straight away.
    fn expire_at<T: Send + 'static>(
        &self,
        deadline: Instant,
        slot: Weak<Mutex<ReplySlot<T>>>,
        task: String,
        timeout: Duration,
    ) {
        self.shared.deadlines.watch(
            deadline,
            Box::new(move || {
                let Some(slot) = slot.upgrade() else {
                    return;
                };
                if reply(&slot, Err(SchedulerError::TimeoutExceeded { task: task.clone(), timeout })) {
                    debug!(task = %task, ?timeout, "Task deadline passed before completion");
                }
            }),
        );
    }

    /// Queue `work` with a caller-side deadline of `timeout` from now.
    ///
    /// If the task has not finished by then the future resolves to
    /// `TimeoutExceeded`. The task itself is not stopped; it still runs when
    /// drained and its result is discarded. Works on any executor.
    pub fn execute_with_timeout<F>(
        &self,
        name: impl Into<TaskName>,
        work: F,
        timeout: Duration,
        priority: Priority,
    ) -> TaskFuture<()>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.submit_with_timeout(name, work, timeout, priority)
    }

    pub fn submit_with_timeout<T, F>(
        &self,
        name: impl Into<TaskName>,
        work: F,
        timeout: Duration,
        priority: Priority,
    ) -> TaskFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let opts = EnqueueOptions { timeout: Some(timeout), ..EnqueueOptions::default() };
        self.submit_inner(name.into(), work, priority, opts).1
    }

    /// Queue `work`; on failure re-submit it immediately under
    /// `"{name}#attempt{n}"`, up to `max_retries` extra attempts.
    pub fn execute_with_retry<F>(
        &self,
        name: impl Into<TaskName>,
        work: F,
        max_retries: u32,
        priority: Priority,
    ) -> TaskFuture<()>
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        let task = name.to_string();
        let (tx, rx) = oneshot::channel();
        let slot: Reply<()> = Arc::new(Mutex::new(Some(tx)));
        let attempt = RetryAttempt {
            base: name,
            work: Arc::new(work),
            attempt: 0,
            max_retries,
            priority,
            slot,
        };
        let rejection = attempt.submit(self);
        await_reply(task, rx, rejection)
    }

    // ── Deferred ────────────────────────────────────────────────

    /// Run `work` once, no earlier than `delay` from now.
    pub fn schedule_delayed<F>(&self, name: impl Into<TaskName>, work: F, delay: Duration, priority: Priority) -> TaskHandle
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let opts = EnqueueOptions { delay: Some(delay), ..EnqueueOptions::default() };
        self.enqueue(name.into(), priority, Payload::Once(Box::new(work)), opts).handle
    }

    /// Run `work` every `interval`, first after one interval, until the
    /// handle is stopped or the scheduler shuts down.
    pub fn schedule_repeating<F>(
        &self,
        name: impl Into<TaskName>,
        work: F,
        interval: Duration,
        priority: Priority,
    ) -> RepeatHandle
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let work: RepeatWork = Arc::new(work);
        let opts = EnqueueOptions { repeat: Some(interval), ..EnqueueOptions::default() };
        let submission = self.enqueue(name.into(), priority, Payload::Repeating(work), opts);
        RepeatHandle::new(submission.handle, interval)
    }

    /// Run every step of `batch` as one logical task.
    pub fn execute_batch<B>(&self, name: impl Into<TaskName>, mut batch: B, priority: Priority) -> TaskFuture<()>
    where
        B: TaskBatch,
    {
        let name = name.into();
        debug!(
            task = %name,
            description = %batch.description(),
            estimated_tasks = batch.estimated_task_count(),
            "Batch submitted"
        );
        self.submit_inner(name, move || batch.execute(), priority, EnqueueOptions::default())
            .1
    }
}

/// One attempt of a retrying task.
struct RetryAttempt {
    base: TaskName,
    work: RepeatWork,
    attempt: u32,
    max_retries: u32,
    priority: Priority,
    slot: Reply<()>,
}

impl RetryAttempt {
    fn label(&self) -> TaskName {
        if self.attempt == 0 {
            self.base.clone()
        } else {
            self.base.with_suffix(&format!("#attempt{}", self.attempt))
        }
    }

    /// Queue this attempt. Returns the rejection, if any; on rejection the
    /// reply slot has not been consumed.
    fn submit(self, scheduler: &WorkScheduler) -> Option<SchedulerError> {
        let label = self.label();
        let priority = self.priority;
        let opts = EnqueueOptions {
            retries_remaining: self.max_retries - self.attempt,
            ..EnqueueOptions::default()
        };
        let weak = Arc::downgrade(&scheduler.shared);
        let slot = Arc::clone(&self.slot);
        let body = move || self.run(weak);
        let rejection = scheduler.enqueue(label, priority, Payload::Once(Box::new(body)), opts).rejection;
        if let Some(err) = &rejection {
            reply(&slot, Err(err.clone()));
        }
        rejection
    }

    fn run(self, scheduler: Weak<Shared>) -> anyhow::Result<()> {
        let work = Arc::clone(&self.work);
        match guarded(|| work()) {
            Ok(()) => {
                reply(&self.slot, Ok(()));
                Ok(())
            }
            Err(err) => {
                let cause = format!("{err:#}");
                if self.attempt < self.max_retries {
                    debug!(task = %self.base, attempt = self.attempt + 1, %cause, "Retrying failed task");
                    match scheduler.upgrade() {
                        Some(shared) => {
                            let next = RetryAttempt { attempt: self.attempt + 1, ..self };
                            next.submit(&WorkScheduler { shared });
                        }
                        None => {
                            reply(&self.slot, Err(SchedulerError::Cancelled { task: self.base.to_string() }));
                        }
                    }
                } else {
                    warn!(task = %self.base, attempts = self.attempt + 1, %cause, "Retries exhausted");
                    reply(
                        &self.slot,
                        Err(SchedulerError::RetryExhausted {
                            task: self.base.to_string(),
                            attempts: self.attempt + 1,
                            last_cause: cause,
                        }),
                    );
                }
                Err(err)
            }
        }
    }
}
