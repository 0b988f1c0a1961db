use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use futures::future::BoxFuture;
use serde::Serialize;

use crate::error::SchedulerError;
use crate::registry::ModuleRecord;
use crate::types::Priority;

/// Monotonically increasing task identifier.
pub type TaskId = u64;

/// Future returned by result-carrying submissions.
pub type TaskFuture<T> = BoxFuture<'static, Result<T, SchedulerError>>;

pub(crate) type OnceWork = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;
pub(crate) type RepeatWork = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync + 'static>;

// ── Task name ───────────────────────────────────────────────────

/// Display name of a task plus its (optional) owning module.
///
/// Module attribution is carried explicitly; it is never recovered by
/// parsing the label. Build attributed names with
/// [`ModuleHandle::task`](crate::ModuleHandle::task).
#[derive(Clone)]
pub struct TaskName {
    label: String,
    module: Option<Arc<ModuleRecord>>,
}

impl TaskName {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into(), module: None }
    }

    pub(crate) fn attributed(label: impl Into<String>, module: Arc<ModuleRecord>) -> Self {
        Self { label: label.into(), module: Some(module) }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn module_name(&self) -> Option<&str> {
        self.module.as_deref().map(ModuleRecord::name)
    }

    pub(crate) fn module(&self) -> Option<&Arc<ModuleRecord>> {
        self.module.as_ref()
    }

    /// Same module, label with `suffix` appended.
    pub fn with_suffix(&self, suffix: &str) -> TaskName {
        TaskName {
            label: format!("{}{}", self.label, suffix),
            module: self.module.clone(),
        }
    }
}

impl From<&str> for TaskName {
    fn from(label: &str) -> Self {
        TaskName::new(label)
    }
}

impl From<String> for TaskName {
    fn from(label: String) -> Self {
        TaskName::new(label)
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.module_name() {
            Some(module) => write!(f, "{}/{}", module, self.label),
            None => f.write_str(&self.label),
        }
    }
}

impl fmt::Debug for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskName")
            .field("label", &self.label)
            .field("module", &self.module_name())
            .finish()
    }
}

// ── Lifecycle ───────────────────────────────────────────────────

/// Lifecycle state observable through a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Rejected,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::Queued,
            1 => TaskState::Running,
            2 => TaskState::Completed,
            3 => TaskState::Failed,
            4 => TaskState::Cancelled,
            _ => TaskState::Rejected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TaskState::Queued => 0,
            TaskState::Running => 1,
            TaskState::Completed => 2,
            TaskState::Failed => 3,
            TaskState::Cancelled => 4,
            TaskState::Rejected => 5,
        }
    }
}

/// Mutable bookkeeping shared between an envelope and its handles.
#[derive(Debug)]
pub(crate) struct TaskControl {
    cancelled: AtomicBool,
    state: AtomicU8,
    executions: AtomicU64,
    next_run: Mutex<Option<Instant>>,
}

impl TaskControl {
    pub(crate) fn new(next_run: Option<Instant>) -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            state: AtomicU8::new(TaskState::Queued.as_u8()),
            executions: AtomicU64::new(0),
            next_run: Mutex::new(next_run),
        })
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn record_execution(&self) -> u64 {
        self.executions.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn executions(&self) -> u64 {
        self.executions.load(Ordering::Acquire)
    }

    pub(crate) fn next_run(&self) -> Option<Instant> {
        *self.next_run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_next_run(&self, at: Option<Instant>) {
        *self.next_run.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

// ── Envelope ────────────────────────────────────────────────────

pub(crate) enum Payload {
    Once(OnceWork),
    Repeating(RepeatWork),
}

/// A submitted unit of work, owned by the scheduler until it runs or is
/// discarded.
pub(crate) struct TaskEnvelope {
    pub(crate) id: TaskId,
    pub(crate) name: TaskName,
    pub(crate) priority: Priority,
    pub(crate) submitted_at: Instant,
    pub(crate) payload: Payload,
    pub(crate) retries_remaining: u32,
    /// Caller-facing deadline. Execution is never cut short by it.
    pub(crate) timeout_deadline: Option<Instant>,
    pub(crate) repeat_interval: Option<Duration>,
    pub(crate) control: Arc<TaskControl>,
}

impl TaskEnvelope {
    pub(crate) fn handle(&self) -> TaskHandle {
        TaskHandle {
            id: self.id,
            name: self.name.to_string(),
            priority: self.priority,
            control: Arc::clone(&self.control),
        }
    }
}

impl fmt::Debug for TaskEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEnvelope")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("retries_remaining", &self.retries_remaining)
            .field("timeout_deadline", &self.timeout_deadline)
            .field("repeat_interval", &self.repeat_interval)
            .field("state", &self.control.state())
            .finish_non_exhaustive()
    }
}

// ── Handles ─────────────────────────────────────────────────────

/// Caller-side view of a submitted task. Allows best-effort cancellation
/// and introspection, never direct mutation of scheduler state.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    name: String,
    priority: Priority,
    control: Arc<TaskControl>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Request cancellation. A queued task is discarded when reached; a
    /// running task finishes normally.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    pub fn state(&self) -> TaskState {
        self.control.state()
    }

    pub fn execution_count(&self) -> u64 {
        self.control.executions()
    }
}

/// Handle to a repeating task.
#[derive(Debug, Clone)]
pub struct RepeatHandle {
    inner: TaskHandle,
    interval: Duration,
}

impl RepeatHandle {
    pub(crate) fn new(inner: TaskHandle, interval: Duration) -> Self {
        Self { inner, interval }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id()
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stop future reschedules. An execution already in progress completes.
    pub fn stop(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// True while further executions are still expected.
    pub fn is_running(&self) -> bool {
        !self.inner.is_cancelled()
            && !matches!(self.inner.state(), TaskState::Cancelled | TaskState::Rejected)
    }

    pub fn execution_count(&self) -> u64 {
        self.inner.execution_count()
    }

    pub fn next_execution(&self) -> Option<Instant> {
        if self.is_running() {
            self.inner.control.next_run()
        } else {
            None
        }
    }

    pub fn state(&self) -> TaskState {
        self.inner.state()
    }
}

// ── Batches ─────────────────────────────────────────────────────

/// Several related steps executed as one logical task.
pub trait TaskBatch: Send + 'static {
    fn execute(&mut self) -> anyhow::Result<()>;

    fn description(&self) -> String;

    fn estimated_task_count(&self) -> usize {
        1
    }
}

/// Closure-list batch. Steps run in order; the first failure stops the batch.
pub struct FnBatch {
    description: String,
    steps: Vec<OnceWork>,
}

impl FnBatch {
    pub fn new(description: impl Into<String>) -> Self {
        Self { description: description.into(), steps: Vec::new() }
    }

    pub fn step<F>(mut self, f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.steps.push(Box::new(f));
        self
    }
}

impl TaskBatch for FnBatch {
    fn execute(&mut self) -> anyhow::Result<()> {
        for (i, step) in std::mem::take(&mut self.steps).into_iter().enumerate() {
            step().with_context(|| format!("batch '{}' step {} failed", self.description, i))?;
        }
        Ok(())
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn estimated_task_count(&self) -> usize {
        self.steps.len()
    }
}

impl fmt::Debug for FnBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnBatch")
            .field("description", &self.description)
            .field("steps", &self.steps.len())
            .finish()
    }
}

// ── Panic isolation ─────────────────────────────────────────────

/// A task body panicked. Carried inside `anyhow::Error` so the executor can
/// tell panics apart from ordinary failures.
#[derive(Debug, thiserror::Error)]
#[error("panicked: {0}")]
pub(crate) struct TaskPanic(String);

/// Run `f`, converting a panic into a [`TaskPanic`] error.
pub(crate) fn guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(TaskPanic(msg).into())
        }
    }
}
