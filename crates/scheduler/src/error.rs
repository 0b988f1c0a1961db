use std::time::Duration;

use thiserror::Error;

/// Failures surfaced through task futures and the module-management API.
///
/// Nothing here is ever raised across a fire-and-forget submission; those
/// report through monitoring only.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchedulerError {
    #[error("submission rejected for task '{task}': {reason}")]
    SubmissionRejected { task: String, reason: String },

    #[error("task '{task}' failed: {cause}")]
    TaskExecutionFailed { task: String, cause: String },

    #[error("task '{task}' timed out after {timeout:?}")]
    TimeoutExceeded { task: String, timeout: Duration },

    #[error("task '{task}' failed after {attempts} attempts: {last_cause}")]
    RetryExhausted { task: String, attempts: u32, last_cause: String },

    #[error("task '{task}' was cancelled before it ran")]
    Cancelled { task: String },

    #[error("invalid weights: {0}")]
    InvalidWeights(String),

    #[error("unknown module: {0}")]
    UnknownModule(String),
}
