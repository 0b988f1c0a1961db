use keystone_core::ConfigError;
use keystone_scheduler::SchedulerError;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Failures surfaced through a [`ComputationTicket`](crate::ComputationTicket)
/// or while building a pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The authoritative apply task was rejected, failed or dropped.
    #[error("apply task: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("computation {0} was cancelled")]
    Cancelled(Uuid),

    /// A stage thread went away without handing the result on.
    #[error("computation {0} was abandoned before reaching the scheduler")]
    Abandoned(Uuid),

    #[error("failed to build stage pool: {0}")]
    PoolBuild(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Why a single stage did not complete. Recorded in the result; never
/// propagated out of the stage.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum StageError {
    #[error("{0}")]
    Failed(String),

    #[error("panicked: {0}")]
    Panicked(String),
}
