//! Stage bodies and the pools they run on.
//!
//! - `compute`: unit computations, inline or fanned out over the compute pool
//! - `resource`: budget validation through the resource gate
//! - `collision`: snapshot and index queries for the computation's area
//! - `aggregate`: final scalars, tier and the application decision

mod aggregate;
mod collision;
mod compute;
mod resource;

use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::context::{CancelFlag, ComputationContext};
use crate::error::{PipelineError, StageError};
use crate::pipeline::PipelineShared;
use crate::result::{ComputationResult, Stage, StageOutcome, StageResult};

/// One pool per stage. Compute is a fixed-size pool; the others have a
/// single worker so each serializes access to its collaborator.
pub(crate) struct StagePools {
    compute: ThreadPool,
    resource: ThreadPool,
    collision: ThreadPool,
    aggregation: ThreadPool,
}

impl StagePools {
    pub(crate) fn build(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let compute = ThreadPoolBuilder::new()
            .num_threads(config.compute_threads)
            .thread_name(|i| format!("keystone-compute-{i}"))
            .build()?;
        Ok(Self {
            compute,
            resource: single("keystone-resource")?,
            collision: single("keystone-collision")?,
            aggregation: single("keystone-aggregation")?,
        })
    }

    pub(crate) fn get(&self, stage: Stage) -> &ThreadPool {
        match stage {
            Stage::Compute => &self.compute,
            Stage::Resource => &self.resource,
            Stage::Collision => &self.collision,
            Stage::Aggregation => &self.aggregation,
        }
    }

    pub(crate) fn compute_threads(&self) -> usize {
        self.compute.current_num_threads()
    }
}

fn single(name: &'static str) -> Result<ThreadPool, PipelineError> {
    Ok(ThreadPoolBuilder::new().num_threads(1).thread_name(move |_| name.to_string()).build()?)
}

/// Body result: notes on success, a stage error otherwise.
type StageBody = Result<Vec<String>, StageError>;

/// Run `stage` on the calling thread and append its [`StageResult`].
///
/// Dependent work is skipped when an earlier stage failed, resources were
/// denied or the computation was cancelled. Panics are caught and recorded.
pub(crate) fn run_stage(
    stage: Stage,
    shared: &PipelineShared,
    ctx: &ComputationContext,
    result: &mut ComputationResult,
    cancel: &CancelFlag,
) {
    let started = Instant::now();
    if cancel.is_cancelled() {
        result.cancelled = true;
    }

    let (outcome, notes) = match skip_reason(stage, shared, ctx, result) {
        Some(reason) => {
            debug!(id = %result.id, %stage, %reason, "Stage skipped");
            (StageOutcome::Skipped { reason }, Vec::new())
        }
        None => match panic::catch_unwind(AssertUnwindSafe(|| body(stage, shared, ctx, result, cancel))) {
            Ok(Ok(notes)) => (StageOutcome::Completed, notes),
            Ok(Err(error)) => (StageOutcome::Failed { error }, Vec::new()),
            Err(payload) => {
                let error = StageError::Panicked(panic_message(payload.as_ref()));
                (StageOutcome::Failed { error }, Vec::new())
            }
        },
    };

    if let StageOutcome::Failed { error } = &outcome {
        warn!(id = %result.id, %stage, %error, "Stage failed");
    }
    result.stages.push(StageResult { stage, outcome, duration: started.elapsed(), notes });
}

fn body(
    stage: Stage,
    shared: &PipelineShared,
    ctx: &ComputationContext,
    result: &mut ComputationResult,
    cancel: &CancelFlag,
) -> StageBody {
    match stage {
        Stage::Compute => compute::run(shared, ctx, result, cancel),
        Stage::Resource => resource::run(shared, ctx, result),
        Stage::Collision => collision::run(shared, ctx, result),
        Stage::Aggregation => aggregate::run(shared, result),
    }
}

fn skip_reason(stage: Stage, shared: &PipelineShared, ctx: &ComputationContext, result: &ComputationResult) -> Option<String> {
    if result.cancelled && stage != Stage::Aggregation {
        return Some("cancelled".to_string());
    }
    let compute_failed = result.stage(Stage::Compute).is_some_and(StageResult::is_failed);
    match stage {
        Stage::Compute | Stage::Aggregation => None,
        Stage::Resource if compute_failed => Some("compute stage failed".to_string()),
        Stage::Resource => None,
        Stage::Collision => {
            if compute_failed {
                Some("compute stage failed".to_string())
            } else if result.stage(Stage::Resource).is_some_and(StageResult::is_failed) {
                Some("resource stage failed".to_string())
            } else if result.resources_denied() {
                Some("resources denied".to_string())
            } else if ctx.collision_snapshot().is_none() && shared.index.is_none() {
                Some("no collision data".to_string())
            } else {
                None
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
