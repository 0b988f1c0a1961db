use tracing::debug;

use crate::context::ComputationContext;
use crate::error::StageError;
use crate::pipeline::PipelineShared;
use crate::result::{ComputationResult, ResourceOutcome};

use super::StageBody;

/// Ask the resource gate to validate and reserve the context's budget.
/// A denial is a normal outcome; only a gate error fails the stage.
pub(super) fn run(shared: &PipelineShared, ctx: &ComputationContext, result: &mut ComputationResult) -> StageBody {
    let outcome = shared
        .resources
        .validate_and_reserve(ctx, result)
        .map_err(|e| StageError::Failed(format!("{e:#}")))?;

    let note = match &outcome {
        ResourceOutcome::Approved { reserved } => format!("reserved {reserved} {}", ctx.budget().resource),
        ResourceOutcome::Denied { reason } => {
            debug!(id = %ctx.id(), %reason, "Resources denied");
            format!("denied: {reason}")
        }
    };
    result.reservation = Some(outcome);
    Ok(vec![note])
}
