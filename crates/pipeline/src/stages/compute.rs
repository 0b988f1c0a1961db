use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::trace;

use crate::context::{CancelFlag, ComputationContext, ParamValue};
use crate::error::StageError;
use crate::hooks::UnitComputation;
use crate::pipeline::PipelineShared;
use crate::result::{ComputationResult, UnitResult};

use super::{panic_message, StageBody};

/// Run every unit the context's parameters call for. Small plans run
/// inline; larger ones fan out over the compute pool this stage is already
/// running on and join before returning.
pub(super) fn run(
    shared: &PipelineShared,
    ctx: &ComputationContext,
    result: &mut ComputationResult,
    cancel: &CancelFlag,
) -> StageBody {
    let plan = shared.units.plan(ctx);
    let total = plan.len();
    if total == 0 {
        return Ok(vec!["no registered unit for any parameter".to_string()]);
    }

    let run_one = |(unit, value): &(Arc<dyn UnitComputation>, ParamValue)| {
        (!cancel.is_cancelled()).then(|| run_unit(unit.as_ref(), ctx, value, cancel))
    };
    let inline = total <= shared.config.sequential_threshold;
    let outputs: Vec<Option<UnitResult>> = if inline {
        plan.iter().map(run_one).collect()
    } else {
        plan.par_iter().map(run_one).collect()
    };

    let mut notes = vec![format!("{total} units {}", if inline { "inline" } else { "in parallel" })];
    let ran = outputs.iter().flatten().count();
    if ran < total {
        result.cancelled = true;
        notes.push(format!("cancelled after {ran} of {total} units"));
    }
    let failed = outputs.iter().flatten().filter(|u| !u.is_ok()).count();
    result.units.extend(outputs.into_iter().flatten());

    if ran > 0 && failed == ran {
        return Err(StageError::Failed(format!("all {ran} units failed")));
    }
    if failed > 0 {
        notes.push(format!("{failed} of {ran} units failed"));
    }
    Ok(notes)
}

/// One unit, with errors and panics captured into its result slot.
fn run_unit(unit: &dyn UnitComputation, ctx: &ComputationContext, value: &ParamValue, cancel: &CancelFlag) -> UnitResult {
    let key = unit.key();
    trace!(id = %ctx.id(), unit = key, "Computing unit");
    match panic::catch_unwind(AssertUnwindSafe(|| unit.compute(ctx, value, cancel))) {
        Ok(Ok(mut out)) => {
            if out.key.is_empty() {
                out.key = key.to_string();
            }
            out
        }
        Ok(Err(err)) => UnitResult::failed(key, format!("{err:#}")),
        Err(payload) => UnitResult::failed(key, format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}
