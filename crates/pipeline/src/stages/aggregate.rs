use crate::pipeline::PipelineShared;
use crate::result::{Aggregate, ComputationResult, EffectTier};

use super::StageBody;

/// Merge per-unit values into the final aggregate and decide whether the
/// authoritative thread has anything to apply.
///
/// Unit value keys read here: `magnitude` (summed), `magnitude_multiplier`
/// (multiplied), `extent` (max) and `intensity_bonus` (summed).
pub(super) fn run(shared: &PipelineShared, result: &mut ComputationResult) -> StageBody {
    let mut total_magnitude = 0.0;
    let mut magnitude_multiplier = 1.0;
    let mut extent: f64 = 0.0;
    let mut bonus = 0.0;
    for unit in result.successful_units() {
        total_magnitude += unit.value("magnitude").unwrap_or(0.0);
        magnitude_multiplier *= unit.value("magnitude_multiplier").unwrap_or(1.0);
        extent = extent.max(unit.value("extent").unwrap_or(0.0));
        bonus += unit.value("intensity_bonus").unwrap_or(0.0);
    }

    let intensity = total_magnitude * magnitude_multiplier + extent * 10.0 + bonus;
    let config = &shared.config;
    let tier = if intensity > config.epic_threshold {
        EffectTier::Epic
    } else if intensity > config.enhanced_threshold {
        EffectTier::Enhanced
    } else {
        EffectTier::Basic
    };
    result.aggregate = Some(Aggregate { total_magnitude, magnitude_multiplier, extent, intensity, tier });

    let blocked = result.cancelled || result.resources_denied() || !result.failed_stages().is_empty();
    let requested = result.successful_units().any(|u| u.needs_application) || !result.collisions.is_empty();
    result.needs_application = requested && !blocked;

    Ok(vec![format!("intensity {intensity:.1} ({tier:?})")])
}
