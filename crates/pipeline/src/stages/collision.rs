use keystone_core::Shape;
use tracing::debug;

use crate::context::ComputationContext;
use crate::pipeline::PipelineShared;
use crate::result::ComputationResult;

use super::StageBody;

/// Default query radius when neither the context nor any unit gives one.
const DEFAULT_EXTENT: f64 = 1.0;

/// Resolve the computation's area against the frozen snapshot and, when
/// one is attached, the spatial index. Neither is ever mutated here.
pub(super) fn run(shared: &PipelineShared, ctx: &ComputationContext, result: &mut ComputationResult) -> StageBody {
    let shape = query_shape(ctx, result);
    let mut notes = Vec::new();

    if let Some(snapshot) = ctx.collision_snapshot() {
        let max_age = shared.config.snapshot_max_age();
        if snapshot.is_expired(max_age) {
            notes.push(format!("snapshot older than {max_age:?}, ignored"));
        } else {
            let report = shared.collisions.query_collisions(snapshot, &shape);
            notes.push(format!("{} of {} snapshot entities hit", report.entities.len(), snapshot.len()));
            result.collisions.entities.extend(report.entities);
            result.collisions.impact_points.extend(report.impact_points);
            result.collisions.overlapping_shapes.extend(report.overlapping_shapes);
        }
    }

    if let Some(index) = &shared.index {
        let overlapping = index.query_intersecting(&shape);
        notes.push(format!("{} indexed shapes overlap", overlapping.len()));
        for id in overlapping {
            if !result.collisions.overlapping_shapes.contains(&id) {
                result.collisions.overlapping_shapes.push(id);
            }
        }
    }

    debug!(
        id = %result.id,
        entities = result.collisions.entities.len(),
        shapes = result.collisions.overlapping_shapes.len(),
        "Collisions resolved"
    );
    Ok(notes)
}

/// The context's area, else a sphere at the origin sized by the largest
/// `extent` any unit reported, shifted by the units' collision deltas.
fn query_shape(ctx: &ComputationContext, result: &ComputationResult) -> Shape {
    if let Some(area) = ctx.area() {
        return area;
    }
    let extent = result
        .successful_units()
        .filter_map(|u| u.value("extent"))
        .fold(DEFAULT_EXTENT, f64::max);
    let center = result
        .successful_units()
        .flat_map(|u| u.collision_deltas.iter().copied())
        .fold(ctx.origin(), |acc, delta| acc + delta);
    Shape::sphere(center, extent)
}
