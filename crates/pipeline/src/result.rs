//! Accumulating output of a pipeline run. Ownership moves stage to stage;
//! no two stages ever hold the same result.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use keystone_core::Vec3;
use keystone_spatial::ShapeId;
use serde::Serialize;
use uuid::Uuid;

use crate::context::ComputationContext;
use crate::error::StageError;

// ── Units ───────────────────────────────────────────────────────

/// Output of one unit computation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UnitResult {
    pub key: String,
    pub values: BTreeMap<String, f64>,
    /// Offsets the collision stage should account for.
    pub collision_deltas: Vec<Vec3>,
    pub needs_collision_update: bool,
    pub needs_application: bool,
    pub error: Option<String>,
}

impl UnitResult {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into(), ..Self::default() }
    }

    pub fn failed(key: impl Into<String>, error: impl Into<String>) -> Self {
        Self { key: key.into(), error: Some(error.into()), ..Self::default() }
    }

    pub fn with_value(mut self, name: impl Into<String>, value: f64) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn with_collision_delta(mut self, delta: Vec3) -> Self {
        self.collision_deltas.push(delta);
        self.needs_collision_update = true;
        self
    }

    pub fn requires_collision_update(mut self) -> Self {
        self.needs_collision_update = true;
        self
    }

    pub fn requires_application(mut self) -> Self {
        self.needs_application = true;
        self
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

// ── Stages ──────────────────────────────────────────────────────

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Compute,
    Resource,
    Collision,
    Aggregation,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Compute, Stage::Resource, Stage::Collision, Stage::Aggregation];

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Compute => Some(Stage::Resource),
            Stage::Resource => Some(Stage::Collision),
            Stage::Collision => Some(Stage::Aggregation),
            Stage::Aggregation => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Compute => "compute",
            Stage::Resource => "resource",
            Stage::Collision => "collision",
            Stage::Aggregation => "aggregation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Completed,
    Skipped { reason: String },
    Failed { error: StageError },
}

#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: Stage,
    pub outcome: StageOutcome,
    pub duration: Duration,
    pub notes: Vec<String>,
}

impl StageResult {
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, StageOutcome::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, StageOutcome::Skipped { .. })
    }
}

// ── Resource, collision, aggregate ──────────────────────────────

/// Verdict of the resource gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ResourceOutcome {
    Approved { reserved: f64 },
    Denied { reason: String },
}

/// One entity touched by the computation's area.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityHit {
    pub id: Uuid,
    pub kind: String,
    pub position: Vec3,
    pub impact_point: Vec3,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollisionReport {
    pub entities: Vec<EntityHit>,
    pub impact_points: Vec<Vec3>,
    /// Index shapes overlapping the area.
    pub overlapping_shapes: Vec<ShapeId>,
}

impl CollisionReport {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.overlapping_shapes.is_empty()
    }

    pub fn push_hit(&mut self, hit: EntityHit) {
        self.impact_points.push(hit.impact_point);
        self.entities.push(hit);
    }
}

/// Presentation tier picked from aggregate intensity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectTier {
    Basic,
    Enhanced,
    Epic,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregate {
    pub total_magnitude: f64,
    pub magnitude_multiplier: f64,
    pub extent: f64,
    pub intensity: f64,
    pub tier: EffectTier,
}

// ── Result ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ComputationResult {
    pub id: Uuid,
    pub kind: String,
    pub units: Vec<UnitResult>,
    pub stages: Vec<StageResult>,
    pub reservation: Option<ResourceOutcome>,
    pub collisions: CollisionReport,
    pub aggregate: Option<Aggregate>,
    pub needs_application: bool,
    pub cancelled: bool,
}

impl ComputationResult {
    pub fn new(ctx: &ComputationContext) -> Self {
        Self {
            id: ctx.id(),
            kind: ctx.kind().to_string(),
            units: Vec::new(),
            stages: Vec::with_capacity(Stage::ALL.len()),
            reservation: None,
            collisions: CollisionReport::default(),
            aggregate: None,
            needs_application: false,
            cancelled: false,
        }
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn failed_stages(&self) -> Vec<Stage> {
        self.stages.iter().filter(|s| s.is_failed()).map(|s| s.stage).collect()
    }

    /// True when any stage failed or any unit reported an error.
    pub fn has_errors(&self) -> bool {
        self.stages.iter().any(StageResult::is_failed) || self.units.iter().any(|u| !u.is_ok())
    }

    pub fn successful_units(&self) -> impl Iterator<Item = &UnitResult> {
        self.units.iter().filter(|u| u.is_ok())
    }

    pub fn needs_collision_update(&self) -> bool {
        self.successful_units().any(|u| u.needs_collision_update)
    }

    pub fn resources_denied(&self) -> bool {
        matches!(self.reservation, Some(ResourceOutcome::Denied { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order() {
        let mut order = vec![Stage::Compute];
        while let Some(next) = order.last().and_then(|s| s.next()) {
            order.push(next);
        }
        assert_eq!(order, Stage::ALL.to_vec());
    }

    #[test]
    fn errors_come_from_units_or_stages() {
        let ctx = ComputationContext::builder("probe").build();
        let mut result = ComputationResult::new(&ctx);
        assert!(!result.has_errors());

        result.units.push(UnitResult::new("a").with_value("magnitude", 3.0));
        result.units.push(UnitResult::failed("b", "bad input"));
        assert!(result.has_errors());
        assert_eq!(result.successful_units().count(), 1);

        result.units.pop();
        result.stages.push(StageResult {
            stage: Stage::Resource,
            outcome: StageOutcome::Failed { error: StageError::Failed("pool offline".into()) },
            duration: Duration::ZERO,
            notes: Vec::new(),
        });
        assert_eq!(result.failed_stages(), vec![Stage::Resource]);
    }

    #[test]
    fn collision_hits_record_impact_points() {
        let mut report = CollisionReport::default();
        assert!(report.is_empty());
        report.push_hit(EntityHit {
            id: Uuid::new_v4(),
            kind: "zombie".into(),
            position: Vec3::new(2.0, 0.0, 0.0),
            impact_point: Vec3::new(1.0, 0.0, 0.0),
        });
        assert_eq!(report.impact_points, vec![Vec3::new(1.0, 0.0, 0.0)]);
        assert!(!report.is_empty());
    }
}
