//! Collaborator seams. Domain layers plug unit computations, resource
//! accounting, collision queries and authoritative application in here.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use keystone_core::Shape;
use tracing::info;

use crate::context::{CancelFlag, CollisionSnapshot, ComputationContext, ParamValue};
use crate::result::{CollisionReport, ComputationResult, EntityHit, ResourceOutcome, UnitResult};

// ── Unit computations ───────────────────────────────────────────

/// A pure computation over one context parameter.
///
/// Runs on a compute worker. Must not touch live world state; long-running
/// implementations should poll `cancel`.
pub trait UnitComputation: Send + Sync {
    /// Parameter key this unit handles.
    fn key(&self) -> &str;

    /// Lower runs first.
    fn order(&self) -> i32 {
        0
    }

    fn compute(&self, ctx: &ComputationContext, value: &ParamValue, cancel: &CancelFlag) -> anyhow::Result<UnitResult>;
}

/// Unit computations keyed by the parameter they consume.
#[derive(Clone, Default)]
pub struct ComputationRegistry {
    units: HashMap<String, Arc<dyn UnitComputation>>,
}

impl ComputationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `unit`, replacing any unit with the same key.
    pub fn register(&mut self, unit: impl UnitComputation + 'static) {
        self.units.insert(unit.key().to_string(), Arc::new(unit));
    }

    pub fn get(&self, key: &str) -> Option<&Arc<dyn UnitComputation>> {
        self.units.get(key)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Units to run for `ctx`, ordered by `order()` then key. Parameters
    /// with no registered unit are ignored.
    pub(crate) fn plan(&self, ctx: &ComputationContext) -> Vec<(Arc<dyn UnitComputation>, ParamValue)> {
        let mut plan: Vec<_> = ctx
            .parameters()
            .iter()
            .filter_map(|(key, value)| self.units.get(key).map(|u| (Arc::clone(u), value.clone())))
            .collect();
        plan.sort_by(|(a, _), (b, _)| a.order().cmp(&b.order()).then_with(|| a.key().cmp(b.key())));
        plan
    }
}

impl fmt::Debug for ComputationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.units.keys().collect();
        keys.sort();
        f.debug_struct("ComputationRegistry").field("units", &keys).finish()
    }
}

// ── Resources ───────────────────────────────────────────────────

/// Validates and reserves the context's budget. Actual pool mutation is
/// the implementor's business.
pub trait ResourceGate: Send + Sync {
    fn validate_and_reserve(&self, ctx: &ComputationContext, result: &ComputationResult) -> anyhow::Result<ResourceOutcome>;
}

/// Approves every request at its stated cost.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedResources;

impl ResourceGate for UnlimitedResources {
    fn validate_and_reserve(&self, ctx: &ComputationContext, _result: &ComputationResult) -> anyhow::Result<ResourceOutcome> {
        Ok(ResourceOutcome::Approved { reserved: ctx.budget().cost })
    }
}

// ── Collisions ──────────────────────────────────────────────────

pub trait CollisionQuery: Send + Sync {
    fn query_collisions(&self, snapshot: &CollisionSnapshot, shape: &Shape) -> CollisionReport;
}

/// Bounding-box overlap against the snapshot's living entities. The impact
/// point is the midpoint between the shape centre and the entity.
#[derive(Debug, Default, Clone, Copy)]
pub struct SnapshotCollisions;

impl CollisionQuery for SnapshotCollisions {
    fn query_collisions(&self, snapshot: &CollisionSnapshot, shape: &Shape) -> CollisionReport {
        let area = shape.bounding_box();
        let center = shape.center();
        let mut report = CollisionReport::default();
        for entity in snapshot.entities().iter().filter(|e| e.living && e.bounds.intersects(&area)) {
            report.push_hit(EntityHit {
                id: entity.id,
                kind: entity.kind.clone(),
                position: entity.position,
                impact_point: center.midpoint(entity.position),
            });
        }
        report
    }
}

// ── Application ─────────────────────────────────────────────────

/// Applies a finished result. Only ever called on the authoritative thread,
/// from inside the scheduler's drain pass.
pub trait Applier: Send + Sync {
    fn apply(&self, result: &ComputationResult) -> anyhow::Result<()>;
}

/// Logs the result and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingApplier;

impl Applier for LoggingApplier {
    fn apply(&self, result: &ComputationResult) -> anyhow::Result<()> {
        info!(
            id = %result.id,
            kind = %result.kind,
            units = result.units.len(),
            hits = result.collisions.entities.len(),
            tier = ?result.aggregate.as_ref().map(|a| a.tier),
            "Applied computation"
        );
        Ok(())
    }
}

impl<F> Applier for F
where
    F: Fn(&ComputationResult) -> anyhow::Result<()> + Send + Sync,
{
    fn apply(&self, result: &ComputationResult) -> anyhow::Result<()> {
        self(result)
    }
}

#[cfg(test)]
mod tests {
    use keystone_core::Vec3;
    use uuid::Uuid;

    use super::*;
    use crate::context::EntitySnapshot;

    struct Fixed {
        key: &'static str,
        order: i32,
    }

    impl UnitComputation for Fixed {
        fn key(&self) -> &str {
            self.key
        }

        fn order(&self) -> i32 {
            self.order
        }

        fn compute(&self, _ctx: &ComputationContext, _value: &ParamValue, _cancel: &CancelFlag) -> anyhow::Result<UnitResult> {
            Ok(UnitResult::new(self.key))
        }
    }

    #[test]
    fn plan_orders_units_and_ignores_unknown_params() {
        let mut registry = ComputationRegistry::new();
        registry.register(Fixed { key: "shape", order: 0 });
        registry.register(Fixed { key: "damage", order: 10 });
        registry.register(Fixed { key: "element", order: 0 });

        let ctx = ComputationContext::builder("bolt")
            .param("damage", 4.0)
            .param("shape", "cone")
            .param("element", "ice")
            .param("cosmetic", true)
            .build();
        let keys: Vec<String> = registry.plan(&ctx).iter().map(|(u, _)| u.key().to_string()).collect();
        assert_eq!(keys, vec!["element", "shape", "damage"]);
    }

    #[test]
    fn snapshot_collisions_use_midpoint() {
        let zombie = EntitySnapshot::new(Uuid::new_v4(), "zombie", Vec3::new(4.0, 0.0, 0.0), 0.5);
        let mut dead = EntitySnapshot::new(Uuid::new_v4(), "ghost", Vec3::new(1.0, 0.0, 0.0), 0.5);
        dead.living = false;
        let far = EntitySnapshot::new(Uuid::new_v4(), "cow", Vec3::new(9.0, 0.0, 0.0), 0.5);
        let snapshot = CollisionSnapshot::capture(Vec3::ZERO, 10.0, [zombie.clone(), dead, far]);

        let report = SnapshotCollisions.query_collisions(&snapshot, &Shape::sphere(Vec3::ZERO, 4.0));
        assert_eq!(report.entities.len(), 1);
        assert_eq!(report.entities[0].id, zombie.id);
        assert_eq!(report.impact_points, vec![Vec3::new(2.0, 0.0, 0.0)]);
    }

    #[test]
    fn unlimited_resources_reserve_stated_cost() {
        let ctx = ComputationContext::builder("heal")
            .budget(crate::context::ResourceBudget::new("mana", 7.5))
            .build();
        let result = ComputationResult::new(&ctx);
        assert_eq!(
            UnlimitedResources.validate_and_reserve(&ctx, &result).unwrap(),
            ResourceOutcome::Approved { reserved: 7.5 }
        );
    }
}
