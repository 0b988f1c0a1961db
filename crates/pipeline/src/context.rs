//! Immutable computation input. Everything in a [`ComputationContext`] is a
//! copied value; nothing refers back to live world state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use keystone_core::{Aabb, Shape, Vec3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Parameters ──────────────────────────────────────────────────

/// A single named input to a unit computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Numeric view: booleans map to 0/1, text has none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            ParamValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(i64::from(v))
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

/// Cost the resource stage is asked to validate and reserve.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceBudget {
    pub resource: String,
    pub cost: f64,
}

impl ResourceBudget {
    pub fn new(resource: impl Into<String>, cost: f64) -> Self {
        Self { resource: resource.into(), cost }
    }
}

// ── Collision snapshot ──────────────────────────────────────────

/// Frozen copy of one entity near the computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: Uuid,
    pub kind: String,
    pub position: Vec3,
    pub bounds: Aabb,
    pub living: bool,
}

impl EntitySnapshot {
    /// Entity occupying a cube of edge `2 * half` around `position`.
    pub fn new(id: Uuid, kind: impl Into<String>, position: Vec3, half: f64) -> Self {
        Self {
            id,
            kind: kind.into(),
            position,
            bounds: Aabb::around(position, half),
            living: true,
        }
    }
}

/// Read-only view of nearby spatial state, captured on the authoritative
/// thread at submission time.
#[derive(Debug, Clone)]
pub struct CollisionSnapshot {
    captured_at: Instant,
    bounds: Aabb,
    entities: Vec<EntitySnapshot>,
}

impl CollisionSnapshot {
    /// Keep the entities whose bounds touch the cube of half-size `radius`
    /// around `center`, padded by one unit.
    pub fn capture(center: Vec3, radius: f64, entities: impl IntoIterator<Item = EntitySnapshot>) -> Self {
        let bounds = Aabb::around(center, radius.abs()).inflate(1.0);
        let entities = entities.into_iter().filter(|e| e.bounds.intersects(&bounds)).collect();
        Self { captured_at: Instant::now(), bounds, entities }
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    pub fn entities(&self) -> &[EntitySnapshot] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn is_expired(&self, max_age: Duration) -> bool {
        self.captured_at.elapsed() > max_age
    }
}

// ── Cancellation ────────────────────────────────────────────────

/// Cooperative cancellation flag shared by a ticket and its stages.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ── Context ─────────────────────────────────────────────────────

#[derive(Debug)]
struct ContextInner {
    id: Uuid,
    kind: String,
    origin: Vec3,
    yaw: f64,
    pitch: f64,
    issued_at: u64,
    parameters: BTreeMap<String, ParamValue>,
    flags: BTreeSet<String>,
    budget: ResourceBudget,
    area: Option<Shape>,
    collision_snapshot: Option<Arc<CollisionSnapshot>>,
}

/// Immutable input to one pipeline run. Cheap to clone.
#[derive(Clone)]
pub struct ComputationContext {
    inner: Arc<ContextInner>,
}

impl ComputationContext {
    pub fn builder(kind: impl Into<String>) -> ContextBuilder {
        ContextBuilder {
            inner: ContextInner {
                id: Uuid::new_v4(),
                kind: kind.into(),
                origin: Vec3::ZERO,
                yaw: 0.0,
                pitch: 0.0,
                issued_at: 0,
                parameters: BTreeMap::new(),
                flags: BTreeSet::new(),
                budget: ResourceBudget::default(),
                area: None,
                collision_snapshot: None,
            },
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    pub fn origin(&self) -> Vec3 {
        self.inner.origin
    }

    pub fn yaw(&self) -> f64 {
        self.inner.yaw
    }

    pub fn pitch(&self) -> f64 {
        self.inner.pitch
    }

    /// Unit direction derived from yaw and pitch.
    pub fn direction(&self) -> Vec3 {
        Vec3::from_rotation(self.inner.yaw, self.inner.pitch)
    }

    /// Simulation tick at which the computation was issued.
    pub fn issued_at(&self) -> u64 {
        self.inner.issued_at
    }

    pub fn parameters(&self) -> &BTreeMap<String, ParamValue> {
        &self.inner.parameters
    }

    pub fn param(&self, key: &str) -> Option<&ParamValue> {
        self.inner.parameters.get(key)
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.inner.flags.contains(flag)
    }

    pub fn flags(&self) -> &BTreeSet<String> {
        &self.inner.flags
    }

    pub fn budget(&self) -> &ResourceBudget {
        &self.inner.budget
    }

    pub fn area(&self) -> Option<Shape> {
        self.inner.area
    }

    pub fn collision_snapshot(&self) -> Option<&Arc<CollisionSnapshot>> {
        self.inner.collision_snapshot.as_ref()
    }
}

impl fmt::Debug for ComputationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputationContext")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("parameters", &self.inner.parameters.len())
            .field("snapshot", &self.inner.collision_snapshot.as_ref().map(|s| s.len()))
            .finish_non_exhaustive()
    }
}

/// Builder for [`ComputationContext`].
#[derive(Debug)]
pub struct ContextBuilder {
    inner: ContextInner,
}

impl ContextBuilder {
    pub fn origin(mut self, origin: Vec3) -> Self {
        self.inner.origin = origin;
        self
    }

    pub fn rotation(mut self, yaw: f64, pitch: f64) -> Self {
        self.inner.yaw = yaw;
        self.inner.pitch = pitch;
        self
    }

    pub fn issued_at(mut self, tick: u64) -> Self {
        self.inner.issued_at = tick;
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.inner.parameters.insert(key.into(), value.into());
        self
    }

    pub fn flag(mut self, flag: impl Into<String>) -> Self {
        self.inner.flags.insert(flag.into());
        self
    }

    pub fn budget(mut self, budget: ResourceBudget) -> Self {
        self.inner.budget = budget;
        self
    }

    pub fn area(mut self, area: Shape) -> Self {
        self.inner.area = Some(area);
        self
    }

    pub fn collision_snapshot(mut self, snapshot: CollisionSnapshot) -> Self {
        self.inner.collision_snapshot = Some(Arc::new(snapshot));
        self
    }

    pub fn build(self) -> ComputationContext {
        ComputationContext { inner: Arc::new(self.inner) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_inputs() {
        let ctx = ComputationContext::builder("fireball")
            .origin(Vec3::new(1.0, 2.0, 3.0))
            .issued_at(40)
            .param("power", 12.5)
            .param("charges", 3i64)
            .param("element", "fire")
            .flag("charged")
            .budget(ResourceBudget::new("mana", 20.0))
            .build();

        assert_eq!(ctx.kind(), "fireball");
        assert_eq!(ctx.issued_at(), 40);
        assert_eq!(ctx.param("power").and_then(ParamValue::as_f64), Some(12.5));
        assert_eq!(ctx.param("charges").and_then(ParamValue::as_f64), Some(3.0));
        assert_eq!(ctx.param("element").and_then(ParamValue::as_str), Some("fire"));
        assert!(ctx.has_flag("charged"));
        assert_eq!(ctx.budget().cost, 20.0);
        assert!(ctx.collision_snapshot().is_none());

        let copy = ctx.clone();
        assert_eq!(copy.id(), ctx.id());
    }

    #[test]
    fn snapshot_keeps_only_nearby_entities() {
        let near = EntitySnapshot::new(Uuid::new_v4(), "zombie", Vec3::new(2.0, 0.0, 0.0), 0.5);
        let edge = EntitySnapshot::new(Uuid::new_v4(), "skeleton", Vec3::new(6.4, 0.0, 0.0), 0.5);
        let far = EntitySnapshot::new(Uuid::new_v4(), "cow", Vec3::new(40.0, 0.0, 0.0), 0.5);

        let snapshot = CollisionSnapshot::capture(Vec3::ZERO, 5.0, [near.clone(), edge, far]);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.entities()[0], near);
        assert!(!snapshot.is_expired(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(2));
        assert!(snapshot.is_expired(Duration::from_millis(1)));
    }

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        other.cancel();
        assert!(flag.is_cancelled());
    }
}
