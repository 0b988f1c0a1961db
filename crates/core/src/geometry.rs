//! Plain-value geometry shared by the spatial index and the computation
//! pipeline. Everything here is `Copy` and free of interior mutability so it
//! can cross thread boundaries inside immutable snapshots.

use std::ops::{Add, Mul, Sub};

use serde::{Deserialize, Serialize};

/// A point or direction in world space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn length(self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn distance(self, other: Vec3) -> f64 {
        (self - other).length()
    }

    /// Point halfway between `self` and `other`.
    pub fn midpoint(self, other: Vec3) -> Vec3 {
        (self + other) * 0.5
    }

    /// Unit vector for a yaw/pitch pair given in degrees.
    pub fn from_rotation(yaw: f64, pitch: f64) -> Vec3 {
        let (yaw, pitch) = (yaw.to_radians(), pitch.to_radians());
        Vec3::new(-yaw.sin() * pitch.cos(), -pitch.sin(), yaw.cos() * pitch.cos())
    }
}

impl Add for Vec3 {
    type Output = Vec3;
    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;
    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f64> for Vec3 {
    type Output = Vec3;
    fn mul(self, rhs: f64) -> Vec3 {
        Vec3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

// ── Axis-aligned bounding box ───────────────────────────────────

/// Axis-aligned bounding box. Bounds are inclusive on every face.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Build a box from two opposite corners in any order.
    pub fn new(a: Vec3, b: Vec3) -> Self {
        Self {
            min: Vec3::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: Vec3::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    /// Cube of half-extent `half` centred on `center`.
    pub fn around(center: Vec3, half: f64) -> Self {
        let h = half.abs();
        Self::new(center - Vec3::new(h, h, h), center + Vec3::new(h, h, h))
    }

    pub fn center(&self) -> Vec3 {
        self.min.midpoint(self.max)
    }

    /// Grow the box by `amount` on every side.
    pub fn inflate(&self, amount: f64) -> Aabb {
        let d = Vec3::new(amount, amount, amount);
        Aabb::new(self.min - d, self.max + d)
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    pub fn contains(&self, p: Vec3) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    /// Closest point of the box to `p`.
    pub fn clamp(&self, p: Vec3) -> Vec3 {
        Vec3::new(
            p.x.clamp(self.min.x, self.max.x),
            p.y.clamp(self.min.y, self.max.y),
            p.z.clamp(self.min.z, self.max.z),
        )
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: Vec3::new(self.min.x.min(other.min.x), self.min.y.min(other.min.y), self.min.z.min(other.min.z)),
            max: Vec3::new(self.max.x.max(other.max.x), self.max.y.max(other.max.y), self.max.z.max(other.max.z)),
        }
    }
}

// ── Shapes ──────────────────────────────────────────────────────

/// The closed set of shapes the index and collision stage understand.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Shape {
    Box(Aabb),
    Sphere { center: Vec3, radius: f64 },
    Point(Vec3),
}

impl Shape {
    pub fn sphere(center: Vec3, radius: f64) -> Self {
        Shape::Sphere { center, radius: radius.abs() }
    }

    pub fn bounding_box(&self) -> Aabb {
        match *self {
            Shape::Box(b) => b,
            Shape::Sphere { center, radius } => Aabb::around(center, radius),
            Shape::Point(p) => Aabb::new(p, p),
        }
    }

    pub fn center(&self) -> Vec3 {
        match *self {
            Shape::Box(b) => b.center(),
            Shape::Sphere { center, .. } => center,
            Shape::Point(p) => p,
        }
    }

    pub fn contains(&self, p: Vec3) -> bool {
        match *self {
            Shape::Box(b) => b.contains(p),
            Shape::Sphere { center, radius } => center.distance(p) <= radius,
            Shape::Point(q) => q == p,
        }
    }

    /// Exact overlap test between two shapes.
    pub fn intersects(&self, other: &Shape) -> bool {
        match (*self, *other) {
            (Shape::Box(a), Shape::Box(b)) => a.intersects(&b),
            (Shape::Box(b), Shape::Sphere { center, radius })
            | (Shape::Sphere { center, radius }, Shape::Box(b)) => {
                b.clamp(center).distance(center) <= radius
            }
            (Shape::Sphere { center: c1, radius: r1 }, Shape::Sphere { center: c2, radius: r2 }) => {
                c1.distance(c2) <= r1 + r2
            }
            (Shape::Point(p), s) | (s, Shape::Point(p)) => s.contains(p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aabb_normalizes_corners() {
        let b = Aabb::new(Vec3::new(3.0, -1.0, 5.0), Vec3::new(1.0, 2.0, 0.0));
        assert_eq!(b.min, Vec3::new(1.0, -1.0, 0.0));
        assert_eq!(b.max, Vec3::new(3.0, 2.0, 5.0));
        assert_eq!(b.center(), Vec3::new(2.0, 0.5, 2.5));
    }

    #[test]
    fn touching_boxes_intersect() {
        let a = Aabb::new(Vec3::ZERO, Vec3::new(1.0, 1.0, 1.0));
        let b = Aabb::new(Vec3::new(1.0, 0.0, 0.0), Vec3::new(2.0, 1.0, 1.0));
        let c = Aabb::new(Vec3::new(1.5, 0.0, 0.0), Vec3::new(2.0, 1.0, 1.0));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn sphere_box_overlap_uses_closest_point() {
        let b = Shape::Box(Aabb::new(Vec3::ZERO, Vec3::new(1.0, 1.0, 1.0)));
        // Corner distance from (2,2,2) to (1,1,1) is sqrt(3) ~ 1.73.
        assert!(!b.intersects(&Shape::sphere(Vec3::new(2.0, 2.0, 2.0), 1.5)));
        assert!(b.intersects(&Shape::sphere(Vec3::new(2.0, 2.0, 2.0), 1.8)));
    }

    #[test]
    fn point_inside_sphere() {
        let s = Shape::sphere(Vec3::ZERO, 2.0);
        assert!(s.intersects(&Shape::Point(Vec3::new(1.0, 1.0, 0.0))));
        assert!(!Shape::Point(Vec3::new(3.0, 0.0, 0.0)).intersects(&s));
    }

    #[test]
    fn rotation_faces_positive_z_at_zero_yaw() {
        let d = Vec3::from_rotation(0.0, 0.0);
        assert!((d.z - 1.0).abs() < 1e-9);
        assert!(d.x.abs() < 1e-9);
    }
}
