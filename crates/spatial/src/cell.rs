use keystone_core::{Aabb, Vec3};
use serde::Serialize;

/// Integer grid coordinate: `floor(coordinate / cell_size)` per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CellKey {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl CellKey {
    /// Out-of-range coordinates saturate at the `i64` bounds.
    pub fn containing(p: Vec3, cell_size: f64) -> Self {
        Self {
            x: (p.x / cell_size).floor() as i64,
            y: (p.y / cell_size).floor() as i64,
            z: (p.z / cell_size).floor() as i64,
        }
    }
}

/// Inclusive block of cells overlapped by a bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CellRange {
    lo: CellKey,
    hi: CellKey,
}

impl CellRange {
    /// Cells overlapped by `bounds`. `None` when any bound is NaN or infinite.
    pub(crate) fn covering(bounds: &Aabb, cell_size: f64) -> Option<Self> {
        let finite = |p: Vec3| p.x.is_finite() && p.y.is_finite() && p.z.is_finite();
        if !finite(bounds.min) || !finite(bounds.max) {
            return None;
        }
        Some(Self {
            lo: CellKey::containing(bounds.min, cell_size),
            hi: CellKey::containing(bounds.max, cell_size),
        })
    }

    /// Number of cells in the block, saturating.
    pub(crate) fn len(&self) -> u128 {
        let span = |lo: i64, hi: i64| (i128::from(hi) - i128::from(lo) + 1).max(0) as u128;
        span(self.lo.x, self.hi.x)
            .saturating_mul(span(self.lo.y, self.hi.y))
            .saturating_mul(span(self.lo.z, self.hi.z))
    }

    pub(crate) fn contains(&self, key: &CellKey) -> bool {
        (self.lo.x..=self.hi.x).contains(&key.x)
            && (self.lo.y..=self.hi.y).contains(&key.y)
            && (self.lo.z..=self.hi.z).contains(&key.z)
    }

    /// Every cell in the block, in x/y/z-major order.
    pub(crate) fn keys(self) -> impl Iterator<Item = CellKey> {
        let Self { lo, hi } = self;
        (lo.x..=hi.x).flat_map(move |x| {
            (lo.y..=hi.y).flat_map(move |y| (lo.z..=hi.z).map(move |z| CellKey { x, y, z }))
        })
    }
}
