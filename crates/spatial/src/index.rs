use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use keystone_core::{Aabb, Shape, Vec3};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::cell::{CellKey, CellRange};

/// Identifier of a shape registered in the index.
pub type ShapeId = Uuid;

/// Smallest permitted cell edge length.
const MIN_CELL_SIZE: f64 = 1.0;

/// Index configuration, typically parsed from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialConfig {
    /// Grid cell edge length in world units. Clamped to at least 1.0.
    #[serde(default = "default_cell_size")]
    pub cell_size: f64,
}

fn default_cell_size() -> f64 { 4.0 }

impl Default for SpatialConfig {
    fn default() -> Self {
        Self { cell_size: default_cell_size() }
    }
}

/// A query hit with its distance from the query point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ShapeDistance {
    pub id: ShapeId,
    pub distance: f64,
}

/// Point-in-time index statistics.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    /// Non-empty grid cells.
    pub total_cells: usize,
    /// Cell memberships summed over all cells (a shape counts once per cell).
    pub total_entries: usize,
    /// Distinct shapes.
    pub shapes: usize,
    pub average_per_cell: f64,
    pub cell_size: f64,
}

#[derive(Debug)]
struct Entry {
    shape: Shape,
    cells: Vec<CellKey>,
}

#[derive(Debug, Default)]
struct Grid {
    cells: HashMap<CellKey, HashSet<ShapeId>>,
    entries: HashMap<ShapeId, Entry>,
}

impl Grid {
    fn unlink(&mut self, id: &ShapeId) -> Option<Entry> {
        let entry = self.entries.remove(id)?;
        for key in &entry.cells {
            if let Some(members) = self.cells.get_mut(key) {
                members.remove(id);
                if members.is_empty() {
                    self.cells.remove(key);
                }
            }
        }
        Some(entry)
    }

    /// Distinct ids stored in any cell of `range`. Walks whichever is
    /// smaller: the range or the populated cells.
    fn candidates(&self, range: CellRange) -> HashSet<ShapeId> {
        let mut found = HashSet::new();
        if range.len() > self.cells.len() as u128 {
            for (key, members) in &self.cells {
                if range.contains(key) {
                    found.extend(members.iter().copied());
                }
            }
        } else {
            for key in range.keys() {
                if let Some(members) = self.cells.get(&key) {
                    found.extend(members.iter().copied());
                }
            }
        }
        found
    }
}

/// Concurrent grid-based spatial index.
#[derive(Debug)]
pub struct SpatialIndex {
    cell_size: f64,
    grid: RwLock<Grid>,
}

impl SpatialIndex {
    pub fn new(cell_size: f64) -> Self {
        let cell_size = if cell_size.is_finite() { cell_size.max(MIN_CELL_SIZE) } else { MIN_CELL_SIZE };
        Self {
            cell_size,
            grid: RwLock::new(Grid::default()),
        }
    }

    pub fn with_config(config: &SpatialConfig) -> Self {
        Self::new(config.cell_size)
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    fn read(&self) -> RwLockReadGuard<'_, Grid> {
        self.grid.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Grid> {
        self.grid.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn range(&self, bounds: &Aabb) -> Option<CellRange> {
        let range = CellRange::covering(bounds, self.cell_size);
        if range.is_none() {
            debug!(?bounds, "non-finite bounds, nothing to cover");
        }
        range
    }

    /// Insert `shape` under `id`. An existing entry for `id` is replaced.
    /// Shapes with NaN or infinite extents are rejected and return false.
    pub fn add(&self, id: ShapeId, shape: Shape) -> bool {
        let Some(range) = CellRange::covering(&shape.bounding_box(), self.cell_size) else {
            warn!(%id, ?shape, "rejected shape with non-finite extents");
            return false;
        };
        let cells: Vec<CellKey> = range.keys().collect();
        let mut grid = self.write();
        if grid.unlink(&id).is_some() {
            trace!(%id, "replacing indexed shape");
        }
        for key in &cells {
            grid.cells.entry(*key).or_default().insert(id);
        }
        trace!(%id, cells = cells.len(), "indexed shape");
        grid.entries.insert(id, Entry { shape, cells });
        true
    }

    /// Remove `id` from every cell it occupies. Unknown ids are a no-op.
    pub fn remove(&self, id: &ShapeId) -> bool {
        let removed = self.write().unlink(id);
        match removed {
            Some(entry) => {
                trace!(%id, cells = entry.cells.len(), "removed shape");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &ShapeId) -> bool {
        self.read().entries.contains_key(id)
    }

    /// Shape registered under `id`, if any.
    pub fn get(&self, id: &ShapeId) -> Option<Shape> {
        self.read().entries.get(id).map(|e| e.shape)
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids whose bounding box intersects `area`. Non-finite areas match
    /// nothing.
    pub fn query_area(&self, area: &Aabb) -> Vec<ShapeId> {
        let Some(range) = self.range(area) else {
            return Vec::new();
        };
        let grid = self.read();
        let mut hits: Vec<ShapeId> = grid
            .candidates(range)
            .into_iter()
            .filter(|id| grid.entries.get(id).is_some_and(|e| e.shape.bounding_box().intersects(area)))
            .collect();
        hits.sort_unstable();
        hits
    }

    /// Ids whose shape overlaps `query` exactly.
    pub fn query_intersecting(&self, query: &Shape) -> Vec<ShapeId> {
        let Some(range) = self.range(&query.bounding_box()) else {
            return Vec::new();
        };
        let grid = self.read();
        let mut hits: Vec<ShapeId> = grid
            .candidates(range)
            .into_iter()
            .filter(|id| grid.entries.get(id).is_some_and(|e| e.shape.intersects(query)))
            .collect();
        hits.sort_unstable();
        hits
    }

    /// Up to `max_count` shapes whose centre lies within `max_distance` of
    /// `point`, closest first. A non-finite point or distance matches nothing.
    pub fn nearest(&self, point: Vec3, max_distance: f64, max_count: usize) -> Vec<ShapeDistance> {
        if max_count == 0 || max_distance.is_nan() || max_distance < 0.0 {
            return Vec::new();
        }
        let Some(range) = self.range(&Aabb::around(point, max_distance)) else {
            return Vec::new();
        };
        let grid = self.read();
        let mut hits: Vec<ShapeDistance> = grid
            .candidates(range)
            .into_iter()
            .filter_map(|id| {
                let distance = grid.entries.get(&id)?.shape.center().distance(point);
                (distance <= max_distance).then_some(ShapeDistance { id, distance })
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
        hits.truncate(max_count);
        hits
    }

    pub fn clear(&self) {
        let mut grid = self.write();
        let shapes = grid.entries.len();
        grid.cells.clear();
        grid.entries.clear();
        debug!(shapes, "cleared spatial index");
    }

    pub fn stats(&self) -> IndexStats {
        let grid = self.read();
        let total_cells = grid.cells.len();
        let total_entries: usize = grid.cells.values().map(HashSet::len).sum();
        IndexStats {
            total_cells,
            total_entries,
            shapes: grid.entries.len(),
            average_per_cell: if total_cells > 0 { total_entries as f64 / total_cells as f64 } else { 0.0 },
            cell_size: self.cell_size,
        }
    }
}
