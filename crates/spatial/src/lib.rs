//! Uniform-grid spatial index over [`Shape`](keystone_core::Shape) handles.
//!
//! Writers take an exclusive lock, queries take a shared lock. A shape is
//! stored under every grid cell its bounding box overlaps, and multi-cell
//! queries de-duplicate before returning.

mod cell;
mod index;

pub use cell::CellKey;
pub use index::{IndexStats, ShapeDistance, ShapeId, SpatialConfig, SpatialIndex};
