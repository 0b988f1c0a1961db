//! Shared building blocks for the keystone workspace: geometry value types,
//! environment-driven configuration helpers, and tracing setup.

pub mod config;
pub mod error;
pub mod geometry;
pub mod telemetry;

pub use error::ConfigError;
pub use geometry::{Aabb, Shape, Vec3};
