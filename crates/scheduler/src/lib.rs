//! Weighted-fair, multi-producer / single-consumer work scheduler.
//!
//! Any thread may submit named units of work at one of three priority
//! classes. The authoritative thread calls [`WorkScheduler::tick`] once per
//! frame; each tick drains the classes with a weighted round-robin pass so
//! that high-priority work is favoured without starving background work.
//!
//! Module attribution, per-module weights and statistics live in
//! [`registry`]; execution health is aggregated by [`monitoring`].

pub mod error;
pub mod metrics;
pub mod monitoring;
pub mod registry;
pub mod runner;
pub mod task;
pub mod types;

pub use error::SchedulerError;
pub use metrics::{SchedulerStats, TickReport};
pub use monitoring::{
    DetailedModuleStats, MonitoringConfig, MonitoringService, PriorityStats, SystemHealthReport,
};
pub use registry::{ModuleHandle, ModuleInfo, ModuleRegistry, ModuleStats};
pub use runner::WorkScheduler;
pub use task::{FnBatch, RepeatHandle, TaskBatch, TaskFuture, TaskHandle, TaskId, TaskName, TaskState};
pub use types::{ClassCounts, HealthStatus, Priority, SchedulerConfig, Weights};
