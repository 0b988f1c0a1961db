//! Staged asynchronous computation pipeline.
//!
//! A [`ComputationContext`] is cast from any thread and moves through four
//! stages (compute, resource, collision, aggregation), each on its own
//! worker pool. Every computation ends with exactly one HIGH-priority apply
//! task on the [`WorkScheduler`](keystone_scheduler::WorkScheduler), so the
//! authoritative thread is the only place results touch live state.

pub mod config;
pub mod context;
pub mod error;
pub mod hooks;
pub mod pipeline;
pub mod result;
mod stages;

pub use config::{EngineConfig, PipelineConfig};
pub use context::{
    CancelFlag, CollisionSnapshot, ComputationContext, ContextBuilder, EntitySnapshot, ParamValue, ResourceBudget,
};
pub use error::{PipelineError, StageError};
pub use hooks::{
    Applier, CollisionQuery, ComputationRegistry, LoggingApplier, ResourceGate, SnapshotCollisions, UnitComputation,
    UnlimitedResources,
};
pub use pipeline::{ComputationPipeline, ComputationTicket, PipelineBuilder, PipelineOutcome, PipelineStats};
pub use result::{
    Aggregate, CollisionReport, ComputationResult, EffectTier, EntityHit, ResourceOutcome, Stage, StageOutcome,
    StageResult, UnitResult,
};
