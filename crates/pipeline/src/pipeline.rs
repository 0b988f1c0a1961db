use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use keystone_scheduler::{ModuleHandle, ModuleInfo, Priority, TaskFuture, WorkScheduler};
use keystone_spatial::SpatialIndex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::context::{CancelFlag, ComputationContext};
use crate::error::PipelineError;
use crate::hooks::{
    Applier, CollisionQuery, ComputationRegistry, LoggingApplier, ResourceGate, SnapshotCollisions, UnitComputation,
    UnlimitedResources,
};
use crate::result::{ComputationResult, Stage};
use crate::stages::{run_stage, StagePools};

// ── Stats ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    finished: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// Point-in-time pipeline counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub started: u64,
    /// Reached the apply task on the authoritative thread.
    pub finished: u64,
    pub applied: u64,
    /// Finished with a failed stage, a failed unit or a failed apply.
    pub failed: u64,
    pub cancelled: u64,
    pub in_flight: u64,
}

impl Counters {
    fn snapshot(&self) -> PipelineStats {
        let started = self.started.load(Ordering::Acquire);
        let finished = self.finished.load(Ordering::Acquire);
        PipelineStats {
            started,
            finished,
            applied: self.applied.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            cancelled: self.cancelled.load(Ordering::Acquire),
            in_flight: started.saturating_sub(finished),
        }
    }
}

// ── Shared state ────────────────────────────────────────────────

/// Everything a stage may read. Never mutated after `build()`.
pub(crate) struct PipelineShared {
    pub(crate) config: PipelineConfig,
    pub(crate) scheduler: WorkScheduler,
    pub(crate) module: ModuleHandle,
    pub(crate) units: ComputationRegistry,
    pub(crate) resources: Arc<dyn ResourceGate>,
    pub(crate) collisions: Arc<dyn CollisionQuery>,
    pub(crate) applier: Arc<dyn Applier>,
    pub(crate) index: Option<Arc<SpatialIndex>>,
    pub(crate) pools: StagePools,
    counters: Arc<Counters>,
}

// ── Builder ─────────────────────────────────────────────────────

/// Builder for [`ComputationPipeline`]. Every collaborator has a default.
pub struct PipelineBuilder {
    scheduler: WorkScheduler,
    config: PipelineConfig,
    units: ComputationRegistry,
    resources: Arc<dyn ResourceGate>,
    collisions: Arc<dyn CollisionQuery>,
    applier: Arc<dyn Applier>,
    index: Option<Arc<SpatialIndex>>,
}

impl PipelineBuilder {
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn unit(mut self, unit: impl UnitComputation + 'static) -> Self {
        self.units.register(unit);
        self
    }

    pub fn units(mut self, units: ComputationRegistry) -> Self {
        self.units = units;
        self
    }

    pub fn resource_gate(mut self, gate: impl ResourceGate + 'static) -> Self {
        self.resources = Arc::new(gate);
        self
    }

    pub fn collision_query(mut self, query: impl CollisionQuery + 'static) -> Self {
        self.collisions = Arc::new(query);
        self
    }

    pub fn applier(mut self, applier: impl Applier + 'static) -> Self {
        self.applier = Arc::new(applier);
        self
    }

    /// Index consulted (read-only) by the collision stage.
    pub fn spatial_index(mut self, index: Arc<SpatialIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Build the stage pools and register the pipeline's scheduler module.
    pub fn build(self) -> Result<ComputationPipeline, PipelineError> {
        let pools = StagePools::build(&self.config)?;
        let module = self.scheduler.register_module(
            &self.config.module_name,
            ModuleInfo::new(env!("CARGO_PKG_VERSION"), "staged computation pipeline"),
        )?;
        info!(
            module = %self.config.module_name,
            compute_threads = pools.compute_threads(),
            units = self.units.len(),
            spatial_index = self.index.is_some(),
            "Computation pipeline ready"
        );
        Ok(ComputationPipeline {
            shared: Arc::new(PipelineShared {
                config: self.config,
                scheduler: self.scheduler,
                module,
                units: self.units,
                resources: self.resources,
                collisions: self.collisions,
                applier: self.applier,
                index: self.index,
                pools,
                counters: Arc::new(Counters::default()),
            }),
        })
    }
}

// ── Pipeline ────────────────────────────────────────────────────

/// Staged computation pipeline. Cheap to clone.
///
/// Each computation moves compute → resource → collision → aggregation, each
/// stage on its own pool, and always ends with exactly one HIGH-priority
/// apply task on the scheduler.
#[derive(Clone)]
pub struct ComputationPipeline {
    shared: Arc<PipelineShared>,
}

impl ComputationPipeline {
    pub fn builder(scheduler: WorkScheduler) -> PipelineBuilder {
        PipelineBuilder {
            scheduler,
            config: PipelineConfig::default(),
            units: ComputationRegistry::new(),
            resources: Arc::new(UnlimitedResources),
            collisions: Arc::new(SnapshotCollisions),
            applier: Arc::new(LoggingApplier),
            index: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    pub fn module(&self) -> &ModuleHandle {
        &self.shared.module
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.counters.snapshot()
    }

    /// Start a computation. Never blocks; safe from any thread.
    pub fn cast_computation(&self, ctx: ComputationContext) -> ComputationTicket {
        let id = ctx.id();
        let cancel = CancelFlag::new();
        let (reply, rx) = oneshot::channel();
        self.shared.counters.started.fetch_add(1, Ordering::AcqRel);
        debug!(%id, kind = %ctx.kind(), params = ctx.parameters().len(), "Computation cast");

        let flight = Flight {
            shared: Arc::clone(&self.shared),
            result: ComputationResult::new(&ctx),
            ctx,
            cancel: cancel.clone(),
            reply,
        };
        flight.advance(Stage::Compute);
        ComputationTicket { id, cancel, rx }
    }
}

impl std::fmt::Debug for ComputationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationPipeline")
            .field("module", &self.shared.config.module_name)
            .field("units", &self.shared.units)
            .field("stats", &self.stats())
            .finish()
    }
}

// ── Flight ──────────────────────────────────────────────────────

/// One computation in transit between stage pools.
struct Flight {
    shared: Arc<PipelineShared>,
    ctx: ComputationContext,
    result: ComputationResult,
    cancel: CancelFlag,
    reply: oneshot::Sender<TaskFuture<PipelineOutcome>>,
}

impl Flight {
    /// Hand the flight to `stage`'s pool. Ownership of the result moves with it.
    fn advance(self, stage: Stage) {
        let shared = Arc::clone(&self.shared);
        shared.pools.get(stage).spawn(move || {
            let mut flight = self;
            run_stage(stage, &flight.shared, &flight.ctx, &mut flight.result, &flight.cancel);
            match stage.next() {
                Some(next) => flight.advance(next),
                None => flight.finish(),
            }
        });
    }

    /// Terminal step: submit the single HIGH-priority apply task.
    fn finish(self) {
        let Flight { shared, result, reply, .. } = self;
        let applier = Arc::clone(&shared.applier);
        let counters = Arc::clone(&shared.counters);
        let task = shared.module.task(format!("apply:{}", result.kind));
        debug!(id = %result.id, failed_stages = ?result.failed_stages(), "Submitting apply task");

        let future = shared.scheduler.submit_with_priority(
            task,
            move || {
                counters.finished.fetch_add(1, Ordering::AcqRel);
                if result.cancelled {
                    counters.cancelled.fetch_add(1, Ordering::AcqRel);
                    return Ok(PipelineOutcome { result, applied: false });
                }
                if result.has_errors() {
                    counters.failed.fetch_add(1, Ordering::AcqRel);
                }
                if !result.needs_application {
                    return Ok(PipelineOutcome { result, applied: false });
                }
                if let Err(err) = applier.apply(&result) {
                    if !result.has_errors() {
                        counters.failed.fetch_add(1, Ordering::AcqRel);
                    }
                    return Err(err);
                }
                counters.applied.fetch_add(1, Ordering::AcqRel);
                Ok(PipelineOutcome { result, applied: true })
            },
            Priority::High,
        );
        // The ticket may already be gone; the apply task still runs.
        let _ = reply.send(future);
    }
}

// ── Ticket ──────────────────────────────────────────────────────

/// Final state of a computation after the apply task ran.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub result: ComputationResult,
    /// The applier was called and succeeded.
    pub applied: bool,
}

/// Caller-side handle for one computation.
pub struct ComputationTicket {
    id: Uuid,
    cancel: CancelFlag,
    rx: oneshot::Receiver<TaskFuture<PipelineOutcome>>,
}

impl ComputationTicket {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Request cooperative cancellation. Checked between units and stages;
    /// the apply task still runs but applies nothing.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the apply task. Resolves only after the scheduler has
    /// drained it on the authoritative thread.
    pub async fn wait(self) -> Result<PipelineOutcome, PipelineError> {
        let apply = self.rx.await.map_err(|_| PipelineError::Abandoned(self.id))?;
        let outcome = apply.await?;
        if outcome.result.cancelled {
            return Err(PipelineError::Cancelled(self.id));
        }
        Ok(outcome)
    }
}

impl std::fmt::Debug for ComputationTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationTicket")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
