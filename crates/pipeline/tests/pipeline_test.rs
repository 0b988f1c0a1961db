use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use anyhow::bail;
use futures::FutureExt;
use keystone_core::{Shape, Vec3};
use keystone_pipeline::{
    CancelFlag, CollisionSnapshot, ComputationContext, ComputationPipeline, ComputationResult, ComputationTicket,
    EffectTier, EntitySnapshot, ParamValue, PipelineConfig, PipelineError, PipelineOutcome, ResourceGate,
    ResourceOutcome, Stage, StageError, StageOutcome, UnitComputation, UnitResult,
};
use keystone_scheduler::{SchedulerConfig, Weights, WorkScheduler};
use keystone_spatial::SpatialIndex;
use uuid::Uuid;

// ── Helpers ─────────────────────────────────────────────────────

fn scheduler() -> WorkScheduler {
    WorkScheduler::new(SchedulerConfig { max_tick_duration_ms: 0, ..SchedulerConfig::default() }).unwrap()
}

/// Tick on this thread until the ticket resolves.
fn drive(scheduler: &WorkScheduler, ticket: ComputationTicket) -> Result<PipelineOutcome, PipelineError> {
    let mut wait = Box::pin(ticket.wait());
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        scheduler.tick();
        if let Some(outcome) = wait.as_mut().now_or_never() {
            return outcome;
        }
        assert!(Instant::now() < deadline, "computation never reached the scheduler");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Emits `values` under its key; records the worker thread it ran on.
struct Emit {
    key: &'static str,
    values: Vec<(&'static str, f64)>,
    apply: bool,
    threads: Option<Arc<Mutex<Vec<String>>>>,
}

impl Emit {
    fn new(key: &'static str, values: &[(&'static str, f64)]) -> Self {
        Self { key, values: values.to_vec(), apply: true, threads: None }
    }

    fn passive(mut self) -> Self {
        self.apply = false;
        self
    }

    fn tracking(mut self, threads: &Arc<Mutex<Vec<String>>>) -> Self {
        self.threads = Some(Arc::clone(threads));
        self
    }
}

impl UnitComputation for Emit {
    fn key(&self) -> &str {
        self.key
    }

    fn compute(&self, _ctx: &ComputationContext, _value: &ParamValue, _cancel: &CancelFlag) -> anyhow::Result<UnitResult> {
        if let Some(threads) = &self.threads {
            let name = thread::current().name().unwrap_or_default().to_string();
            threads.lock().unwrap().push(name);
        }
        let mut out = UnitResult::new(self.key);
        for (name, value) in &self.values {
            out = out.with_value(*name, *value);
        }
        Ok(if self.apply { out.requires_application() } else { out })
    }
}

struct Explode;

impl UnitComputation for Explode {
    fn key(&self) -> &str {
        "explode"
    }

    fn compute(&self, _ctx: &ComputationContext, _value: &ParamValue, _cancel: &CancelFlag) -> anyhow::Result<UnitResult> {
        panic!("unit blew up");
    }
}

/// Spins until cancelled (or a safety timeout), then returns normally.
struct UntilCancelled;

impl UnitComputation for UntilCancelled {
    fn key(&self) -> &str {
        "channel"
    }

    fn compute(&self, _ctx: &ComputationContext, _value: &ParamValue, cancel: &CancelFlag) -> anyhow::Result<UnitResult> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cancel.is_cancelled() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        Ok(UnitResult::new("channel").requires_application())
    }
}

struct BrokenGate;

impl ResourceGate for BrokenGate {
    fn validate_and_reserve(&self, _ctx: &ComputationContext, _result: &ComputationResult) -> anyhow::Result<ResourceOutcome> {
        bail!("resource store offline")
    }
}

struct PanickingGate;

impl ResourceGate for PanickingGate {
    fn validate_and_reserve(&self, _ctx: &ComputationContext, _result: &ComputationResult) -> anyhow::Result<ResourceOutcome> {
        panic!("gate poisoned")
    }
}

struct EmptyPool;

impl ResourceGate for EmptyPool {
    fn validate_and_reserve(&self, ctx: &ComputationContext, _result: &ComputationResult) -> anyhow::Result<ResourceOutcome> {
        Ok(ResourceOutcome::Denied { reason: format!("not enough {}", ctx.budget().resource) })
    }
}

fn applier_log() -> (
    Arc<Mutex<Vec<(Uuid, ThreadId)>>>,
    impl Fn(&ComputationResult) -> anyhow::Result<()> + Send + Sync + 'static,
) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let applier = move |result: &ComputationResult| -> anyhow::Result<()> {
        sink.lock().unwrap().push((result.id, thread::current().id()));
        Ok(())
    };
    (log, applier)
}

// ── Happy path ──────────────────────────────────────────────────

#[test]
fn apply_runs_on_the_ticking_thread() {
    let scheduler = scheduler();
    let (log, applier) = applier_log();
    let pipeline = ComputationPipeline::builder(scheduler.clone())
        .unit(Emit::new("magnitude", &[("magnitude", 30.0)]))
        .unit(Emit::new("extent", &[("extent", 4.0)]).passive())
        .applier(applier)
        .build()
        .unwrap();

    let ctx = ComputationContext::builder("bolt").param("magnitude", 30.0).param("extent", 4.0).build();
    let id = ctx.id();
    let outcome = drive(&scheduler, pipeline.cast_computation(ctx)).unwrap();

    assert!(outcome.applied);
    let log = log.lock().unwrap();
    assert_eq!(log.as_slice(), &[(id, thread::current().id())]);

    let stages: Vec<Stage> = outcome.result.stages.iter().map(|s| s.stage).collect();
    assert_eq!(stages, Stage::ALL.to_vec());
    let aggregate = outcome.result.aggregate.unwrap();
    assert_eq!(aggregate.intensity, 30.0 + 40.0);
    assert_eq!(aggregate.tier, EffectTier::Enhanced);
    assert_eq!(pipeline.module().stats().completed, 1);
}

#[test]
fn tiers_follow_configured_thresholds() {
    let scheduler = scheduler();
    let pipeline = ComputationPipeline::builder(scheduler.clone())
        .unit(Emit::new("magnitude", &[("magnitude", 40.0)]))
        .unit(Emit::new("amplify", &[("magnitude_multiplier", 3.0)]))
        .build()
        .unwrap();

    let epic = ComputationContext::builder("nova").param("magnitude", 1).param("amplify", 1).build();
    let basic = ComputationContext::builder("spark").param("magnitude", 1).build();
    let epic = drive(&scheduler, pipeline.cast_computation(epic)).unwrap();
    let basic = drive(&scheduler, pipeline.cast_computation(basic)).unwrap();

    assert_eq!(epic.result.aggregate.unwrap().tier, EffectTier::Epic);
    assert_eq!(basic.result.aggregate.unwrap().tier, EffectTier::Basic);
}

#[test]
fn large_plans_fan_out_over_the_compute_pool() {
    let scheduler = scheduler();
    let threads = Arc::new(Mutex::new(Vec::new()));
    let pipeline = ComputationPipeline::builder(scheduler.clone())
        .config(PipelineConfig { compute_threads: 3, sequential_threshold: 2, ..PipelineConfig::default() })
        .unit(Emit::new("a", &[("magnitude", 1.0)]).tracking(&threads))
        .unit(Emit::new("b", &[("magnitude", 2.0)]).tracking(&threads))
        .unit(Emit::new("c", &[("magnitude", 3.0)]).tracking(&threads))
        .unit(Emit::new("d", &[("magnitude", 4.0)]).tracking(&threads))
        .build()
        .unwrap();

    let ctx = ComputationContext::builder("storm").param("a", 1).param("b", 1).param("c", 1).param("d", 1).build();
    let outcome = drive(&scheduler, pipeline.cast_computation(ctx)).unwrap();

    let compute = outcome.result.stage(Stage::Compute).unwrap();
    assert_eq!(compute.outcome, StageOutcome::Completed);
    assert!(compute.notes[0].contains("in parallel"));
    assert_eq!(outcome.result.aggregate.unwrap().total_magnitude, 10.0);
    let threads = threads.lock().unwrap();
    assert_eq!(threads.len(), 4);
    assert!(threads.iter().all(|name| name.starts_with("keystone-compute-")));
}

// ── Failures ────────────────────────────────────────────────────

#[test]
fn stage_failure_still_submits_exactly_one_apply() {
    let scheduler = scheduler();
    let (log, applier) = applier_log();
    let pipeline = ComputationPipeline::builder(scheduler.clone())
        .unit(Emit::new("magnitude", &[("magnitude", 10.0)]))
        .resource_gate(BrokenGate)
        .applier(applier)
        .build()
        .unwrap();

    let ctx = ComputationContext::builder("bolt")
        .param("magnitude", 10.0)
        .collision_snapshot(CollisionSnapshot::capture(Vec3::ZERO, 4.0, Vec::<EntitySnapshot>::new()))
        .build();
    let outcome = drive(&scheduler, pipeline.cast_computation(ctx)).unwrap();

    assert!(!outcome.applied);
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(outcome.result.failed_stages(), vec![Stage::Resource]);
    assert!(outcome.result.stage(Stage::Collision).unwrap().is_skipped());
    assert_eq!(outcome.result.stage(Stage::Aggregation).unwrap().outcome, StageOutcome::Completed);
    assert_eq!(pipeline.module().stats().submitted, 1);
    assert_eq!(pipeline.stats().failed, 1);
}

#[test]
fn stage_panic_is_recorded_as_failure() {
    let scheduler = scheduler();
    let pipeline = ComputationPipeline::builder(scheduler.clone())
        .unit(Emit::new("magnitude", &[("magnitude", 10.0)]))
        .resource_gate(PanickingGate)
        .build()
        .unwrap();

    let ctx = ComputationContext::builder("bolt").param("magnitude", 1).build();
    let outcome = drive(&scheduler, pipeline.cast_computation(ctx)).unwrap();

    let resource = outcome.result.stage(Stage::Resource).unwrap();
    assert_eq!(
        resource.outcome,
        StageOutcome::Failed { error: StageError::Panicked("gate poisoned".into()) }
    );
    assert!(!outcome.applied);
}

#[test]
fn unit_panic_is_contained() {
    let scheduler = scheduler();
    let pipeline = ComputationPipeline::builder(scheduler.clone())
        .unit(Emit::new("magnitude", &[("magnitude", 25.0)]))
        .unit(Explode)
        .build()
        .unwrap();

    let ctx = ComputationContext::builder("bolt").param("magnitude", 1).param("explode", true).build();
    let outcome = drive(&scheduler, pipeline.cast_computation(ctx)).unwrap();

    assert_eq!(outcome.result.stage(Stage::Compute).unwrap().outcome, StageOutcome::Completed);
    assert_eq!(outcome.result.successful_units().count(), 1);
    let exploded = outcome.result.units.iter().find(|u| u.key == "explode").unwrap();
    assert!(exploded.error.as_deref().unwrap().contains("unit blew up"));
    assert_eq!(outcome.result.aggregate.unwrap().total_magnitude, 25.0);
    assert!(outcome.applied);
}

#[test]
fn all_units_failing_fails_compute() {
    let scheduler = scheduler();
    let pipeline = ComputationPipeline::builder(scheduler.clone()).unit(Explode).build().unwrap();

    let ctx = ComputationContext::builder("bolt").param("explode", true).build();
    let outcome = drive(&scheduler, pipeline.cast_computation(ctx)).unwrap();

    assert_eq!(outcome.result.failed_stages(), vec![Stage::Compute]);
    assert!(outcome.result.stage(Stage::Resource).unwrap().is_skipped());
    assert!(!outcome.applied);
}

#[test]
fn denied_resources_skip_collision_and_application() {
    let scheduler = scheduler();
    let (log, applier) = applier_log();
    let pipeline = ComputationPipeline::builder(scheduler.clone())
        .unit(Emit::new("magnitude", &[("magnitude", 10.0)]))
        .resource_gate(EmptyPool)
        .applier(applier)
        .build()
        .unwrap();

    let ctx = ComputationContext::builder("bolt")
        .param("magnitude", 10.0)
        .budget(keystone_pipeline::ResourceBudget::new("mana", 50.0))
        .collision_snapshot(CollisionSnapshot::capture(Vec3::ZERO, 4.0, Vec::<EntitySnapshot>::new()))
        .build();
    let outcome = drive(&scheduler, pipeline.cast_computation(ctx)).unwrap();

    assert!(outcome.result.resources_denied());
    assert!(outcome.result.failed_stages().is_empty());
    match &outcome.result.stage(Stage::Collision).unwrap().outcome {
        StageOutcome::Skipped { reason } => assert_eq!(reason, "resources denied"),
        other => panic!("collision should be skipped, got {other:?}"),
    }
    assert!(!outcome.applied);
    assert!(log.lock().unwrap().is_empty());
}

// ── Cancellation ────────────────────────────────────────────────

#[test]
fn cancelled_computation_reports_cancelled() {
    let scheduler = scheduler();
    let (log, applier) = applier_log();
    let pipeline = ComputationPipeline::builder(scheduler.clone()).unit(UntilCancelled).applier(applier).build().unwrap();

    let ticket = pipeline.cast_computation(ComputationContext::builder("channel").param("channel", 1).build());
    ticket.cancel();
    assert!(ticket.is_cancelled());
    let id = ticket.id();

    match drive(&scheduler, ticket) {
        Err(PipelineError::Cancelled(cancelled)) => assert_eq!(cancelled, id),
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(log.lock().unwrap().is_empty());
    // The apply task still ran, once.
    assert_eq!(pipeline.module().stats().completed, 1);
    assert_eq!(pipeline.stats().cancelled, 1);
}

#[test]
fn shutdown_rejects_the_apply_task() {
    let scheduler = scheduler();
    let pipeline = ComputationPipeline::builder(scheduler.clone())
        .unit(Emit::new("magnitude", &[("magnitude", 1.0)]))
        .build()
        .unwrap();
    scheduler.shutdown();

    let ticket = pipeline.cast_computation(ComputationContext::builder("bolt").param("magnitude", 1).build());
    let result = futures::executor::block_on(ticket.wait());
    assert!(matches!(result, Err(PipelineError::Scheduler(_))));
}

#[test]
fn pipeline_module_leaves_global_weights_configurable() {
    let scheduler = scheduler();
    let pipeline = ComputationPipeline::builder(scheduler.clone()).build().unwrap();
    assert_eq!(pipeline.module().weights(), None);

    scheduler.configure_weights(Weights::balanced()).unwrap();
    assert_eq!(scheduler.effective_weights(), Weights::balanced());
}

// ── Collisions ──────────────────────────────────────────────────

#[test]
fn snapshot_hits_request_application() {
    let scheduler = scheduler();
    let pipeline = ComputationPipeline::builder(scheduler.clone())
        .unit(Emit::new("extent", &[("extent", 3.0)]).passive())
        .build()
        .unwrap();

    let near = EntitySnapshot::new(Uuid::new_v4(), "zombie", Vec3::new(2.0, 0.0, 0.0), 0.5);
    let far = EntitySnapshot::new(Uuid::new_v4(), "zombie", Vec3::new(8.0, 0.0, 0.0), 0.5);
    let ctx = ComputationContext::builder("frost")
        .param("extent", 3.0)
        .collision_snapshot(CollisionSnapshot::capture(Vec3::ZERO, 10.0, [near.clone(), far]))
        .build();
    let outcome = drive(&scheduler, pipeline.cast_computation(ctx)).unwrap();

    let hits = &outcome.result.collisions.entities;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, near.id);
    assert_eq!(outcome.result.collisions.impact_points, vec![Vec3::new(1.0, 0.0, 0.0)]);
    assert!(outcome.result.needs_application);
    assert!(outcome.applied);
}

#[test]
fn expired_snapshot_is_ignored() {
    let scheduler = scheduler();
    let pipeline = ComputationPipeline::builder(scheduler.clone())
        .config(PipelineConfig { snapshot_max_age_ms: 1, ..PipelineConfig::default() })
        .unit(Emit::new("extent", &[("extent", 3.0)]).passive())
        .build()
        .unwrap();

    let near = EntitySnapshot::new(Uuid::new_v4(), "zombie", Vec3::new(1.0, 0.0, 0.0), 0.5);
    let snapshot = CollisionSnapshot::capture(Vec3::ZERO, 10.0, [near]);
    thread::sleep(Duration::from_millis(5));
    let ctx = ComputationContext::builder("frost").param("extent", 3.0).collision_snapshot(snapshot).build();
    let outcome = drive(&scheduler, pipeline.cast_computation(ctx)).unwrap();

    assert!(outcome.result.collisions.is_empty());
    assert!(outcome.result.stage(Stage::Collision).unwrap().notes[0].contains("ignored"));
    assert!(!outcome.applied);
}

#[test]
fn index_overlaps_are_reported() {
    let scheduler = scheduler();
    let index = Arc::new(SpatialIndex::new(4.0));
    let wall = Uuid::new_v4();
    let distant = Uuid::new_v4();
    index.add(wall, Shape::sphere(Vec3::new(3.0, 0.0, 0.0), 1.0));
    index.add(distant, Shape::sphere(Vec3::new(40.0, 0.0, 0.0), 1.0));

    let pipeline = ComputationPipeline::builder(scheduler.clone())
        .unit(Emit::new("magnitude", &[("magnitude", 5.0)]).passive())
        .spatial_index(Arc::clone(&index))
        .build()
        .unwrap();

    let ctx = ComputationContext::builder("quake")
        .param("magnitude", 5.0)
        .area(Shape::sphere(Vec3::ZERO, 2.5))
        .build();
    let outcome = drive(&scheduler, pipeline.cast_computation(ctx)).unwrap();

    assert_eq!(outcome.result.collisions.overlapping_shapes, vec![wall]);
    assert_eq!(index.len(), 2);
}

#[test]
fn no_collision_data_skips_collision() {
    let scheduler = scheduler();
    let pipeline = ComputationPipeline::builder(scheduler.clone())
        .unit(Emit::new("magnitude", &[("magnitude", 5.0)]))
        .build()
        .unwrap();

    let outcome =
        drive(&scheduler, pipeline.cast_computation(ComputationContext::builder("bolt").param("magnitude", 1).build()))
            .unwrap();
    assert!(outcome.result.stage(Stage::Collision).unwrap().is_skipped());
    assert!(outcome.applied);
}

// ── Concurrency ─────────────────────────────────────────────────

#[test]
fn concurrent_casts_each_apply_once() {
    const CASTERS: usize = 4;
    const PER_CASTER: usize = 25;

    let scheduler = scheduler();
    let applied = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&applied);
    let pipeline = ComputationPipeline::builder(scheduler.clone())
        .unit(Emit::new("magnitude", &[("magnitude", 1.0)]))
        .applier(move |_: &ComputationResult| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .build()
        .unwrap();

    let casters: Vec<_> = (0..CASTERS)
        .map(|_| {
            let pipeline = pipeline.clone();
            thread::spawn(move || {
                (0..PER_CASTER)
                    .map(|_| pipeline.cast_computation(ComputationContext::builder("bolt").param("magnitude", 1).build()))
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let tickets: Vec<_> = casters.into_iter().flat_map(|c| c.join().unwrap()).collect();

    for ticket in tickets {
        assert!(drive(&scheduler, ticket).unwrap().applied);
    }
    assert_eq!(applied.load(Ordering::SeqCst), CASTERS * PER_CASTER);
    let stats = pipeline.stats();
    assert_eq!(stats.started, (CASTERS * PER_CASTER) as u64);
    assert_eq!(stats.finished, stats.started);
    assert_eq!(stats.in_flight, 0);
}
