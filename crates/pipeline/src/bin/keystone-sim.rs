//! Headless simulation driver: producers submit work and cast computations
//! from their own threads while the main thread ticks the scheduler.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use keystone_core::{Shape, Vec3};
use keystone_pipeline::{
    CancelFlag, CollisionSnapshot, ComputationContext, ComputationPipeline, ComputationResult, EngineConfig,
    EntitySnapshot, ParamValue, ResourceBudget, UnitComputation, UnitResult,
};
use keystone_scheduler::{ModuleInfo, Priority, WorkScheduler};
use keystone_spatial::SpatialIndex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "keystone-sim", about = "Drive the keystone scheduler and pipeline headlessly")]
struct Cli {
    /// Path to the engine config file
    #[arg(long, env = "KEYSTONE_CONFIG", default_value = "config/keystone.toml")]
    config: PathBuf,

    /// Ticks to run before shutting down
    #[arg(long, default_value = "200")]
    ticks: u64,

    /// Producer threads
    #[arg(long, default_value = "4")]
    producers: usize,

    /// Tasks each producer submits, spread over the three priorities
    #[arg(long, default_value = "250")]
    tasks_per_producer: usize,

    /// Computations each producer casts through the pipeline
    #[arg(long, default_value = "8")]
    computations: usize,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
}

// ── Demo units ──────────────────────────────────────────────────

struct Magnitude;

impl UnitComputation for Magnitude {
    fn key(&self) -> &str {
        "magnitude"
    }

    fn compute(&self, _ctx: &ComputationContext, value: &ParamValue, _cancel: &CancelFlag) -> Result<UnitResult> {
        let magnitude = value.as_f64().context("magnitude must be numeric")?;
        Ok(UnitResult::new(self.key()).with_value("magnitude", magnitude).requires_application())
    }
}

struct Extent;

impl UnitComputation for Extent {
    fn key(&self) -> &str {
        "extent"
    }

    fn order(&self) -> i32 {
        -1
    }

    fn compute(&self, ctx: &ComputationContext, value: &ParamValue, _cancel: &CancelFlag) -> Result<UnitResult> {
        let extent = value.as_f64().context("extent must be numeric")?;
        Ok(UnitResult::new(self.key())
            .with_value("extent", extent)
            .with_collision_delta(ctx.direction() * extent))
    }
}

// ── Main ────────────────────────────────────────────────────────

fn main() -> Result<()> {
    keystone_core::config::load_dotenv();
    keystone_core::telemetry::init_tracing("info");
    let cli = Cli::parse();

    let config = match EngineConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, path = %cli.config.display(), "Config file unusable, using defaults and env");
            EngineConfig::from_env().context("failed to load engine config")?
        }
    };

    let scheduler = WorkScheduler::new(config.scheduler.clone()).context("failed to create scheduler")?;
    let index = Arc::new(SpatialIndex::with_config(&config.spatial));
    for i in 0..64 {
        let at = Vec3::new(f64::from(i % 8) * 6.0, 0.0, f64::from(i / 8) * 6.0);
        index.add(Uuid::new_v4(), Shape::sphere(at, 1.5));
    }

    let applied = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&applied);
    let pipeline = ComputationPipeline::builder(scheduler.clone())
        .config(config.pipeline.clone())
        .unit(Magnitude)
        .unit(Extent)
        .spatial_index(Arc::clone(&index))
        .applier(move |result: &ComputationResult| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::Relaxed);
            info!(id = %result.id, tier = ?result.aggregate.as_ref().map(|a| a.tier), "Effect applied");
            Ok(())
        })
        .build()
        .context("failed to build pipeline")?;

    let producers: Vec<_> = (0..cli.producers)
        .map(|p| spawn_producer(p, &cli, scheduler.clone(), pipeline.clone()))
        .collect::<Result<_>>()?;

    for _ in 0..cli.ticks {
        let report = scheduler.tick();
        thread::sleep(scheduler.config().tick_interval().saturating_sub(report.duration));
    }

    for producer in producers {
        if producer.join().is_err() {
            warn!("Producer thread panicked");
        }
    }

    let report = serde_json::json!({
        "scheduler": scheduler.stats(),
        "health": scheduler.system_health_report(),
        "pipeline": pipeline.stats(),
        "applied": applied.load(Ordering::Relaxed),
        "index": index.stats(),
    });
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let stats = scheduler.stats();
        println!(
            "ticks={} processed={} failed={} pending={} health={:?} computations={:?}",
            stats.ticks,
            stats.total_processed,
            stats.total_failed,
            stats.total_pending,
            stats.health,
            pipeline.stats()
        );
    }

    scheduler.shutdown();
    Ok(())
}

fn spawn_producer(
    p: usize,
    cli: &Cli,
    scheduler: WorkScheduler,
    pipeline: ComputationPipeline,
) -> Result<thread::JoinHandle<()>> {
    let module = scheduler.register_module(&format!("producer-{p}"), ModuleInfo::new("0.1.0", "simulated producer"))?;
    let tasks = cli.tasks_per_producer;
    let computations = cli.computations;

    let handle = thread::Builder::new().name(format!("producer-{p}")).spawn(move || {
        for i in 0..tasks {
            let priority = Priority::ALL[i % Priority::ALL.len()];
            scheduler.execute_with_priority(module.task(format!("work-{i}")), || Ok(()), priority);
        }

        for i in 0..computations {
            let origin = Vec3::new(p as f64 * 6.0, 0.0, i as f64 * 6.0);
            let entities = (0..4).map(|e| {
                EntitySnapshot::new(Uuid::new_v4(), "target", origin + Vec3::new(e as f64, 0.0, 1.0), 0.5)
            });
            let ctx = ComputationContext::builder("bolt")
                .origin(origin)
                .rotation(i as f64 * 15.0, 0.0)
                .param("magnitude", 10.0 + i as f64 * 8.0)
                .param("extent", 2.0)
                .budget(ResourceBudget::new("mana", 5.0))
                .collision_snapshot(CollisionSnapshot::capture(origin, 8.0, entities))
                .build();
            let _ticket = pipeline.cast_computation(ctx);
        }
    })?;
    Ok(handle)
}
