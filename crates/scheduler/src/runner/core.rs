use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info};

use crate::error::SchedulerError;
use crate::metrics::SchedulerStats;
use crate::monitoring::{DetailedModuleStats, MonitoringService, PriorityStats, SystemHealthReport};
use crate::registry::{ModuleHandle, ModuleInfo, ModuleRegistry, ModuleStats};
use crate::task::{TaskEnvelope, TaskState};
use crate::types::{ClassCounts, HealthStatus, Priority, SchedulerConfig, Weights};

use super::deadlines::DeadlineWatcher;
use super::timers::TimerQueue;

/// One priority class: an unbounded multi-producer FIFO.
pub(super) struct ClassQueue {
    pub(super) tx: Sender<TaskEnvelope>,
    pub(super) rx: Receiver<TaskEnvelope>,
}

impl ClassQueue {
    fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }
}

/// State owned by whichever thread is running the drain pass.
#[derive(Debug, Default)]
pub(super) struct DrainState {
    pub(super) tick: u64,
}

pub(super) struct Shared {
    pub(super) config: SchedulerConfig,
    /// Global weights; read once at the start of every tick.
    pub(super) weights: RwLock<Weights>,
    pub(super) queues: [ClassQueue; 3],
    pub(super) timers: Mutex<TimerQueue>,
    pub(super) deadlines: DeadlineWatcher,
    pub(super) registry: ModuleRegistry,
    pub(super) monitoring: MonitoringService,
    /// Held for the duration of a drain pass; `try_lock` enforces a single consumer.
    pub(super) drain: Mutex<DrainState>,
    pub(super) next_id: AtomicU64,
    pub(super) shutdown: AtomicBool,
    pub(super) overflow_warned: AtomicBool,
    pub(super) started: Instant,
    pub(super) total_processed: AtomicU64,
    pub(super) total_failed: AtomicU64,
    pub(super) last_tick_processed: AtomicUsize,
    pub(super) ticks: AtomicU64,
}

/// The work scheduler. Cheap to clone; all clones share one set of queues.
///
/// Construct one per authoritative thread and pass clones to producers.
#[derive(Clone)]
pub struct WorkScheduler {
    pub(super) shared: Arc<Shared>,
}

impl WorkScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        info!(
            weights = %config.weights,
            max_tasks_per_tick = config.max_tasks_per_tick,
            max_tick_duration_ms = config.max_tick_duration_ms,
            "Work scheduler created"
        );
        let monitoring = MonitoringService::new(config.monitoring.clone());
        Ok(Self {
            shared: Arc::new(Shared {
                weights: RwLock::new(config.weights),
                config,
                queues: [ClassQueue::new(), ClassQueue::new(), ClassQueue::new()],
                timers: Mutex::new(TimerQueue::default()),
                deadlines: DeadlineWatcher::default(),
                registry: ModuleRegistry::new(),
                monitoring,
                drain: Mutex::new(DrainState::default()),
                next_id: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
                overflow_warned: AtomicBool::new(false),
                started: Instant::now(),
                total_processed: AtomicU64::new(0),
                total_failed: AtomicU64::new(0),
                last_tick_processed: AtomicUsize::new(0),
                ticks: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub(super) fn queue(&self, priority: Priority) -> &ClassQueue {
        &self.shared.queues[priority.index()]
    }

    pub(super) fn timers(&self) -> MutexGuard<'_, TimerQueue> {
        self.shared.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    // ── Weights ─────────────────────────────────────────────────

    /// Global weights as configured.
    pub fn weights(&self) -> Weights {
        *self.shared.weights.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Weights the next tick will use: global weights raised per class by
    /// every enabled module's weights.
    pub fn effective_weights(&self) -> Weights {
        self.shared.registry.effective_weights(self.weights())
    }

    /// Replace the global weights. Takes effect at the next tick.
    pub fn configure_weights(&self, weights: Weights) -> Result<(), SchedulerError> {
        weights.validate()?;
        *self.shared.weights.write().unwrap_or_else(PoisonError::into_inner) = weights;
        info!(%weights, "Global weights reconfigured");
        Ok(())
    }

    pub fn reset_weights_to_default(&self) {
        let weights = self.shared.config.weights;
        *self.shared.weights.write().unwrap_or_else(PoisonError::into_inner) = weights;
        info!(%weights, "Global weights reset to configured defaults");
    }

    // ── Modules ─────────────────────────────────────────────────

    pub fn registry(&self) -> &ModuleRegistry {
        &self.shared.registry
    }

    pub fn register_module(&self, name: &str, info: ModuleInfo) -> Result<ModuleHandle, SchedulerError> {
        self.shared.registry.register(name, info)
    }

    pub fn configure_module_weights(&self, name: &str, weights: Weights) -> Result<(), SchedulerError> {
        self.shared.registry.configure_weights(name, weights)
    }

    pub fn module_stats(&self, name: &str) -> Option<ModuleStats> {
        self.shared.registry.module_stats(name)
    }

    /// Queued (not yet executed) tasks attributed to `module`.
    pub fn pending_task_count(&self, module: &str) -> usize {
        self.shared.registry.get(module).map_or(0, |r| r.pending())
    }

    // ── Monitoring ──────────────────────────────────────────────

    pub fn monitoring(&self) -> &MonitoringService {
        &self.shared.monitoring
    }

    pub fn system_health_report(&self) -> SystemHealthReport {
        let mut report = self.shared.monitoring.system_health();
        report.status = report.status.max(self.queue_health());
        report
    }

    pub fn problematic_modules(&self) -> Vec<String> {
        self.shared.monitoring.problematic_modules()
    }

    pub fn priority_stats(&self) -> BTreeMap<Priority, PriorityStats> {
        self.shared.monitoring.priority_stats()
    }

    pub fn detailed_module_stats(&self, name: &str) -> Option<DetailedModuleStats> {
        self.shared.monitoring.module_report(name)
    }

    fn queue_health(&self) -> HealthStatus {
        if self.is_shutdown() {
            return HealthStatus::Shutdown;
        }
        self.shared.config.queue_health(self.pending().total())
    }

    /// Worst of queue-depth health and execution health.
    pub fn health_status(&self) -> HealthStatus {
        self.queue_health().max(self.shared.monitoring.health_status())
    }

    pub(super) fn pending(&self) -> ClassCounts {
        let mut counts = ClassCounts::default();
        for p in Priority::ALL {
            counts[p] = self.queue(p).rx.len();
        }
        counts
    }

    pub fn stats(&self) -> SchedulerStats {
        let pending = self.pending();
        SchedulerStats {
            total_pending: pending.total(),
            pending,
            scheduled: self.timers().len(),
            total_processed: self.shared.total_processed.load(Ordering::Acquire),
            total_failed: self.shared.total_failed.load(Ordering::Acquire),
            processed_last_tick: self.shared.last_tick_processed.load(Ordering::Acquire),
            ticks: self.shared.ticks.load(Ordering::Acquire),
            registered_modules: self.shared.registry.len(),
            weights: self.weights(),
            effective_weights: self.effective_weights(),
            uptime_secs: self.shared.started.elapsed().as_secs_f64(),
            health: self.health_status(),
        }
    }

    // ── Shutdown ────────────────────────────────────────────────

    /// Stop accepting work and drop everything still queued or scheduled.
    /// Futures of dropped tasks resolve to `Cancelled`.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Scheduler shutdown requested");

        let mut dropped = self.discard_queued();
        let scheduled = self.timers().drain_all();
        dropped += scheduled.len();
        for envelope in scheduled {
            self.discard(envelope, TaskState::Cancelled);
        }
        info!(dropped, "Scheduler stopped");
    }

    /// Cancel everything sitting in the class queues. Returns the count.
    pub(super) fn discard_queued(&self) -> usize {
        let mut dropped = 0;
        for p in Priority::ALL {
            while let Ok(envelope) = self.queue(p).rx.try_recv() {
                self.discard(envelope, TaskState::Cancelled);
                dropped += 1;
            }
        }
        dropped
    }

    /// Drop an envelope without running it.
    pub(super) fn discard(&self, envelope: TaskEnvelope, state: TaskState) {
        envelope.control.set_state(state);
        if let Some(module) = envelope.name.module() {
            module.on_discard();
        }
        debug!(task = %envelope.name, id = envelope.id, ?state, "Task discarded");
    }
}

impl std::fmt::Debug for WorkScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkScheduler")
            .field("weights", &self.weights())
            .field("pending", &self.pending())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
