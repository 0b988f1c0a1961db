//! Execution monitoring: per-module and per-priority aggregates, a rolling
//! throughput history, and health classification.

mod history;
mod report;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::metrics::RunningMean;
use crate::types::{HealthStatus, Priority};

pub use history::{PerformanceSample, RingBuffer};
pub use report::{DetailedModuleStats, MonitoringConfig, PriorityStats, SystemHealthReport};

use report::rate;

/// One finished task, as reported by the scheduler.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub module: Option<String>,
    pub task: String,
    pub priority: Priority,
    pub duration: Duration,
    /// `None` on success, otherwise `(kind, message)`.
    pub error: Option<(String, String)>,
}

#[derive(Debug)]
struct ModuleMetrics {
    tasks: u64,
    failures: u64,
    durations: RunningMean,
    errors_by_kind: BTreeMap<String, u64>,
    recent_errors: RingBuffer<Instant>,
    last_error: Option<String>,
    last_activity: Option<(Instant, DateTime<Utc>)>,
}

impl ModuleMetrics {
    fn new(error_capacity: usize) -> Self {
        Self {
            tasks: 0,
            failures: 0,
            durations: RunningMean::default(),
            errors_by_kind: BTreeMap::new(),
            recent_errors: RingBuffer::new(error_capacity),
            last_error: None,
            last_activity: None,
        }
    }

    fn recent_error_count(&self, now: Instant, window: Duration) -> usize {
        self.recent_errors.iter().filter(|t| now.duration_since(**t) <= window).count()
    }
}

#[derive(Debug, Default)]
struct PriorityMetrics {
    executed: u64,
    failed: u64,
    durations: RunningMean,
}

#[derive(Debug)]
struct MonitorState {
    total_tasks: u64,
    total_failures: u64,
    durations: RunningMean,
    modules: HashMap<String, ModuleMetrics>,
    priorities: HashMap<Priority, PriorityMetrics>,
    history: RingBuffer<PerformanceSample>,
    window_started: Instant,
    window_tasks: u64,
    window_durations: RunningMean,
}

/// Thread-safe execution monitor.
#[derive(Debug)]
pub struct MonitoringService {
    config: MonitoringConfig,
    started: Instant,
    state: Mutex<MonitorState>,
}

impl MonitoringService {
    pub fn new(config: MonitoringConfig) -> Self {
        let now = Instant::now();
        let history = RingBuffer::new(config.history_capacity);
        Self {
            config,
            started: now,
            state: Mutex::new(MonitorState {
                total_tasks: 0,
                total_failures: 0,
                durations: RunningMean::default(),
                modules: HashMap::new(),
                priorities: HashMap::new(),
                history,
                window_started: now,
                window_tasks: 0,
                window_durations: RunningMean::default(),
            }),
        }
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn error_window(&self) -> Duration {
        Duration::from_secs(self.config.recent_error_window_secs)
    }

    /// Record one task completion.
    pub fn record(&self, outcome: TaskOutcome) {
        let now = Instant::now();
        let mut guard = self.lock();
        let state = &mut *guard;
        state.total_tasks += 1;
        state.durations.record(outcome.duration);
        state.window_tasks += 1;
        state.window_durations.record(outcome.duration);

        let p = state.priorities.entry(outcome.priority).or_default();
        p.executed += 1;
        p.durations.record(outcome.duration);
        if outcome.error.is_some() {
            p.failed += 1;
            state.total_failures += 1;
        }

        if let Some(module) = &outcome.module {
            let capacity = self.config.recent_error_capacity;
            let m = state.modules.entry(module.clone()).or_insert_with(|| ModuleMetrics::new(capacity));
            m.tasks += 1;
            m.durations.record(outcome.duration);
            m.last_activity = Some((now, Utc::now()));
            if let Some((kind, message)) = &outcome.error {
                m.failures += 1;
                Self::note_error(m, now, kind, message);
            }
        }

        self.maybe_sample(state, now);
    }

    /// Record an error attributed to `module` that did not come from a task
    /// completion (e.g. a module-level fault).
    pub fn record_module_error(&self, module: &str, kind: &str, message: &str) {
        let now = Instant::now();
        let capacity = self.config.recent_error_capacity;
        let mut state = self.lock();
        let m = state.modules.entry(module.to_string()).or_insert_with(|| ModuleMetrics::new(capacity));
        m.last_activity = Some((now, Utc::now()));
        Self::note_error(m, now, kind, message);
        debug!(module, kind, message, "Module error recorded");
    }

    fn note_error(m: &mut ModuleMetrics, now: Instant, kind: &str, message: &str) {
        *m.errors_by_kind.entry(kind.to_string()).or_default() += 1;
        m.recent_errors.push(now);
        m.last_error = Some(message.to_string());
    }

    /// Close the current sampling window if it is old enough. Called on
    /// every record and once per tick so idle periods produce samples too.
    pub fn sample(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        self.maybe_sample(&mut state, now);
    }

    fn maybe_sample(&self, state: &mut MonitorState, now: Instant) {
        let elapsed = now.duration_since(state.window_started);
        if elapsed < Duration::from_millis(self.config.sample_interval_ms) {
            return;
        }
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let sample = PerformanceSample {
            at: now,
            tasks_per_second: state.window_tasks as f64 / secs,
            average_duration_ms: state.window_durations.mean_ms(),
        };
        state.history.push(sample);
        state.window_started = now;
        state.window_tasks = 0;
        state.window_durations = RunningMean::default();
    }

    /// Mean tasks/second over samples inside the throughput window.
    pub fn throughput(&self) -> f64 {
        let state = self.lock();
        Self::throughput_locked(&state, Instant::now(), Duration::from_secs(self.config.throughput_window_secs))
    }

    fn throughput_locked(state: &MonitorState, now: Instant, window: Duration) -> f64 {
        let recent: Vec<f64> = state
            .history
            .iter()
            .filter(|s| now.duration_since(s.at) <= window)
            .map(|s| s.tasks_per_second)
            .collect();
        if recent.is_empty() {
            0.0
        } else {
            recent.iter().sum::<f64>() / recent.len() as f64
        }
    }

    /// Health from the global failure rate and mean duration.
    pub fn health_status(&self) -> HealthStatus {
        let state = self.lock();
        self.config.classify(rate(state.total_failures, state.total_tasks), state.durations.mean_ms())
    }

    pub fn problematic_modules(&self) -> Vec<String> {
        let state = self.lock();
        self.problematic_locked(&state, Instant::now())
    }

    fn problematic_locked(&self, state: &MonitorState, now: Instant) -> Vec<String> {
        let window = self.error_window();
        let mut names: Vec<String> = state
            .modules
            .iter()
            .filter(|(_, m)| {
                self.config.is_problematic(
                    rate(m.failures, m.tasks),
                    m.durations.mean_ms(),
                    m.recent_error_count(now, window),
                )
            })
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn system_health(&self) -> SystemHealthReport {
        let now = Instant::now();
        let state = self.lock();
        let window = self.error_window();
        let failure_rate = rate(state.total_failures, state.total_tasks);
        let average_duration_ms = state.durations.mean_ms();
        let problematic_modules = self.problematic_locked(&state, now);
        let status = self.config.classify(failure_rate, average_duration_ms);
        if status >= HealthStatus::Critical {
            warn!(failure_rate, average_duration_ms, "Scheduler health is CRITICAL");
        }
        SystemHealthReport {
            status,
            uptime_secs: now.duration_since(self.started).as_secs_f64(),
            total_tasks: state.total_tasks,
            total_failures: state.total_failures,
            failure_rate,
            average_duration_ms,
            active_modules: state
                .modules
                .values()
                .filter(|m| m.last_activity.is_some_and(|(at, _)| now.duration_since(at) <= window))
                .count(),
            throughput_per_second: Self::throughput_locked(
                &state,
                now,
                Duration::from_secs(self.config.throughput_window_secs),
            ),
            problematic_modules,
            history_samples: state.history.len(),
        }
    }

    pub fn module_report(&self, module: &str) -> Option<DetailedModuleStats> {
        let now = Instant::now();
        let state = self.lock();
        let m = state.modules.get(module)?;
        let failure_rate = rate(m.failures, m.tasks);
        let average_duration_ms = m.durations.mean_ms();
        Some(DetailedModuleStats {
            name: module.to_string(),
            tasks: m.tasks,
            failures: m.failures,
            failure_rate,
            average_duration_ms,
            recent_errors: m.recent_error_count(now, self.error_window()),
            errors_by_kind: m.errors_by_kind.clone(),
            last_error: m.last_error.clone(),
            last_activity: m.last_activity.map(|(_, wall)| wall),
            status: self.config.classify(failure_rate, average_duration_ms),
        })
    }

    pub fn priority_stats(&self) -> BTreeMap<Priority, PriorityStats> {
        let state = self.lock();
        Priority::ALL
            .iter()
            .map(|p| {
                let stats = state
                    .priorities
                    .get(p)
                    .map(|m| PriorityStats {
                        executed: m.executed,
                        failed: m.failed,
                        failure_rate: rate(m.failed, m.executed),
                        average_duration_ms: m.durations.mean_ms(),
                    })
                    .unwrap_or_default();
                (*p, stats)
            })
            .collect()
    }

    /// Snapshot of the rolling history, oldest first.
    pub fn history(&self) -> Vec<PerformanceSample> {
        self.lock().history.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(module: Option<&str>, priority: Priority, ms: u64, ok: bool) -> TaskOutcome {
        TaskOutcome {
            module: module.map(str::to_string),
            task: "t".into(),
            priority,
            duration: Duration::from_millis(ms),
            error: (!ok).then(|| ("task_failure".to_string(), "bad".to_string())),
        }
    }

    #[test]
    fn empty_service_is_healthy() {
        let svc = MonitoringService::new(MonitoringConfig::default());
        assert_eq!(svc.health_status(), HealthStatus::Healthy);
        let report = svc.system_health();
        assert_eq!(report.total_tasks, 0);
        assert_eq!(report.failure_rate, 0.0);
        assert!(report.problematic_modules.is_empty());
    }

    #[test]
    fn failure_rate_drives_health() {
        let svc = MonitoringService::new(MonitoringConfig::default());
        for _ in 0..94 {
            svc.record(outcome(Some("m"), Priority::Normal, 1, true));
        }
        for _ in 0..6 {
            svc.record(outcome(Some("m"), Priority::Normal, 1, false));
        }
        // 6% failures: above 5% warning, below 10% critical.
        assert_eq!(svc.health_status(), HealthStatus::Warning);

        for _ in 0..10 {
            svc.record(outcome(Some("m"), Priority::Normal, 1, false));
        }
        assert_eq!(svc.health_status(), HealthStatus::Critical);
    }

    #[test]
    fn slow_tasks_degrade_health() {
        let svc = MonitoringService::new(MonitoringConfig::default());
        svc.record(outcome(None, Priority::Low, 150, true));
        assert_eq!(svc.health_status(), HealthStatus::Warning);
        svc.record(outcome(None, Priority::Low, 450, true));
        assert_eq!(svc.health_status(), HealthStatus::Critical);
    }

    #[test]
    fn thresholds_are_configurable() {
        let config = MonitoringConfig {
            warning_avg_duration_ms: 1000.0,
            critical_avg_duration_ms: 2000.0,
            ..MonitoringConfig::default()
        };
        let svc = MonitoringService::new(config);
        svc.record(outcome(None, Priority::Low, 450, true));
        assert_eq!(svc.health_status(), HealthStatus::Healthy);
    }

    #[test]
    fn problematic_by_recent_errors() {
        let svc = MonitoringService::new(MonitoringConfig::default());
        for _ in 0..11 {
            svc.record_module_error("net", "timeout", "peer vanished");
        }
        svc.record(outcome(Some("quiet"), Priority::High, 1, true));

        assert_eq!(svc.problematic_modules(), vec!["net".to_string()]);
        let report = svc.module_report("net").unwrap();
        assert_eq!(report.recent_errors, 11);
        assert_eq!(report.errors_by_kind["timeout"], 11);
        assert_eq!(report.last_error.as_deref(), Some("peer vanished"));
        // Module-level errors are not task failures.
        assert_eq!(report.failures, 0);
    }

    #[test]
    fn recent_error_buffer_is_bounded() {
        let svc = MonitoringService::new(MonitoringConfig::default());
        for _ in 0..80 {
            svc.record_module_error("m", "io", "disk");
        }
        let report = svc.module_report("m").unwrap();
        assert_eq!(report.recent_errors, 50);
        assert_eq!(report.errors_by_kind["io"], 80);
    }

    #[test]
    fn per_priority_aggregates() {
        let svc = MonitoringService::new(MonitoringConfig::default());
        svc.record(outcome(None, Priority::High, 2, true));
        svc.record(outcome(None, Priority::High, 4, false));
        svc.record(outcome(None, Priority::Low, 1, true));

        let stats = svc.priority_stats();
        assert_eq!(stats.len(), 3);
        assert_eq!(stats[&Priority::High].executed, 2);
        assert_eq!(stats[&Priority::High].failed, 1);
        assert!((stats[&Priority::High].failure_rate - 0.5).abs() < 1e-9);
        assert_eq!(stats[&Priority::Normal].executed, 0);
        assert_eq!(stats[&Priority::Low].executed, 1);
    }

    #[test]
    fn history_samples_after_interval() {
        let config = MonitoringConfig { sample_interval_ms: 10, ..MonitoringConfig::default() };
        let svc = MonitoringService::new(config);
        for _ in 0..5 {
            svc.record(outcome(None, Priority::Normal, 1, true));
        }
        std::thread::sleep(Duration::from_millis(20));
        svc.sample();

        let history = svc.history();
        assert!(!history.is_empty());
        assert!(history.iter().any(|s| s.tasks_per_second > 0.0));
        assert!(svc.throughput() > 0.0);
    }

    #[test]
    fn unknown_module_has_no_report() {
        let svc = MonitoringService::new(MonitoringConfig::default());
        assert!(svc.module_report("ghost").is_none());
    }
}
