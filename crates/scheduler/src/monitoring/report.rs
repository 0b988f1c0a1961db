use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::HealthStatus;

/// Health thresholds and history sizing. All of these are tuning knobs,
/// not physical constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Rolling performance history length.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Minimum spacing between history samples.
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// Window over which throughput is averaged.
    #[serde(default = "default_throughput_window_secs")]
    pub throughput_window_secs: u64,
    #[serde(default = "default_warning_failure_rate")]
    pub warning_failure_rate: f64,
    #[serde(default = "default_critical_failure_rate")]
    pub critical_failure_rate: f64,
    #[serde(default = "default_warning_avg_ms")]
    pub warning_avg_duration_ms: f64,
    #[serde(default = "default_critical_avg_ms")]
    pub critical_avg_duration_ms: f64,
    #[serde(default = "default_problematic_failure_rate")]
    pub problematic_failure_rate: f64,
    #[serde(default = "default_problematic_avg_ms")]
    pub problematic_avg_duration_ms: f64,
    /// More recent errors than this marks a module problematic.
    #[serde(default = "default_problematic_recent_errors")]
    pub problematic_recent_errors: usize,
    #[serde(default = "default_recent_error_window_secs")]
    pub recent_error_window_secs: u64,
    /// Error timestamps kept per module.
    #[serde(default = "default_recent_error_capacity")]
    pub recent_error_capacity: usize,
}

fn default_history_capacity() -> usize { 100 }
fn default_sample_interval_ms() -> u64 { 100 }
fn default_throughput_window_secs() -> u64 { 10 }
fn default_warning_failure_rate() -> f64 { 0.05 }
fn default_critical_failure_rate() -> f64 { 0.10 }
fn default_warning_avg_ms() -> f64 { 100.0 }
fn default_critical_avg_ms() -> f64 { 200.0 }
fn default_problematic_failure_rate() -> f64 { 0.05 }
fn default_problematic_avg_ms() -> f64 { 100.0 }
fn default_problematic_recent_errors() -> usize { 10 }
fn default_recent_error_window_secs() -> u64 { 300 }
fn default_recent_error_capacity() -> usize { 50 }

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            sample_interval_ms: default_sample_interval_ms(),
            throughput_window_secs: default_throughput_window_secs(),
            warning_failure_rate: default_warning_failure_rate(),
            critical_failure_rate: default_critical_failure_rate(),
            warning_avg_duration_ms: default_warning_avg_ms(),
            critical_avg_duration_ms: default_critical_avg_ms(),
            problematic_failure_rate: default_problematic_failure_rate(),
            problematic_avg_duration_ms: default_problematic_avg_ms(),
            problematic_recent_errors: default_problematic_recent_errors(),
            recent_error_window_secs: default_recent_error_window_secs(),
            recent_error_capacity: default_recent_error_capacity(),
        }
    }
}

impl MonitoringConfig {
    /// Classify a failure rate and mean duration against the WARNING and
    /// CRITICAL thresholds.
    pub fn classify(&self, failure_rate: f64, average_duration_ms: f64) -> HealthStatus {
        if failure_rate > self.critical_failure_rate || average_duration_ms > self.critical_avg_duration_ms {
            HealthStatus::Critical
        } else if failure_rate > self.warning_failure_rate || average_duration_ms > self.warning_avg_duration_ms {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn is_problematic(&self, failure_rate: f64, average_duration_ms: f64, recent_errors: usize) -> bool {
        failure_rate > self.problematic_failure_rate
            || average_duration_ms > self.problematic_avg_duration_ms
            || recent_errors > self.problematic_recent_errors
    }
}

/// Whole-system health summary.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealthReport {
    pub status: HealthStatus,
    pub uptime_secs: f64,
    pub total_tasks: u64,
    pub total_failures: u64,
    pub failure_rate: f64,
    pub average_duration_ms: f64,
    /// Modules with activity inside the recent-error window.
    pub active_modules: usize,
    pub throughput_per_second: f64,
    pub problematic_modules: Vec<String>,
    pub history_samples: usize,
}

/// Monitoring view of a single module.
#[derive(Debug, Clone, Serialize)]
pub struct DetailedModuleStats {
    pub name: String,
    pub tasks: u64,
    pub failures: u64,
    pub failure_rate: f64,
    pub average_duration_ms: f64,
    pub recent_errors: usize,
    pub errors_by_kind: BTreeMap<String, u64>,
    pub last_error: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
    pub status: HealthStatus,
}

/// Aggregates for one priority class.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PriorityStats {
    pub executed: u64,
    pub failed: u64,
    pub failure_rate: f64,
    pub average_duration_ms: f64,
}

pub(crate) fn rate(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}
