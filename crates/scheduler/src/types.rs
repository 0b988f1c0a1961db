use std::fmt;
use std::ops::{Index, IndexMut};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;
use crate::monitoring::MonitoringConfig;

/// Priority class of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Latency-sensitive work; drained first every tick.
    High,
    Normal,
    /// Background work; guaranteed its weight each tick but nothing more.
    Low,
}

impl Priority {
    /// Drain order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub(crate) fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Priority::High => "HIGH",
            Priority::Normal => "NORMAL",
            Priority::Low => "LOW",
        })
    }
}

// ── Weights ─────────────────────────────────────────────────────

/// Credits granted to each class at the start of every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Weights {
    pub high: u32,
    pub normal: u32,
    pub low: u32,
}

impl Default for Weights {
    fn default() -> Self {
        Self { high: 5, normal: 3, low: 1 }
    }
}

impl Weights {
    /// Validated constructor: every weight must be at least 1.
    pub fn new(high: u32, normal: u32, low: u32) -> Result<Self, SchedulerError> {
        let w = Self { high, normal, low };
        w.validate()?;
        Ok(w)
    }

    pub fn balanced() -> Self {
        Self { high: 1, normal: 1, low: 1 }
    }

    pub fn high_focused() -> Self {
        Self { high: 3, normal: 1, low: 1 }
    }

    pub fn background_focused() -> Self {
        Self { high: 1, normal: 1, low: 3 }
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.high == 0 || self.normal == 0 || self.low == 0 {
            return Err(SchedulerError::InvalidWeights(format!(
                "weights must be positive, got high={} normal={} low={}",
                self.high, self.normal, self.low
            )));
        }
        Ok(())
    }

    pub fn get(&self, priority: Priority) -> u32 {
        match priority {
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }

    pub fn total(&self) -> u32 {
        self.high + self.normal + self.low
    }

    /// Percentage of a full tick's credits that goes to `priority`.
    pub fn share(&self, priority: Priority) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.get(priority) as f64 * 100.0 / total as f64
    }

    /// Per-class maximum of two weight triples.
    pub fn max(self, other: Weights) -> Weights {
        Weights {
            high: self.high.max(other.high),
            normal: self.normal.max(other.normal),
            low: self.low.max(other.low),
        }
    }
}

impl fmt::Display for Weights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HIGH:{} NORMAL:{} LOW:{}", self.high, self.normal, self.low)
    }
}

// ── Per-class counters ──────────────────────────────────────────

/// One count per priority class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassCounts {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl ClassCounts {
    pub fn total(&self) -> usize {
        self.high + self.normal + self.low
    }
}

impl Index<Priority> for ClassCounts {
    type Output = usize;
    fn index(&self, p: Priority) -> &usize {
        match p {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
        }
    }
}

impl IndexMut<Priority> for ClassCounts {
    fn index_mut(&mut self, p: Priority) -> &mut usize {
        match p {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }
}

// ── Health ──────────────────────────────────────────────────────

/// Coarse health classification, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Shutdown,
}

// ── Config ──────────────────────────────────────────────────────

/// Scheduler configuration, typically parsed from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Global class weights.
    #[serde(default)]
    pub weights: Weights,
    /// Hard cap on tasks executed in one tick. 0 = unlimited.
    #[serde(default = "default_max_tasks_per_tick")]
    pub max_tasks_per_tick: usize,
    /// Wall-clock cap on one tick in milliseconds. 0 = unlimited.
    #[serde(default = "default_max_tick_duration_ms")]
    pub max_tick_duration_ms: u64,
    /// Sleep between ticks when driven by [`run`](crate::WorkScheduler::run).
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Tasks slower than this are logged at debug level.
    #[serde(default = "default_slow_task_threshold_ms")]
    pub slow_task_threshold_ms: u64,
    /// Total pending tasks above which health degrades to WARNING.
    #[serde(default = "default_queue_warning")]
    pub queue_warning_threshold: usize,
    /// Total pending tasks above which health degrades to CRITICAL.
    #[serde(default = "default_queue_critical")]
    pub queue_critical_threshold: usize,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

fn default_max_tasks_per_tick() -> usize { 128 }
fn default_max_tick_duration_ms() -> u64 { 40 }
fn default_tick_interval_ms() -> u64 { 50 }
fn default_slow_task_threshold_ms() -> u64 { 1 }
fn default_queue_warning() -> usize { 500 }
fn default_queue_critical() -> usize { 1000 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            weights: Weights::default(),
            max_tasks_per_tick: default_max_tasks_per_tick(),
            max_tick_duration_ms: default_max_tick_duration_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            slow_task_threshold_ms: default_slow_task_threshold_ms(),
            queue_warning_threshold: default_queue_warning(),
            queue_critical_threshold: default_queue_critical(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        self.weights.validate()
    }

    pub fn max_tick_duration(&self) -> Option<Duration> {
        (self.max_tick_duration_ms > 0).then(|| Duration::from_millis(self.max_tick_duration_ms))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn slow_task_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_task_threshold_ms)
    }

    /// Queue-depth health for `pending` queued tasks.
    pub fn queue_health(&self, pending: usize) -> HealthStatus {
        if pending > self.queue_critical_threshold {
            HealthStatus::Critical
        } else if pending > self.queue_warning_threshold {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_drain_order() {
        assert_eq!(Priority::ALL, [Priority::High, Priority::Normal, Priority::Low]);
        assert!(Priority::High < Priority::Low);
        assert_eq!(Priority::Normal.to_string(), "NORMAL");
    }

    #[test]
    fn zero_weight_rejected() {
        assert!(Weights::new(5, 3, 1).is_ok());
        let err = Weights::new(5, 0, 1).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidWeights(_)));
    }

    #[test]
    fn weight_presets_and_shares() {
        assert_eq!(Weights::default(), Weights { high: 5, normal: 3, low: 1 });
        assert_eq!(Weights::background_focused().low, 3);
        let w = Weights::default();
        assert_eq!(w.total(), 9);
        assert!((w.share(Priority::High) - 55.555).abs() < 0.01);
        assert_eq!(
            Weights::balanced().max(Weights::high_focused()),
            Weights { high: 3, normal: 1, low: 1 }
        );
    }

    #[test]
    fn class_counts_index_by_priority() {
        let mut c = ClassCounts::default();
        c[Priority::Low] += 4;
        c[Priority::High] += 2;
        assert_eq!(c.low, 4);
        assert_eq!(c.total(), 6);
    }

    #[test]
    fn health_ordering() {
        assert!(HealthStatus::Healthy < HealthStatus::Warning);
        assert!(HealthStatus::Critical < HealthStatus::Shutdown);
    }

    #[test]
    fn scheduler_config_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.weights, Weights::default());
        assert_eq!(config.max_tasks_per_tick, 128);
        assert_eq!(config.max_tick_duration(), Some(Duration::from_millis(40)));
        assert_eq!(config.queue_health(0), HealthStatus::Healthy);
        assert_eq!(config.queue_health(501), HealthStatus::Warning);
        assert_eq!(config.queue_health(1001), HealthStatus::Critical);
    }

    #[test]
    fn config_parses_partial_toml() {
        let config: SchedulerConfig = toml::from_str(
            r#"
max_tasks_per_tick = 10

[weights]
high = 8
"#,
        )
        .unwrap();
        assert_eq!(config.max_tasks_per_tick, 10);
        assert_eq!(config.weights, Weights { high: 8, normal: 3, low: 1 });
        assert_eq!(config.tick_interval_ms, 50);
    }
}
