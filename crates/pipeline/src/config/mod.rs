//! Engine configuration: scheduler, spatial index and pipeline sections,
//! parsed from TOML with `KEYSTONE_*` environment overrides.

mod loading;
mod validation;

use std::time::Duration;

use keystone_scheduler::SchedulerConfig;
use keystone_spatial::SpatialConfig;
use serde::{Deserialize, Serialize};

// ── Top-level config ────────────────────────────────────────────

/// Full configuration for one engine process.
///
/// Parsed from `keystone.toml`; every section is optional and falls back to
/// its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub spatial: SpatialConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

// ── Pipeline section ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Compute pool size. 0 = one per logical CPU.
    #[serde(default)]
    pub compute_threads: usize,

    /// Plans with at most this many units run inline on one compute worker.
    #[serde(default = "default_sequential_threshold")]
    pub sequential_threshold: usize,

    /// Intensity above which the enhanced tier is chosen.
    #[serde(default = "default_enhanced_threshold")]
    pub enhanced_threshold: f64,

    /// Intensity above which the epic tier is chosen.
    #[serde(default = "default_epic_threshold")]
    pub epic_threshold: f64,

    /// Collision snapshots older than this are ignored.
    #[serde(default = "default_snapshot_max_age_ms")]
    pub snapshot_max_age_ms: u64,

    /// Scheduler module the apply tasks are attributed to.
    #[serde(default = "default_module_name")]
    pub module_name: String,
}

fn default_sequential_threshold() -> usize {
    2
}

fn default_enhanced_threshold() -> f64 {
    50.0
}

fn default_epic_threshold() -> f64 {
    100.0
}

fn default_snapshot_max_age_ms() -> u64 {
    1000
}

fn default_module_name() -> String {
    "computation-pipeline".into()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            compute_threads: 0,
            sequential_threshold: default_sequential_threshold(),
            enhanced_threshold: default_enhanced_threshold(),
            epic_threshold: default_epic_threshold(),
            snapshot_max_age_ms: default_snapshot_max_age_ms(),
            module_name: default_module_name(),
        }
    }
}

impl PipelineConfig {
    pub fn snapshot_max_age(&self) -> Duration {
        Duration::from_millis(self.snapshot_max_age_ms)
    }
}
