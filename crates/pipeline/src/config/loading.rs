use std::path::Path;

use keystone_core::config::{active_profile, profiled_env_opt, profiled_env_parse};
use keystone_core::ConfigError;
use tracing::{debug, info};

use super::EngineConfig;

impl EngineConfig {
    /// Parse config from a TOML string, then apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        info!(path = %path.display(), "Loaded engine config");
        Ok(config)
    }

    /// Defaults plus env overrides, for running without a config file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    // ── Environment variable overrides ──────────────────────────

    /// Apply environment variable overrides.
    ///
    /// With `KEYSTONE_PROFILE=PROD` set, `PROD_KEYSTONE_X` wins over
    /// `KEYSTONE_X`. Unparseable values are logged and ignored.
    /// - `KEYSTONE_WEIGHT_HIGH` / `_NORMAL` / `_LOW` -> `scheduler.weights.*`
    /// - `KEYSTONE_MAX_TASKS_PER_TICK` -> `scheduler.max_tasks_per_tick`
    /// - `KEYSTONE_MAX_TICK_MS` -> `scheduler.max_tick_duration_ms`
    /// - `KEYSTONE_TICK_INTERVAL_MS` -> `scheduler.tick_interval_ms`
    /// - `KEYSTONE_CELL_SIZE` -> `spatial.cell_size`
    /// - `KEYSTONE_COMPUTE_THREADS` -> `pipeline.compute_threads`
    /// - `KEYSTONE_PIPELINE_MODULE` -> `pipeline.module_name`
    pub(crate) fn apply_env_overrides(&mut self) {
        let profile = active_profile();
        if !profile.is_empty() {
            debug!(%profile, "Applying profiled env overrides");
        }
        let p = profile.as_str();

        let weights = &mut self.scheduler.weights;
        if let Some(v) = profiled_env_parse(p, "KEYSTONE_WEIGHT_HIGH") {
            weights.high = v;
        }
        if let Some(v) = profiled_env_parse(p, "KEYSTONE_WEIGHT_NORMAL") {
            weights.normal = v;
        }
        if let Some(v) = profiled_env_parse(p, "KEYSTONE_WEIGHT_LOW") {
            weights.low = v;
        }
        if let Some(v) = profiled_env_parse(p, "KEYSTONE_MAX_TASKS_PER_TICK") {
            self.scheduler.max_tasks_per_tick = v;
        }
        if let Some(v) = profiled_env_parse(p, "KEYSTONE_MAX_TICK_MS") {
            self.scheduler.max_tick_duration_ms = v;
        }
        if let Some(v) = profiled_env_parse(p, "KEYSTONE_TICK_INTERVAL_MS") {
            self.scheduler.tick_interval_ms = v;
        }
        if let Some(v) = profiled_env_parse(p, "KEYSTONE_CELL_SIZE") {
            self.spatial.cell_size = v;
        }
        if let Some(v) = profiled_env_parse(p, "KEYSTONE_COMPUTE_THREADS") {
            self.pipeline.compute_threads = v;
        }
        if let Some(v) = profiled_env_opt(p, "KEYSTONE_PIPELINE_MODULE") {
            self.pipeline.module_name = v;
        }
    }
}
