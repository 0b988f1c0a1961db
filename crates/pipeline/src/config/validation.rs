use keystone_core::ConfigError;

use super::EngineConfig;

impl EngineConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("scheduler: {e}")))?;
        self.validate_spatial()?;
        self.validate_pipeline()?;
        Ok(())
    }

    fn validate_spatial(&self) -> Result<(), ConfigError> {
        let size = self.spatial.cell_size;
        if !size.is_finite() || size <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "spatial.cell_size must be a positive number, got {size}"
            )));
        }
        Ok(())
    }

    fn validate_pipeline(&self) -> Result<(), ConfigError> {
        let p = &self.pipeline;
        if p.enhanced_threshold >= p.epic_threshold {
            return Err(ConfigError::Invalid(format!(
                "pipeline.enhanced_threshold ({}) must be below pipeline.epic_threshold ({})",
                p.enhanced_threshold, p.epic_threshold
            )));
        }
        if p.module_name.trim().is_empty() {
            return Err(ConfigError::Invalid("pipeline.module_name must not be empty".into()));
        }
        Ok(())
    }
}
