//! Pipeline configuration

use crate::error::{Error, Result};
use crate::optimizer::OptimizerKind;
pub use crate::pipeline::ScheduleKind;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Serializable pipeline settings.
///
/// Closures (criterion, hooks) live in [`EngineOptions`](crate::pipeline::EngineOptions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Physical stages; the engine runs `num_stages * chunk` workers.
    pub num_stages: usize,
    pub num_microbatches: usize,
    pub schedule: ScheduleKind,
    /// Keep only stage inputs at forward time and recompute at backward time.
    pub checkpoint: bool,
    pub chunk: usize,
    /// Optimizer installed on every stage at construction.
    pub optimizer: Option<OptimizerKind>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_stages: 1,
            num_microbatches: 1,
            schedule: ScheduleKind::FillDrain,
            checkpoint: false,
            chunk: 1,
            optimizer: None,
        }
    }
}

impl PipelineConfig {
    pub fn new(num_stages: usize, num_microbatches: usize) -> Self {
        Self {
            num_stages,
            num_microbatches,
            ..Self::default()
        }
    }

    pub fn with_schedule(mut self, schedule: ScheduleKind) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: bool) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerKind) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    /// Number of stage workers, counting virtual stages.
    pub fn total_stages(&self) -> usize {
        self.num_stages * self.chunk
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_stages == 0 {
            return Err(Error::InvalidConfig {
                reason: "num_stages must be > 0".into(),
            });
        }
        if self.num_microbatches == 0 {
            return Err(Error::InvalidConfig {
                reason: "num_microbatches must be > 0".into(),
            });
        }
        if self.chunk == 0 {
            return Err(Error::InvalidConfig {
                reason: "chunk must be > 0".into(),
            });
        }
        if let Some(opt) = &self.optimizer {
            let lr = opt.lr();
            if !lr.is_finite() || lr < 0.0 {
                return Err(Error::InvalidConfig {
                    reason: format!("optimizer lr must be finite and >= 0, got {lr}"),
                });
            }
        }
        Ok(())
    }

    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::Config {
            reason: format!("IO error: {e}"),
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| Error::Config {
            reason: format!("YAML parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::Config {
            reason: format!("IO error: {e}"),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| Error::Config {
            reason: format!("JSON parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::SgdConfig;

    fn scratch(name: &str, content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("pipr-{}-{name}", std::process::id()));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_builders() {
        let config = PipelineConfig::new(4, 8)
            .with_schedule(ScheduleKind::OneFOneB)
            .with_checkpoint(true)
            .with_chunk(2)
            .with_optimizer(OptimizerKind::Sgd(SgdConfig::default()));
        assert_eq!(config.total_stages(), 8);
        assert!(config.checkpoint);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zeroes() {
        assert!(PipelineConfig::new(0, 4).validate().is_err());
        assert!(PipelineConfig::new(2, 0).validate().is_err());
        assert!(PipelineConfig::new(2, 4).with_chunk(0).validate().is_err());
        let bad_lr = PipelineConfig::new(2, 4).with_optimizer(OptimizerKind::Sgd(SgdConfig {
            lr: f64::NAN,
            ..Default::default()
        }));
        assert!(matches!(bad_lr.validate(), Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_load_yaml() {
        let path = scratch(
            "pipe.yaml",
            "num_stages: 2\nnum_microbatches: 4\nschedule: 1f1b\noptimizer:\n  kind: adamw\n  lr: 0.01\n",
        );
        let config = PipelineConfig::load_yaml(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.num_stages, 2);
        assert_eq!(config.schedule, ScheduleKind::OneFOneB);
        assert_eq!(config.chunk, 1);
        assert_eq!(config.optimizer.map(|o| o.lr()), Some(0.01));
    }

    #[test]
    fn test_load_json_validates() {
        let path = scratch("pipe.json", r#"{"num_stages": 3, "num_microbatches": 0}"#);
        let err = PipelineConfig::load_json(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = PipelineConfig::load_yaml("/nonexistent/pipr.yaml").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
