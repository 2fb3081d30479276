//! Run configuration, loadable from TOML.

use crate::annealing::{AnnealingSchedules, AnnealingSpec};
use crate::checkpoint::CheckpointPolicy;
use crate::error::{TrainingError, TrainingResult};
use crate::pipeline::PipelineConfig;
use crate::schedule::{ScheduleSpec, TierKind, TierSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const DEFAULT_READER_THREADS: usize = 4;

/// Tier periods in iterations. A tier set to 0 never fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub scalars: u64,
    pub gradients: u64,
    pub variables: u64,
    pub images: u64,
    pub checkpoint: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            scalars: 50,
            gradients: 100,
            variables: 500,
            images: 1000,
            checkpoint: 10_000,
        }
    }
}

impl ScheduleConfig {
    pub fn to_spec(&self) -> TrainingResult<ScheduleSpec> {
        let tiers = [
            (TierKind::Scalars, self.scalars),
            (TierKind::Gradients, self.gradients),
            (TierKind::Variables, self.variables),
            (TierKind::Images, self.images),
            (TierKind::Checkpoint, self.checkpoint),
        ]
        .into_iter()
        .filter(|(_, period)| *period > 0)
        .map(|(kind, period)| TierSpec { kind, period })
        .collect();
        ScheduleSpec::new(tiers)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Extensions of the top-level files copied into `source/`.
    pub extensions: Vec<String>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self { extensions: vec!["rs".to_string(), "toml".to_string()] }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: u32,
    pub batch_size: usize,
    pub reader_threads: usize,
    /// Defaults to `reader_threads`.
    pub queue_capacity: Option<usize>,
    pub allow_smaller_final_batch: bool,
    pub schedule: ScheduleConfig,
    pub annealing: BTreeMap<String, AnnealingSpec>,
    pub checkpoint: CheckpointPolicy,
    pub snapshot: SnapshotConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        let mut annealing = BTreeMap::new();
        annealing.insert(
            "z_pres_prior".to_string(),
            AnnealingSpec { init: 1e-1, min: 1e-9, factor: 0.5, iters: 1000 },
        );
        annealing.insert(
            "gumbel_temperature".to_string(),
            AnnealingSpec { init: 10.0, min: 0.1, factor: 0.8, iters: 1000 },
        );
        annealing.insert(
            "learning_rate".to_string(),
            AnnealingSpec { init: 1e-3, min: 1e-4, factor: 0.5, iters: 1000 },
        );

        Self {
            epochs: 300,
            batch_size: 64,
            reader_threads: DEFAULT_READER_THREADS,
            queue_capacity: None,
            allow_smaller_final_batch: false,
            schedule: ScheduleConfig::default(),
            annealing,
            checkpoint: CheckpointPolicy::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

/// Validated pieces of a [`TrainingConfig`].
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schedule: ScheduleSpec,
    pub annealing: AnnealingSchedules,
    pub pipeline: PipelineConfig,
    pub checkpoint: CheckpointPolicy,
}

impl TrainingConfig {
    pub fn from_toml_str(contents: &str) -> TrainingResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_toml_file(path: &Path) -> TrainingResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
            .map_err(|e| TrainingError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    pub fn to_toml(&self) -> TrainingResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    #[must_use]
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            workers: self.reader_threads,
            capacity: self.queue_capacity.unwrap_or(self.reader_threads),
            batch_size: self.batch_size,
            epochs: self.epochs,
            allow_smaller_final_batch: self.allow_smaller_final_batch,
        }
    }

    pub fn validate(&self) -> TrainingResult<ResolvedConfig> {
        let pipeline = self.pipeline();
        pipeline.validate()?;
        self.checkpoint.validate()?;

        Ok(ResolvedConfig {
            schedule: self.schedule.to_spec()?,
            annealing: AnnealingSchedules::new(self.annealing.clone())?,
            pipeline,
            checkpoint: self.checkpoint.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let resolved = TrainingConfig::default().validate().unwrap();
        assert_eq!(resolved.pipeline.workers, 4);
        assert_eq!(resolved.pipeline.capacity, 4);
        assert_eq!(resolved.pipeline.batch_size, 64);
        assert_eq!(resolved.schedule.period(TierKind::Checkpoint), Some(10_000));
        let lr = resolved.annealing.get("learning_rate").unwrap();
        assert!((lr.value(1000) - 5e-4).abs() < 1e-15);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = TrainingConfig::from_toml_str(
            r#"
            epochs = 2
            queue_capacity = 16

            [schedule]
            images = 2000
            checkpoint = 4000

            [checkpoint]
            prefix = "air-model"
            max_to_keep = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.epochs, 2);
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.schedule.scalars, 50);
        assert_eq!(config.schedule.images, 2000);
        assert_eq!(config.checkpoint.max_to_keep, Some(3));
        assert_eq!(config.annealing.len(), 3);
        assert_eq!(config.validate().unwrap().pipeline.capacity, 16);
    }

    #[test]
    fn test_serialized_config_parses_back() {
        let config = TrainingConfig { epochs: 7, ..Default::default() };
        let parsed = TrainingConfig::from_toml_str(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_rejects_bad_nesting() {
        let mut config = TrainingConfig::default();
        config.schedule.variables = 75;
        assert!(matches!(config.validate(), Err(TrainingError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_threads_and_bad_annealing() {
        let config = TrainingConfig { reader_threads: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config
            .annealing
            .insert("bad".to_string(), AnnealingSpec { init: 1.0, min: 0.1, factor: 2.0, iters: 10 });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_schedule_rejected() {
        let config = TrainingConfig {
            schedule: ScheduleConfig { scalars: 0, gradients: 0, variables: 0, images: 0, checkpoint: 0 },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_period_disables_tier() {
        let config = TrainingConfig::from_toml_str("[schedule]\nimages = 0\n").unwrap();
        let schedule = config.validate().unwrap().schedule;
        assert_eq!(schedule.period(TierKind::Images), None);
        assert!(!schedule.due_tasks(0).contains(TierKind::Images));
    }

    #[test]
    fn test_disabled_tier_survives_serialization() {
        let mut config = TrainingConfig::default();
        config.schedule.gradients = 0;
        config.schedule.images = 0;

        let parsed = TrainingConfig::from_toml_str(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed.schedule, config.schedule);
        let schedule = parsed.validate().unwrap().schedule;
        assert_eq!(schedule.period(TierKind::Gradients), None);
        assert_eq!(schedule.period(TierKind::Images), None);
    }
}
