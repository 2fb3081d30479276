//! CLI configuration loading and merging.

use anyhow::{Context, Result};
use cadence_training::TrainingConfig;
use std::path::Path;

/// Load the training configuration.
///
/// Precedence: CLI flags (applied by the caller), then the TOML file, then defaults.
pub fn load_config(path: Option<&Path>) -> Result<TrainingConfig> {
    match path {
        Some(path) => TrainingConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display())),
        None => Ok(TrainingConfig::default()),
    }
}
