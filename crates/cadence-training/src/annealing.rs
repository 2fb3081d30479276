//! Exponential hyperparameter decay with a floor.

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `value(step) = max(min, init * factor ^ floor(step / iters))`.
///
/// Only constructible through [`AnnealingSpec::new`] (or deserialization followed by
/// [`AnnealingSpec::validate`]), so `value` has no error path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnnealingSpec {
    pub init: f64,
    pub min: f64,
    pub factor: f64,
    pub iters: u64,
}

impl AnnealingSpec {
    pub fn new(init: f64, min: f64, factor: f64, iters: u64) -> TrainingResult<Self> {
        let spec = Self { init, min, factor, iters };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if !self.init.is_finite() || !self.min.is_finite() || !self.factor.is_finite() {
            return Err(TrainingError::Config("annealing values must be finite".to_string()));
        }
        if self.factor <= 0.0 || self.factor > 1.0 {
            return Err(TrainingError::Config(format!(
                "annealing factor must be in (0, 1], got {}",
                self.factor
            )));
        }
        if self.iters == 0 {
            return Err(TrainingError::Config("annealing iters must be >= 1".to_string()));
        }
        if self.min > self.init {
            return Err(TrainingError::Config(format!(
                "annealing min ({}) must not exceed init ({})",
                self.min, self.init
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn value(&self, step: u64) -> f64 {
        let decays = step / self.iters;
        // powf underflows to 0.0 for huge exponents, which the floor absorbs.
        let decayed = self.init * self.factor.powf(decays as f64);
        decayed.max(self.min)
    }
}

/// Hyperparameter values in effect for one iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HyperParams(BTreeMap<String, f64>);

impl HyperParams {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One validated [`AnnealingSpec`] per annealed hyperparameter.
#[derive(Debug, Clone, Default)]
pub struct AnnealingSchedules {
    specs: BTreeMap<String, AnnealingSpec>,
}

impl AnnealingSchedules {
    pub fn new(specs: BTreeMap<String, AnnealingSpec>) -> TrainingResult<Self> {
        for (name, spec) in &specs {
            if name.trim().is_empty() {
                return Err(TrainingError::Config("annealed hyperparameter name is empty".to_string()));
            }
            spec.validate()
                .map_err(|e| TrainingError::Config(format!("annealing schedule '{name}': {e}")))?;
        }
        Ok(Self { specs })
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AnnealingSpec> {
        self.specs.get(name)
    }

    #[must_use]
    pub fn values(&self, step: u64) -> HyperParams {
        HyperParams(self.specs.iter().map(|(name, spec)| (name.clone(), spec.value(step))).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn z_pres() -> AnnealingSpec {
        AnnealingSpec::new(1e-1, 1e-9, 0.5, 1000).unwrap()
    }

    #[test]
    fn test_value_steps_at_iters_boundary() {
        let spec = z_pres();
        assert!((spec.value(0) - 0.1).abs() < 1e-15);
        assert!((spec.value(999) - 0.1).abs() < 1e-15);
        assert!((spec.value(1000) - 0.05).abs() < 1e-15);
        assert!((spec.value(2500) - 0.025).abs() < 1e-15);
    }

    #[test]
    fn test_value_non_increasing_and_floored() {
        let spec = z_pres();
        let mut prev = f64::INFINITY;
        for step in (0..200_000).step_by(250) {
            let v = spec.value(step);
            assert!(v <= prev);
            assert!(v >= spec.min);
            prev = v;
        }
        assert_eq!(spec.value(u64::MAX), spec.min);
    }

    #[test]
    fn test_factor_one_is_constant() {
        let spec = AnnealingSpec::new(3.0, 1.0, 1.0, 10).unwrap();
        assert_eq!(spec.value(0), 3.0);
        assert_eq!(spec.value(1_000_000), 3.0);
    }

    #[test]
    fn test_rejects_malformed_specs() {
        assert!(AnnealingSpec::new(1.0, 0.1, 0.0, 10).is_err());
        assert!(AnnealingSpec::new(1.0, 0.1, 1.5, 10).is_err());
        assert!(AnnealingSpec::new(1.0, 0.1, 0.5, 0).is_err());
        assert!(AnnealingSpec::new(0.1, 1.0, 0.5, 10).is_err());
        assert!(AnnealingSpec::new(f64::NAN, 0.1, 0.5, 10).is_err());
    }

    #[test]
    fn test_schedules_values_per_name() {
        let mut specs = BTreeMap::new();
        specs.insert("learning_rate".to_string(), AnnealingSpec::new(1e-3, 1e-4, 0.5, 1000).unwrap());
        specs.insert("gumbel_temperature".to_string(), AnnealingSpec::new(10.0, 0.1, 0.8, 1000).unwrap());
        let schedules = AnnealingSchedules::new(specs).unwrap();

        let hp = schedules.values(2000);
        assert_eq!(hp.len(), 2);
        assert!((hp.get("learning_rate").unwrap() - 2.5e-4).abs() < 1e-12);
        assert!((hp.get("gumbel_temperature").unwrap() - 6.4).abs() < 1e-9);
        assert!(hp.get("missing").is_none());
    }
}
