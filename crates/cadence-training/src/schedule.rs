//! Periodic auxiliary tasks with nested (divisible) periods.

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A periodic auxiliary task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    /// Lightweight scalar metrics.
    Scalars,
    /// Heavier diagnostics (variable histograms).
    Variables,
    /// Image capture.
    Images,
    /// Gradient capture, taken during the training step itself.
    Gradients,
    /// Durable checkpoint of the model state.
    Checkpoint,
}

impl TierKind {
    pub const ALL: [Self; 5] = [Self::Scalars, Self::Variables, Self::Images, Self::Gradients, Self::Checkpoint];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scalars => "scalars",
            Self::Variables => "variables",
            Self::Images => "images",
            Self::Gradients => "gradients",
            Self::Checkpoint => "checkpoint",
        }
    }

    /// Tiers evaluated from held-out diagnostics between training steps.
    #[must_use]
    pub fn is_diagnostic(self) -> bool {
        matches!(self, Self::Scalars | Self::Variables | Self::Images)
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSpec {
    pub kind: TierKind,
    pub period: u64,
}

/// Tiers ordered finest to coarsest.
///
/// Every period is an exact multiple of the period before it, so a tier that is due
/// implies every finer tier is due at the same step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSpec {
    tiers: Vec<TierSpec>,
}

impl ScheduleSpec {
    pub fn new(mut tiers: Vec<TierSpec>) -> TrainingResult<Self> {
        if tiers.is_empty() {
            return Err(TrainingError::Config("schedule must declare at least one tier".to_string()));
        }
        let mut seen = Vec::with_capacity(tiers.len());
        for tier in &tiers {
            if tier.period == 0 {
                return Err(TrainingError::Config(format!("tier '{}' has period 0", tier.kind)));
            }
            if seen.contains(&tier.kind) {
                return Err(TrainingError::Config(format!("tier '{}' declared more than once", tier.kind)));
            }
            seen.push(tier.kind);
        }

        tiers.sort_by_key(|t| (t.period, t.kind));
        for pair in tiers.windows(2) {
            let (finer, coarser) = (pair[0], pair[1]);
            if coarser.period % finer.period != 0 {
                return Err(TrainingError::Config(format!(
                    "tier '{}' period {} is not a multiple of tier '{}' period {}",
                    coarser.kind, coarser.period, finer.kind, finer.period
                )));
            }
        }

        Ok(Self { tiers })
    }

    #[must_use]
    pub fn tiers(&self) -> &[TierSpec] {
        &self.tiers
    }

    #[must_use]
    pub fn period(&self, kind: TierKind) -> Option<u64> {
        self.tiers.iter().find(|t| t.kind == kind).map(|t| t.period)
    }

    /// Tiers due at `step`. Step 0 is due for every tier.
    #[must_use]
    pub fn due_tasks(&self, step: u64) -> DueTiers {
        let mut due = DueTiers::default();
        for tier in &self.tiers {
            // Finest first: once a tier misses, every coarser one misses too.
            if step % tier.period != 0 {
                break;
            }
            due.insert(tier.kind);
        }
        due
    }
}

/// Set of tiers due at one step, stored finest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DueTiers {
    kinds: Vec<TierKind>,
}

impl DueTiers {
    fn insert(&mut self, kind: TierKind) {
        if !self.kinds.contains(&kind) {
            self.kinds.push(kind);
        }
    }

    #[must_use]
    pub fn contains(&self, kind: TierKind) -> bool {
        self.kinds.contains(&kind)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Finest to coarsest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = TierKind> + '_ {
        self.kinds.iter().copied()
    }

    /// Coarsest to finest, the order in which artifacts are produced.
    pub fn coarsest_first(&self) -> impl Iterator<Item = TierKind> + '_ {
        self.kinds.iter().rev().copied()
    }

    /// Due diagnostic tiers, coarsest first.
    #[must_use]
    pub fn diagnostics(&self) -> Vec<TierKind> {
        self.coarsest_first().filter(|k| k.is_diagnostic()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_schedule() -> ScheduleSpec {
        ScheduleSpec::new(vec![
            TierSpec { kind: TierKind::Images, period: 1000 },
            TierSpec { kind: TierKind::Scalars, period: 50 },
            TierSpec { kind: TierKind::Checkpoint, period: 10_000 },
            TierSpec { kind: TierKind::Variables, period: 500 },
            TierSpec { kind: TierKind::Gradients, period: 100 },
        ])
        .unwrap()
    }

    #[test]
    fn test_tiers_sorted_finest_first() {
        let schedule = default_schedule();
        let periods: Vec<u64> = schedule.tiers().iter().map(|t| t.period).collect();
        assert_eq!(periods, vec![50, 100, 500, 1000, 10_000]);
        assert_eq!(schedule.period(TierKind::Variables), Some(500));
    }

    #[test]
    fn test_step_zero_due_for_every_tier() {
        let due = default_schedule().due_tasks(0);
        for kind in TierKind::ALL {
            assert!(due.contains(kind), "{kind} not due at step 0");
        }
    }

    #[test]
    fn test_coarse_due_implies_finer_due() {
        let schedule = default_schedule();
        for step in 0..25_000 {
            let due = schedule.due_tasks(step);
            for (i, tier) in schedule.tiers().iter().enumerate() {
                if due.contains(tier.kind) {
                    for finer in &schedule.tiers()[..i] {
                        assert!(due.contains(finer.kind), "step {step}: {} without {}", tier.kind, finer.kind);
                    }
                }
                assert_eq!(due.contains(tier.kind), step % tier.period == 0);
            }
        }
    }

    #[test]
    fn test_due_sets_at_sample_steps() {
        let schedule = default_schedule();
        assert!(schedule.due_tasks(1).is_empty());
        assert_eq!(schedule.due_tasks(50).iter().collect::<Vec<_>>(), vec![TierKind::Scalars]);
        assert_eq!(
            schedule.due_tasks(500).iter().collect::<Vec<_>>(),
            vec![TierKind::Scalars, TierKind::Gradients, TierKind::Variables]
        );
        assert_eq!(
            schedule.due_tasks(3000).coarsest_first().collect::<Vec<_>>(),
            vec![TierKind::Images, TierKind::Variables, TierKind::Gradients, TierKind::Scalars]
        );
        assert_eq!(
            schedule.due_tasks(3000).diagnostics(),
            vec![TierKind::Images, TierKind::Variables, TierKind::Scalars]
        );
    }

    #[test]
    fn test_rejects_non_nested_periods() {
        let err = ScheduleSpec::new(vec![
            TierSpec { kind: TierKind::Scalars, period: 50 },
            TierSpec { kind: TierKind::Gradients, period: 75 },
        ])
        .unwrap_err();
        assert!(matches!(err, TrainingError::Config(_)));
    }

    #[test]
    fn test_rejects_zero_period_duplicates_and_empty() {
        assert!(ScheduleSpec::new(vec![]).is_err());
        assert!(ScheduleSpec::new(vec![TierSpec { kind: TierKind::Scalars, period: 0 }]).is_err());
        assert!(ScheduleSpec::new(vec![
            TierSpec { kind: TierKind::Scalars, period: 10 },
            TierSpec { kind: TierKind::Scalars, period: 20 },
        ])
        .is_err());
        assert!(ScheduleSpec::new(vec![
            TierSpec { kind: TierKind::Scalars, period: 10 },
            TierSpec { kind: TierKind::Images, period: 10 },
        ])
        .is_ok());
    }
}
