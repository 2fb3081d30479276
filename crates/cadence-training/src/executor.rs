use crate::annealing::HyperParams;
use crate::checkpoint::Checkpointable;
use crate::dataset::Batch;
use crate::error::TrainingResult;
use crate::schedule::TierKind;
use crate::summary::SummaryValue;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    pub loss: f64,
    pub accuracy: f64,
    /// Filled only when the step was asked to capture gradients.
    pub gradients: Vec<SummaryValue>,
}

/// The model side of training: one optimization step per batch, plus the diagnostics
/// and state the loop records around it.
pub trait StepExecutor: Checkpointable {
    fn train_step(&mut self, batch: Batch, hparams: &HyperParams, capture_gradients: bool) -> TrainingResult<StepOutput>;

    /// Summaries for every requested diagnostic tier, computed in a single evaluation so
    /// that all of them describe the same parameters. Tiers are requested coarsest first.
    fn diagnostics(&mut self, tiers: &[TierKind]) -> TrainingResult<BTreeMap<TierKind, Vec<SummaryValue>>> {
        let _ = tiers;
        Ok(BTreeMap::new())
    }
}
