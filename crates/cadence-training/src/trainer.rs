//! The iteration driver.

use crate::annealing::{AnnealingSchedules, HyperParams};
use crate::checkpoint::CheckpointManager;
use crate::error::{TrainingError, TrainingResult};
use crate::executor::StepExecutor;
use crate::pipeline::{DataPipeline, ShutdownReport, ensure_blocking_context};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::schedule::{ScheduleSpec, TierKind};
use crate::summary::{SummaryValue, SummaryWriter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    /// Baseline capture before the first step.
    Init,
    Running,
    /// Cancelling and joining the pipeline.
    Draining,
    Stopped,
    Failed,
}

impl LoopState {
    #[must_use]
    #[allow(clippy::match_same_arms)]
    pub fn can_transition_to(&self, to: Self) -> bool {
        match (self, to) {
            (Self::Init, Self::Running | Self::Draining) => true,
            (Self::Running, Self::Draining) => true,
            (Self::Draining, Self::Stopped | Self::Failed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every pass over the source was consumed.
    Exhausted,
    /// Stopped through the pipeline's stop token.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub steps: u64,
    pub checkpoints: usize,
    pub failed_checkpoints: usize,
    pub summary_events: u64,
    pub failed_summaries: usize,
    pub shutdown: ShutdownReport,
}

#[derive(Debug, Default)]
struct Tally {
    checkpoints: usize,
    failed_checkpoints: usize,
    failed_summaries: usize,
}

/// Owns the iteration counter and every per-run component. A run is one call to
/// [`TrainingLoop::run`]; the loop cannot be restarted afterwards.
pub struct TrainingLoop {
    schedule: ScheduleSpec,
    annealing: AnnealingSchedules,
    checkpoints: CheckpointManager,
    summaries: SummaryWriter,
    progress: Arc<dyn ProgressSink>,
    step: u64,
    state: LoopState,
    tally: Tally,
}

impl std::fmt::Debug for TrainingLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingLoop")
            .field("step", &self.step)
            .field("state", &self.state)
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

impl TrainingLoop {
    #[must_use]
    pub fn new(
        schedule: ScheduleSpec,
        annealing: AnnealingSchedules,
        checkpoints: CheckpointManager,
        summaries: SummaryWriter,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            schedule,
            annealing,
            checkpoints,
            summaries,
            progress,
            step: 0,
            state: LoopState::Init,
            tally: Tally::default(),
        }
    }

    #[must_use]
    pub fn step(&self) -> u64 {
        self.step
    }

    #[must_use]
    pub fn state(&self) -> LoopState {
        self.state
    }

    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Drives `executor` with batches from `pipeline` until the source is exhausted, the
    /// pipeline is stopped, or a step fails.
    ///
    /// The pipeline is cancelled and joined before this returns, on every path.
    /// Blocks the calling thread, so it is refused inside a tokio runtime.
    pub fn run(&mut self, executor: &mut dyn StepExecutor, mut pipeline: DataPipeline) -> TrainingResult<RunSummary> {
        if self.state != LoopState::Init {
            return Err(TrainingError::Transition { from: self.state, to: LoopState::Running });
        }
        ensure_blocking_context()?;
        self.progress.on_event(ProgressEvent::Started { workers: pipeline.stats().live_workers });

        let driven = self.drive(executor, &mut pipeline);

        let draining = self.transition(LoopState::Draining);
        let shutdown = pipeline.shutdown();
        drop(pipeline);
        if let Err(e) = self.summaries.flush() {
            warn!(error = %e, "Failed to flush summaries");
        }
        draining?;

        let driven = driven.and_then(|outcome| {
            if shutdown.panicked > 0 {
                return Err(TrainingError::Source(format!("{} pipeline workers panicked", shutdown.panicked)));
            }
            Ok(outcome)
        });

        match driven {
            Ok(outcome) => {
                self.transition(LoopState::Stopped)?;
                let event = match outcome {
                    RunOutcome::Exhausted => ProgressEvent::Ended { steps: self.step },
                    RunOutcome::Cancelled => ProgressEvent::Cancelled { steps: self.step },
                };
                self.progress.on_event(event);
                info!(steps = self.step, outcome = ?outcome, "Training finished");

                Ok(RunSummary {
                    outcome,
                    steps: self.step,
                    checkpoints: self.tally.checkpoints,
                    failed_checkpoints: self.tally.failed_checkpoints,
                    summary_events: self.summaries.written(),
                    failed_summaries: self.tally.failed_summaries,
                    shutdown,
                })
            }
            Err(e) => {
                self.transition(LoopState::Failed)?;
                error!(step = self.step, error = %e, "Training failed");
                Err(e)
            }
        }
    }

    fn drive(&mut self, executor: &mut dyn StepExecutor, pipeline: &mut DataPipeline) -> TrainingResult<RunOutcome> {
        // Every tier is due at the first step, so this records the untrained baseline.
        self.capture(executor);
        self.transition(LoopState::Running)?;

        loop {
            if pipeline.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }

            let due = self.schedule.due_tasks(self.step);
            let hparams = self.annealing.values(self.step);

            let Some(batch) = pipeline.next_batch()? else {
                return Ok(if pipeline.is_cancelled() { RunOutcome::Cancelled } else { RunOutcome::Exhausted });
            };

            let output = executor
                .train_step(batch, &hparams, due.contains(TierKind::Gradients))
                .map_err(|e| match e {
                    TrainingError::Step(_) => e,
                    other => TrainingError::Step(other.to_string()),
                })?;

            let computed_at = self.step;
            self.step += 1;

            if !output.gradients.is_empty() {
                // Tagged with the step whose parameters produced them.
                self.record(computed_at, TierKind::Gradients, output.gradients);
            }

            self.progress.on_event(ProgressEvent::Step {
                step: self.step,
                loss: output.loss,
                accuracy: output.accuracy,
            });

            self.capture(executor);
        }
    }

    /// Records diagnostics and checkpoints due at the current step.
    fn capture(&mut self, executor: &mut dyn StepExecutor) {
        let step = self.step;
        let due = self.schedule.due_tasks(step);
        if due.is_empty() {
            return;
        }
        debug!(step, tiers = ?due.iter().collect::<Vec<_>>(), "Tiers due");

        let diagnostics = due.diagnostics();
        if !diagnostics.is_empty() {
            match executor.diagnostics(&diagnostics) {
                Ok(mut captured) => {
                    for tier in diagnostics {
                        let mut values = captured.remove(&tier).unwrap_or_default();
                        if tier == TierKind::Scalars {
                            values.extend(hyperparam_scalars(&self.annealing.values(step)));
                        }
                        self.record(step, tier, values);
                    }
                }
                Err(e) => {
                    // All or nothing, so the exported series stay aligned.
                    self.tally.failed_summaries += diagnostics.len();
                    warn!(step, error = %e, "Diagnostic capture failed");
                }
            }
        }

        if due.contains(TierKind::Checkpoint) {
            self.checkpoint(step, executor);
        }
    }

    fn checkpoint(&mut self, step: u64, executor: &dyn StepExecutor) {
        match self.checkpoints.maybe_save(step, executor) {
            Ok(Some(record)) => {
                self.tally.checkpoints += 1;
                self.progress.on_event(ProgressEvent::CheckpointSaved { step, path: record.path });
            }
            Ok(None) => {}
            Err(e) => {
                self.tally.failed_checkpoints += 1;
                warn!(step, error = %e, "Checkpoint failed, continuing");
                self.progress.on_event(ProgressEvent::CheckpointFailed { step, error: e.to_string() });
            }
        }
    }

    fn record(&mut self, step: u64, tier: TierKind, values: Vec<SummaryValue>) {
        if let Err(e) = self.summaries.write(step, tier, values) {
            self.tally.failed_summaries += 1;
            warn!(step, tier = %tier, error = %e, "Failed to write summary");
        }
    }

    fn transition(&mut self, to: LoopState) -> TrainingResult<()> {
        let from = self.state;
        if !from.can_transition_to(to) {
            error!(from = ?from, to = ?to, "Invalid loop transition");
            return Err(TrainingError::Transition { from, to });
        }
        debug!(from = ?from, to = ?to, step = self.step, "Loop transition");
        self.state = to;
        Ok(())
    }
}

fn hyperparam_scalars(hparams: &HyperParams) -> impl Iterator<Item = SummaryValue> + '_ {
    hparams.iter().map(|(name, value)| SummaryValue::scalar(format!("hparams/{name}"), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        assert!(LoopState::Init.can_transition_to(LoopState::Running));
        assert!(LoopState::Init.can_transition_to(LoopState::Draining));
        assert!(LoopState::Running.can_transition_to(LoopState::Draining));
        assert!(LoopState::Draining.can_transition_to(LoopState::Stopped));
        assert!(LoopState::Draining.can_transition_to(LoopState::Failed));

        assert!(!LoopState::Running.can_transition_to(LoopState::Stopped));
        assert!(!LoopState::Running.can_transition_to(LoopState::Failed));
        assert!(!LoopState::Stopped.can_transition_to(LoopState::Running));
        assert!(!LoopState::Failed.can_transition_to(LoopState::Draining));
        assert!(!LoopState::Init.can_transition_to(LoopState::Init));
    }
}
