//! Cadence Training
//!
//! Iteration orchestration for long-running training jobs:
//! - Nested periodic tiers (`ScheduleSpec`) deciding what to capture at each step
//! - Exponential hyperparameter annealing (`AnnealingSchedules`)
//! - A bounded, cancellable background decoding pipeline (`DataPipeline`)
//! - Atomically published checkpoints (`CheckpointManager`)
//! - The driver tying them together (`TrainingLoop`)

pub mod annealing;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod executor;
pub mod layout;
pub mod pipeline;
pub mod progress;
pub mod schedule;
pub mod summary;
pub mod trainer;

pub use annealing::{AnnealingSchedules, AnnealingSpec, HyperParams};
pub use checkpoint::{CheckpointManager, CheckpointPolicy, CheckpointRecord, Checkpointable};
pub use config::{ResolvedConfig, ScheduleConfig, SnapshotConfig, TrainingConfig};
pub use dataset::{Batch, Example, MemoryRecords, RecordDecoder, RecordReader};
pub use error::{TrainingError, TrainingResult};
pub use executor::{StepExecutor, StepOutput};
pub use layout::ResultsLayout;
pub use pipeline::{DataPipeline, PipelineConfig, PipelineStats, ShutdownReport};
pub use progress::{format_step_line, ProgressEvent, ProgressSink, StdoutProgressSink};
pub use schedule::{DueTiers, ScheduleSpec, TierKind, TierSpec};
pub use summary::{read_events, SummaryEvent, SummaryValue, SummaryWriter};
pub use trainer::{LoopState, RunOutcome, RunSummary, TrainingLoop};
