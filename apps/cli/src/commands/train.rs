//! The `train` command: prepares the results folder, starts the data pipeline and
//! drives the training loop over the synthetic dataset.

use crate::config::load_config;
use crate::synthetic::{self, CanvasDecoder, SoftmaxClassifier};
use anyhow::{Context, Result};
use cadence_training::{
    CheckpointManager, DataPipeline, MemoryRecords, RecordDecoder, ResultsLayout, RunOutcome, StdoutProgressSink,
    SummaryWriter, TierKind, TrainingLoop, config::DEFAULT_READER_THREADS,
};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_RESULTS_FOLDER: &str = "cadence_results";

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Folder that receives models, summaries and the source snapshot
    #[arg(short, long, default_value = DEFAULT_RESULTS_FOLDER)]
    pub results_folder: PathBuf,

    /// Replace an existing results folder (0 or 1)
    #[arg(short = 'o', long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    pub overwrite_results: u8,

    /// Number of data reader threads
    #[arg(short = 't', long, default_value_t = DEFAULT_READER_THREADS, value_parser = parse_reader_threads)]
    pub reader_threads: usize,

    /// Configuration file to merge over the defaults
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override the number of passes over the dataset
    #[arg(long)]
    pub epochs: Option<u32>,

    /// Override the batch size
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Number of synthetic training records
    #[arg(long, default_value_t = 640)]
    pub records: usize,

    /// Seed for the synthetic dataset
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Directory whose source files are copied into the results folder
    #[arg(long, default_value = ".")]
    pub snapshot_dir: PathBuf,
}

fn parse_reader_threads(value: &str) -> Result<usize, String> {
    let threads: usize = value.parse().map_err(|_| format!("`{value}` is not a number"))?;
    if threads == 0 {
        return Err("at least one reader thread is required".to_string());
    }
    Ok(threads)
}

pub fn execute(args: TrainArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    config.reader_threads = args.reader_threads;
    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    let resolved = config.validate().context("Invalid training configuration")?;

    let layout = ResultsLayout::new(&args.results_folder);
    layout.prepare(args.overwrite_results == 1)?;
    layout.write_source_file("config.toml", &config.to_toml()?)?;
    let copied = layout
        .snapshot_sources(&args.snapshot_dir, &config.snapshot.extensions)
        .with_context(|| format!("Failed to snapshot sources from {}", args.snapshot_dir.display()))?;
    info!(results = %layout.root().display(), copied, "Results folder prepared");

    let checkpoints = CheckpointManager::open(
        layout.models_dir(),
        resolved.schedule.period(TierKind::Checkpoint),
        resolved.checkpoint.clone(),
    )?;
    let summaries = SummaryWriter::open(&layout.summary_dir())?;

    let test_set = synthetic::generate_records(args.records.div_ceil(10).max(1), args.seed.wrapping_add(1))
        .iter()
        .map(|record| CanvasDecoder.decode(record))
        .collect::<Result<Vec<_>, _>>()?;
    let mut model = SoftmaxClassifier::new(test_set);
    let reader = MemoryRecords::new(synthetic::generate_records(args.records, args.seed));

    let pipeline = DataPipeline::start(resolved.pipeline.clone(), reader, CanvasDecoder)?;
    let interrupt = watch_interrupt(pipeline.stop_token());

    let mut training = TrainingLoop::new(
        resolved.schedule,
        resolved.annealing,
        checkpoints,
        summaries,
        Arc::new(StdoutProgressSink),
    );
    let result = training.run(&mut model, pipeline);

    if let Some(handle) = interrupt
        && handle.join().is_err()
    {
        warn!("Interrupt watcher panicked");
    }

    let summary = result.context("Training failed")?;
    info!(
        steps = summary.steps,
        checkpoints = summary.checkpoints,
        failed_checkpoints = summary.failed_checkpoints,
        summary_events = summary.summary_events,
        discarded_batches = summary.shutdown.discarded,
        "Run summary"
    );
    if summary.outcome == RunOutcome::Cancelled {
        warn!(steps = summary.steps, "Training was interrupted");
    }
    Ok(())
}

/// Cancels `token` on Ctrl-C. The watcher exits once the token is cancelled, which
/// pipeline shutdown always does.
fn watch_interrupt(token: CancellationToken) -> Option<JoinHandle<()>> {
    let spawned = std::thread::Builder::new().name("interrupt-watcher".to_string()).spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(error = %e, "Ctrl-C handling unavailable");
                return;
            }
        };
        runtime.block_on(async {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => match signal {
                    Ok(()) => {
                        info!("Interrupt received, stopping");
                        token.cancel();
                    }
                    Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
                },
                () = token.cancelled() => {}
            }
        });
    });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Failed to spawn interrupt watcher");
            None
        }
    }
}
