//! Background decoding workers feeding a bounded batch queue.
//!
//! Shutdown order is fixed: cancel, close the queue to new pushes, join every worker,
//! then release whatever is still buffered. [`DataPipeline`] runs it from `Drop` as well,
//! so no worker outlives the pipeline on any exit path.

use crate::dataset::{Batch, Example, RecordDecoder, RecordReader};
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type QueueItem = TrainingResult<Batch>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub workers: usize,
    /// Bounded queue size; pushes block once this many batches are buffered.
    pub capacity: usize,
    pub batch_size: usize,
    /// Number of full passes over the source before it reports exhaustion.
    pub epochs: u32,
    /// Emit the trailing partial batch of the last pass instead of dropping it.
    pub allow_smaller_final_batch: bool,
}

impl PipelineConfig {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.workers == 0 {
            return Err(TrainingError::Config("pipeline workers must be >= 1".to_string()));
        }
        if self.capacity == 0 {
            return Err(TrainingError::Config("pipeline queue capacity must be >= 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(TrainingError::Config("batch_size must be >= 1".to_string()));
        }
        if self.epochs == 0 {
            return Err(TrainingError::Config("epochs must be >= 1".to_string()));
        }
        Ok(())
    }
}

/// Hands out records across passes. Passes are continuous: a batch may span two of them.
struct EpochCursor {
    reader: Box<dyn RecordReader>,
    epochs: u32,
    pass: u32,
    read_in_pass: u64,
    exhausted: bool,
}

impl EpochCursor {
    fn take(&mut self, n: usize) -> TrainingResult<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n && !self.exhausted {
            if let Some(record) = self.reader.next_record()? {
                self.read_in_pass += 1;
                out.push(record);
                continue;
            }

            self.pass += 1;
            debug!(pass = self.pass, records = self.read_in_pass, "Source pass complete");
            if self.pass >= self.epochs || self.read_in_pass == 0 {
                self.exhausted = true;
            } else {
                self.read_in_pass = 0;
                self.reader.rewind()?;
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Default)]
struct Counters {
    produced: AtomicU64,
    live_workers: AtomicUsize,
}

/// Decrements the live worker count however the worker exits.
struct LiveGuard(Arc<Counters>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.live_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    /// Batches successfully pushed into the queue so far.
    pub produced: u64,
    pub live_workers: usize,
    pub buffered: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub joined: usize,
    pub panicked: usize,
    /// Buffered batches released without being consumed.
    pub discarded: usize,
}

pub struct DataPipeline {
    receiver: Option<mpsc::Receiver<QueueItem>>,
    workers: Vec<JoinHandle<()>>,
    /// External stop signal, also cancelled by `shutdown`.
    stop: CancellationToken,
    /// Observed by workers. Child of `stop`; cancelled alone when a worker fails.
    halt: CancellationToken,
    counters: Arc<Counters>,
    report: Option<ShutdownReport>,
}

impl std::fmt::Debug for DataPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataPipeline")
            .field("workers", &self.workers.len())
            .field("cancelled", &self.stop.is_cancelled())
            .field("stopped", &self.report.is_some())
            .finish_non_exhaustive()
    }
}

impl DataPipeline {
    /// Spawns `config.workers` threads reading from one shared source.
    pub fn start<R, D>(config: PipelineConfig, reader: R, decoder: D) -> TrainingResult<Self>
    where
        R: RecordReader + 'static,
        D: RecordDecoder + 'static,
    {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.capacity);
        let stop = CancellationToken::new();
        let halt = stop.child_token();
        let counters = Arc::new(Counters::default());
        let cursor = Arc::new(Mutex::new(EpochCursor {
            reader: Box::new(reader),
            epochs: config.epochs,
            pass: 0,
            read_in_pass: 0,
            exhausted: false,
        }));
        let decoder: Arc<dyn RecordDecoder> = Arc::new(decoder);

        // Built before spawning so that a failed spawn still joins the earlier workers.
        let mut pipeline = Self {
            receiver: Some(rx),
            workers: Vec::with_capacity(config.workers),
            stop,
            halt,
            counters,
            report: None,
        };

        for id in 0..config.workers {
            let worker = Worker {
                id,
                batch_size: config.batch_size,
                allow_smaller_final_batch: config.allow_smaller_final_batch,
                cursor: Arc::clone(&cursor),
                decoder: Arc::clone(&decoder),
                tx: tx.clone(),
                halt: pipeline.halt.clone(),
                counters: Arc::clone(&pipeline.counters),
            };
            pipeline.counters.live_workers.fetch_add(1, Ordering::SeqCst);
            let spawned = std::thread::Builder::new()
                .name(format!("pipeline-worker-{id}"))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => pipeline.workers.push(handle),
                Err(e) => {
                    pipeline.counters.live_workers.fetch_sub(1, Ordering::SeqCst);
                    return Err(e.into());
                }
            }
        }

        info!(
            workers = config.workers,
            capacity = config.capacity,
            batch_size = config.batch_size,
            epochs = config.epochs,
            "Data pipeline started"
        );
        Ok(pipeline)
    }

    /// Blocks until a batch is available.
    ///
    /// `Ok(None)` means every worker has exited: the source is exhausted, or the
    /// pipeline was stopped (see [`DataPipeline::is_cancelled`]).
    ///
    /// Must not be called from a thread driving a tokio runtime; async callers go
    /// through `tokio::task::spawn_blocking`.
    pub fn next_batch(&mut self) -> TrainingResult<Option<Batch>> {
        ensure_blocking_context()?;
        let Some(rx) = self.receiver.as_mut() else {
            return Ok(None);
        };
        rx.blocking_recv().transpose()
    }

    /// Token for external stop requests (e.g. Ctrl-C).
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.stop.is_cancelled()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.report.is_some()
    }

    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            produced: self.counters.produced.load(Ordering::SeqCst),
            live_workers: self.counters.live_workers.load(Ordering::SeqCst),
            buffered: self.receiver.as_ref().map_or(0, mpsc::Receiver::len),
        }
    }

    /// Cancels, joins every worker, then releases the queue. Idempotent.
    pub fn shutdown(&mut self) -> ShutdownReport {
        if let Some(report) = self.report {
            return report;
        }

        self.stop.cancel();
        if let Some(rx) = self.receiver.as_mut() {
            // Wakes workers blocked on a full queue.
            rx.close();
        }

        let mut report = ShutdownReport::default();
        for handle in self.workers.drain(..) {
            report.joined += 1;
            if handle.join().is_err() {
                report.panicked += 1;
                error!("Pipeline worker panicked");
            }
        }

        if let Some(mut rx) = self.receiver.take() {
            while rx.try_recv().is_ok() {
                report.discarded += 1;
            }
        }

        info!(
            joined = report.joined,
            panicked = report.panicked,
            discarded = report.discarded,
            "Data pipeline stopped"
        );
        self.report = Some(report);
        report
    }
}

/// Blocking queue operations panic inside a runtime, so refuse them up front.
pub(crate) fn ensure_blocking_context() -> TrainingResult<()> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(TrainingError::Config(
            "the data pipeline blocks and must not be driven from an async context; use spawn_blocking".to_string(),
        ));
    }
    Ok(())
}

impl Drop for DataPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}

struct Worker {
    id: usize,
    batch_size: usize,
    allow_smaller_final_batch: bool,
    cursor: Arc<Mutex<EpochCursor>>,
    decoder: Arc<dyn RecordDecoder>,
    tx: mpsc::Sender<QueueItem>,
    halt: CancellationToken,
    counters: Arc<Counters>,
}

impl Worker {
    fn run(self) {
        let _live = LiveGuard(Arc::clone(&self.counters));
        debug!(worker = self.id, "Pipeline worker started");

        while !self.halt.is_cancelled() {
            let produced = panic::catch_unwind(AssertUnwindSafe(|| self.produce())).unwrap_or_else(|payload| {
                Err(TrainingError::Source(format!("pipeline worker panicked: {}", panic_message(payload.as_ref()))))
            });
            let batch = match produced {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) => {
                    warn!(worker = self.id, error = %e, "Pipeline worker failed");
                    // Queue the error before halting siblings so the consumer sees it.
                    let _ = self.tx.blocking_send(Err(e));
                    self.halt.cancel();
                    break;
                }
            };

            if self.tx.blocking_send(Ok(batch)).is_err() {
                // Queue closed by shutdown.
                break;
            }
            self.counters.produced.fetch_add(1, Ordering::SeqCst);
        }

        debug!(worker = self.id, "Pipeline worker exiting");
    }

    fn produce(&self) -> TrainingResult<Option<Batch>> {
        let records = {
            let mut cursor = self
                .cursor
                .lock()
                .map_err(|_| TrainingError::Source("record cursor lock poisoned".to_string()))?;
            cursor.take(self.batch_size)?
        };

        if records.is_empty() {
            return Ok(None);
        }
        if records.len() < self.batch_size && !self.allow_smaller_final_batch {
            debug!(worker = self.id, records = records.len(), "Dropping partial final batch");
            return Ok(None);
        }

        let mut examples: Vec<Example> = Vec::with_capacity(records.len());
        for record in &records {
            if self.halt.is_cancelled() {
                return Ok(None);
            }
            examples.push(self.decoder.decode(record)?);
        }
        Batch::from_examples(examples).map(Some)
    }
}
