use crate::error::{TrainingError, TrainingResult};

/// One decoded training example.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub features: Vec<f32>,
    pub target: u32,
}

/// Decoded inputs plus target labels, consumed exactly once by the step executor.
///
/// Deliberately not `Clone`: ownership moves from the pipeline to the loop on dequeue.
#[derive(Debug, PartialEq)]
pub struct Batch {
    /// Row-major `len() x width()` feature matrix.
    pub inputs: Vec<f32>,
    pub targets: Vec<u32>,
    width: usize,
}

impl Batch {
    pub fn from_examples(examples: Vec<Example>) -> TrainingResult<Self> {
        let Some(first) = examples.first() else {
            return Err(TrainingError::Source("cannot assemble an empty batch".to_string()));
        };
        let width = first.features.len();

        let mut inputs = Vec::with_capacity(width * examples.len());
        let mut targets = Vec::with_capacity(examples.len());
        for (idx, ex) in examples.into_iter().enumerate() {
            if ex.features.len() != width {
                return Err(TrainingError::Source(format!(
                    "example[{idx}] has {} features, expected {width}",
                    ex.features.len()
                )));
            }
            inputs.extend_from_slice(&ex.features);
            targets.push(ex.target);
        }

        Ok(Self { inputs, targets, width })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn rows(&self) -> impl Iterator<Item = (&[f32], u32)> {
        self.inputs.chunks(self.width.max(1)).zip(self.targets.iter().copied())
    }
}

/// Sequential access to raw records, one pass over the dataset at a time.
///
/// Shared by every pipeline worker behind a lock, so implementations only need `Send`.
pub trait RecordReader: Send {
    /// Next raw record of the current pass, or `None` when the pass is over.
    fn next_record(&mut self) -> TrainingResult<Option<Vec<u8>>>;

    /// Start a new pass from the first record.
    fn rewind(&mut self) -> TrainingResult<()>;
}

/// Turns one raw record into an [`Example`]. Runs concurrently on every worker.
pub trait RecordDecoder: Send + Sync {
    fn decode(&self, record: &[u8]) -> TrainingResult<Example>;
}

/// In-memory record list, mostly for tests and synthetic runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecords {
    records: Vec<Vec<u8>>,
    cursor: usize,
}

impl MemoryRecords {
    #[must_use]
    pub fn new(records: Vec<Vec<u8>>) -> Self {
        Self { records, cursor: 0 }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RecordReader for MemoryRecords {
    fn next_record(&mut self) -> TrainingResult<Option<Vec<u8>>> {
        let record = self.records.get(self.cursor).cloned();
        if record.is_some() {
            self.cursor += 1;
        }
        Ok(record)
    }

    fn rewind(&mut self) -> TrainingResult<()> {
        self.cursor = 0;
        Ok(())
    }
}
