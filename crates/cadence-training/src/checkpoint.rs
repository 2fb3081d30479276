//! Durable, atomically published checkpoints keyed by step.

use crate::error::{TrainingError, TrainingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const INDEX_FILE: &str = "checkpoints.json";

/// Anything whose full state can be streamed into a checkpoint.
pub trait Checkpointable {
    fn write_state(&self, out: &mut dyn Write) -> TrainingResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub step: u64,
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CheckpointIndex {
    latest: Option<PathBuf>,
    records: Vec<CheckpointRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointPolicy {
    /// File name prefix, `<prefix>-<step>.ckpt`.
    pub prefix: String,
    /// `None` keeps every checkpoint.
    pub max_to_keep: Option<usize>,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self { prefix: "model".to_string(), max_to_keep: None }
    }
}

impl CheckpointPolicy {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.prefix.trim().is_empty() || self.prefix.contains(['/', '\\']) {
            return Err(TrainingError::Config(format!("invalid checkpoint prefix '{}'", self.prefix)));
        }
        if self.max_to_keep == Some(0) {
            return Err(TrainingError::Config("checkpoint max_to_keep must be >= 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    /// Checkpoint tier period; `None` disables saving.
    period: Option<u64>,
    policy: CheckpointPolicy,
    records: Vec<CheckpointRecord>,
}

impl CheckpointManager {
    /// Opens `dir`, picking up any records already listed in its index.
    pub fn open(dir: impl Into<PathBuf>, period: Option<u64>, policy: CheckpointPolicy) -> TrainingResult<Self> {
        policy.validate()?;
        if period == Some(0) {
            return Err(TrainingError::Config("checkpoint period must be >= 1".to_string()));
        }

        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let index_path = dir.join(INDEX_FILE);
        let records = if index_path.exists() {
            let index: CheckpointIndex = serde_json::from_slice(&fs::read(&index_path)?)?;
            index.records
        } else {
            Vec::new()
        };

        Ok(Self { dir, period, policy, records })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn records(&self) -> &[CheckpointRecord] {
        &self.records
    }

    #[must_use]
    pub fn latest(&self) -> Option<&CheckpointRecord> {
        self.records.last()
    }

    #[must_use]
    pub fn is_due(&self, step: u64) -> bool {
        self.period.is_some_and(|p| step % p == 0)
    }

    #[must_use]
    pub fn path_for(&self, step: u64) -> PathBuf {
        self.dir.join(format!("{}-{step}.ckpt", self.policy.prefix))
    }

    /// Saves when `step` falls on the checkpoint period.
    pub fn maybe_save<S>(&mut self, step: u64, state: &S) -> TrainingResult<Option<CheckpointRecord>>
    where
        S: Checkpointable + ?Sized,
    {
        if !self.is_due(step) {
            return Ok(None);
        }
        self.save(step, state).map(Some)
    }

    /// Writes to a temporary file beside the target and renames it into place,
    /// so the final path never holds a partial checkpoint.
    pub fn save<S>(&mut self, step: u64, state: &S) -> TrainingResult<CheckpointRecord>
    where
        S: Checkpointable + ?Sized,
    {
        let path = self.path_for(step);
        let (sha256, bytes) = publish(&path, |out| state.write_state(out))
            .map_err(|e| TrainingError::Checkpoint(format!("step {step}: {e}")))?;

        let record = CheckpointRecord { step, path, sha256, bytes, created_at: Utc::now() };
        let mut records = self.records.clone();
        records.retain(|r| r.step != step);
        records.push(record.clone());
        let evicted = self.evict(&mut records);

        // Until the index lands, the published file is not part of the history.
        self.write_index(&records)?;
        self.records = records;
        for old in evicted {
            match fs::remove_file(&old.path) {
                Ok(()) => debug!(step = old.step, "Pruned checkpoint"),
                Err(e) => warn!(step = old.step, error = %e, "Failed to prune checkpoint"),
            }
        }

        info!(step, path = %record.path.display(), bytes, "Checkpoint saved");
        Ok(record)
    }

    /// Oldest records beyond `max_to_keep`, removed from `records`.
    fn evict(&self, records: &mut Vec<CheckpointRecord>) -> Vec<CheckpointRecord> {
        let excess = match self.policy.max_to_keep {
            Some(max) => records.len().saturating_sub(max),
            None => 0,
        };
        records.drain(..excess).collect()
    }

    fn write_index(&self, records: &[CheckpointRecord]) -> TrainingResult<()> {
        let index = CheckpointIndex { latest: records.last().map(|r| r.path.clone()), records: records.to_vec() };
        let json = serde_json::to_vec_pretty(&index)?;
        publish(&self.dir.join(INDEX_FILE), |out| Ok(out.write_all(&json)?))
            .map_err(|e| TrainingError::Checkpoint(format!("index: {e}")))?;
        Ok(())
    }
}

/// Tees written bytes into a SHA-256 digest.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn publish<F>(target: &Path, fill: F) -> TrainingResult<(String, u64)>
where
    F: FnOnce(&mut dyn Write) -> TrainingResult<()>,
{
    let dir = target
        .parent()
        .ok_or_else(|| TrainingError::Checkpoint(format!("no parent directory: {}", target.display())))?;
    let name = target.file_name().and_then(|n| n.to_str()).unwrap_or("checkpoint");
    let temp_path = dir.join(format!(".{name}.tmp.{}", Uuid::new_v4().simple()));

    let written = (|| {
        let file = fs::File::create(&temp_path)?;
        let mut out = HashingWriter { inner: BufWriter::new(file), hasher: Sha256::new(), bytes: 0 };
        fill(&mut out)?;
        out.flush()?;
        let file = out.inner.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok::<_, TrainingError>((hex::encode(out.hasher.finalize()), out.bytes))
    })();

    let digest = match written {
        Ok(d) => d,
        Err(e) => {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
    };

    if let Err(e) = fs::rename(&temp_path, target) {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }
    Ok(digest)
}
