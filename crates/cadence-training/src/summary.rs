//! Append-only diagnostic event stream (`summary/events.jsonl`).

use crate::error::{TrainingError, TrainingResult};
use crate::schedule::TierKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SummaryValue {
    Scalar {
        tag: String,
        value: f64,
    },
    Histogram {
        tag: String,
        count: u64,
        min: f64,
        max: f64,
        mean: f64,
        std: f64,
    },
    Image {
        tag: String,
        width: u32,
        height: u32,
        /// Grayscale, row-major.
        #[serde(with = "base64_bytes")]
        pixels: Vec<u8>,
    },
}

impl SummaryValue {
    pub fn scalar(tag: impl Into<String>, value: f64) -> Self {
        Self::Scalar { tag: tag.into(), value }
    }

    /// Summary statistics of `values`. An empty slice yields an all-zero histogram.
    pub fn histogram(tag: impl Into<String>, values: &[f32]) -> Self {
        let count = values.len() as u64;
        if values.is_empty() {
            return Self::Histogram { tag: tag.into(), count, min: 0.0, max: 0.0, mean: 0.0, std: 0.0 };
        }
        let (mut min, mut max, mut sum) = (f64::INFINITY, f64::NEG_INFINITY, 0.0);
        for v in values.iter().map(|v| f64::from(*v)) {
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        let mean = sum / count as f64;
        let var = values.iter().map(|v| (f64::from(*v) - mean).powi(2)).sum::<f64>() / count as f64;
        Self::Histogram { tag: tag.into(), count, min, max, mean, std: var.sqrt() }
    }

    pub fn image(tag: impl Into<String>, width: u32, height: u32, pixels: Vec<u8>) -> TrainingResult<Self> {
        if pixels.len() != width as usize * height as usize {
            return Err(TrainingError::Summary(format!(
                "image has {} pixels, expected {width}x{height}",
                pixels.len()
            )));
        }
        Ok(Self::Image { tag: tag.into(), width, height, pixels })
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        match self {
            Self::Scalar { tag, .. } | Self::Histogram { tag, .. } | Self::Image { tag, .. } => tag,
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryEvent {
    pub step: u64,
    pub tier: TierKind,
    pub wall_time: DateTime<Utc>,
    pub values: Vec<SummaryValue>,
}

pub struct SummaryWriter {
    path: PathBuf,
    out: BufWriter<fs::File>,
    written: u64,
}

impl std::fmt::Debug for SummaryWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryWriter").field("path", &self.path).field("written", &self.written).finish()
    }
}

impl SummaryWriter {
    /// Opens (or continues) the event stream inside `dir`.
    pub fn open(dir: &Path) -> TrainingResult<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(EVENTS_FILE);
        let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, out: BufWriter::new(file), written: 0 })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Events written through this writer.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn write(&mut self, step: u64, tier: TierKind, values: Vec<SummaryValue>) -> TrainingResult<()> {
        let event = SummaryEvent { step, tier, wall_time: Utc::now(), values };
        serde_json::to_writer(&mut self.out, &event)?;
        self.out.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> TrainingResult<()> {
        self.out.flush()?;
        Ok(())
    }
}

impl Drop for SummaryWriter {
    fn drop(&mut self) {
        let _ = self.out.flush();
    }
}

pub fn read_events(path: &Path) -> TrainingResult<Vec<SummaryEvent>> {
    let contents = fs::read_to_string(path)?;
    let mut events = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str(line)
            .map_err(|e| TrainingError::Summary(format!("failed to parse event line {}: {}", idx + 1, e)))?;
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_read_events() {
        let temp = TempDir::new().unwrap();
        let mut writer = SummaryWriter::open(temp.path()).unwrap();
        writer.write(0, TierKind::Scalars, vec![SummaryValue::scalar("loss", 1.5)]).unwrap();
        writer
            .write(0, TierKind::Images, vec![SummaryValue::image("canvas", 2, 2, vec![0, 64, 128, 255]).unwrap()])
            .unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.written(), 2);

        let events = read_events(writer.path()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].tier, TierKind::Scalars);
        assert_eq!(events[0].values[0].tag(), "loss");
        match &events[1].values[0] {
            SummaryValue::Image { pixels, width, .. } => {
                assert_eq!(*width, 2);
                assert_eq!(pixels, &vec![0, 64, 128, 255]);
            }
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn test_reopen_appends() {
        let temp = TempDir::new().unwrap();
        for step in [0, 50] {
            let mut writer = SummaryWriter::open(temp.path()).unwrap();
            writer.write(step, TierKind::Scalars, vec![]).unwrap();
        }
        let steps: Vec<u64> = read_events(&temp.path().join(EVENTS_FILE)).unwrap().iter().map(|e| e.step).collect();
        assert_eq!(steps, vec![0, 50]);
    }

    #[test]
    fn test_histogram_stats() {
        match SummaryValue::histogram("w", &[1.0, 2.0, 3.0, 4.0]) {
            SummaryValue::Histogram { count, min, max, mean, std, .. } => {
                assert_eq!(count, 4);
                assert_eq!(min, 1.0);
                assert_eq!(max, 4.0);
                assert!((mean - 2.5).abs() < 1e-12);
                assert!((std - 1.25f64.sqrt()).abs() < 1e-12);
            }
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn test_image_dimension_mismatch() {
        assert!(SummaryValue::image("bad", 3, 3, vec![0; 8]).is_err());
    }
}
