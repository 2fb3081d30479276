//! A synthetic "count the blobs" dataset and a tiny softmax classifier trained on it, so a
//! run can be exercised end to end without an external model.

use cadence_training::{
    Batch, Checkpointable, Example, HyperParams, RecordDecoder, StepExecutor, StepOutput, SummaryValue, TierKind,
    TrainingError, TrainingResult,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::io::Write;

pub const CANVAS_SIZE: usize = 20;
pub const MAX_DIGITS: u8 = 2;
const CLASSES: usize = MAX_DIGITS as usize + 1;
const BLOB: usize = 5;
const NUM_SUMMARY_IMAGES: usize = 8;
const RECORD_LEN: usize = 1 + CANVAS_SIZE * CANVAS_SIZE;

/// Records are `[target, pixel...]`, one grayscale byte per pixel.
pub fn generate_records(count: usize, seed: u64) -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count).map(|_| render(&mut rng)).collect()
}

fn render(rng: &mut StdRng) -> Vec<u8> {
    let digits = rng.gen_range(0..=MAX_DIGITS);
    let mut record = vec![0u8; RECORD_LEN];
    record[0] = digits;
    for _ in 0..digits {
        let x = rng.gen_range(0..=CANVAS_SIZE - BLOB);
        let y = rng.gen_range(0..=CANVAS_SIZE - BLOB);
        for dy in 0..BLOB {
            let row = 1 + (y + dy) * CANVAS_SIZE + x;
            record[row..row + BLOB].fill(255);
        }
    }
    record
}

#[derive(Debug, Default)]
pub struct CanvasDecoder;

impl RecordDecoder for CanvasDecoder {
    fn decode(&self, record: &[u8]) -> TrainingResult<Example> {
        if record.len() != RECORD_LEN {
            return Err(TrainingError::Source(format!(
                "record has {} bytes, expected {RECORD_LEN}",
                record.len()
            )));
        }
        let Some((&target, pixels)) = record.split_first() else {
            return Err(TrainingError::Source("empty record".to_string()));
        };
        if target > MAX_DIGITS {
            return Err(TrainingError::Source(format!("target {target} exceeds {MAX_DIGITS}")));
        }
        Ok(Example {
            features: pixels.iter().map(|p| f32::from(*p) / 255.0).collect(),
            target: u32::from(target),
        })
    }
}

/// Multinomial logistic regression on (ink mass, bias).
#[derive(Debug)]
pub struct SoftmaxClassifier {
    weights: [[f64; 2]; CLASSES],
    test: Vec<Example>,
}

impl SoftmaxClassifier {
    pub fn new(test: Vec<Example>) -> Self {
        Self { weights: [[0.0; 2]; CLASSES], test }
    }

    fn features(pixels: &[f32]) -> [f64; 2] {
        let mass: f64 = pixels.iter().map(|p| f64::from(*p)).sum();
        [mass / (BLOB * BLOB) as f64, 1.0]
    }

    fn probabilities(&self, features: [f64; 2]) -> [f64; CLASSES] {
        let mut logits = [0.0; CLASSES];
        for (logit, w) in logits.iter_mut().zip(&self.weights) {
            *logit = w[0] * features[0] + w[1] * features[1];
        }
        let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut total = 0.0;
        for logit in &mut logits {
            *logit = (*logit - max).exp();
            total += *logit;
        }
        logits.map(|e| e / total)
    }

    /// Mean loss, accuracy and weight gradient over `(pixels, target)` rows.
    fn evaluate<'a>(&self, rows: impl Iterator<Item = (&'a [f32], u32)>) -> (f64, f64, [[f64; 2]; CLASSES]) {
        let (mut loss, mut correct, mut n) = (0.0, 0usize, 0usize);
        let mut grad = [[0.0; 2]; CLASSES];
        for (pixels, target) in rows {
            let f = Self::features(pixels);
            let p = self.probabilities(f);
            let target = target as usize;
            loss -= p[target].max(1e-12).ln();
            let predicted = (0..CLASSES).max_by(|a, b| p[*a].total_cmp(&p[*b])).unwrap_or(0);
            if predicted == target {
                correct += 1;
            }
            for (c, g) in grad.iter_mut().enumerate() {
                let delta = p[c] - if c == target { 1.0 } else { 0.0 };
                g[0] += delta * f[0];
                g[1] += delta * f[1];
            }
            n += 1;
        }
        if n == 0 {
            return (0.0, 0.0, grad);
        }
        let scale = 1.0 / n as f64;
        for g in &mut grad {
            g[0] *= scale;
            g[1] *= scale;
        }
        (loss * scale, correct as f64 * scale, grad)
    }
}

impl Checkpointable for SoftmaxClassifier {
    fn write_state(&self, out: &mut dyn Write) -> TrainingResult<()> {
        serde_json::to_writer(out, &serde_json::json!({ "weights": self.weights }))?;
        Ok(())
    }
}

impl StepExecutor for SoftmaxClassifier {
    fn train_step(&mut self, batch: Batch, hparams: &HyperParams, capture_gradients: bool) -> TrainingResult<StepOutput> {
        if batch.is_empty() {
            return Err(TrainingError::Step("empty batch".to_string()));
        }
        let lr = hparams.get("learning_rate").unwrap_or(1e-3);
        let (loss, accuracy, grad) = self.evaluate(batch.rows());
        if !loss.is_finite() {
            return Err(TrainingError::Step(format!("loss diverged: {loss}")));
        }

        for (w, g) in self.weights.iter_mut().zip(&grad) {
            w[0] -= lr * g[0];
            w[1] -= lr * g[1];
        }

        let gradients = if capture_gradients {
            let flat: Vec<f32> = grad.iter().flatten().map(|g| *g as f32).collect();
            let norm = grad.iter().flatten().map(|g| g * g).sum::<f64>().sqrt();
            vec![SummaryValue::histogram("gradients/weights", &flat), SummaryValue::scalar("gradients/norm", norm)]
        } else {
            Vec::new()
        };

        Ok(StepOutput { loss, accuracy, gradients })
    }

    fn diagnostics(&mut self, tiers: &[TierKind]) -> TrainingResult<BTreeMap<TierKind, Vec<SummaryValue>>> {
        let mut out = BTreeMap::new();
        for tier in tiers {
            let values = match tier {
                TierKind::Scalars => {
                    let rows = self.test.iter().map(|ex| (ex.features.as_slice(), ex.target));
                    let (loss, accuracy, _) = self.evaluate(rows);
                    vec![SummaryValue::scalar("eval/loss", loss), SummaryValue::scalar("eval/accuracy", accuracy)]
                }
                TierKind::Variables => {
                    let mass: Vec<f32> = self.weights.iter().map(|w| w[0] as f32).collect();
                    let bias: Vec<f32> = self.weights.iter().map(|w| w[1] as f32).collect();
                    vec![SummaryValue::histogram("weights/mass", &mass), SummaryValue::histogram("weights/bias", &bias)]
                }
                TierKind::Images => self
                    .test
                    .iter()
                    .take(NUM_SUMMARY_IMAGES)
                    .enumerate()
                    .map(|(i, ex)| {
                        let pixels = ex.features.iter().map(|v| (v * 255.0).round() as u8).collect();
                        SummaryValue::image(format!("eval/canvas_{i}"), CANVAS_SIZE as u32, CANVAS_SIZE as u32, pixels)
                    })
                    .collect::<TrainingResult<Vec<_>>>()?,
                TierKind::Gradients | TierKind::Checkpoint => continue,
            };
            out.insert(*tier, values);
        }
        Ok(out)
    }
}
