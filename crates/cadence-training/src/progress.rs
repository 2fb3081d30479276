use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { workers: usize },
    Step { step: u64, loss: f64, accuracy: f64 },
    CheckpointSaved { step: u64, path: PathBuf },
    CheckpointFailed { step: u64, error: String },
    /// The source is exhausted.
    Ended { steps: u64 },
    /// Stopped by an external signal before the source was exhausted.
    Cancelled { steps: u64 },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

#[must_use]
pub fn format_step_line(step: u64, loss: f64, accuracy: f64) -> String {
    format!("iteration {step}\tloss {loss:.3}\taccuracy {accuracy:.2}")
}

/// Progress lines on stdout; checkpoint failures on stderr.
#[derive(Debug, Default)]
pub struct StdoutProgressSink;

impl ProgressSink for StdoutProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Step { step, loss, accuracy } => println!("{}", format_step_line(step, loss, accuracy)),
            ProgressEvent::CheckpointFailed { step, error } => {
                eprintln!("checkpoint at iteration {step} failed: {error}");
            }
            ProgressEvent::Ended { .. } => {
                println!();
                println!("training has ended");
                println!();
            }
            ProgressEvent::Cancelled { steps } => {
                println!();
                println!("training stopped after {steps} iterations");
                println!();
            }
            ProgressEvent::Started { .. } | ProgressEvent::CheckpointSaved { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_line_format() {
        assert_eq!(format_step_line(1, 2.34567, 0.5), "iteration 1\tloss 2.346\taccuracy 0.50");
        assert_eq!(format_step_line(10_000, 0.0, 1.0), "iteration 10000\tloss 0.000\taccuracy 1.00");
    }
}
