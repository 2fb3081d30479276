use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    /// Rejected before any thread or directory is created.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Malformed source record. Never retried.
    #[error("source error: {0}")]
    Source(String),

    #[error("step execution failed: {0}")]
    Step(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("summary error: {0}")]
    Summary(String),

    #[error("illegal loop transition from {from:?} to {to:?}")]
    Transition { from: crate::trainer::LoopState, to: crate::trainer::LoopState },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
