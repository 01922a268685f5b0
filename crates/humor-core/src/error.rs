//! Error types for classification, watching and configuration.

use thiserror::Error;

/// Errors raised while loading a model or running inference.
#[derive(Error, Debug, Clone)]
pub enum ClassifyError {
    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("no model loaded")]
    NoModel,

    #[error("inference failed: {0}")]
    Inference(String),
}

impl From<humor_artifacts::ArtifactError> for ClassifyError {
    fn from(e: humor_artifacts::ArtifactError) -> Self {
        ClassifyError::ModelLoad(e.to_string())
    }
}

/// Errors surfaced by a poll cycle.
#[derive(Error, Debug)]
pub enum WatchError {
    /// The source was readable but its content is not a complete record
    /// array. Non-fatal: the next cycle re-reads.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WatchError {
    /// Whether the watch loop should keep going after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, WatchError::Parse(_))
    }
}

/// Errors loading or validating [`AppConfig`](crate::config::AppConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T, E = ClassifyError> = std::result::Result<T, E>;
