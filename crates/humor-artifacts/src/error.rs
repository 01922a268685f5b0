//! Error taxonomy for artifact merge and promotion.

use std::path::PathBuf;

/// Errors produced while merging, importing, or promoting model artifacts.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// A required file or directory is absent. Raised before any side effect.
    #[error("missing artifact: {}", path.display())]
    MissingArtifact { path: PathBuf },

    /// The adapter is not structurally compatible with the base model.
    #[error("merge error: {0}")]
    Merge(String),

    /// The active-slot swap failed; the previously active artifact is intact.
    #[error("promote error: {0}")]
    Promote(String),

    #[error("no active artifact in store {}", root.display())]
    NoActiveArtifact { root: PathBuf },

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("safetensors error: {0}")]
    SafeTensors(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArtifactError {
    pub(crate) fn missing(path: impl Into<PathBuf>) -> Self {
        Self::MissingArtifact { path: path.into() }
    }
}

/// Result type for artifact operations.
pub type Result<T> = std::result::Result<T, ArtifactError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_artifact_names_the_file() {
        let err = ArtifactError::missing("/tmp/adapter/adapter_model.safetensors");
        assert!(err.to_string().contains("adapter_model.safetensors"));
    }

    #[test]
    fn digest_mismatch_display() {
        let err = ArtifactError::DigestMismatch {
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("abc123"));
        assert!(msg.contains("def456"));
    }
}
