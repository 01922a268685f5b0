//! Model artifacts and their manifests.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{ArtifactError, Result};
use crate::fsutil::write_atomic;

pub const MANIFEST_FILE: &str = "artifact.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const CONFIG_FILE: &str = "config.json";

const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Lifecycle slot an artifact currently occupies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactStatus {
    Candidate,
    Active,
    Backup,
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Candidate => "candidate",
            Self::Active => "active",
            Self::Backup => "backup",
        };
        f.write_str(s)
    }
}

/// Where a merged artifact's adapter came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterProvenance {
    pub path: String,
    pub config_digest: String,
    pub weights_digest: String,
}

/// Contents of `artifact.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactManifest {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub weights_file: String,
    /// SHA-256 of the weights file; defines content equality between artifacts.
    pub weights_digest: String,
    pub base_model: Option<String>,
    pub adapter: Option<AdapterProvenance>,
    #[serde(default)]
    pub merged_modules: usize,
    #[serde(default)]
    pub replaced_modules: usize,
}

impl ArtifactManifest {
    pub fn new(weights_digest: Digest) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            created_at: Utc::now(),
            weights_file: WEIGHTS_FILE.to_string(),
            weights_digest: weights_digest.to_hex(),
            base_model: None,
            adapter: None,
            merged_modules: 0,
            replaced_modules: 0,
        }
    }

    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ArtifactError::missing(&path)
            } else {
                ArtifactError::Io(e)
            }
        })?;
        let manifest: Self = serde_json::from_str(&raw)
            .map_err(|e| ArtifactError::InvalidManifest(format!("{}: {e}", path.display())))?;
        if manifest.format_version != MANIFEST_FORMAT_VERSION {
            return Err(ArtifactError::InvalidManifest(format!(
                "{}: unsupported format_version {}",
                path.display(),
                manifest.format_version
            )));
        }
        Ok(manifest)
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(&dir.join(MANIFEST_FILE), &json)?;
        Ok(())
    }

    pub fn digest(&self) -> Result<Digest> {
        self.weights_digest.parse()
    }

    /// Recompute the weights digest of the copy in `dir` and compare.
    pub fn verify(&self, dir: &Path) -> Result<()> {
        let expected = self.digest()?;
        let actual = Digest::of_file(dir.join(&self.weights_file))?;
        if expected != actual {
            return Err(ArtifactError::DigestMismatch {
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(())
    }
}

/// A deployable, self-contained model directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelArtifact {
    /// Store-assigned id; `None` for candidates outside the store.
    pub id: Option<String>,
    pub path: PathBuf,
    pub status: ArtifactStatus,
    pub manifest: ArtifactManifest,
}

impl ModelArtifact {
    /// Open a directory holding a manifest as a candidate.
    pub fn open_candidate(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_dir() {
            return Err(ArtifactError::missing(path));
        }
        let manifest = ArtifactManifest::read(&path)?;
        Ok(Self {
            id: None,
            path,
            status: ArtifactStatus::Candidate,
            manifest,
        })
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.manifest.created_at
    }

    pub fn weights_digest(&self) -> &str {
        &self.manifest.weights_digest
    }

    pub fn weights_path(&self) -> PathBuf {
        self.path.join(&self.manifest.weights_file)
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join(CONFIG_FILE)
    }

    /// Human-readable version: store id, else the directory path.
    pub fn version(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&ArtifactStatus::Backup).unwrap();
        assert_eq!(json, "\"backup\"");
        assert_eq!(ArtifactStatus::Active.to_string(), "active");
    }

    #[test]
    fn manifest_write_read_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let weights = b"pretend weights";
        std::fs::write(dir.path().join(WEIGHTS_FILE), weights).unwrap();

        let mut manifest = ArtifactManifest::new(Digest::compute(weights));
        manifest.base_model = Some("base".to_string());
        manifest.write(dir.path()).unwrap();

        let read = ArtifactManifest::read(dir.path()).unwrap();
        assert_eq!(read, manifest);
        read.verify(dir.path()).unwrap();

        std::fs::write(dir.path().join(WEIGHTS_FILE), b"tampered").unwrap();
        assert!(matches!(
            read.verify(dir.path()),
            Err(ArtifactError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn open_candidate_without_manifest_is_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModelArtifact::open_candidate(dir.path()).unwrap_err();
        match err {
            ArtifactError::MissingArtifact { path } => assert!(path.ends_with(MANIFEST_FILE)),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
