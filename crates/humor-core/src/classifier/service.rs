use std::fmt;
use std::sync::Arc;

use humor_artifacts::{ArtifactStore, ModelArtifact};
use tokio::sync::RwLock;
use tracing::debug;

use super::{predict, Classifier, HashedLinearModel, Prediction, Threshold};
use crate::error::{ClassifyError, Result};
use crate::obs;

/// A loaded model tagged with the artifact version it came from. Cheap to
/// clone; predictions hold a clone so a concurrent swap never pulls the
/// model out from under them.
#[derive(Clone)]
pub struct ModelHandle {
    version: String,
    model: Arc<dyn Classifier>,
}

impl ModelHandle {
    pub fn new(version: impl Into<String>, model: Arc<dyn Classifier>) -> Self {
        Self {
            version: version.into(),
            model,
        }
    }

    /// Verify the artifact's weights against its manifest and load it.
    pub fn load(artifact: &ModelArtifact) -> Result<Self> {
        artifact.manifest.verify(&artifact.path)?;
        let model = HashedLinearModel::load(&artifact.path)?;
        Ok(Self::new(artifact.version(), Arc::new(model)))
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn model(&self) -> &dyn Classifier {
        self.model.as_ref()
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Serves predictions from whichever model is currently installed.
pub struct ClassificationService {
    current: RwLock<Option<ModelHandle>>,
    threshold: Threshold,
}

impl ClassificationService {
    pub fn new(threshold: Threshold) -> Self {
        Self {
            current: RwLock::new(None),
            threshold,
        }
    }

    pub fn with_handle(handle: ModelHandle, threshold: Threshold) -> Self {
        Self {
            current: RwLock::new(Some(handle)),
            threshold,
        }
    }

    pub fn threshold(&self) -> Threshold {
        self.threshold
    }

    /// Swap in `handle`, returning the one it replaced.
    pub async fn install(&self, handle: ModelHandle) -> Option<ModelHandle> {
        let version = handle.version().to_string();
        let previous = self.current.write().await.replace(handle);
        obs::emit_model_loaded(&version, previous.as_ref().map(ModelHandle::version));
        previous
    }

    /// Load `artifact` and install it.
    pub async fn load(&self, artifact: &ModelArtifact) -> Result<String> {
        let handle = ModelHandle::load(artifact)?;
        let version = handle.version().to_string();
        self.install(handle).await;
        Ok(version)
    }

    /// Load whatever is in the store's active slot.
    pub async fn reload_active(&self, store: &ArtifactStore) -> Result<String> {
        let active = store.require_active()?;
        if self.version().await.as_deref() == Some(active.version().as_str()) {
            debug!(version = %active.version(), "active artifact already loaded");
            return Ok(active.version());
        }
        self.load(&active).await
    }

    /// Current handle. The read lock is held only for the clone.
    pub async fn handle(&self) -> Result<ModelHandle> {
        self.current
            .read()
            .await
            .clone()
            .ok_or(ClassifyError::NoModel)
    }

    pub async fn version(&self) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|h| h.version().to_string())
    }

    pub async fn predict(&self, text: &str) -> Result<Prediction> {
        let handle = self.handle().await?;
        predict(&handle, text, self.threshold)
    }

    /// Classify every text against one handle. A failure only affects its
    /// own entry.
    pub async fn predict_batch<S: AsRef<str>>(&self, texts: &[S]) -> Result<Vec<Result<Prediction>>> {
        let handle = self.handle().await?;
        Ok(texts
            .iter()
            .map(|t| predict(&handle, t.as_ref(), self.threshold))
            .collect())
    }
}
