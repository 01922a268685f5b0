//! Application configuration.
//!
//! Loaded from a JSON file; every section rejects unknown keys. Missing
//! keys take the defaults below. The CLI layers its flags on top and then
//! calls [`AppConfig::validate`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use backon::ExponentialBuilder;
use serde::{Deserialize, Serialize};

use crate::classifier::Threshold;
use crate::error::ConfigError;

/// File picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "commit-humor.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub model: ModelSettings,
    pub watch: WatchSettings,
    pub urls: UrlSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelSettings {
    /// Root of the artifact store (`versions/` and `slots.json`).
    pub store_dir: PathBuf,
    /// Base model reference used by `merge` when `--base` is omitted.
    pub base_model: String,
    /// Registry id of the published model.
    pub model_id: String,
    pub threshold: f32,
    /// Local cache for registry models, searched by `org--name`.
    pub cache_dir: Option<PathBuf>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("models"),
            base_model: "jplu/eurobert-base-cased".to_string(),
            model_id: "LBerthalon/eurobert-commit-humor".to_string(),
            threshold: Threshold::DEFAULT.value(),
            cache_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchSettings {
    pub source: PathBuf,
    /// Defaults to `<source stem>_results.json` next to the source.
    pub output: Option<PathBuf>,
    pub interval_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            source: PathBuf::from("commits.json"),
            output: None,
            interval_secs: 5,
            retry: RetryPolicy::default(),
        }
    }
}

impl WatchSettings {
    pub fn output_path(&self) -> PathBuf {
        match &self.output {
            Some(path) => path.clone(),
            None => {
                let stem = self
                    .source
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "commits".to_string());
                self.source.with_file_name(format!("{stem}_results.json"))
            }
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Retry schedule for transient source I/O failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// No retries; used by tests and `--once` runs that should fail fast.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.initial_backoff_ms))
            .with_max_delay(Duration::from_millis(self.max_backoff_ms))
            .with_max_times(self.max_attempts.saturating_sub(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UrlSettings {
    pub registry: String,
    pub viewer: String,
}

impl Default for UrlSettings {
    fn default() -> Self {
        Self {
            registry: "https://huggingface.co".to_string(),
            viewer: "http://localhost:5000".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw).map_err(|e| match e {
            ConfigError::Parse(msg) => ConfigError::Parse(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    /// Load `path` if given, else [`DEFAULT_CONFIG_FILE`] if it exists in
    /// the working directory, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.is_file() {
                    Self::load(fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn threshold(&self) -> Result<Threshold, ConfigError> {
        Threshold::new(self.model.threshold)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.threshold()?;
        if self.watch.interval_secs < 1 {
            return Err(ConfigError::Invalid(
                "watch.interval_secs must be at least 1".to_string(),
            ));
        }
        let retry = &self.watch.retry;
        if retry.max_attempts < 1 {
            return Err(ConfigError::Invalid(
                "watch.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "watch.retry.initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                retry.initial_backoff_ms, retry.max_backoff_ms
            )));
        }
        for (key, url) in [("urls.registry", &self.urls.registry), ("urls.viewer", &self.urls.viewer)] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "{key} must be an http(s) URL, got {url:?}"
                )));
            }
        }
        if self.model.base_model.trim().is_empty() {
            return Err(ConfigError::Invalid("model.base_model is empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.model.threshold, 0.7);
        assert_eq!(config.watch.interval_secs, 5);
        assert_eq!(config.watch.retry.max_attempts, 3);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config = AppConfig::from_json(r#"{"watch": {"interval_secs": 30}}"#).unwrap();
        assert_eq!(config.watch.interval_secs, 30);
        assert_eq!(config.model, ModelSettings::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        for raw in [
            r#"{"modle": {}}"#,
            r#"{"model": {"treshold": 0.5}}"#,
            r#"{"watch": {"retry": {"attempts": 2}}}"#,
        ] {
            assert!(matches!(AppConfig::from_json(raw), Err(ConfigError::Parse(_))), "{raw}");
        }
    }

    #[test]
    fn validate_catches_bad_values() {
        let mut config = AppConfig::default();
        config.model.threshold = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AppConfig::default();
        config.watch.interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.watch.retry.initial_backoff_ms = 10_000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.urls.viewer = "localhost:5000".into();
        assert!(config.validate().unwrap_err().to_string().contains("urls.viewer"));
    }

    #[test]
    fn output_defaults_next_to_source() {
        let watch = WatchSettings {
            source: PathBuf::from("data/commits.json"),
            ..WatchSettings::default()
        };
        assert_eq!(watch.output_path(), PathBuf::from("data/commits_results.json"));
    }

    #[test]
    fn load_reports_missing_file_as_io() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            AppConfig::load(&dir.path().join("absent.json")),
            Err(ConfigError::Io(_))
        ));
    }
}
