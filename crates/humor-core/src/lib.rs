//! Commit message humor classification.
//!
//! - [`classifier`]: the model, the [`Classifier`] seam and the
//!   hot-swappable [`ClassificationService`]
//! - [`watcher`]: incremental polling of a commit source
//! - [`sink`]: accumulated results published as immutable snapshots
//! - [`config`], [`telemetry`], [`metrics`], [`obs`]: ambient plumbing
//!   shared by the binaries

pub mod classifier;
pub mod commit;
pub mod config;
pub mod error;
pub mod metrics;
pub mod obs;
pub mod sink;
pub mod telemetry;
pub mod watcher;

pub use classifier::{
    predict, ClassificationService, Classifier, HashedLinearModel, ModelConfig, ModelHandle,
    Prediction, Threshold,
};
pub use commit::{
    ClassificationResult, CommitRecord, HumorClassification, HumorLabel, RepoInfo, Signature,
};
pub use config::{AppConfig, RetryPolicy};
pub use error::{ClassifyError, ConfigError, WatchError};
pub use sink::{ResultSink, SinkSnapshot, SinkStats};
pub use watcher::{
    CommitSource, CycleReport, JsonFileSource, ProcessingState, ProcessingStats, RunMode,
    StreamWatcher, WatchSummary, WatcherState,
};
