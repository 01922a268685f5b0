//! Model artifact lifecycle for commit-humor.
//!
//! - [`merge`]: fold a LoRA adapter bundle into base weights, producing a
//!   candidate artifact
//! - [`store`]: promote candidates into the `active` slot, keep a `backup`,
//!   roll back
//!
//! The central invariant: at most one artifact is active at any time, and a
//! reader of the active slot never observes a half-written directory.

pub mod artifact;
pub mod bundle;
pub mod digest;
pub mod error;
mod fsutil;
mod lock;
pub mod merge;
pub mod store;
pub mod tensors;

pub use artifact::{
    AdapterProvenance, ArtifactManifest, ArtifactStatus, ModelArtifact, CONFIG_FILE,
    MANIFEST_FILE, WEIGHTS_FILE,
};
pub use bundle::{
    AdapterBundle, AdapterConfig, AdapterKey, TargetMatcher, TargetModules, ADAPTER_CONFIG_FILE,
    ADAPTER_WEIGHTS_FILE,
};
pub use digest::Digest;
pub use error::{ArtifactError, Result};
pub use merge::{apply_adapter, BaseModelLoader, LocalBaseModels, MergeEngine, MergeStats};
pub use store::{ArtifactStore, Slots, StoreStatus};
pub use tensors::{Tensor, TensorMap};
