//! LoRA adapter bundles in the PEFT on-disk format.
//!
//! A bundle is a directory holding `adapter_config.json` and
//! `adapter_model.safetensors`. Bundles are read-only inputs to a merge.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{ArtifactError, Result};
use crate::tensors::TensorMap;

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

/// Files a bundle must contain, checked in this order.
pub const REQUIRED_FILES: [&str; 2] = [ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE];

/// Tensor-name prefix PEFT uses for every saved adapter tensor.
const PEFT_PREFIX: &str = "base_model.model.";

/// A validated adapter bundle directory.
#[derive(Debug, Clone)]
pub struct AdapterBundle {
    root: PathBuf,
}

impl AdapterBundle {
    /// Check the bundle layout. Fails with `MissingArtifact` naming the
    /// first absent path; nothing else is read.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(ArtifactError::missing(root));
        }
        for file in REQUIRED_FILES {
            let required = root.join(file);
            if !required.is_file() {
                return Err(ArtifactError::missing(required));
            }
        }
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(ADAPTER_CONFIG_FILE)
    }

    pub fn weights_path(&self) -> PathBuf {
        self.root.join(ADAPTER_WEIGHTS_FILE)
    }

    pub fn read_config(&self) -> Result<AdapterConfig> {
        let raw = std::fs::read_to_string(self.config_path())?;
        AdapterConfig::from_json(&raw)
            .map_err(|e| ArtifactError::Merge(format!("invalid {ADAPTER_CONFIG_FILE}: {e}")))
    }

    pub fn read_weights(&self) -> Result<TensorMap> {
        TensorMap::load(self.weights_path())
            .map_err(|e| ArtifactError::Merge(format!("invalid {ADAPTER_WEIGHTS_FILE}: {e}")))
    }

    /// `(config digest, weights digest)` recorded in merged manifests.
    pub fn digests(&self) -> Result<(Digest, Digest)> {
        Ok((
            Digest::of_file(self.config_path())?,
            Digest::of_file(self.weights_path())?,
        ))
    }
}

/// `target_modules` is either a list of module names or a regex.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TargetModules {
    List(Vec<String>),
    Pattern(String),
}

impl TargetModules {
    /// Compile into a matcher. An invalid pattern is a `Merge` error.
    pub fn matcher(&self) -> Result<TargetMatcher<'_>> {
        match self {
            Self::List(names) => Ok(TargetMatcher::List(names)),
            Self::Pattern(pattern) => Regex::new(&format!("^(?:{pattern})$"))
                .map(TargetMatcher::Pattern)
                .map_err(|e| {
                    ArtifactError::Merge(format!("invalid target_modules pattern {pattern:?}: {e}"))
                }),
        }
    }
}

/// Compiled `target_modules`.
#[derive(Debug, Clone)]
pub enum TargetMatcher<'a> {
    List(&'a [String]),
    Pattern(Regex),
}

impl TargetMatcher<'_> {
    /// PEFT semantics: a list entry matches the module name or its last
    /// dotted component; a pattern must match the whole module name.
    pub fn matches(&self, module: &str) -> bool {
        match self {
            Self::List(names) => names
                .iter()
                .any(|name| module == name || module.ends_with(&format!(".{name}"))),
            Self::Pattern(re) => re.is_match(module),
        }
    }
}

/// Subset of PEFT's `adapter_config.json` the merge needs. Other keys are
/// ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterConfig {
    pub peft_type: String,
    pub r: usize,
    pub lora_alpha: f32,
    #[serde(default)]
    pub use_rslora: bool,
    #[serde(default)]
    pub fan_in_fan_out: bool,
    #[serde(default)]
    pub target_modules: Option<TargetModules>,
    #[serde(default)]
    pub modules_to_save: Option<Vec<String>>,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    #[serde(default)]
    pub task_type: Option<String>,
}

impl AdapterConfig {
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.peft_type.eq_ignore_ascii_case("LORA") {
            return Err(ArtifactError::Merge(format!(
                "unsupported peft_type {:?}, expected LORA",
                self.peft_type
            )));
        }
        if self.r == 0 {
            return Err(ArtifactError::Merge("LoRA rank r must be > 0".to_string()));
        }
        if !self.lora_alpha.is_finite() {
            return Err(ArtifactError::Merge("lora_alpha must be finite".to_string()));
        }
        if let Some(targets) = &self.target_modules {
            targets.matcher()?;
        }
        Ok(())
    }

    /// Scaling applied to `B·A`.
    pub fn scale(&self) -> f32 {
        if self.use_rslora {
            self.lora_alpha / (self.r as f32).sqrt()
        } else {
            self.lora_alpha / self.r as f32
        }
    }
}

/// What an adapter tensor contributes to the merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterKey {
    LoraA(String),
    LoraB(String),
    /// Full replacement of a base tensor (PEFT `modules_to_save`).
    Full(String),
}

impl AdapterKey {
    pub fn parse(name: &str) -> Result<Self> {
        let rest = name.strip_prefix(PEFT_PREFIX).ok_or_else(|| {
            ArtifactError::Merge(format!(
                "adapter tensor {name} lacks the {PEFT_PREFIX} prefix"
            ))
        })?;

        for suffix in [".lora_A.weight", ".lora_A.default.weight"] {
            if let Some(module) = rest.strip_suffix(suffix) {
                return Ok(Self::LoraA(module.to_string()));
            }
        }
        for suffix in [".lora_B.weight", ".lora_B.default.weight"] {
            if let Some(module) = rest.strip_suffix(suffix) {
                return Ok(Self::LoraB(module.to_string()));
            }
        }
        Ok(Self::Full(rest.replacen(".modules_to_save.default", "", 1)))
    }
}
