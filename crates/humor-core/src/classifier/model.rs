//! The shipped classifier: hashed bag-of-words with a two-layer head.
//!
//! ```text
//! tokens -> SHA-256 buckets -> mean(embeddings) -> tanh(pre_classifier) -> classifier -> softmax
//! ```
//!
//! Tensor names follow the sequence-classification layout so a LoRA adapter
//! trained against `pre_classifier` / `classifier` merges straight in.

use std::fs;
use std::path::Path;

use humor_artifacts::{Tensor, TensorMap, CONFIG_FILE, WEIGHTS_FILE};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use super::Classifier;
use crate::error::{ClassifyError, Result};

pub const MODEL_TYPE: &str = "hashed-linear";

const EMBEDDINGS: &str = "embeddings.word_embeddings.weight";
const PRE_WEIGHT: &str = "pre_classifier.weight";
const PRE_BIAS: &str = "pre_classifier.bias";
const HEAD_WEIGHT: &str = "classifier.weight";
const HEAD_BIAS: &str = "classifier.bias";

/// Index of the "funny" logit.
const FUNNY: usize = 1;

/// `config.json` of a model artifact. Unrecognised keys are ignored so
/// configs exported by other tooling still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_type: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    #[serde(default = "default_num_labels")]
    pub num_labels: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_lowercase")]
    pub lowercase: bool,
}

fn default_num_labels() -> usize {
    2
}

fn default_max_tokens() -> usize {
    128
}

fn default_lowercase() -> bool {
    true
}

impl ModelConfig {
    pub fn new(vocab_size: usize, hidden_size: usize) -> Self {
        Self {
            model_type: MODEL_TYPE.to_string(),
            vocab_size,
            hidden_size,
            num_labels: default_num_labels(),
            max_tokens: default_max_tokens(),
            lowercase: default_lowercase(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.model_type != MODEL_TYPE {
            return Err(ClassifyError::ModelLoad(format!(
                "unsupported model_type {:?}, expected {MODEL_TYPE:?}",
                self.model_type
            )));
        }
        if self.num_labels != 2 {
            return Err(ClassifyError::ModelLoad(format!(
                "binary classifier needs num_labels = 2, got {}",
                self.num_labels
            )));
        }
        if self.vocab_size == 0 || self.hidden_size == 0 || self.max_tokens == 0 {
            return Err(ClassifyError::ModelLoad(
                "vocab_size, hidden_size and max_tokens must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HashedLinearModel {
    config: ModelConfig,
    embeddings: Tensor,
    pre_weight: Tensor,
    pre_bias: Tensor,
    head_weight: Tensor,
    head_bias: Tensor,
}

impl HashedLinearModel {
    /// Load `config.json` and `model.safetensors` from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let raw = fs::read_to_string(dir.join(CONFIG_FILE)).map_err(|e| {
            ClassifyError::ModelLoad(format!("{}: {e}", dir.join(CONFIG_FILE).display()))
        })?;
        let config: ModelConfig = serde_json::from_str(&raw).map_err(|e| {
            ClassifyError::ModelLoad(format!("{}: {e}", dir.join(CONFIG_FILE).display()))
        })?;
        let tensors = TensorMap::load(dir.join(WEIGHTS_FILE))?;
        Self::from_parts(config, &tensors)
    }

    pub fn from_parts(config: ModelConfig, tensors: &TensorMap) -> Result<Self> {
        config.validate()?;
        let (v, h) = (config.vocab_size, config.hidden_size);
        let take = |name: &str, shape: &[usize]| -> Result<Tensor> {
            let tensor = tensors
                .get(name)
                .ok_or_else(|| ClassifyError::ModelLoad(format!("missing tensor {name}")))?;
            if tensor.shape() != shape {
                return Err(ClassifyError::ModelLoad(format!(
                    "tensor {name} has shape {:?}, expected {shape:?}",
                    tensor.shape()
                )));
            }
            Ok(tensor.clone())
        };

        Ok(Self {
            embeddings: take(EMBEDDINGS, &[v, h])?,
            pre_weight: take(PRE_WEIGHT, &[h, h])?,
            pre_bias: take(PRE_BIAS, &[h])?,
            head_weight: take(HEAD_WEIGHT, &[2, h])?,
            head_bias: take(HEAD_BIAS, &[2])?,
            config,
        })
    }

    /// Write this model as an artifact directory (config + weights).
    pub fn save(&self, dir: &Path) -> Result<()> {
        let io = |e: std::io::Error| ClassifyError::ModelLoad(e.to_string());
        fs::create_dir_all(dir).map_err(io)?;
        let config = serde_json::to_vec_pretty(&self.config)
            .map_err(|e| ClassifyError::ModelLoad(e.to_string()))?;
        fs::write(dir.join(CONFIG_FILE), config).map_err(io)?;
        self.tensors().save(dir.join(WEIGHTS_FILE))?;
        Ok(())
    }

    pub fn tensors(&self) -> TensorMap {
        let mut map = TensorMap::new();
        map.insert(EMBEDDINGS, self.embeddings.clone());
        map.insert(PRE_WEIGHT, self.pre_weight.clone());
        map.insert(PRE_BIAS, self.pre_bias.clone());
        map.insert(HEAD_WEIGHT, self.head_weight.clone());
        map.insert(HEAD_BIAS, self.head_bias.clone());
        map
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Split on anything that is not alphanumeric, keeping at most
    /// `max_tokens` tokens.
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .take(self.config.max_tokens)
            .map(|t| {
                if self.config.lowercase {
                    t.to_lowercase()
                } else {
                    t.to_string()
                }
            })
            .collect()
    }

    /// Embedding row for `token`: first 8 bytes of its SHA-256, little
    /// endian, modulo the vocabulary size.
    pub fn bucket(&self, token: &str) -> usize {
        let hash = Sha256::digest(token.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash[..8]);
        (u64::from_le_bytes(prefix) % self.config.vocab_size as u64) as usize
    }

    fn logits(&self, text: &str) -> [f32; 2] {
        let h = self.config.hidden_size;
        let tokens = self.tokenize(text);

        let mut pooled = vec![0.0f32; h];
        if !tokens.is_empty() {
            let emb = self.embeddings.data();
            for token in &tokens {
                let row = self.bucket(token) * h;
                for (p, e) in pooled.iter_mut().zip(&emb[row..row + h]) {
                    *p += e;
                }
            }
            let n = tokens.len() as f32;
            pooled.iter_mut().for_each(|p| *p /= n);
        }

        let hidden: Vec<f32> = affine(self.pre_weight.data(), self.pre_bias.data(), &pooled)
            .into_iter()
            .map(f32::tanh)
            .collect();
        let out = affine(self.head_weight.data(), self.head_bias.data(), &hidden);
        [out[0], out[1]]
    }
}

/// `W·x + b` for row-major `W` of shape `[b.len(), x.len()]`.
fn affine(weight: &[f32], bias: &[f32], x: &[f32]) -> Vec<f32> {
    bias.iter()
        .enumerate()
        .map(|(i, b)| {
            let row = &weight[i * x.len()..(i + 1) * x.len()];
            row.iter().zip(x).map(|(w, v)| w * v).sum::<f32>() + b
        })
        .collect()
}

impl Classifier for HashedLinearModel {
    fn funny_probability(&self, text: &str) -> Result<f32> {
        let logits = self.logits(text);
        let other = logits[1 - FUNNY];
        let funny = logits[FUNNY];
        // Two-way softmax reduces to a logistic on the logit difference.
        let p = 1.0 / (1.0 + (other - funny).exp());
        if p.is_finite() {
            Ok(p)
        } else {
            Err(ClassifyError::Inference(format!(
                "non-finite probability from logits {logits:?}"
            )))
        }
    }
}
