//! Merge LoRA adapter bundles into base model weights.
//!
//! The merge is a pure function of the bundle and base model contents:
//! tensors are visited in name order and the result is serialised
//! canonically, so the same inputs always yield byte-identical weights.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::artifact::{
    AdapterProvenance, ArtifactManifest, ArtifactStatus, ModelArtifact, MANIFEST_FILE,
    WEIGHTS_FILE,
};
use crate::bundle::{AdapterBundle, AdapterConfig, AdapterKey};
use crate::digest::Digest;
use crate::error::{ArtifactError, Result};
use crate::fsutil::copy_dir;
use crate::store::ArtifactStore;
use crate::tensors::{Tensor, TensorMap};

/// Resolves a base model reference to a local model directory.
///
/// Fetching from a remote registry is the caller's business; a loader only
/// looks at what is already on disk.
pub trait BaseModelLoader: Send + Sync {
    fn resolve(&self, reference: &str) -> Result<PathBuf>;
}

/// Resolves references as directory paths, then under a cache directory
/// using the `org--name` convention for hub-style ids.
#[derive(Debug, Clone, Default)]
pub struct LocalBaseModels {
    cache_dir: Option<PathBuf>,
}

impl LocalBaseModels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }
}

impl BaseModelLoader for LocalBaseModels {
    fn resolve(&self, reference: &str) -> Result<PathBuf> {
        let direct = PathBuf::from(reference);
        let cached = self
            .cache_dir
            .as_ref()
            .map(|dir| dir.join(reference.replace('/', "--")));

        std::iter::once(direct)
            .chain(cached)
            .find(|dir| dir.join(WEIGHTS_FILE).is_file())
            .ok_or_else(|| {
                ArtifactError::Merge(format!(
                    "base model {reference:?} not found locally (need {WEIGHTS_FILE})"
                ))
            })
    }
}

/// Counts reported by [`apply_adapter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub merged_modules: usize,
    pub replaced_modules: usize,
}

#[derive(Default)]
struct LoraPair<'a> {
    a: Option<&'a Tensor>,
    b: Option<&'a Tensor>,
}

/// Fold adapter tensors into `base`.
///
/// Every shape is checked before `base` is touched, so on error `base` is
/// left as it was.
pub fn apply_adapter(
    base: &mut TensorMap,
    config: &AdapterConfig,
    adapter: &TensorMap,
) -> Result<MergeStats> {
    config.validate()?;
    let targets = config
        .target_modules
        .as_ref()
        .map(|t| t.matcher())
        .transpose()?;

    let mut pairs: BTreeMap<String, LoraPair<'_>> = BTreeMap::new();
    let mut replacements: Vec<(String, &Tensor)> = Vec::new();
    for (name, tensor) in adapter.iter() {
        match AdapterKey::parse(name)? {
            AdapterKey::LoraA(module) => pairs.entry(module).or_default().a = Some(tensor),
            AdapterKey::LoraB(module) => pairs.entry(module).or_default().b = Some(tensor),
            AdapterKey::Full(target) => replacements.push((target, tensor)),
        }
    }
    if pairs.is_empty() && replacements.is_empty() {
        return Err(ArtifactError::Merge("adapter contains no tensors".to_string()));
    }

    let mut deltas: Vec<(String, Vec<f32>)> = Vec::with_capacity(pairs.len());
    for (module, pair) in &pairs {
        let (Some(a), Some(b)) = (pair.a, pair.b) else {
            return Err(ArtifactError::Merge(format!(
                "module {module} has only one of lora_A/lora_B"
            )));
        };
        if let Some(targets) = &targets {
            if !targets.matches(module) {
                debug!(module = %module, "adapter module not listed in target_modules");
            }
        }
        let target = format!("{module}.weight");
        let weight = base.get(&target).ok_or_else(|| {
            ArtifactError::Merge(format!("adapter targets unknown base tensor {target}"))
        })?;
        deltas.push((target, lora_delta(module, weight, a, b, config)?));
    }

    for (target, tensor) in &replacements {
        let existing = base.get(target).ok_or_else(|| {
            ArtifactError::Merge(format!("adapter replaces unknown base tensor {target}"))
        })?;
        if existing.shape() != tensor.shape() {
            return Err(ArtifactError::Merge(format!(
                "tensor {target}: base shape {:?} != adapter shape {:?}",
                existing.shape(),
                tensor.shape()
            )));
        }
    }

    // All checks passed; mutate.
    for (target, delta) in &deltas {
        if let Some(weight) = base.get_mut(target) {
            for (w, d) in weight.data_mut().iter_mut().zip(delta) {
                *w += d;
            }
        }
    }
    for (target, tensor) in &replacements {
        base.insert(target.clone(), (*tensor).clone());
    }

    Ok(MergeStats {
        merged_modules: deltas.len(),
        replaced_modules: replacements.len(),
    })
}

/// `scale · B·A`, laid out like `weight`.
fn lora_delta(
    module: &str,
    weight: &Tensor,
    a: &Tensor,
    b: &Tensor,
    config: &AdapterConfig,
) -> Result<Vec<f32>> {
    let shape_err = |what: String| ArtifactError::Merge(format!("module {module}: {what}"));

    let (rank_a, d_in) = a
        .dims2()
        .ok_or_else(|| shape_err(format!("lora_A must be 2-D, got {:?}", a.shape())))?;
    let (d_out, rank_b) = b
        .dims2()
        .ok_or_else(|| shape_err(format!("lora_B must be 2-D, got {:?}", b.shape())))?;
    if rank_a != config.r || rank_b != config.r {
        return Err(shape_err(format!(
            "rank mismatch: config r={}, lora_A {rank_a}, lora_B {rank_b}",
            config.r
        )));
    }
    let expected = if config.fan_in_fan_out {
        (d_in, d_out)
    } else {
        (d_out, d_in)
    };
    if weight.dims2() != Some(expected) {
        return Err(shape_err(format!(
            "base weight shape {:?} incompatible with adapter [{d_out}, {d_in}]",
            weight.shape()
        )));
    }

    let r = config.r;
    let scale = config.scale();
    let (a, b) = (a.data(), b.data());
    let mut delta = vec![0.0f32; d_out * d_in];
    for i in 0..d_out {
        for j in 0..d_in {
            let mut acc = 0.0f32;
            for k in 0..r {
                acc += b[i * r + k] * a[k * d_in + j];
            }
            let idx = if config.fan_in_fan_out {
                j * d_out + i
            } else {
                i * d_in + j
            };
            delta[idx] = scale * acc;
        }
    }
    Ok(delta)
}

/// Produces candidate artifacts from adapter bundles.
pub struct MergeEngine<L = LocalBaseModels> {
    loader: L,
}

impl<L: BaseModelLoader> MergeEngine<L> {
    pub fn new(loader: L) -> Self {
        Self { loader }
    }

    /// Merge the bundle at `bundle_path` into `base_ref` and write a
    /// candidate artifact at `output`.
    ///
    /// The bundle is validated before the base model is loaded. The
    /// artifact is assembled in a temporary sibling of `output` and renamed
    /// into place, so a failed merge leaves nothing behind.
    pub fn merge(
        &self,
        bundle_path: impl AsRef<Path>,
        base_ref: &str,
        output: impl AsRef<Path>,
    ) -> Result<ModelArtifact> {
        let output = output.as_ref();
        let bundle = AdapterBundle::open(bundle_path)?;
        if output.exists() {
            return Err(ArtifactError::Merge(format!(
                "output path {} already exists",
                output.display()
            )));
        }

        let config = bundle.read_config()?;
        let adapter = bundle.read_weights()?;

        let base_dir = self.loader.resolve(base_ref)?;
        let mut tensors = TensorMap::load(base_dir.join(WEIGHTS_FILE)).map_err(|e| {
            ArtifactError::Merge(format!("cannot load base model {base_ref:?}: {e}"))
        })?;
        if let Some(declared) = &config.base_model_name_or_path {
            if declared != base_ref {
                warn!(declared = %declared, base = %base_ref, "adapter was trained against a different base model reference");
            }
        }

        let stats = apply_adapter(&mut tensors, &config, &adapter)?;
        let weights = tensors.to_bytes()?;
        let digest = Digest::compute(&weights);
        let (config_digest, adapter_digest) = bundle.digests()?;

        let parent = match output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;
        let staging = tempfile::Builder::new()
            .prefix(".merge-")
            .tempdir_in(&parent)?;

        copy_dir(&base_dir, staging.path(), &[WEIGHTS_FILE, MANIFEST_FILE])?;
        fs::write(staging.path().join(WEIGHTS_FILE), &weights)?;

        let mut manifest = ArtifactManifest::new(digest);
        manifest.base_model = Some(base_ref.to_string());
        manifest.adapter = Some(AdapterProvenance {
            path: bundle.path().display().to_string(),
            config_digest: config_digest.to_hex(),
            weights_digest: adapter_digest.to_hex(),
        });
        manifest.merged_modules = stats.merged_modules;
        manifest.replaced_modules = stats.replaced_modules;
        manifest.write(staging.path())?;

        // Dropping `staging` afterwards is a no-op once it has been renamed.
        fs::rename(staging.path(), output)?;

        info!(
            event = "artifact.merged",
            output = %output.display(),
            base = %base_ref,
            digest = %digest.short(),
            merged_modules = stats.merged_modules,
            replaced_modules = stats.replaced_modules,
        );

        Ok(ModelArtifact {
            id: None,
            path: output.to_path_buf(),
            status: ArtifactStatus::Candidate,
            manifest,
        })
    }

    /// Merge, then promote the candidate into `store`.
    pub fn merge_and_promote(
        &self,
        bundle_path: impl AsRef<Path>,
        base_ref: &str,
        output: impl AsRef<Path>,
        store: &ArtifactStore,
        backup: bool,
    ) -> Result<ModelArtifact> {
        let candidate = self.merge(bundle_path, base_ref, output)?;
        store.promote(&candidate, backup)
    }
}

impl Default for MergeEngine<LocalBaseModels> {
    fn default() -> Self {
        Self::new(LocalBaseModels::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::TargetModules;

    fn t(shape: Vec<usize>, data: Vec<f32>) -> Tensor {
        Tensor::new(shape, data).unwrap()
    }

    fn config(r: usize, alpha: f32) -> AdapterConfig {
        AdapterConfig {
            peft_type: "LORA".to_string(),
            r,
            lora_alpha: alpha,
            use_rslora: false,
            fan_in_fan_out: false,
            target_modules: Some(TargetModules::List(vec!["dense".to_string()])),
            modules_to_save: None,
            base_model_name_or_path: None,
            task_type: None,
        }
    }

    fn base() -> TensorMap {
        let mut base = TensorMap::new();
        base.insert(
            "dense.weight",
            t(vec![2, 3], vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
        );
        base.insert("head.bias", t(vec![2], vec![0.0, 0.0]));
        base
    }

    fn adapter() -> TensorMap {
        let mut adapter = TensorMap::new();
        adapter.insert(
            "base_model.model.dense.lora_A.weight",
            t(vec![1, 3], vec![1.0, 2.0, 3.0]),
        );
        adapter.insert(
            "base_model.model.dense.lora_B.weight",
            t(vec![2, 1], vec![1.0, 2.0]),
        );
        adapter
    }

    #[test]
    fn lora_delta_is_scaled_b_times_a() {
        let mut base = base();
        let stats = apply_adapter(&mut base, &config(1, 2.0), &adapter()).unwrap();

        assert_eq!(stats.merged_modules, 1);
        assert_eq!(
            base.get("dense.weight").unwrap().data(),
            &[3.0, 4.0, 6.0, 4.0, 9.0, 12.0]
        );
    }

    #[test]
    fn fan_in_fan_out_transposes_delta() {
        let mut base = TensorMap::new();
        base.insert("dense.weight", t(vec![3, 2], vec![0.0; 6]));
        let mut cfg = config(1, 1.0);
        cfg.fan_in_fan_out = true;

        apply_adapter(&mut base, &cfg, &adapter()).unwrap();
        // (B·A)^T for B=[1,2]^T, A=[1,2,3]
        assert_eq!(
            base.get("dense.weight").unwrap().data(),
            &[1.0, 2.0, 2.0, 4.0, 3.0, 6.0]
        );
    }

    #[test]
    fn modules_to_save_replace_base_tensors() {
        let mut base = base();
        let mut adapter = adapter();
        adapter.insert(
            "base_model.model.head.modules_to_save.default.bias",
            t(vec![2], vec![0.5, -0.5]),
        );

        let stats = apply_adapter(&mut base, &config(1, 2.0), &adapter).unwrap();
        assert_eq!(stats.replaced_modules, 1);
        assert_eq!(base.get("head.bias").unwrap().data(), &[0.5, -0.5]);
    }

    #[test]
    fn shape_mismatch_leaves_base_untouched() {
        let mut base = base();
        let mut adapter = adapter();
        adapter.insert("base_model.model.head.bias", t(vec![3], vec![0.0; 3]));

        let err = apply_adapter(&mut base, &config(1, 2.0), &adapter).unwrap_err();
        assert!(matches!(err, ArtifactError::Merge(_)));
        assert_eq!(base, self::base());
    }

    #[test]
    fn rank_mismatch_is_a_merge_error() {
        let mut base = base();
        let err = apply_adapter(&mut base, &config(2, 2.0), &adapter()).unwrap_err();
        assert!(err.to_string().contains("rank mismatch"));
    }

    #[test]
    fn unpaired_lora_tensor_is_a_merge_error() {
        let mut base = base();
        let mut adapter = TensorMap::new();
        adapter.insert(
            "base_model.model.dense.lora_A.weight",
            t(vec![1, 3], vec![1.0, 2.0, 3.0]),
        );
        assert!(matches!(
            apply_adapter(&mut base, &config(1, 2.0), &adapter),
            Err(ArtifactError::Merge(_))
        ));
    }

    #[test]
    fn unknown_target_is_a_merge_error() {
        let mut base = TensorMap::new();
        base.insert("other.weight", t(vec![2, 3], vec![0.0; 6]));
        let err = apply_adapter(&mut base, &config(1, 2.0), &adapter()).unwrap_err();
        assert!(err.to_string().contains("dense.weight"));
    }

    #[test]
    fn local_loader_resolves_cache_convention() {
        let dir = tempfile::tempdir().unwrap();
        let cached = dir.path().join("jplu--eurobert-base-cased");
        fs::create_dir_all(&cached).unwrap();
        fs::write(cached.join(WEIGHTS_FILE), b"x").unwrap();

        let loader = LocalBaseModels::new().with_cache_dir(dir.path());
        assert_eq!(loader.resolve("jplu/eurobert-base-cased").unwrap(), cached);
        assert!(matches!(
            loader.resolve("someone/else"),
            Err(ArtifactError::Merge(_))
        ));
    }
}
