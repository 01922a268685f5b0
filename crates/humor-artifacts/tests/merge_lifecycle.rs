use std::fs;
use std::path::{Path, PathBuf};

use humor_artifacts::{
    ArtifactError, ArtifactStatus, ArtifactStore, LocalBaseModels, MergeEngine, Tensor,
    TensorMap, ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE, CONFIG_FILE, WEIGHTS_FILE,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn tensor(shape: Vec<usize>, data: Vec<f32>) -> Tensor {
    Tensor::new(shape, data).expect("tensor")
}

/// Base model directory with config, tokenizer file, and weights.
fn write_base(dir: &Path) -> PathBuf {
    let base = dir.join("base");
    fs::create_dir_all(&base).unwrap();
    fs::write(base.join(CONFIG_FILE), br#"{"model_type":"hashed-linear"}"#).unwrap();
    fs::write(base.join("tokenizer_config.json"), br#"{"lowercase":true}"#).unwrap();

    let mut weights = TensorMap::new();
    weights.insert(
        "pre_classifier.weight",
        tensor(vec![2, 3], vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]),
    );
    weights.insert("classifier.weight", tensor(vec![2, 2], vec![1.0, 0.0, 0.0, 1.0]));
    weights.insert("classifier.bias", tensor(vec![2], vec![0.0, 0.0]));
    weights.save(base.join(WEIGHTS_FILE)).unwrap();
    base
}

fn write_adapter(dir: &Path, name: &str, b_scale: f32) -> PathBuf {
    let adapter = dir.join(name);
    fs::create_dir_all(&adapter).unwrap();
    fs::write(
        adapter.join(ADAPTER_CONFIG_FILE),
        br#"{
            "peft_type": "LORA",
            "r": 1,
            "lora_alpha": 2,
            "target_modules": ["pre_classifier"],
            "modules_to_save": ["classifier"],
            "task_type": "SEQ_CLS"
        }"#,
    )
    .unwrap();

    let mut weights = TensorMap::new();
    weights.insert(
        "base_model.model.pre_classifier.lora_A.weight",
        tensor(vec![1, 3], vec![0.5, -0.25, 1.0]),
    );
    weights.insert(
        "base_model.model.pre_classifier.lora_B.weight",
        tensor(vec![2, 1], vec![b_scale, -b_scale]),
    );
    weights.insert(
        "base_model.model.classifier.modules_to_save.default.bias",
        tensor(vec![2], vec![0.1, -0.1]),
    );
    weights.save(adapter.join(ADAPTER_WEIGHTS_FILE)).unwrap();
    adapter
}

fn engine() -> MergeEngine<LocalBaseModels> {
    MergeEngine::new(LocalBaseModels::new())
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

#[test]
fn merge_produces_candidate_with_base_files() {
    let dir = tempfile::tempdir().unwrap();
    let base = write_base(dir.path());
    let adapter = write_adapter(dir.path(), "adapter", 1.0);
    let output = dir.path().join("merged");

    let artifact = engine()
        .merge(&adapter, base.to_str().unwrap(), &output)
        .expect("merge");

    assert_eq!(artifact.status, ArtifactStatus::Candidate);
    assert!(output.join(CONFIG_FILE).is_file());
    assert!(output.join("tokenizer_config.json").is_file());
    assert_eq!(artifact.manifest.merged_modules, 1);
    assert_eq!(artifact.manifest.replaced_modules, 1);

    let merged = TensorMap::load(output.join(WEIGHTS_FILE)).unwrap();
    // W + 2 * [1, -1]^T [0.5, -0.25, 1.0]
    let expected = [1.1, -0.3, 2.3, -0.6, 1.0, -1.4];
    for (got, want) in merged
        .get("pre_classifier.weight")
        .unwrap()
        .data()
        .iter()
        .zip(expected)
    {
        assert!((got - want).abs() < 1e-6, "got {got}, want {want}");
    }
    assert_eq!(merged.get("classifier.bias").unwrap().data(), &[0.1, -0.1]);
}

#[test]
fn repeated_merges_are_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let base = write_base(dir.path());
    let adapter = write_adapter(dir.path(), "adapter", 0.75);

    let first = engine()
        .merge(&adapter, base.to_str().unwrap(), dir.path().join("out-1"))
        .unwrap();
    let second = engine()
        .merge(&adapter, base.to_str().unwrap(), dir.path().join("out-2"))
        .unwrap();

    assert_eq!(first.weights_digest(), second.weights_digest());
    assert_eq!(
        fs::read(first.weights_path()).unwrap(),
        fs::read(second.weights_path()).unwrap()
    );
}

#[test]
fn missing_weights_file_fails_before_any_output() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = write_adapter(dir.path(), "adapter", 1.0);
    fs::remove_file(adapter.join(ADAPTER_WEIGHTS_FILE)).unwrap();
    let output = dir.path().join("merged");

    // The base reference does not exist either: the bundle check must come first.
    let err = engine()
        .merge(&adapter, "does/not-exist", &output)
        .unwrap_err();

    match err {
        ArtifactError::MissingArtifact { path } => assert!(path.ends_with(ADAPTER_WEIGHTS_FILE)),
        other => panic!("expected MissingArtifact, got {other:?}"),
    }
    assert!(!output.exists());
}

#[test]
fn incompatible_adapter_leaves_no_partial_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let base = write_base(dir.path());
    let adapter = write_adapter(dir.path(), "adapter", 1.0);
    fs::write(
        adapter.join(ADAPTER_CONFIG_FILE),
        br#"{"peft_type": "LORA", "r": 4, "lora_alpha": 8}"#,
    )
    .unwrap();
    let output = dir.path().join("merged");

    let err = engine()
        .merge(&adapter, base.to_str().unwrap(), &output)
        .unwrap_err();

    assert!(matches!(err, ArtifactError::Merge(_)));
    assert!(!output.exists());
    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(".merge-"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn merge_refuses_existing_output() {
    let dir = tempfile::tempdir().unwrap();
    let base = write_base(dir.path());
    let adapter = write_adapter(dir.path(), "adapter", 1.0);
    let output = dir.path().join("merged");
    fs::create_dir_all(&output).unwrap();
    fs::write(output.join("keep.txt"), b"untouched").unwrap();

    let err = engine()
        .merge(&adapter, base.to_str().unwrap(), &output)
        .unwrap_err();

    assert!(matches!(err, ArtifactError::Merge(_)));
    assert_eq!(fs::read(output.join("keep.txt")).unwrap(), b"untouched");
}

#[test]
fn merge_and_promote_activates_the_merge() {
    let dir = tempfile::tempdir().unwrap();
    let base = write_base(dir.path());
    let adapter = write_adapter(dir.path(), "adapter", 1.0);
    let store = ArtifactStore::open(dir.path().join("store")).unwrap();

    let active = engine()
        .merge_and_promote(
            &adapter,
            base.to_str().unwrap(),
            dir.path().join("merged"),
            &store,
            true,
        )
        .expect("merge and promote");

    assert_eq!(active.status, ArtifactStatus::Active);
    assert_eq!(store.require_active().unwrap().id, active.id);
    assert!(store.backup().unwrap().is_none());
}
