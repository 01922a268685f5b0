//! commit-humor - commit message humor classifier
//!
//! ## Commands
//!
//! - `merge`: fold a LoRA adapter into the base model, optionally promote
//! - `promote` / `rollback` / `status` / `import`: manage the artifact store
//! - `classify`: classify messages with the active model
//! - `watch`: classify new commits from a JSON file as they arrive

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use humor_artifacts::{ArtifactStore, LocalBaseModels, MergeEngine, ModelArtifact};
use humor_core::telemetry::{init_tracing, level_for};
use humor_core::{
    AppConfig, ClassificationService, ClassifyError, JsonFileSource, Prediction, ResultSink,
    RunMode, StreamWatcher, WatchError,
};

#[derive(Parser)]
#[command(name = "commit-humor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Classify commit messages as funny or not, and manage the model behind it", long_about = None)]
struct Cli {
    /// Configuration file (default: ./commit-humor.json when present)
    #[arg(short, long, global = true, env = "COMMIT_HUMOR_CONFIG")]
    config: Option<PathBuf>,

    /// Artifact store directory (overrides model.store_dir)
    #[arg(long, global = true, env = "COMMIT_HUMOR_STORE")]
    store: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and JSON command output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge a LoRA adapter bundle into the base model
    Merge {
        /// Adapter directory (adapter_config.json + adapter_model.safetensors)
        #[arg(long)]
        adapter: PathBuf,

        /// Base model directory or registry id (default: model.base_model)
        #[arg(long, env = "COMMIT_HUMOR_BASE_MODEL")]
        base: Option<String>,

        /// Where to write the merged candidate
        #[arg(long)]
        output: PathBuf,

        /// Promote the merged model to active
        #[arg(long)]
        promote: bool,

        /// Keep the current active model as backup when promoting
        #[arg(long, requires = "promote")]
        backup: bool,
    },

    /// Promote a candidate model directory to active
    Promote {
        candidate: PathBuf,

        /// Keep the current active model as backup
        #[arg(long)]
        backup: bool,
    },

    /// Swap the active and backup models
    Rollback,

    /// Show the active and backup models
    Status,

    /// Register a bare model directory (config + weights) as a candidate
    Import { dir: PathBuf },

    /// Classify messages with the active model
    ///
    /// With neither TEXT nor --batch, reads one message per line from stdin.
    Classify {
        text: Option<String>,

        /// File with one message per line
        #[arg(short, long, conflicts_with = "text")]
        batch: Option<PathBuf>,

        /// Decision threshold on P(funny)
        #[arg(short, long, env = "COMMIT_HUMOR_THRESHOLD")]
        threshold: Option<f32>,
    },

    /// Watch a commit JSON file and classify new records
    Watch {
        /// Commit JSON file (default: watch.source)
        #[arg(long, env = "COMMIT_HUMOR_SOURCE")]
        source: Option<PathBuf>,

        /// Results file (default: <source stem>_results.json)
        #[arg(short, long, env = "COMMIT_HUMOR_OUTPUT")]
        output: Option<PathBuf>,

        /// Seconds between polls
        #[arg(short, long, env = "COMMIT_HUMOR_INTERVAL")]
        interval: Option<u64>,

        /// Decision threshold on P(funny)
        #[arg(short, long, env = "COMMIT_HUMOR_THRESHOLD")]
        threshold: Option<f32>,

        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,

        /// Ignore results already in the output file
        #[arg(long)]
        fresh: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json, level_for(cli.verbose));

    let mut config = AppConfig::load_or_default(cli.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(store) = &cli.store {
        config.model.store_dir = store.clone();
    }

    match cli.command {
        Commands::Merge {
            adapter,
            base,
            output,
            promote,
            backup,
        } => {
            let base = base.unwrap_or_else(|| config.model.base_model.clone());
            cmd_merge(&config, &adapter, &base, &output, promote, backup, cli.json)
        }
        Commands::Promote { candidate, backup } => {
            cmd_promote(&config, &candidate, backup, cli.json)
        }
        Commands::Rollback => cmd_rollback(&config, cli.json),
        Commands::Status => cmd_status(&config, cli.json),
        Commands::Import { dir } => cmd_import(&config, &dir, cli.json),
        Commands::Classify {
            text,
            batch,
            threshold,
        } => {
            if let Some(t) = threshold {
                config.model.threshold = t;
            }
            cmd_classify(&config, text, batch.as_deref(), cli.json).await
        }
        Commands::Watch {
            source,
            output,
            interval,
            threshold,
            once,
            fresh,
        } => {
            apply_watch_overrides(&mut config, source, output, interval, threshold);
            cmd_watch(&config, once, fresh, cli.json).await
        }
    }
}

fn apply_watch_overrides(
    config: &mut AppConfig,
    source: Option<PathBuf>,
    output: Option<PathBuf>,
    interval: Option<u64>,
    threshold: Option<f32>,
) {
    if let Some(source) = source {
        config.watch.source = source;
    }
    if output.is_some() {
        config.watch.output = output;
    }
    if let Some(interval) = interval {
        config.watch.interval_secs = interval;
    }
    if let Some(threshold) = threshold {
        config.model.threshold = threshold;
    }
}

fn open_store(config: &AppConfig) -> Result<ArtifactStore> {
    ArtifactStore::open(&config.model.store_dir).with_context(|| {
        format!(
            "failed to open artifact store at {}",
            config.model.store_dir.display()
        )
    })
}

/// Artifact summary printed by the store commands.
#[derive(Serialize)]
struct ArtifactView {
    id: Option<String>,
    status: String,
    path: PathBuf,
    weights_digest: String,
    created_at: String,
    base_model: Option<String>,
}

impl From<&ModelArtifact> for ArtifactView {
    fn from(a: &ModelArtifact) -> Self {
        Self {
            id: a.id.clone(),
            status: a.status.to_string(),
            path: a.path.clone(),
            weights_digest: a.weights_digest().to_string(),
            created_at: a.created_at().to_rfc3339(),
            base_model: a.manifest.base_model.clone(),
        }
    }
}

fn print_artifact(label: &str, artifact: &ModelArtifact, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(&ArtifactView::from(artifact))?);
    } else {
        let digest = artifact.weights_digest();
        println!(
            "{label}: {} ({}, sha256 {}, created {})",
            artifact.version(),
            artifact.status,
            &digest[..12.min(digest.len())],
            artifact.created_at().to_rfc3339()
        );
    }
    Ok(())
}

// ========== Artifact Commands ==========

fn cmd_merge(
    config: &AppConfig,
    adapter: &Path,
    base: &str,
    output: &Path,
    promote: bool,
    backup: bool,
    json: bool,
) -> Result<()> {
    config.validate()?;
    let mut loader = LocalBaseModels::new();
    if let Some(cache) = &config.model.cache_dir {
        loader = loader.with_cache_dir(cache);
    }
    let engine = MergeEngine::new(loader);

    let artifact = if promote {
        let store = open_store(config)?;
        engine
            .merge_and_promote(adapter, base, output, &store, backup)
            .context("merge and promote failed")?
    } else {
        engine
            .merge(adapter, base, output)
            .context("merge failed")?
    };

    info!(
        merged = artifact.manifest.merged_modules,
        replaced = artifact.manifest.replaced_modules,
        "merge complete"
    );
    print_artifact("merged", &artifact, json)
}

fn cmd_promote(config: &AppConfig, candidate: &Path, backup: bool, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let candidate = ModelArtifact::open_candidate(candidate)
        .with_context(|| format!("{} is not a candidate artifact", candidate.display()))?;
    let active = store.promote(&candidate, backup).context("promote failed")?;
    print_artifact("active", &active, json)
}

fn cmd_rollback(config: &AppConfig, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let active = store.rollback().context("rollback failed")?;
    print_artifact("active", &active, json)
}

fn cmd_status(config: &AppConfig, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let status = store.status()?;

    if json {
        let view = serde_json::json!({
            "store": store.root(),
            "active": status.active.as_ref().map(ArtifactView::from),
            "backup": status.backup.as_ref().map(ArtifactView::from),
        });
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!("store: {}", store.root().display());
    match &status.active {
        Some(a) => print_artifact("active", a, false)?,
        None => println!("active: none"),
    }
    match &status.backup {
        Some(b) => print_artifact("backup", b, false)?,
        None => println!("backup: none"),
    }
    Ok(())
}

fn cmd_import(config: &AppConfig, dir: &Path, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let candidate = store
        .import(dir)
        .with_context(|| format!("failed to import {}", dir.display()))?;
    print_artifact("candidate", &candidate, json)
}

// ========== Classification Commands ==========

async fn load_service(config: &AppConfig, store: &ArtifactStore) -> Result<ClassificationService> {
    let service = ClassificationService::new(config.threshold()?);
    service.reload_active(store).await.with_context(|| {
        format!(
            "no usable active model in {} (merge with --promote, or import and promote one)",
            store.root().display()
        )
    })?;
    Ok(service)
}

#[derive(Serialize)]
struct ClassifyLine<'a> {
    text: &'a str,
    #[serde(flatten)]
    prediction: Option<Prediction>,
    error: Option<String>,
}

fn print_prediction(
    text: &str,
    outcome: &std::result::Result<Prediction, ClassifyError>,
    json: bool,
) -> Result<()> {
    let line = ClassifyLine {
        text,
        prediction: outcome.as_ref().ok().copied(),
        error: outcome.as_ref().err().map(ToString::to_string),
    };
    if json {
        println!("{}", serde_json::to_string(&line)?);
        return Ok(());
    }
    match (&line.prediction, &line.error) {
        (Some(p), _) => println!("{} (p={:.3})  {}", p.label, p.confidence, text),
        (None, Some(e)) => println!("ERROR ({e})  {text}"),
        (None, None) => {}
    }
    Ok(())
}

async fn cmd_classify(
    config: &AppConfig,
    text: Option<String>,
    batch: Option<&Path>,
    json: bool,
) -> Result<()> {
    config.validate()?;
    let store = open_store(config)?;
    let service = load_service(config, &store).await?;

    let texts: Vec<String> = match (text, batch) {
        (Some(text), _) => vec![text],
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        (None, None) => {
            let stdin = std::io::stdin();
            let mut lines = Vec::new();
            for line in stdin.lock().lines() {
                let line = line.context("failed to read stdin")?;
                if !line.trim().is_empty() {
                    lines.push(line.trim().to_string());
                }
            }
            lines
        }
    };
    if texts.is_empty() {
        bail!("nothing to classify");
    }

    let outcomes = service.predict_batch(texts.as_slice()).await?;
    let mut funny = 0;
    for (text, outcome) in texts.iter().zip(&outcomes) {
        if matches!(outcome, Ok(p) if p.is_funny()) {
            funny += 1;
        }
        print_prediction(text, outcome, json)?;
    }
    if texts.len() > 1 {
        info!(total = texts.len(), funny = funny, threshold = %service.threshold(), "batch classified");
    }
    Ok(())
}

async fn cmd_watch(config: &AppConfig, once: bool, fresh: bool, json: bool) -> Result<()> {
    config.validate()?;
    let store = Arc::new(open_store(config)?);
    let service = Arc::new(load_service(config, &store).await?);
    let sink = Arc::new(ResultSink::new());

    let output = config.watch.output_path();
    let source = JsonFileSource::new(&config.watch.source).with_retry(config.watch.retry.clone());
    let watcher = StreamWatcher::new(source, service.clone(), sink.clone()).with_output(&output);

    if !fresh {
        match watcher.restore().await {
            Ok(0) => {}
            Ok(n) => info!(restored = n, output = %output.display(), "resuming from previous results"),
            Err(e @ WatchError::Parse(_)) => {
                warn!(error = %e, "previous results unreadable, starting fresh")
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("could not restore previous results from {}", output.display())
                })
            }
        }
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping after the current cycle");
                cancel.cancel();
            }
        });
    }
    if !once {
        spawn_model_follower(store.clone(), service.clone(), config.watch.interval(), cancel.clone());
    }

    let mode = if once { RunMode::Once } else { RunMode::Continuous };
    let summary = watcher
        .watch(config.watch.interval(), mode, cancel.clone())
        .await
        .context("watch failed")?;
    cancel.cancel();

    let snapshot = sink.snapshot().await;
    let stats = snapshot.stats();
    if json {
        let view = serde_json::json!({
            "summary": summary,
            "stats": stats,
            "processed": watcher.stats().await,
            "output": output,
        });
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        println!(
            "{} cycles, {} newly classified; {} of {} funny ({:.1}%), results in {}",
            summary.cycles,
            summary.classified,
            stats.funny_count,
            stats.total_count,
            stats.funny_ratio() * 100.0,
            output.display()
        );
    }
    Ok(())
}

/// Reload the model whenever the store's active slot changes.
fn spawn_model_follower(
    store: Arc<ArtifactStore>,
    service: Arc<ClassificationService>,
    every: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(every) => {}
            }
            if let Err(e) = service.reload_active(&store).await {
                warn!(error = %e, "active model reload failed, keeping current model");
            }
        }
    });
}
