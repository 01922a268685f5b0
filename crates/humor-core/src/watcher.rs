//! Incremental classification of an append-only commit source.
//!
//! Each poll cycle reads the whole source, picks the records whose id has
//! not been processed yet, classifies them and publishes the results to the
//! [`ResultSink`] as one batch.
//!
//! ```text
//! Idle -> Polling -> Classifying -> Idle -> ...   (until cancelled) -> Stopped
//! ```
//!
//! Records that fail to classify stay pending and are retried on the next
//! cycle. A malformed read leaves the state untouched. A single record that
//! does not fit the schema is logged and skipped; the rest of the read is
//! still classified.
//!
//! Processing state is published as an immutable snapshot, replaced only
//! after the cycle's results are in the sink. Dropping a [`poll_once`]
//! future part-way is therefore safe: whatever was not published is simply
//! picked up again by the next cycle.
//!
//! [`poll_once`]: StreamWatcher::poll_once

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::classifier::{predict, ClassificationService, ModelHandle};
use crate::commit::{ClassificationResult, CommitRecord, HumorClassification};
use crate::config::RetryPolicy;
use crate::error::{ClassifyError, WatchError};
use crate::metrics::METRICS;
use crate::obs::{self, CycleSpan};
use crate::sink::ResultSink;

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Where commit records come from. Each call returns the complete current
/// contents; the watcher does the diffing.
#[async_trait]
pub trait CommitSource: Send + Sync {
    fn describe(&self) -> String;

    async fn read_records(&self) -> Result<Vec<CommitRecord>, WatchError>;
}

/// A JSON file holding an array of commit records.
///
/// A missing file reads as an empty array. Other I/O failures are retried
/// per the [`RetryPolicy`]; content that does not parse is a
/// [`WatchError::Parse`] and is not retried within the cycle.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
    retry: RetryPolicy,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_bytes(&self) -> io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl CommitSource for JsonFileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn read_records(&self) -> Result<Vec<CommitRecord>, WatchError> {
        let bytes = (|| self.read_bytes())
            .retry(self.retry.backoff())
            .notify(|err: &io::Error, delay: Duration| {
                warn!(source = %self.path.display(), error = %err, delay_ms = delay.as_millis() as u64, "source read failed, retrying");
            })
            .await?;
        match bytes {
            Some(bytes) => parse_records(&self.describe(), &bytes),
            None => {
                debug!(source = %self.path.display(), "source does not exist yet");
                Ok(Vec::new())
            }
        }
    }
}

/// Parse a JSON array of records. Blank input counts as an empty array.
///
/// Only content that is not a JSON array is a [`WatchError::Parse`]. An
/// element that does not fit the record schema is logged and left out.
pub fn parse_records(source: &str, bytes: &[u8]) -> Result<Vec<CommitRecord>, WatchError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let values: Vec<Value> =
        serde_json::from_slice(bytes).map_err(|e| WatchError::Parse(e.to_string()))?;
    let mut records = Vec::with_capacity(values.len());
    for (index, value) in values.into_iter().enumerate() {
        match serde_json::from_value::<CommitRecord>(value) {
            Ok(record) => records.push(record),
            Err(e) => obs::emit_record_invalid(source, index, &e),
        }
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingStats {
    pub funny_count: usize,
    pub total_count: usize,
    /// Records with an empty message, marked processed without a result.
    pub skipped_count: usize,
}

/// Ids already handled plus running counts. Only grows, except on
/// [`StreamWatcher::reset`]. The watcher publishes it as an `Arc` snapshot.
#[derive(Debug, Clone, Default)]
pub struct ProcessingState {
    processed: HashSet<String>,
    stats: ProcessingStats,
}

impl ProcessingState {
    pub fn is_processed(&self, id: &str) -> bool {
        self.processed.contains(id)
    }

    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }

    pub fn stats(&self) -> ProcessingStats {
        self.stats
    }

    fn mark_classified(&mut self, id: String, funny: bool) {
        if self.processed.insert(id) {
            self.stats.total_count += 1;
            if funny {
                self.stats.funny_count += 1;
            }
        }
    }

    fn mark_skipped(&mut self, id: String) {
        if self.processed.insert(id) {
            self.stats.skipped_count += 1;
        }
    }
}

/// State changes a cycle makes, applied in one step once its results are
/// in the sink.
#[derive(Debug, Default)]
struct CycleUpdate {
    classified: Vec<(String, bool)>,
    skipped: Vec<String>,
}

impl CycleUpdate {
    fn is_empty(&self) -> bool {
        self.classified.is_empty() && self.skipped.is_empty()
    }

    fn applied_to(self, current: &ProcessingState) -> ProcessingState {
        let mut next = current.clone();
        for (id, funny) in self.classified {
            next.mark_classified(id, funny);
        }
        for id in self.skipped {
            next.mark_skipped(id);
        }
        next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherState {
    Idle,
    Polling,
    Classifying,
    Stopped,
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WatcherState::Idle => "idle",
            WatcherState::Polling => "polling",
            WatcherState::Classifying => "classifying",
            WatcherState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// One cycle, then return.
    Once,
    /// Cycle until cancelled.
    Continuous,
}

/// What one poll cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub records_seen: usize,
    pub new_records: usize,
    pub classified: usize,
    pub funny: usize,
    pub skipped: usize,
    pub failed: usize,
    pub exported: bool,
}

impl CycleReport {
    /// Nothing changed.
    pub fn is_quiet(&self) -> bool {
        self.classified == 0 && self.skipped == 0
    }
}

/// Totals for a [`StreamWatcher::watch`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatchSummary {
    pub cycles: u64,
    pub classified: usize,
    pub parse_failures: usize,
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

pub struct StreamWatcher<S = JsonFileSource> {
    source: S,
    service: Arc<ClassificationService>,
    sink: Arc<ResultSink>,
    output: Option<PathBuf>,
    /// Held by whatever is changing the state: a cycle, a reset, a restore.
    writer: Mutex<()>,
    state: RwLock<Arc<ProcessingState>>,
    export_pending: AtomicBool,
    status: RwLock<WatcherState>,
    cycles: AtomicU64,
}

impl<S: CommitSource> StreamWatcher<S> {
    pub fn new(source: S, service: Arc<ClassificationService>, sink: Arc<ResultSink>) -> Self {
        Self {
            source,
            service,
            sink,
            output: None,
            writer: Mutex::new(()),
            state: RwLock::new(Arc::new(ProcessingState::default())),
            export_pending: AtomicBool::new(false),
            status: RwLock::new(WatcherState::Idle),
            cycles: AtomicU64::new(0),
        }
    }

    /// Export results to `path` after every cycle that produced some.
    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn sink(&self) -> &Arc<ResultSink> {
        &self.sink
    }

    pub fn service(&self) -> &Arc<ClassificationService> {
        &self.service
    }

    pub async fn status(&self) -> WatcherState {
        *self.status.read().await
    }

    /// The last published processing state. Never waits for a running
    /// cycle.
    pub async fn processing(&self) -> Arc<ProcessingState> {
        self.state.read().await.clone()
    }

    pub async fn stats(&self) -> ProcessingStats {
        self.processing().await.stats()
    }

    pub async fn processed_count(&self) -> usize {
        self.processing().await.len()
    }

    pub async fn is_processed(&self, id: &str) -> bool {
        self.processing().await.is_processed(id)
    }

    async fn set_status(&self, status: WatcherState) {
        *self.status.write().await = status;
    }

    /// Forget everything processed so far. The next cycle reclassifies the
    /// whole source.
    pub async fn reset(&self) {
        let _writer = self.writer.lock().await;
        let mut published = self.state.write().await;
        self.sink.clear().await;
        *published = Arc::new(ProcessingState::default());
        self.export_pending.store(false, Ordering::Relaxed);
        info!(source = %self.source.describe(), "processing state reset");
    }

    /// Reload results from the output file, if there is one, so a restart
    /// does not classify the same records again. Returns how many results
    /// were restored.
    ///
    /// An output file that cannot be parsed is renamed aside (see
    /// [`set_aside`]) before the error is returned, so later exports never
    /// overwrite it.
    pub async fn restore(&self) -> Result<usize, WatchError> {
        let Some(path) = &self.output else {
            return Ok(0);
        };
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let results: Vec<ClassificationResult> = match serde_json::from_slice(&bytes) {
            Ok(results) => results,
            Err(e) => {
                let kept = set_aside(path).await?;
                warn!(output = %path.display(), kept = %kept.display(), error = %e, "previous results unreadable, moved aside");
                return Err(WatchError::Parse(format!(
                    "{}: {e} (moved to {})",
                    path.display(),
                    kept.display()
                )));
            }
        };

        let _writer = self.writer.lock().await;
        let update = CycleUpdate {
            classified: results.iter().map(|r| (r.id(), r.is_funny())).collect(),
            skipped: Vec::new(),
        };
        let mut published = self.state.write().await;
        let next = update.applied_to(&published);
        let restored = self.sink.extend(results).await;
        *published = Arc::new(next);
        info!(output = %path.display(), restored = restored, "restored previous results");
        Ok(restored)
    }

    /// Run one cycle: read, diff, classify, publish, export.
    ///
    /// Cancel-safe: a record counts as processed only once its result is in
    /// the sink, and both become visible together.
    pub async fn poll_once(&self) -> Result<CycleReport, WatchError> {
        let _writer = self.writer.lock().await;
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let span = CycleSpan::new(cycle, &self.source.describe());

        let outcome = self.run_cycle(cycle).instrument(span.span()).await;
        self.set_status(WatcherState::Idle).await;
        METRICS.inc_cycles();

        match outcome {
            Ok(report) => {
                span.finish(report.new_records, report.classified, report.funny, report.failed);
                Ok(report)
            }
            Err(e) => {
                if let WatchError::Parse(_) = &e {
                    METRICS.inc_parse_failures();
                    obs::emit_parse_failed(&self.source.describe(), &e);
                }
                Err(e)
            }
        }
    }

    async fn run_cycle(&self, cycle: u64) -> Result<CycleReport, WatchError> {
        self.set_status(WatcherState::Polling).await;
        let records = self.source.read_records().await?;
        let state = self.processing().await;

        let mut report = CycleReport {
            cycle,
            records_seen: records.len(),
            ..CycleReport::default()
        };

        let mut seen = HashSet::new();
        let pending: Vec<(String, CommitRecord)> = records
            .into_iter()
            .map(|r| (r.id(), r))
            .filter(|(id, _)| !state.is_processed(id) && seen.insert(id.clone()))
            .collect();
        report.new_records = pending.len();

        if !pending.is_empty() {
            self.set_status(WatcherState::Classifying).await;
        }
        // One handle per cycle, fetched on first use: a model swap takes
        // effect at the next cycle.
        let mut handle: Option<Result<ModelHandle, ClassifyError>> = None;
        let threshold = self.service.threshold();

        let mut batch = Vec::new();
        let mut update = CycleUpdate::default();
        for (id, record) in pending {
            if !record.has_message() {
                debug!(id = %id, "skipping record with empty message");
                update.skipped.push(id);
                report.skipped += 1;
                continue;
            }
            if handle.is_none() {
                handle = Some(self.service.handle().await);
            }
            let prediction = match &handle {
                Some(Ok(handle)) => predict(handle, record.message(), threshold),
                Some(Err(e)) => Err(e.clone()),
                None => Err(ClassifyError::NoModel),
            };
            match prediction {
                Ok(p) => {
                    obs::emit_record_classified(&id, p.label.as_str(), p.confidence);
                    METRICS.inc_records_classified();
                    update.classified.push((id, p.is_funny()));
                    report.classified += 1;
                    if p.is_funny() {
                        report.funny += 1;
                    }
                    let classification = HumorClassification {
                        message: record.message().trim().to_string(),
                        is_funny: p.is_funny(),
                        confidence: p.confidence,
                        label: p.label,
                        processed_at: Utc::now(),
                    };
                    batch.push(ClassificationResult::new(record, classification));
                }
                Err(e) => {
                    METRICS.inc_classification_failures();
                    obs::emit_record_failed(&id, &e);
                    report.failed += 1;
                }
            }
        }

        if !update.is_empty() {
            let mut published = self.state.write().await;
            let next = update.applied_to(&published);
            if !batch.is_empty() {
                self.sink.extend(batch).await;
                self.export_pending.store(true, Ordering::Relaxed);
            }
            // No await between the sink append and this swap.
            *published = Arc::new(next);
        }
        if self.export_pending.load(Ordering::Relaxed) {
            report.exported = self.export().await;
            self.export_pending.store(!report.exported, Ordering::Relaxed);
        }
        Ok(report)
    }

    /// Write the current results to the output file. Failures are logged
    /// and the export is retried after the next cycle.
    async fn export(&self) -> bool {
        let Some(path) = self.output.clone() else {
            return false;
        };
        let snapshot = self.sink.snapshot().await;
        let written = tokio::task::spawn_blocking(move || {
            write_results(&path, snapshot.results()).map(|()| path)
        })
        .await
        .map_err(io::Error::other)
        .and_then(|r| r);
        match written {
            Ok(path) => {
                debug!(output = %path.display(), "results exported");
                true
            }
            Err(e) => {
                warn!(error = %e, "results export failed, will retry next cycle");
                false
            }
        }
    }

    /// Poll until `cancel` fires (or once, per `mode`).
    ///
    /// Cancellation is observed between cycles and while sleeping, never in
    /// the middle of a record. Parse errors are logged and the loop goes
    /// on; an I/O error that survived its retries ends the run.
    pub async fn watch(
        &self,
        interval: Duration,
        mode: RunMode,
        cancel: CancellationToken,
    ) -> Result<WatchSummary, WatchError> {
        let mut summary = WatchSummary::default();
        info!(source = %self.source.describe(), interval_secs = interval.as_secs(), ?mode, "watch started");

        let outcome = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }
            summary.cycles += 1;
            match self.poll_once().await {
                Ok(report) => summary.classified += report.classified,
                Err(e) if e.is_recoverable() && mode == RunMode::Continuous => {
                    summary.parse_failures += 1;
                }
                Err(e) => break Err(e),
            }
            if mode == RunMode::Once {
                break Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }
        };

        self.set_status(WatcherState::Stopped).await;
        METRICS.flush();
        match &outcome {
            Ok(()) => info!(cycles = summary.cycles, classified = summary.classified, "watch stopped"),
            Err(e) => warn!(error = %e, cycles = summary.cycles, "watch aborted"),
        }
        outcome.map(|()| summary)
    }
}

/// Rename an unreadable results file to `<name>.unreadable-<timestamp>` next
/// to it and return the new path.
pub async fn set_aside(path: &Path) -> io::Result<PathBuf> {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".unreadable-{}", Utc::now().format("%Y%m%dT%H%M%S%.3f")));
    let kept = path.with_file_name(name);
    tokio::fs::rename(path, &kept).await?;
    Ok(kept)
}

/// Atomically replace `path` with the results as a pretty JSON array.
pub fn write_results(path: &Path, results: &[ClassificationResult]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;
    let json = serde_json::to_vec_pretty(results).map_err(io::Error::other)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
    io::Write::write_all(&mut tmp, &json)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
