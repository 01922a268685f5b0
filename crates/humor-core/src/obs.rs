//! Structured lifecycle events for the watcher and classification service.
//!
//! - [`CycleSpan`]: span plus timer for one poll cycle
//! - `emit_*`: one `info!` (or `warn!`) event per lifecycle step, tagged with
//!   an `event` field so JSON logs can be filtered on it

use std::time::Instant;

use tracing::{info, warn, Span};

/// Span covering a single poll cycle.
///
/// The span is not entered here; the watcher instruments its async cycle
/// with [`CycleSpan::span`] so the guard stays `Send`.
pub struct CycleSpan {
    span: Span,
    cycle: u64,
    started: Instant,
}

impl CycleSpan {
    pub fn new(cycle: u64, source: &str) -> Self {
        Self {
            span: tracing::info_span!("humor.cycle", cycle = cycle, source = %source),
            cycle,
            started: Instant::now(),
        }
    }

    pub fn span(&self) -> Span {
        self.span.clone()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Emit `cycle.finished` inside the cycle span.
    pub fn finish(self, new_records: usize, classified: usize, funny: usize, failed: usize) {
        let duration_ms = self.elapsed_ms();
        let _entered = self.span.enter();
        emit_cycle_finished(self.cycle, new_records, classified, funny, failed, duration_ms);
    }
}

pub fn emit_cycle_finished(
    cycle: u64,
    new_records: usize,
    classified: usize,
    funny: usize,
    failed: usize,
    duration_ms: u64,
) {
    info!(
        event = "cycle.finished",
        cycle = cycle,
        new_records = new_records,
        classified = classified,
        funny = funny,
        failed = failed,
        duration_ms = duration_ms,
    );
}

pub fn emit_record_classified(id: &str, label: &str, confidence: f32) {
    info!(event = "record.classified", id = %id, label = %label, confidence = confidence);
}

/// The record stays pending and is retried next cycle.
pub fn emit_record_failed(id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "record.failed", id = %id, error = %error);
}

pub fn emit_parse_failed(source: &str, error: &dyn std::fmt::Display) {
    warn!(event = "source.parse_failed", source = %source, error = %error);
}

/// A record in an otherwise readable source that does not fit the record
/// schema. It is skipped for this cycle.
pub fn emit_record_invalid(source: &str, index: usize, error: &dyn std::fmt::Display) {
    warn!(event = "record.invalid", source = %source, index = index, error = %error);
}

pub fn emit_model_loaded(version: &str, previous: Option<&str>) {
    info!(event = "model.loaded", version = %version, previous = ?previous);
}
