//! Process-wide counters for the classification pipeline.
//!
//! Call sites bump counters without logging anything; [`Metrics::flush`]
//! reports all of them in one `info!` event, typically when a watch run
//! ends.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    records_classified: AtomicU64,
    classification_failures: AtomicU64,
    parse_failures: AtomicU64,
    cycles: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            records_classified: AtomicU64::new(0),
            classification_failures: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
        }
    }

    pub fn inc_records_classified(&self) {
        self.records_classified.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_classification_failures(&self) {
        self.classification_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_parse_failures(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cycles(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit every counter as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            records_classified = self.records_classified(),
            classification_failures = self.classification_failures(),
            parse_failures = self.parse_failures(),
            cycles = self.cycles(),
        );
    }

    pub fn records_classified(&self) -> u64 {
        self.records_classified.load(Ordering::Relaxed)
    }

    pub fn classification_failures(&self) -> u64 {
        self.classification_failures.load(Ordering::Relaxed)
    }

    pub fn parse_failures(&self) -> u64 {
        self.parse_failures.load(Ordering::Relaxed)
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Zero all counters (tests).
    pub fn reset(&self) {
        self.records_classified.store(0, Ordering::Relaxed);
        self.classification_failures.store(0, Ordering::Relaxed);
        self.parse_failures.store(0, Ordering::Relaxed);
        self.cycles.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_independent() {
        let m = Metrics::new();
        m.inc_records_classified();
        m.inc_records_classified();
        m.inc_parse_failures();
        m.inc_cycles();

        assert_eq!(m.records_classified(), 2);
        assert_eq!(m.classification_failures(), 0);
        assert_eq!(m.parse_failures(), 1);
        assert_eq!(m.cycles(), 1);

        m.flush();
        m.reset();
        assert_eq!(m.records_classified(), 0);
        assert_eq!(m.cycles(), 0);
    }
}
