//! Accumulated classification results, published as immutable snapshots.
//!
//! The watcher is the only writer. Readers (the CLI, a viewer) call
//! [`ResultSink::snapshot`] and get an `Arc` they can hold as long as they
//! like; writers build the next snapshot and swap the pointer, so a reader
//! never sees a partially appended batch.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::commit::ClassificationResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub funny_count: usize,
    pub total_count: usize,
}

impl SinkStats {
    pub fn funny_ratio(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.funny_count as f64 / self.total_count as f64
        }
    }

    fn record(&mut self, result: &ClassificationResult) {
        self.total_count += 1;
        if result.is_funny() {
            self.funny_count += 1;
        }
    }
}

#[derive(Debug, Default)]
pub struct SinkSnapshot {
    results: Vec<ClassificationResult>,
    ids: HashSet<String>,
    stats: SinkStats,
    version: u64,
}

impl SinkSnapshot {
    /// All results in append order.
    pub fn results(&self) -> &[ClassificationResult] {
        &self.results
    }

    pub fn stats(&self) -> SinkStats {
        self.stats
    }

    /// Incremented on every published change.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Funny results, most recently authored first. Records without a
    /// parseable author date sort last.
    pub fn funny_commits(&self) -> Vec<&ClassificationResult> {
        let mut funny: Vec<_> = self.results.iter().filter(|r| r.is_funny()).collect();
        funny.sort_by(|a, b| b.record.authored_at().cmp(&a.record.authored_at()));
        funny
    }

    /// Copy of `self` with `batch` appended, skipping ids already present.
    fn extended(&self, batch: Vec<ClassificationResult>) -> (SinkSnapshot, usize) {
        let mut next = SinkSnapshot {
            results: self.results.clone(),
            ids: self.ids.clone(),
            stats: self.stats,
            version: self.version,
        };
        let mut added = 0;
        for result in batch {
            if next.ids.insert(result.id()) {
                next.stats.record(&result);
                next.results.push(result);
                added += 1;
            }
        }
        if added > 0 {
            next.version += 1;
        }
        (next, added)
    }
}

#[derive(Debug, Default)]
pub struct ResultSink {
    current: RwLock<Arc<SinkSnapshot>>,
}

impl ResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Arc<SinkSnapshot> {
        self.current.read().await.clone()
    }

    /// Append one result. Returns `false` (and changes nothing) when a
    /// result with the same id is already present.
    pub async fn append(&self, result: ClassificationResult) -> bool {
        self.extend(vec![result]).await == 1
    }

    /// Append a batch as a single published change. Returns how many were
    /// new.
    pub async fn extend(&self, batch: Vec<ClassificationResult>) -> usize {
        let mut current = self.current.write().await;
        let (next, added) = current.extended(batch);
        if added > 0 {
            *current = Arc::new(next);
        }
        added
    }

    /// Drop every result. Readers holding an older snapshot keep it.
    pub async fn clear(&self) {
        let mut current = self.current.write().await;
        *current = Arc::new(SinkSnapshot {
            version: current.version + 1,
            ..SinkSnapshot::default()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::{CommitRecord, HumorClassification, HumorLabel, Signature};

    pub(crate) fn result(sha: &str, funny: bool, date: &str) -> ClassificationResult {
        ClassificationResult {
            record: CommitRecord {
                sha: sha.to_string(),
                author: Some(Signature {
                    date: Some(date.to_string()),
                    ..Signature::default()
                }),
                message: Some(format!("commit {sha}")),
                ..CommitRecord::default()
            },
            humor_classification: HumorClassification {
                message: format!("commit {sha}"),
                is_funny: funny,
                confidence: if funny { 0.9 } else { 0.1 },
                label: if funny { HumorLabel::Funny } else { HumorLabel::NotFunny },
                processed_at: chrono::Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let sink = ResultSink::new();
        assert!(sink.append(result("a", true, "")).await);
        assert!(!sink.append(result("a", false, "")).await);

        let snap = sink.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.stats(), SinkStats { funny_count: 1, total_count: 1 });
        assert_eq!(snap.version(), 1);
    }

    #[tokio::test]
    async fn old_snapshots_are_unaffected_by_appends() {
        let sink = ResultSink::new();
        sink.append(result("a", false, "")).await;
        let before = sink.snapshot().await;

        sink.extend(vec![result("b", true, ""), result("c", true, "")]).await;
        let after = sink.snapshot().await;

        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 3);
        assert_eq!(after.version(), before.version() + 1);
        assert!((after.stats().funny_ratio() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn funny_commits_newest_first() {
        let sink = ResultSink::new();
        sink.extend(vec![
            result("old", true, "2024-01-01T00:00:00Z"),
            result("dull", false, "2024-06-01T00:00:00Z"),
            result("undated", true, ""),
            result("new", true, "2024-05-01T00:00:00+02:00"),
        ])
        .await;

        let snap = sink.snapshot().await;
        let ids: Vec<_> = snap.funny_commits().iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["new", "old", "undated"]);
    }

    #[tokio::test]
    async fn clear_bumps_version() {
        let sink = ResultSink::new();
        sink.append(result("a", true, "")).await;
        sink.clear().await;
        let snap = sink.snapshot().await;
        assert!(snap.is_empty());
        assert_eq!(snap.version(), 2);
        assert!(!snap.contains("a"));
    }
}
