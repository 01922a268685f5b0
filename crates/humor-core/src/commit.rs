//! Commit records and their classification results.
//!
//! Input records are read as-is; fields this crate does not know about are
//! carried in `extra` and written back unchanged on export. Identity fields
//! are nullable, as commit APIs emit `null` for unknown emails or dates.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest as _, Sha256};

/// Key under which a record's classification is exported.
pub const CLASSIFICATION_KEY: &str = "humor_classification";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoInfo {
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
}

/// Author or committer identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sha: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<RepoInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committer: Option<Signature>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CommitRecord {
    /// Identifier used for deduplication: the `sha`, or for sha-less
    /// records a SHA-256 of the message and author date.
    pub fn id(&self) -> String {
        if !self.sha.is_empty() {
            return self.sha.clone();
        }
        let mut hasher = Sha256::new();
        hasher.update(self.message().as_bytes());
        hasher.update(self.author_date().unwrap_or_default().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or_default()
    }

    pub fn has_message(&self) -> bool {
        !self.message().trim().is_empty()
    }

    pub fn author_date(&self) -> Option<&str> {
        self.author
            .as_ref()
            .and_then(|a| a.date.as_deref())
            .filter(|d| !d.is_empty())
    }

    /// Author date parsed as RFC 3339, if it is one.
    pub fn authored_at(&self) -> Option<DateTime<Utc>> {
        self.author_date()
            .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
            .map(|d| d.with_timezone(&Utc))
    }
}

/// The two classes the model distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HumorLabel {
    #[serde(rename = "DRÔLE")]
    Funny,
    #[serde(rename = "PAS DRÔLE")]
    NotFunny,
}

impl HumorLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HumorLabel::Funny => "DRÔLE",
            HumorLabel::NotFunny => "PAS DRÔLE",
        }
    }

    pub fn is_funny(&self) -> bool {
        matches!(self, HumorLabel::Funny)
    }
}

impl fmt::Display for HumorLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `humor_classification` object attached to exported records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumorClassification {
    pub message: String,
    pub is_funny: bool,
    pub confidence: f32,
    pub label: HumorLabel,
    pub processed_at: DateTime<Utc>,
}

/// A source record together with its classification. Created once per
/// record id and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    #[serde(flatten)]
    pub record: CommitRecord,
    pub humor_classification: HumorClassification,
}

impl ClassificationResult {
    /// Attach `classification` to `record`. A classification the record
    /// already carried from upstream is dropped so the key appears once.
    pub fn new(mut record: CommitRecord, classification: HumorClassification) -> Self {
        record.extra.remove(CLASSIFICATION_KEY);
        Self {
            record,
            humor_classification: classification,
        }
    }

    pub fn id(&self) -> String {
        self.record.id()
    }

    pub fn is_funny(&self) -> bool {
        self.humor_classification.is_funny
    }

    pub fn confidence(&self) -> f32 {
        self.humor_classification.confidence
    }

    pub fn label(&self) -> HumorLabel {
        self.humor_classification.label
    }
}
