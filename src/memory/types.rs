//! Core record type definitions.
//!
//! Defines [`Source`] (the closed set of collaborators that feed the engine),
//! [`MemoryRecord`] (a full row of the record table), [`NewMemory`] (an ingest
//! payload) and [`MemoryFilter`] (the query-side restriction used by every search).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::partition::{user_segment, PartitionKey};

/// Free-form metadata attached to a memory. Keys and values are plain strings.
pub type Metadata = BTreeMap<String, String>;

/// Where a memory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Medication,
    Habit,
    Finance,
    Voice,
    Camera,
    Chat,
    Document,
}

impl Source {
    pub const ALL: [Source; 7] = [
        Self::Medication,
        Self::Habit,
        Self::Finance,
        Self::Voice,
        Self::Camera,
        Self::Chat,
        Self::Document,
    ];

    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Medication => "medication",
            Self::Habit => "habit",
            Self::Finance => "finance",
            Self::Voice => "voice",
            Self::Camera => "camera",
            Self::Chat => "chat",
            Self::Document => "document",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|src| src.as_str() == s)
            .ok_or_else(|| format!("unknown source: {s}"))
    }
}

/// A memory record, matching the `memories` table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// UUID v7 (time-sortable) primary key.
    pub id: String,
    pub text: String,
    /// `None` until the embedding pipeline has filled it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Model version that produced `embedding`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    pub source: Source,
    pub user: String,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    /// Long-term relevance in `[0.0, 1.0]`.
    pub importance: f64,
    pub encrypted: bool,
    /// Assigned once at creation, never changed.
    pub partition_key: PartitionKey,
    /// Tombstone. Deleted records stay in the table but are never searched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl MemoryRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Ingest payload. Everything but `text` and `source` has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMemory {
    pub text: String,
    pub source: Source,
    #[serde(default)]
    pub metadata: Metadata,
    /// Owning user; the configured default user when absent.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub importance: Option<f64>,
    #[serde(default)]
    pub encrypted: bool,
    /// Backdated creation time (imports). Defaults to now.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Precomputed `(vector, model)` pair, e.g. from a bulk import.
    #[serde(skip)]
    pub embedding: Option<(Vec<f32>, String)>,
}

impl NewMemory {
    pub fn new(text: impl Into<String>, source: Source) -> Self {
        Self {
            text: text.into(),
            source,
            metadata: Metadata::new(),
            user: None,
            importance: None,
            encrypted: false,
            created_at: None,
            embedding: None,
        }
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn with_embedding(mut self, vector: Vec<f32>, model: impl Into<String>) -> Self {
        self.embedding = Some((vector, model.into()));
        self
    }
}

/// Restricts a search to a user, a set of sources, and a creation-time window.
/// An empty `sources` list means every source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryFilter {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

impl MemoryFilter {
    pub fn for_user(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            ..Self::default()
        }
    }

    /// The user as records store it.
    pub fn user_name(&self) -> Option<&str> {
        self.user.as_deref().map(str::trim)
    }

    pub fn has_time_window(&self) -> bool {
        self.since.is_some() || self.until.is_some()
    }

    /// Coarse partition-level check: user, source, and bucket/window overlap.
    pub fn matches_partition(&self, key: &PartitionKey) -> bool {
        if let Some(user) = self.user_name() {
            if key.user() != user_segment(user) {
                return false;
            }
        }
        if !self.sources.is_empty() {
            match key.source() {
                Some(src) if self.sources.contains(&src) => {}
                _ => return false,
            }
        }
        if self.since.is_none() && self.until.is_none() {
            return true;
        }
        match key.bucket_bounds() {
            Some((start, end)) => {
                let after_since = self.since.map_or(true, |since| end > since);
                let before_until = self.until.map_or(true, |until| start <= until);
                after_since && before_until
            }
            None => true,
        }
    }

    /// Exact record-level check.
    pub fn matches_record(&self, record: &MemoryRecord) -> bool {
        if let Some(user) = self.user_name() {
            if record.user != user {
                return false;
            }
        }
        if !self.sources.is_empty() && !self.sources.contains(&record.source) {
            return false;
        }
        if let Some(since) = self.since {
            if record.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.created_at > until {
                return false;
            }
        }
        true
    }
}
