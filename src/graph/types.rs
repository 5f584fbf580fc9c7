use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Habit,
    Medication,
    Location,
    Activity,
    Concept,
    Time,
}

impl EntityType {
    pub const ALL: [EntityType; 7] = [
        Self::Person,
        Self::Habit,
        Self::Medication,
        Self::Location,
        Self::Activity,
        Self::Concept,
        Self::Time,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Habit => "habit",
            Self::Medication => "medication",
            Self::Location => "location",
            Self::Activity => "activity",
            Self::Concept => "concept",
            Self::Time => "time",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown entity type: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    Causes,
    Prevents,
    Improves,
    Worsens,
    RelatedTo,
    OccursAt,
    BelongsTo,
    SimilarTo,
}

impl RelationType {
    pub const ALL: [RelationType; 8] = [
        Self::Causes,
        Self::Prevents,
        Self::Improves,
        Self::Worsens,
        Self::RelatedTo,
        Self::OccursAt,
        Self::BelongsTo,
        Self::SimilarTo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Causes => "causes",
            Self::Prevents => "prevents",
            Self::Improves => "improves",
            Self::Worsens => "worsens",
            Self::RelatedTo => "related_to",
            Self::OccursAt => "occurs_at",
            Self::BelongsTo => "belongs_to",
            Self::SimilarTo => "similar_to",
        }
    }

    /// Edges worth turning into a suggestion.
    pub fn is_actionable(&self) -> bool {
        matches!(self, Self::Improves | Self::Prevents)
    }
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RelationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown relation type: {s}"))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeEntity {
    pub id: String,
    pub entity_type: EntityType,
    pub label: String,
    pub memory_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeRelationship {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub relation: RelationType,
    /// Evidence-weighted confidence in `[0, 1)`.
    pub strength: f64,
    pub evidence_count: u32,
    pub memory_ids: Vec<String>,
}

/// Lowercase, strip surrounding punctuation, collapse whitespace.
pub fn normalize_label(label: &str) -> String {
    label
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Stable id for an entity: the same type and label always map to the same id.
pub fn entity_id(entity_type: EntityType, label: &str) -> String {
    format!(
        "ent_{}",
        short_hash(&format!("{}:{}", entity_type.as_str(), normalize_label(label)))
    )
}

pub fn relationship_id(source_id: &str, target_id: &str, relation: RelationType) -> String {
    format!(
        "rel_{}",
        short_hash(&format!("{source_id}|{}|{target_id}", relation.as_str()))
    )
}

/// `mean · n / (n + prior)`: grows toward the mean confidence as evidence piles up.
pub fn evidence_strength(confidence_sum: f64, evidence_count: u32, prior: f64) -> f64 {
    if evidence_count == 0 {
        return 0.0;
    }
    let n = f64::from(evidence_count);
    let mean = confidence_sum / n;
    mean * n / (n + prior.max(0.0))
}
