use chrono::{DateTime, Utc};
use serde::Serialize;

/// Highest priority, reserved for repairs (rebuild after a checksum mismatch).
pub const PRIORITY_URGENT: u8 = 0;
pub const PRIORITY_LOWEST: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Target: memory id.
    Embed,
    /// Target: memory id whose shard should absorb its pending entries.
    Index,
    /// Target: shard id, or `*` for a full policy pass.
    Consolidate,
    /// Target: `*` or a memory id.
    BuildGraph,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Embed => "embed",
            Self::Index => "index",
            Self::Consolidate => "consolidate",
            Self::BuildGraph => "build_graph",
        }
    }

    /// Kinds whose ready tasks are handed to one worker together.
    pub fn is_batched(&self) -> bool {
        matches!(self, Self::Embed)
    }

    pub fn default_priority(&self) -> u8 {
        match self {
            Self::Embed | Self::Index => 1,
            Self::Consolidate => 2,
            Self::BuildGraph => 3,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "embed" => Ok(Self::Embed),
            "index" => Ok(Self::Index),
            "consolidate" => Ok(Self::Consolidate),
            "build_graph" => Ok(Self::BuildGraph),
            other => Err(format!("unknown task kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A unit of background work as recorded in the task log.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub target: String,
    pub priority: u8,
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(kind: TaskKind, target: impl Into<String>, priority: u8) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            kind,
            target: target.into(),
            priority: priority.min(PRIORITY_LOWEST),
            status: TaskStatus::Queued,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
