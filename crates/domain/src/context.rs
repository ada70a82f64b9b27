//! Context-repository records: dialogue turns, execution evidence, memory
//! items, context snapshots, and the thread TODO snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation turns
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A paired user/assistant exchange. An unpaired trailing user message is
/// surfaced as a pending turn (`assistant_message_id = None`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub thread_id: String,
    pub user_message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_message_id: Option<String>,
    pub user_text: String,
    #[serde(default)]
    pub assistant_text: String,
    pub at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn is_pending(&self) -> bool {
        self.assistant_message_id.is_none()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution evidence
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Evidence of one executed step (a tool call, a provider decision) kept
/// for prompt packing. Bounded: summary ≤ 220 runes, payload ≤ 400 runes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSpan {
    pub span_id: String,
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub kind: String,
    pub summary: String,
    pub payload_json: String,
    pub at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory items
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    Working,
    Episodic,
    LongTerm,
}

impl MemoryScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::Episodic => "episodic",
            Self::LongTerm => "long_term",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "working" => Self::Working,
            "episodic" => Self::Episodic,
            "long_term" => Self::LongTerm,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Fact,
    Constraint,
    Decision,
    Todo,
    Artifact,
    Blocker,
}

impl MemoryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Constraint => "constraint",
            Self::Decision => "decision",
            Self::Todo => "todo",
            Self::Artifact => "artifact",
            Self::Blocker => "blocker",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "fact" => Self::Fact,
            "constraint" => Self::Constraint,
            "decision" => Self::Decision,
            "todo" => Self::Todo,
            "artifact" => Self::Artifact,
            "blocker" => Self::Blocker,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub memory_id: String,
    pub thread_id: String,
    pub scope: MemoryScope,
    pub kind: MemoryKind,
    pub content: String,
    #[serde(default)]
    pub source_refs: Vec<String>,
    pub importance: f64,
    pub freshness: f64,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context snapshots
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotLevel {
    Episode,
    Thread,
}

impl SnapshotLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Episode => "episode",
            Self::Thread => "thread",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "episode" => Self::Episode,
            "thread" => Self::Thread,
            _ => return None,
        })
    }
}

/// A folded summary of older dialogue, identified by a content hash so the
/// same summary is never stored twice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub snapshot_id: String,
    pub thread_id: String,
    pub level: SnapshotLevel,
    pub summary: String,
    pub covers_from_turn: i64,
    pub covers_to_turn: i64,
    pub quality: f64,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Thread TODO snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    #[default]
    Pending,
    InProgress,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub status: TodoStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// The versioned TODO snapshot returned by the store. `version = 0` with an
/// empty list means "never written".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TodosSnapshot {
    pub version: u64,
    pub todos_json: String,
}

impl TodosSnapshot {
    pub fn empty() -> Self {
        Self {
            version: 0,
            todos_json: "[]".into(),
        }
    }

    pub fn items(&self) -> Vec<TodoItem> {
        serde_json::from_str(&self.todos_json).unwrap_or_default()
    }
}
