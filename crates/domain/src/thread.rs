//! Thread records and the run state set.
//!
//! A thread is one conversation, identified by `(endpoint_id, thread_id)`.
//! The thread row carries the *current* run state so clients can render a
//! thread list without joining against runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::text::truncate_runes;

/// Maximum persisted run error length, in runes.
pub const RUN_ERROR_MAX_RUNES: usize = 600;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Accepted,
    Running,
    WaitingApproval,
    Recovering,
    WaitingUser,
    Success,
    Failed,
    Canceled,
    TimedOut,
}

impl RunState {
    /// A run is active while it may still produce output.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Accepted | Self::Running | Self::WaitingApproval | Self::Recovering
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Canceled | Self::TimedOut
        )
    }

    /// States that may carry a non-empty run error.
    pub fn allows_error(self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Accepted => "accepted",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::Recovering => "recovering",
            Self::WaitingUser => "waiting_user",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "idle" => Self::Idle,
            "accepted" => Self::Accepted,
            "running" => Self::Running,
            "waiting_approval" => Self::WaitingApproval,
            "recovering" => Self::Recovering,
            "waiting_user" => Self::WaitingUser,
            "success" => Self::Success,
            "failed" => Self::Failed,
            "canceled" => Self::Canceled,
            "timed_out" => Self::TimedOut,
            _ => return None,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Waiting prompt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The pending `ask_user` triple. Present iff the thread is in
/// `waiting_user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingPrompt {
    pub prompt_id: String,
    pub message_id: String,
    pub tool_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Thread record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub endpoint_id: String,
    pub thread_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default)]
    pub model_locked: bool,
    /// Absolute path; must exist and be a directory when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    pub run_status: RunState,
    /// Non-empty only in `failed` / `timed_out`, ≤ 600 runes.
    #[serde(default)]
    pub run_error: String,
    #[serde(default)]
    pub last_message_preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_prompt: Option<WaitingPrompt>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    pub run_updated_at: DateTime<Utc>,
}

impl ThreadRecord {
    /// Normalize a `(state, error, waiting)` triple so it satisfies the
    /// thread invariants: error only on failure states (truncated to 600
    /// runes), waiting triple only in `waiting_user`.
    pub fn normalize_run_state(
        state: RunState,
        error: &str,
        waiting: Option<WaitingPrompt>,
    ) -> (RunState, String, Option<WaitingPrompt>) {
        let error = if state.allows_error() {
            truncate_runes(error, RUN_ERROR_MAX_RUNES)
        } else {
            String::new()
        };
        let waiting = if state == RunState::WaitingUser {
            waiting
        } else {
            None
        };
        (state, error, waiting)
    }
}
