//! Run, tool-call, and run-event records.
//!
//! A run is one end-to-end attempt to produce an assistant message. Tool
//! call records are owned by the run until terminal; run events are the
//! authoritative append-only log clients replay after a stream drop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::thread::RunState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Budgets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RunBudgets {
    pub max_steps: u32,
    pub max_wall_time_ms: u64,
    pub idle_timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_total_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,
}

impl Default for RunBudgets {
    fn default() -> Self {
        Self {
            max_steps: 24,
            max_wall_time_ms: 10 * 60 * 1000,
            idle_timeout_ms: 2 * 60 * 1000,
            max_total_tokens: None,
            max_cost_usd: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Why a run left the turn loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeReason {
    Completed,
    TaskComplete,
    AskUser,
    StepBudget,
    WallClock,
    IdleTimeout,
    DoomLoop,
    Canceled,
    ProviderError,
    ToolError,
    InvariantViolation,
}

/// Stats stamped by the compactor on the last prompt pack of a run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CompactionStats {
    pub saving_ratio: f64,
    pub quality_pass: bool,
    pub estimated_input_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub endpoint_id: String,
    pub thread_id: String,
    pub state: RunState,
    pub step_count: u32,
    pub budgets: RunBudgets,
    #[serde(default)]
    pub compaction: CompactionStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalize_reason: Option<FinalizeReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_message_id: Option<String>,
    /// Short label from the intent classifier: "social" or "task".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub estimated_cost_usd: f64,
    #[serde(default)]
    pub input_preview: String,
    #[serde(default)]
    pub output_preview: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn new(endpoint_id: String, thread_id: String, budgets: RunBudgets) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            endpoint_id,
            thread_id,
            state: RunState::Accepted,
            step_count: 0,
            budgets,
            compaction: CompactionStats::default(),
            finalize_reason: None,
            assistant_message_id: None,
            intent: None,
            model_id: None,
            input_tokens: 0,
            output_tokens: 0,
            reasoning_tokens: 0,
            estimated_cost_usd: 0.0,
            input_preview: String::new(),
            output_preview: String::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn finish(&mut self, state: RunState, reason: FinalizeReason) {
        self.state = state;
        self.finalize_reason = Some(reason);
        self.ended_at = Some(Utc::now());
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool call record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallState {
    Pending,
    Running,
    Recovering,
    Success,
    Error,
    Timeout,
    Aborted,
}

impl ToolCallState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Error | Self::Timeout | Self::Aborted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Recovering => "recovering",
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "recovering" => Self::Recovering,
            "success" => Self::Success,
            "error" => Self::Error,
            "timeout" => Self::Timeout,
            "aborted" => Self::Aborted,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub run_id: Uuid,
    pub tool_id: String,
    pub tool_name: String,
    /// Arguments JSON with sensitive fields redacted.
    pub args_json: serde_json::Value,
    pub state: ToolCallState,
    /// Full result JSON. The authoritative store never truncates this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_json: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Lifecycle,
    Assistant,
    Tool,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lifecycle => "lifecycle",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "lifecycle" => Self::Lifecycle,
            "assistant" => Self::Assistant,
            "tool" => Self::Tool,
            _ => return None,
        })
    }
}

/// One appended run event. Ordering is non-decreasing `at_unix_ms`, ties
/// broken by insertion order (the store's rowid).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEventRecord {
    pub run_id: Uuid,
    pub stream: StreamKind,
    pub event_type: String,
    pub at_unix_ms: i64,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_run_is_accepted() {
        let run = RunRecord::new("ep".into(), "th".into(), RunBudgets::default());
        assert_eq!(run.state, RunState::Accepted);
        assert_eq!(run.step_count, 0);
        assert!(run.ended_at.is_none());
    }

    #[test]
    fn finish_stamps_reason_and_end() {
        let mut run = RunRecord::new("ep".into(), "th".into(), RunBudgets::default());
        run.finish(RunState::Success, FinalizeReason::Completed);
        assert_eq!(run.state, RunState::Success);
        assert_eq!(run.finalize_reason, Some(FinalizeReason::Completed));
        assert!(run.ended_at.is_some());
    }

    #[test]
    fn tool_call_state_terminality() {
        assert!(!ToolCallState::Pending.is_terminal());
        assert!(!ToolCallState::Running.is_terminal());
        assert!(!ToolCallState::Recovering.is_terminal());
        assert!(ToolCallState::Success.is_terminal());
        assert!(ToolCallState::Aborted.is_terminal());
    }

    #[test]
    fn stream_kind_round_trip() {
        for k in [StreamKind::Lifecycle, StreamKind::Assistant, StreamKind::Tool] {
            assert_eq!(StreamKind::parse(k.as_str()), Some(k));
        }
    }
}
