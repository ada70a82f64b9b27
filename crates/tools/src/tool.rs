//! The tool contract: definitions, handler trait, results, and the
//! execution context handed to every handler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use strand_domain::chat::ToolDefinition;
use strand_domain::error::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error codes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Structured error codes carried in tool results.
pub mod codes {
    /// Cancellation by deadline.
    pub const TIMEOUT: &str = "tool.timeout";
    /// Cancellation by the parent context.
    pub const ABORTED: &str = "tool.aborted";
    /// The human rejected the call.
    pub const PERMISSION_DENIED: &str = "permission_denied";
    /// Arguments failed schema/semantic validation.
    pub const INVALID_ARGS: &str = "tool.invalid_args";
    /// A collaborator this tool needs is not wired in.
    pub const NOT_CONFIGURED: &str = "tool.not_configured";
    /// The tool ran and failed.
    pub const EXEC_FAILED: &str = "tool.exec_failed";
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Definition
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolSource {
    Builtin,
    Skill,
    Subagent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub schema: serde_json::Value,
    /// Safe to dispatch concurrently with other parallel-safe tools.
    pub parallel_safe: bool,
    /// Mutates the workspace or external state.
    pub mutating: bool,
    /// Must pass the approval gate before execution.
    pub requires_approval: bool,
    pub source: ToolSource,
    /// Dotted namespace, e.g. `"terminal"` for `terminal.exec`.
    pub namespace: String,
    /// Listing priority; lower sorts first.
    pub priority: i32,
}

impl ToolDef {
    /// The definition shape sent to providers.
    pub fn to_llm_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.schema.clone(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
    Timeout,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub status: ToolStatus,
    /// One-line outcome shown in tool blocks.
    pub summary: String,
    /// Longer human-readable detail, when useful.
    #[serde(default)]
    pub details: String,
    /// Structured payload (full, untruncated).
    #[serde(default)]
    pub data: serde_json::Value,
    /// True when the streamed view of `data` was truncated.
    #[serde(default)]
    pub truncated: bool,
    /// Structured error code when status is not success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(summary: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            status: ToolStatus::Success,
            summary: summary.into(),
            details: String::new(),
            data,
            truncated: false,
            error: None,
        }
    }

    pub fn error(code: &str, summary: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            summary: summary.into(),
            details: String::new(),
            data: serde_json::Value::Null,
            truncated: false,
            error: Some(code.to_string()),
        }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Timeout,
            summary: codes::TIMEOUT.into(),
            details: detail.into(),
            data: serde_json::Value::Null,
            truncated: false,
            error: Some("Approval timed out".into()),
        }
    }

    pub fn aborted() -> Self {
        Self {
            status: ToolStatus::Aborted,
            summary: codes::ABORTED.into(),
            details: String::new(),
            data: serde_json::Value::Null,
            truncated: false,
            error: Some(codes::ABORTED.into()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Sink for lifecycle events emitted from inside a handler (e.g.
/// `todos.args_hydrated`).
pub trait LifecycleSink: Send + Sync {
    fn emit(&self, event_type: &str, payload: serde_json::Value);
}

/// A sink that drops everything; default for tests.
pub struct NullSink;

impl LifecycleSink for NullSink {
    fn emit(&self, _event_type: &str, _payload: serde_json::Value) {}
}

/// Per-invocation context threaded into every handler.
#[derive(Clone)]
pub struct ToolCtx {
    pub run_id: Uuid,
    pub tool_id: String,
    pub endpoint_id: String,
    pub thread_id: String,
    /// The run's working directory, when the thread has one.
    pub workdir: Option<PathBuf>,
    /// Cooperative cancellation; cancelled on run cancel / force-delete.
    pub cancel: CancellationToken,
    /// Hard per-invocation deadline.
    pub timeout: Duration,
    pub events: Arc<dyn LifecycleSink>,
}

impl ToolCtx {
    /// A bare context for tests.
    pub fn test(run_id: Uuid, tool_id: &str) -> Self {
        Self {
            run_id,
            tool_id: tool_id.to_string(),
            endpoint_id: "ep".into(),
            thread_id: "th".into(),
            workdir: None,
            cancel: CancellationToken::new(),
            timeout: Duration::from_secs(30),
            events: Arc::new(NullSink),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    fn def(&self) -> &ToolDef;

    /// Cheap argument validation before approval/execution.
    fn validate(&self, args: &serde_json::Value) -> Result<()>;

    /// Execute the call. Handlers map cancellation to `aborted` and their
    /// own deadlines to `timeout`; they do not panic on bad input.
    async fn execute(&self, ctx: &ToolCtx, args: serde_json::Value) -> ToolResult;

    /// Observe partially-streamed arguments. Default: ignore.
    fn handle_partial(&self, _ctx: &ToolCtx, _partial_args: &str) {}
}
