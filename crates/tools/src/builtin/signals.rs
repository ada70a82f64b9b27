//! Signal tools — `task_complete` and `ask_user`.
//!
//! Both execute to accepted no-ops; their effect is observed by the run
//! engine (terminating the loop, or parking the run in `waiting_user`).

use strand_domain::error::{Error, Result};

use crate::tool::{ToolCtx, ToolDef, ToolHandler, ToolResult, ToolSource};

pub struct TaskCompleteTool {
    def: ToolDef,
}

impl Default for TaskCompleteTool {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskCompleteTool {
    pub fn new() -> Self {
        Self {
            def: ToolDef {
                name: "task_complete".into(),
                description: "Signal that the current task is finished.".into(),
                schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "summary": { "type": "string", "description": "Short completion summary" }
                    }
                }),
                parallel_safe: false,
                mutating: false,
                requires_approval: false,
                source: ToolSource::Builtin,
                namespace: "signals".into(),
                priority: 90,
            },
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for TaskCompleteTool {
    fn def(&self) -> &ToolDef {
        &self.def
    }

    fn validate(&self, _args: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, _ctx: &ToolCtx, args: serde_json::Value) -> ToolResult {
        let summary = args
            .get("summary")
            .and_then(|v| v.as_str())
            .unwrap_or("task complete");
        ToolResult::success("accepted", serde_json::json!({ "summary": summary }))
    }
}

pub struct AskUserTool {
    def: ToolDef,
}

impl Default for AskUserTool {
    fn default() -> Self {
        Self::new()
    }
}

impl AskUserTool {
    pub fn new() -> Self {
        Self {
            def: ToolDef {
                name: "ask_user".into(),
                description:
                    "Ask the user a question and suspend the run until they reply.".into(),
                schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "prompt": { "type": "string", "description": "The question to ask" }
                    },
                    "required": ["prompt"]
                }),
                parallel_safe: false,
                mutating: false,
                requires_approval: false,
                source: ToolSource::Builtin,
                namespace: "signals".into(),
                priority: 91,
            },
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for AskUserTool {
    fn def(&self) -> &ToolDef {
        &self.def
    }

    fn validate(&self, args: &serde_json::Value) -> Result<()> {
        let prompt = args.get("prompt").and_then(|v| v.as_str()).unwrap_or("");
        if prompt.trim().is_empty() {
            return Err(Error::InvalidArgument("prompt must not be empty".into()));
        }
        Ok(())
    }

    async fn execute(&self, _ctx: &ToolCtx, args: serde_json::Value) -> ToolResult {
        let prompt = args
            .get("prompt")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        ToolResult::success("accepted", serde_json::json!({ "prompt": prompt }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolStatus;
    use uuid::Uuid;

    #[tokio::test]
    async fn signals_execute_to_accepted_noops() {
        let ctx = ToolCtx::test(Uuid::new_v4(), "tc");

        let complete = TaskCompleteTool::new();
        let result = complete
            .execute(&ctx, serde_json::json!({"summary": "all done"}))
            .await;
        assert_eq!(result.status, ToolStatus::Success);
        assert_eq!(result.summary, "accepted");

        let ask = AskUserTool::new();
        let result = ask
            .execute(&ctx, serde_json::json!({"prompt": "which branch?"}))
            .await;
        assert_eq!(result.status, ToolStatus::Success);
        assert_eq!(result.data["prompt"], "which branch?");
    }

    #[test]
    fn ask_user_requires_prompt() {
        let ask = AskUserTool::new();
        assert!(ask.validate(&serde_json::json!({})).is_err());
        assert!(ask.validate(&serde_json::json!({"prompt": "?"})).is_ok());
    }
}
