//! `apply_patch` — apply a patch text to the run's working directory.
//!
//! Patch parsing and application are an external collaborator; the
//! handler validates, resolves the working directory, and delegates to a
//! [`PatchApplier`]. Without one wired in, the tool reports itself as not
//! configured rather than guessing at diff semantics.

use std::path::Path;
use std::sync::Arc;

use strand_domain::error::{Error, Result};

use crate::tool::{codes, ToolCtx, ToolDef, ToolHandler, ToolResult, ToolSource};

/// Outcome of a successful patch application.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PatchSummary {
    pub files_changed: Vec<String>,
    pub insertions: usize,
    pub deletions: usize,
}

/// External patch collaborator.
pub trait PatchApplier: Send + Sync {
    fn apply(&self, workdir: &Path, patch: &str) -> Result<PatchSummary>;
}

pub struct ApplyPatchTool {
    def: ToolDef,
    applier: Option<Arc<dyn PatchApplier>>,
}

impl ApplyPatchTool {
    pub fn new(applier: Option<Arc<dyn PatchApplier>>) -> Self {
        Self {
            def: ToolDef {
                name: "apply_patch".into(),
                description: "Apply a patch to files in the working directory.".into(),
                schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "patch": { "type": "string", "description": "Patch text to apply" }
                    },
                    "required": ["patch"]
                }),
                parallel_safe: false,
                mutating: true,
                requires_approval: true,
                source: ToolSource::Builtin,
                namespace: "workspace".into(),
                priority: 20,
            },
            applier,
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for ApplyPatchTool {
    fn def(&self) -> &ToolDef {
        &self.def
    }

    fn validate(&self, args: &serde_json::Value) -> Result<()> {
        let patch = args.get("patch").and_then(|v| v.as_str()).unwrap_or("");
        if patch.trim().is_empty() {
            return Err(Error::InvalidArgument("patch must not be empty".into()));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &ToolCtx, args: serde_json::Value) -> ToolResult {
        let Some(applier) = &self.applier else {
            return ToolResult::error(
                codes::NOT_CONFIGURED,
                "no patch applier configured for this workspace",
            );
        };
        let Some(workdir) = &ctx.workdir else {
            return ToolResult::error(
                codes::NOT_CONFIGURED,
                "thread has no working directory configured",
            );
        };
        let patch = args
            .get("patch")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        match applier.apply(workdir, patch) {
            Ok(summary) => ToolResult::success(
                format!(
                    "{} files changed (+{} -{})",
                    summary.files_changed.len(),
                    summary.insertions,
                    summary.deletions
                ),
                serde_json::to_value(&summary).unwrap_or(serde_json::Value::Null),
            ),
            Err(e) => ToolResult::error(codes::EXEC_FAILED, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolStatus;
    use uuid::Uuid;

    struct FakeApplier;

    impl PatchApplier for FakeApplier {
        fn apply(&self, _workdir: &Path, patch: &str) -> Result<PatchSummary> {
            if patch.contains("reject") {
                return Err(Error::Tool {
                    tool: "apply_patch".into(),
                    message: "hunk failed to apply".into(),
                });
            }
            Ok(PatchSummary {
                files_changed: vec!["src/main.rs".into()],
                insertions: 3,
                deletions: 1,
            })
        }
    }

    fn ctx_with_workdir() -> (ToolCtx, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ToolCtx::test(Uuid::new_v4(), "tc_patch");
        ctx.workdir = Some(dir.path().to_path_buf());
        (ctx, dir)
    }

    #[tokio::test]
    async fn requires_approval_by_definition() {
        let tool = ApplyPatchTool::new(None);
        assert!(tool.def().requires_approval);
        assert!(tool.def().mutating);
    }

    #[tokio::test]
    async fn unconfigured_applier_is_structured_error() {
        let tool = ApplyPatchTool::new(None);
        let (ctx, _dir) = ctx_with_workdir();
        let result = tool
            .execute(&ctx, serde_json::json!({"patch": "diff"}))
            .await;
        assert_eq!(result.status, ToolStatus::Error);
        assert_eq!(result.error.as_deref(), Some(codes::NOT_CONFIGURED));
    }

    #[tokio::test]
    async fn applies_through_collaborator() {
        let tool = ApplyPatchTool::new(Some(Arc::new(FakeApplier)));
        let (ctx, _dir) = ctx_with_workdir();
        let result = tool
            .execute(&ctx, serde_json::json!({"patch": "some patch"}))
            .await;
        assert_eq!(result.status, ToolStatus::Success);
        assert_eq!(result.data["files_changed"][0], "src/main.rs");
    }

    #[tokio::test]
    async fn applier_failure_becomes_tool_error() {
        let tool = ApplyPatchTool::new(Some(Arc::new(FakeApplier)));
        let (ctx, _dir) = ctx_with_workdir();
        let result = tool
            .execute(&ctx, serde_json::json!({"patch": "reject this"}))
            .await;
        assert_eq!(result.status, ToolStatus::Error);
        assert_eq!(result.error.as_deref(), Some(codes::EXEC_FAILED));
    }

    #[test]
    fn empty_patch_rejected() {
        let tool = ApplyPatchTool::new(None);
        assert!(tool.validate(&serde_json::json!({"patch": ""})).is_err());
    }
}
