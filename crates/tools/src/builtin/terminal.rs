//! `terminal.exec` — run a shell command in a configurable cwd.
//!
//! The full stdout/stderr goes into the result payload (the authoritative
//! store never truncates); the engine builds bounded frame views with
//! [`crate::truncate::frame_terminal_output`]. The `stdin` argument is
//! sensitive and must be redacted before persisting
//! ([`crate::truncate::redact_args`]).

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use strand_domain::error::{Error, Result};

use crate::tool::{codes, ToolCtx, ToolDef, ToolHandler, ToolResult, ToolSource, ToolStatus};

pub struct TerminalExecTool {
    def: ToolDef,
}

impl Default for TerminalExecTool {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalExecTool {
    pub fn new() -> Self {
        Self {
            def: ToolDef {
                name: "terminal.exec".into(),
                description: "Run a shell command. Returns exit code, stdout, and stderr."
                    .into(),
                schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "command": { "type": "string", "description": "Shell command to execute" },
                        "cwd": { "type": "string", "description": "Working directory (defaults to the thread working dir)" },
                        "stdin": { "type": "string", "description": "Data piped to the command's stdin" },
                        "timeout_ms": { "type": "integer", "description": "Hard timeout in milliseconds" }
                    },
                    "required": ["command"]
                }),
                parallel_safe: false,
                mutating: true,
                requires_approval: false,
                source: ToolSource::Builtin,
                namespace: "terminal".into(),
                priority: 10,
            },
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for TerminalExecTool {
    fn def(&self) -> &ToolDef {
        &self.def
    }

    fn validate(&self, args: &serde_json::Value) -> Result<()> {
        let command = args.get("command").and_then(|v| v.as_str()).unwrap_or("");
        if command.trim().is_empty() {
            return Err(Error::InvalidArgument("command must not be empty".into()));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &ToolCtx, args: serde_json::Value) -> ToolResult {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let stdin_data = args
            .get("stdin")
            .and_then(|v| v.as_str())
            .map(String::from);
        let cwd = args
            .get("cwd")
            .and_then(|v| v.as_str())
            .map(std::path::PathBuf::from)
            .or_else(|| ctx.workdir.clone());
        let timeout = args
            .get("timeout_ms")
            .and_then(|v| v.as_u64())
            .map(std::time::Duration::from_millis)
            .unwrap_or(ctx.timeout);

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&command);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return ToolResult::error(codes::EXEC_FAILED, format!("failed to spawn: {e}"))
            }
        };

        if let (Some(data), Some(mut stdin)) = (stdin_data, child.stdin.take()) {
            if let Err(e) = stdin.write_all(data.as_bytes()).await {
                tracing::warn!(error = %e, "failed to write stdin");
            }
            drop(stdin);
        }

        // Drain stdout/stderr concurrently so the child never blocks on a
        // full pipe while we wait.
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(read_pipe(stdout_pipe));
        let stderr_task = tokio::spawn(read_pipe(stderr_pipe));

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Outcome::Exited(status.code()),
                Err(e) => Outcome::Failed(e.to_string()),
            },
            _ = ctx.cancel.cancelled() => {
                let _ = child.kill().await;
                Outcome::Aborted
            }
            _ = tokio::time::sleep(timeout) => {
                let _ = child.kill().await;
                Outcome::TimedOut
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        match outcome {
            Outcome::Exited(exit_code) => {
                let data = serde_json::json!({
                    "command": command,
                    "cwd": cwd.as_ref().map(|p| p.display().to_string()),
                    "exit_code": exit_code,
                    "stdout": stdout,
                    "stderr": stderr,
                });
                ToolResult::success(
                    format!("exit {}", exit_code.map_or("?".into(), |c| c.to_string())),
                    data,
                )
            }
            Outcome::Failed(message) => ToolResult::error(codes::EXEC_FAILED, message),
            Outcome::Aborted => ToolResult::aborted(),
            Outcome::TimedOut => {
                let mut result = ToolResult::timeout(format!(
                    "command exceeded {}ms",
                    timeout.as_millis()
                ));
                result.error = Some(codes::TIMEOUT.into());
                result.data = serde_json::json!({
                    "command": command,
                    "stdout": stdout,
                    "stderr": stderr,
                });
                result
            }
        }
    }
}

enum Outcome {
    Exited(Option<i32>),
    Failed(String),
    Aborted,
    TimedOut,
}

async fn read_pipe<R>(pipe: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    use tokio::io::AsyncReadExt;
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ctx() -> ToolCtx {
        ToolCtx::test(Uuid::new_v4(), "tc_1")
    }

    #[tokio::test]
    async fn runs_command_and_captures_output() {
        let tool = TerminalExecTool::new();
        let result = tool
            .execute(&ctx(), serde_json::json!({"command": "printf hello; printf err >&2"}))
            .await;
        assert_eq!(result.status, ToolStatus::Success);
        assert_eq!(result.summary, "exit 0");
        assert_eq!(result.data["stdout"], "hello");
        assert_eq!(result.data["stderr"], "err");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_errored() {
        let tool = TerminalExecTool::new();
        let result = tool
            .execute(&ctx(), serde_json::json!({"command": "exit 3"}))
            .await;
        assert_eq!(result.status, ToolStatus::Success);
        assert_eq!(result.data["exit_code"], 3);
    }

    #[tokio::test]
    async fn stdin_is_piped() {
        let tool = TerminalExecTool::new();
        let result = tool
            .execute(
                &ctx(),
                serde_json::json!({"command": "wc -l", "stdin": "a\nb\nc\n"}),
            )
            .await;
        assert_eq!(result.status, ToolStatus::Success);
        assert_eq!(result.data["stdout"].as_str().unwrap().trim(), "3");
    }

    #[tokio::test]
    async fn cwd_argument_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let tool = TerminalExecTool::new();
        let result = tool
            .execute(
                &ctx(),
                serde_json::json!({
                    "command": "pwd",
                    "cwd": dir.path().to_str().unwrap(),
                }),
            )
            .await;
        let printed = result.data["stdout"].as_str().unwrap().trim();
        // Compare canonically: macOS tempdirs involve /private symlinks.
        assert!(printed.ends_with(dir.path().file_name().unwrap().to_str().unwrap()));
    }

    #[tokio::test]
    async fn timeout_kills_and_reports() {
        let tool = TerminalExecTool::new();
        let result = tool
            .execute(
                &ctx(),
                serde_json::json!({"command": "sleep 5", "timeout_ms": 50}),
            )
            .await;
        assert_eq!(result.status, ToolStatus::Timeout);
        assert_eq!(result.summary, "tool.timeout");
    }

    #[tokio::test]
    async fn cancellation_aborts() {
        let tool = TerminalExecTool::new();
        let ctx = ctx();
        let cancel = ctx.cancel.clone();
        let exec = tool.execute(&ctx, serde_json::json!({"command": "sleep 5"}));
        let abort = async {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            cancel.cancel();
        };
        let (result, _) = tokio::join!(exec, abort);
        assert_eq!(result.status, ToolStatus::Aborted);
        assert_eq!(result.summary, "tool.aborted");
    }

    #[test]
    fn empty_command_rejected() {
        let tool = TerminalExecTool::new();
        assert!(tool.validate(&serde_json::json!({"command": "  "})).is_err());
        assert!(tool.validate(&serde_json::json!({"command": "ls"})).is_ok());
    }
}
