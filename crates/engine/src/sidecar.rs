//! Optional sidecar child process for delegated LLM orchestration.
//!
//! The child speaks newline-delimited JSON-RPC 2.0 over stdin/stdout and
//! reports diagnostics on stderr only. The core sends `run.start`; the
//! child answers with `run.delta`, `tool.call`, `tool.result`, `run.end`,
//! and `run.error`. When no sidecar is configured the same event
//! vocabulary is used in-process.

use std::process::Stdio;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use uuid::Uuid;

use strand_domain::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
}

/// Events the core accepts from the child.
#[derive(Debug, Clone, PartialEq)]
pub enum SidecarEvent {
    RunDelta {
        run_id: Uuid,
        delta: String,
    },
    ToolCall {
        run_id: Uuid,
        tool_id: String,
        tool_name: String,
        args: Value,
    },
    ToolResult {
        run_id: Uuid,
        tool_id: String,
        status: String,
        result: Option<Value>,
    },
    RunEnd {
        run_id: Uuid,
    },
    RunError {
        run_id: Uuid,
        error: String,
    },
}

fn parse_event(line: &str) -> Option<SidecarEvent> {
    let value: Value = serde_json::from_str(line).ok()?;
    if value.get("jsonrpc").and_then(|v| v.as_str()) != Some("2.0") {
        return None;
    }
    let method = value.get("method").and_then(|v| v.as_str())?;
    let params = value.get("params").cloned().unwrap_or(Value::Null);
    let run_id = params
        .get("run_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())?;

    match method {
        "run.delta" => Some(SidecarEvent::RunDelta {
            run_id,
            delta: params.get("delta")?.as_str()?.to_string(),
        }),
        "tool.call" => Some(SidecarEvent::ToolCall {
            run_id,
            tool_id: params.get("tool_id")?.as_str()?.to_string(),
            tool_name: params.get("tool_name")?.as_str()?.to_string(),
            args: params.get("args").cloned().unwrap_or(Value::Null),
        }),
        "tool.result" => Some(SidecarEvent::ToolResult {
            run_id,
            tool_id: params.get("tool_id")?.as_str()?.to_string(),
            status: params.get("status")?.as_str()?.to_string(),
            result: params.get("result").cloned(),
        }),
        "run.end" => Some(SidecarEvent::RunEnd { run_id }),
        "run.error" => Some(SidecarEvent::RunError {
            run_id,
            error: params
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown sidecar error")
                .to_string(),
        }),
        other => {
            tracing::warn!(method = other, "unknown sidecar method");
            None
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Process handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    events: mpsc::Receiver<SidecarEvent>,
}

impl Sidecar {
    /// Spawn the helper binary. It inherits the session's working
    /// directory; stdout is the protocol channel, stderr is diagnostics.
    pub fn spawn(program: &str, args: &[&str], cwd: &std::path::Path) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(Error::Io)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Other("sidecar stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Other("sidecar stdout unavailable".into()))?;
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match parse_event(&line) {
                    Some(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    None => tracing::warn!(line = %line, "unparseable sidecar line"),
                }
            }
        });

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "sidecar", "{line}");
                }
            });
        }

        Ok(Self { child, stdin, events: rx })
    }

    /// Send `run.start` to the child.
    pub async fn send_run_start(
        &mut self,
        run_id: Uuid,
        workspace_root_abs: &std::path::Path,
        input: &str,
        context_package: Value,
        recovery: Option<Value>,
    ) -> Result<()> {
        let mut params = serde_json::json!({
            "run_id": run_id.to_string(),
            "workspace_root_abs": workspace_root_abs.display().to_string(),
            "input": input,
            "context_package": context_package,
        });
        if let Some(recovery) = recovery {
            params["recovery"] = recovery;
        }
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method: "run.start",
            params,
        };
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        self.stdin.write_all(&line).await.map_err(Error::Io)?;
        self.stdin.flush().await.map_err(Error::Io)?;
        Ok(())
    }

    /// Next event from the child; `None` when it exited.
    pub async fn next_event(&mut self) -> Option<SidecarEvent> {
        self.events.recv().await
    }

    pub async fn shutdown(mut self) {
        let _ = self.child.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_methods() {
        let run_id = Uuid::new_v4();
        let delta = format!(
            r#"{{"jsonrpc":"2.0","method":"run.delta","params":{{"run_id":"{run_id}","delta":"hel"}}}}"#
        );
        assert_eq!(
            parse_event(&delta),
            Some(SidecarEvent::RunDelta {
                run_id,
                delta: "hel".into()
            })
        );

        let call = format!(
            r#"{{"jsonrpc":"2.0","method":"tool.call","params":{{"run_id":"{run_id}","tool_id":"tc_1","tool_name":"terminal.exec","args":{{"command":"ls"}}}}}}"#
        );
        assert!(matches!(
            parse_event(&call),
            Some(SidecarEvent::ToolCall { tool_name, .. }) if tool_name == "terminal.exec"
        ));

        let result = format!(
            r#"{{"jsonrpc":"2.0","method":"tool.result","params":{{"run_id":"{run_id}","tool_id":"tc_1","status":"success","result":{{"ok":true}}}}}}"#
        );
        assert!(matches!(
            parse_event(&result),
            Some(SidecarEvent::ToolResult { status, .. }) if status == "success"
        ));

        let end = format!(
            r#"{{"jsonrpc":"2.0","method":"run.end","params":{{"run_id":"{run_id}"}}}}"#
        );
        assert_eq!(parse_event(&end), Some(SidecarEvent::RunEnd { run_id }));

        let error = format!(
            r#"{{"jsonrpc":"2.0","method":"run.error","params":{{"run_id":"{run_id}","error":"boom"}}}}"#
        );
        assert!(matches!(
            parse_event(&error),
            Some(SidecarEvent::RunError { error, .. }) if error == "boom"
        ));
    }

    #[test]
    fn rejects_non_jsonrpc_lines() {
        assert_eq!(parse_event("not json"), None);
        assert_eq!(parse_event(r#"{"method":"run.end","params":{}}"#), None);
        assert_eq!(
            parse_event(r#"{"jsonrpc":"2.0","method":"run.end","params":{"run_id":"nope"}}"#),
            None
        );
    }

    #[tokio::test]
    async fn round_trip_with_shell_child() {
        let run_id = Uuid::new_v4();
        let dir = tempfile::tempdir().unwrap();
        // The child echoes one run.delta and one run.end for whatever
        // run.start it receives, then reports on stderr.
        let script = format!(
            "read line; \
             printf '%s\\n' '{{\"jsonrpc\":\"2.0\",\"method\":\"run.delta\",\"params\":{{\"run_id\":\"{run_id}\",\"delta\":\"hi\"}}}}'; \
             printf '%s\\n' '{{\"jsonrpc\":\"2.0\",\"method\":\"run.end\",\"params\":{{\"run_id\":\"{run_id}\"}}}}'; \
             echo 'diagnostic' >&2"
        );
        let mut sidecar = Sidecar::spawn("sh", &["-c", &script], dir.path()).unwrap();
        sidecar
            .send_run_start(
                run_id,
                dir.path(),
                "fix the tests",
                serde_json::json!({"objective": "fix"}),
                None,
            )
            .await
            .unwrap();

        let first = sidecar.next_event().await.unwrap();
        assert_eq!(
            first,
            SidecarEvent::RunDelta {
                run_id,
                delta: "hi".into()
            }
        );
        let second = sidecar.next_event().await.unwrap();
        assert_eq!(second, SidecarEvent::RunEnd { run_id });
        assert!(sidecar.next_event().await.is_none());
        sidecar.shutdown().await;
    }
}
