//! Streamed-view truncation and argument redaction.
//!
//! The authoritative store keeps full tool output; only the streamed
//! block-set frames are bounded. Sensitive arguments (`stdin`) are
//! redacted before anything is persisted or streamed.

use serde_json::Value;

use strand_domain::text::{rune_count, truncate_runes};

/// Rune cap for streamed stdout.
pub const STDOUT_FRAME_MAX_RUNES: usize = 4_000;
/// Rune cap for streamed stderr.
pub const STDERR_FRAME_MAX_RUNES: usize = 2_000;

/// Replace the sensitive `stdin` argument with a size marker, preserving
/// every other argument (the command string stays intact).
pub fn redact_args(tool_name: &str, args: &Value) -> Value {
    if tool_name != "terminal.exec" {
        return args.clone();
    }
    let mut redacted = args.clone();
    if let Some(obj) = redacted.as_object_mut() {
        if let Some(stdin) = obj.get("stdin").and_then(|v| v.as_str()) {
            let marker = serde_json::json!({
                "redacted": true,
                "bytes": stdin.len(),
                "lines": stdin.lines().count(),
            });
            obj.insert("stdin".into(), marker);
        }
    }
    redacted
}

/// Build the streamed view of a terminal result payload: stdout/stderr
/// truncated to their frame caps with a `truncated` flag. Returns the
/// framed value and whether anything was cut.
pub fn frame_terminal_output(data: &Value) -> (Value, bool) {
    let mut framed = data.clone();
    let mut truncated = false;
    if let Some(obj) = framed.as_object_mut() {
        for (key, cap) in [
            ("stdout", STDOUT_FRAME_MAX_RUNES),
            ("stderr", STDERR_FRAME_MAX_RUNES),
        ] {
            if let Some(text) = obj.get(key).and_then(|v| v.as_str()) {
                if rune_count(text) > cap {
                    obj.insert(key.into(), Value::String(truncate_runes(text, cap)));
                    truncated = true;
                }
            }
        }
        obj.insert("truncated".into(), Value::Bool(truncated));
    }
    (framed, truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdin_is_redacted_command_preserved() {
        let args = serde_json::json!({
            "command": "wc -l",
            "stdin": "line one\nline two",
        });
        let redacted = redact_args("terminal.exec", &args);
        assert_eq!(redacted["command"], "wc -l");
        assert_eq!(redacted["stdin"]["redacted"], true);
        assert_eq!(redacted["stdin"]["bytes"], 17);
        assert_eq!(redacted["stdin"]["lines"], 2);
    }

    #[test]
    fn other_tools_untouched() {
        let args = serde_json::json!({"stdin": "not sensitive here"});
        let out = redact_args("web.search", &args);
        assert_eq!(out, args);
    }

    #[test]
    fn frame_truncates_and_flags() {
        let data = serde_json::json!({
            "stdout": "o".repeat(5_000),
            "stderr": "e".repeat(2_500),
            "exit_code": 0,
        });
        let (framed, truncated) = frame_terminal_output(&data);
        assert!(truncated);
        assert_eq!(framed["truncated"], true);
        assert_eq!(
            framed["stdout"].as_str().unwrap().chars().count(),
            STDOUT_FRAME_MAX_RUNES
        );
        assert_eq!(
            framed["stderr"].as_str().unwrap().chars().count(),
            STDERR_FRAME_MAX_RUNES
        );
        assert_eq!(framed["exit_code"], 0);
    }

    #[test]
    fn frame_under_caps_is_unchanged() {
        let data = serde_json::json!({"stdout": "short", "stderr": ""});
        let (framed, truncated) = frame_terminal_output(&data);
        assert!(!truncated);
        assert_eq!(framed["stdout"], "short");
        assert_eq!(framed["truncated"], false);
    }
}
