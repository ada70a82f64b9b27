//! Transcript messages and their canonical JSON block layout.
//!
//! Every message row stores both a plain-text rendering and a canonical
//! JSON payload (`{"blocks": [...]}`). The two must stay consistent: the
//! text column is the concatenation of the text blocks.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "user" => Self::User,
            "assistant" => Self::Assistant,
            "tool" => Self::Tool,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Complete,
    Streaming,
    Error,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Streaming => "streaming",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "complete" => Self::Complete,
            "streaming" => Self::Streaming,
            "error" => Self::Error,
            _ => return None,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Blocks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Status of a tool block inside an assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolBlockStatus {
    Pending,
    Running,
    Success,
    Error,
    Timeout,
    Aborted,
}

/// Reference a late subscriber can use to fetch the full tool output from
/// the transcript store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    pub run_id: String,
    pub tool_id: String,
}

/// One block of a canonical message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text {
        text: String,
    },
    File {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        upload_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        size_bytes: Option<u64>,
    },
    Image {
        #[serde(skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        upload_id: Option<String>,
    },
    ToolCall {
        tool_id: String,
        name: String,
        status: ToolBlockStatus,
        /// Redacted arguments JSON (sensitive fields replaced).
        args: serde_json::Value,
    },
    ToolResult {
        tool_id: String,
        name: String,
        status: ToolBlockStatus,
        summary: String,
        /// Bounded streamed view of the output; the full payload lives in
        /// the tool-call record reachable via `output_ref`.
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output_ref: Option<OutputRef>,
        #[serde(default)]
        truncated: bool,
    },
}

/// Canonical message payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub blocks: Vec<Block>,
}

impl MessagePayload {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            blocks: vec![Block::Text { text: text.into() }],
        }
    }

    /// Plain-text rendering: text blocks joined by newlines.
    pub fn render_text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                Block::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Index of the block for a given tool id, if present.
    pub fn tool_block_index(&self, tool_id: &str) -> Option<usize> {
        self.blocks.iter().position(|b| match b {
            Block::ToolCall { tool_id: id, .. } | Block::ToolResult { tool_id: id, .. } => {
                id == tool_id
            }
            _ => false,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Dense store row id; 0 before the first append.
    pub row_id: i64,
    pub endpoint_id: String,
    pub thread_id: String,
    pub message_id: String,
    pub role: Role,
    pub status: MessageStatus,
    pub text: String,
    pub payload: MessagePayload,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_text_joins_text_blocks() {
        let payload = MessagePayload {
            blocks: vec![
                Block::Text { text: "one".into() },
                Block::ToolCall {
                    tool_id: "t1".into(),
                    name: "web.search".into(),
                    status: ToolBlockStatus::Pending,
                    args: serde_json::json!({"query": "x"}),
                },
                Block::Text { text: "two".into() },
            ],
        };
        assert_eq!(payload.render_text(), "one\ntwo");
    }

    #[test]
    fn tool_block_index_matches_calls_and_results() {
        let payload = MessagePayload {
            blocks: vec![
                Block::Text { text: "t".into() },
                Block::ToolResult {
                    tool_id: "t9".into(),
                    name: "terminal.exec".into(),
                    status: ToolBlockStatus::Success,
                    summary: "ok".into(),
                    output: None,
                    output_ref: Some(OutputRef {
                        run_id: "r1".into(),
                        tool_id: "t9".into(),
                    }),
                    truncated: false,
                },
            ],
        };
        assert_eq!(payload.tool_block_index("t9"), Some(1));
        assert_eq!(payload.tool_block_index("nope"), None);
    }

    #[test]
    fn block_json_is_tagged() {
        let block = Block::Text { text: "hi".into() };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "text");
    }
}
