//! Provider-agnostic chat messages.
//!
//! The run engine builds history out of these; every adapter converts them
//! to and from its wire format. Tool results are bound to their
//! declarations by `tool_call_id`, never by position.

use serde::{Deserialize, Serialize};

/// Internal tool call format (provider-agnostic).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// Tool definition exposed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ChatPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatPart {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// A message in the conversation (provider-agnostic).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: ChatContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: ChatContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: ChatContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: ChatContent::Text(text.into()),
        }
    }

    /// Assistant message carrying text (when non-empty) plus tool calls.
    pub fn assistant_with_tools(text: &str, calls: &[ToolCall]) -> Self {
        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(ChatPart::Text { text: text.into() });
        }
        for call in calls {
            parts.push(ChatPart::ToolUse {
                id: call.call_id.clone(),
                name: call.tool_name.clone(),
                input: call.arguments.clone(),
            });
        }
        Self {
            role: ChatRole::Assistant,
            content: ChatContent::Parts(parts),
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: ChatRole::Tool,
            content: ChatContent::Parts(vec![ChatPart::ToolResult {
                tool_call_id: call_id.into(),
                content: content.into(),
                is_error,
            }]),
        }
    }

    /// Tool call ids declared by this message (assistant messages only).
    pub fn declared_tool_call_ids(&self) -> Vec<&str> {
        match &self.content {
            ChatContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ChatPart::ToolUse { id, .. } => Some(id.as_str()),
                    _ => None,
                })
                .collect(),
            ChatContent::Text(_) => Vec::new(),
        }
    }

    /// Tool call ids this message carries results for.
    pub fn result_tool_call_ids(&self) -> Vec<&str> {
        match &self.content {
            ChatContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ChatPart::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
                    _ => None,
                })
                .collect(),
            ChatContent::Text(_) => Vec::new(),
        }
    }
}

impl ChatContent {
    /// Extract and join all text content.
    pub fn extract_all_text(&self) -> String {
        match self {
            ChatContent::Text(t) => t.clone(),
            ChatContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ChatPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_with_tools_layout() {
        let calls = vec![ToolCall {
            call_id: "tc_1".into(),
            tool_name: "web.search".into(),
            arguments: serde_json::json!({"query": "rust"}),
        }];
        let msg = ChatMessage::assistant_with_tools("looking this up", &calls);
        assert_eq!(msg.declared_tool_call_ids(), vec!["tc_1"]);
        assert_eq!(msg.content.extract_all_text(), "looking this up");

        let empty_text = ChatMessage::assistant_with_tools("", &calls);
        match &empty_text.content {
            ChatContent::Parts(parts) => assert_eq!(parts.len(), 1),
            _ => panic!("expected parts"),
        }
    }

    #[test]
    fn result_ids_extracted() {
        let msg = ChatMessage::tool_result("tc_9", "output", false);
        assert_eq!(msg.result_tool_call_ids(), vec!["tc_9"]);
        assert!(msg.declared_tool_call_ids().is_empty());
    }

    #[test]
    fn extract_all_text_joins_parts() {
        let msg = ChatMessage {
            role: ChatRole::Assistant,
            content: ChatContent::Parts(vec![
                ChatPart::Text { text: "a".into() },
                ChatPart::ToolUse {
                    id: "x".into(),
                    name: "t".into(),
                    input: serde_json::json!({}),
                },
                ChatPart::Text { text: "b".into() },
            ]),
        };
        assert_eq!(msg.content.extract_all_text(), "a\nb");
    }
}
