//! Anthropic Messages API adapter.

use std::collections::HashMap;

use serde_json::Value;

use strand_domain::capability::{ProviderCapability, ToolSchemaMode};
use strand_domain::chat::{ChatContent, ChatMessage, ChatPart, ChatRole, ToolDefinition};
use strand_domain::error::Result;
use strand_domain::stream::{BoxStream, FinishReason, StreamEvent, Usage};

use crate::normalize::{classify_provider_error, StreamNormalizer};
use crate::sse::{from_reqwest, sse_event_stream};
use crate::traits::{Provider, TurnRequest};

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(id: &str, base_url: &str, api_key: &str, default_model: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            id: id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            default_model: default_model.to_string(),
            client,
        })
    }

    fn build_body(&self, req: &TurnRequest) -> Value {
        // Anthropic takes the system prompt as a top-level field.
        let mut system_parts: Vec<String> = Vec::new();
        let mut messages: Vec<Value> = Vec::new();
        for msg in &req.messages {
            match msg.role {
                ChatRole::System => system_parts.push(msg.content.extract_all_text()),
                _ => messages.push(msg_to_anthropic(msg)),
            }
        }

        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let max_tokens = req
            .max_tokens
            .unwrap_or(if req.intent_probe { 8 } else { 8_192 });

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "max_tokens": max_tokens,
            "stream": true,
        });
        if !system_parts.is_empty() {
            body["system"] = Value::String(system_parts.join("\n\n"));
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_anthropic).collect();
            body["tools"] = Value::Array(tools);
        }
        body
    }
}

#[async_trait::async_trait]
impl Provider for AnthropicProvider {
    async fn stream_turn(
        &self,
        req: TurnRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let body = self.build_body(&req);
        let url = format!("{}/v1/messages", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_provider_error(
                &self.id,
                &format!("HTTP {status}: {text}"),
            ));
        }

        let provider_id = self.id.clone();
        // content block index → tool call id.
        let mut block_ids: HashMap<u64, String> = HashMap::new();
        Ok(sse_event_stream(response, move |data, normalizer| {
            parse_event(data, &provider_id, &mut block_ids, normalizer)
        }))
    }

    fn capability(&self, model: &str) -> ProviderCapability {
        let mut cap = ProviderCapability::fallback(&self.id, model);
        cap.supports_parallel_tools = true;
        cap.supports_image_input = true;
        cap.supports_file_input = true;
        cap.supports_reasoning_tokens = true;
        cap.max_context_tokens = 200_000;
        cap.max_output_tokens = 8_192;
        cap.tool_schema_mode = ToolSchemaMode::Functions;
        cap
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn msg_to_anthropic(msg: &ChatMessage) -> Value {
    let role = match msg.role {
        ChatRole::Assistant => "assistant",
        // Tool results travel in user-role messages.
        _ => "user",
    };
    let content = match &msg.content {
        ChatContent::Text(t) => Value::String(t.clone()),
        ChatContent::Parts(parts) => {
            let blocks: Vec<Value> = parts
                .iter()
                .map(|part| match part {
                    ChatPart::Text { text } => serde_json::json!({
                        "type": "text", "text": text,
                    }),
                    ChatPart::ToolUse { id, name, input } => serde_json::json!({
                        "type": "tool_use", "id": id, "name": name, "input": input,
                    }),
                    ChatPart::ToolResult {
                        tool_call_id,
                        content,
                        is_error,
                    } => serde_json::json!({
                        "type": "tool_result",
                        "tool_use_id": tool_call_id,
                        "content": content,
                        "is_error": is_error,
                    }),
                })
                .collect();
            Value::Array(blocks)
        }
    };
    serde_json::json!({ "role": role, "content": content })
}

fn tool_to_anthropic(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn map_stop_reason(raw: &str) -> FinishReason {
    match raw {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "tool_use" => FinishReason::ToolCalls,
        "max_tokens" => FinishReason::Length,
        _ => FinishReason::Incomplete,
    }
}

fn parse_event(
    data: &str,
    provider_id: &str,
    block_ids: &mut HashMap<u64, String>,
    normalizer: &mut StreamNormalizer,
) -> Vec<Result<StreamEvent>> {
    let event: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "skipping malformed anthropic event");
            return Vec::new();
        }
    };

    match event.get("type").and_then(|t| t.as_str()).unwrap_or("") {
        "message_start" => {
            normalizer.note_response(
                event
                    .pointer("/message/id")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                event
                    .pointer("/message/model")
                    .and_then(|v| v.as_str())
                    .map(String::from),
            );
            let input = event
                .pointer("/message/usage/input_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            vec![Ok(StreamEvent::Usage {
                usage: Usage {
                    input_tokens: input,
                    output_tokens: 0,
                    reasoning_tokens: 0,
                },
            })]
        }
        "content_block_start" => {
            let index = event.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            let block = event.get("content_block");
            match block.and_then(|b| b.get("type")).and_then(|t| t.as_str()) {
                Some("tool_use") => {
                    let id = block
                        .and_then(|b| b.get("id"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();
                    let name = block
                        .and_then(|b| b.get("name"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();
                    block_ids.insert(index, id.clone());
                    vec![Ok(StreamEvent::ToolCallAdded {
                        id,
                        name,
                        args_partial: String::new(),
                    })]
                }
                _ => Vec::new(),
            }
        }
        "content_block_delta" => {
            let index = event.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            let delta = event.get("delta");
            match delta.and_then(|d| d.get("type")).and_then(|t| t.as_str()) {
                Some("text_delta") => {
                    let text = delta
                        .and_then(|d| d.get("text"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("");
                    vec![Ok(StreamEvent::TextDelta { text: text.into() })]
                }
                Some("input_json_delta") => {
                    let partial = delta
                        .and_then(|d| d.get("partial_json"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("");
                    match block_ids.get(&index) {
                        Some(id) => vec![Ok(StreamEvent::ToolCallDelta {
                            id: id.clone(),
                            delta: partial.into(),
                        })],
                        None => Vec::new(),
                    }
                }
                _ => Vec::new(),
            }
        }
        "message_delta" => {
            let mut out = Vec::new();
            if let Some(output) = event
                .pointer("/usage/output_tokens")
                .and_then(|v| v.as_u64())
            {
                out.push(Ok(StreamEvent::Usage {
                    usage: Usage {
                        input_tokens: 0,
                        output_tokens: output,
                        reasoning_tokens: 0,
                    },
                }));
            }
            if let Some(reason) = event
                .pointer("/delta/stop_reason")
                .and_then(|v| v.as_str())
            {
                out.push(Ok(StreamEvent::Completed {
                    finish_reason: map_stop_reason(reason),
                    response_id: None,
                    model: None,
                }));
            }
            out
        }
        "error" => {
            let message = event
                .pointer("/error/message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown provider error");
            vec![Err(classify_provider_error(provider_id, message))]
        }
        // ping, content_block_stop, message_stop carry nothing we need.
        _ => Vec::new(),
    }
}
