//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, Azure-style gateways, Ollama, vLLM, and any other
//! endpoint following the chat-completions contract.

use std::collections::HashMap;

use serde_json::Value;

use strand_domain::capability::{ProviderCapability, ToolSchemaMode};
use strand_domain::chat::{ChatContent, ChatMessage, ChatPart, ChatRole, ToolDefinition};
use strand_domain::error::Result;
use strand_domain::stream::{BoxStream, FinishReason, StreamEvent, Usage};

use crate::normalize::{classify_provider_error, StreamNormalizer};
use crate::sse::{from_reqwest, sse_event_stream};
use crate::traits::{Provider, TurnRequest};

pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
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

    fn effective_model(&self, req: &TurnRequest) -> String {
        req.model
            .clone()
            .unwrap_or_else(|| self.default_model.clone())
    }

    fn build_body(&self, req: &TurnRequest, strict: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_openai).collect();
        let mut body = serde_json::json!({
            "model": self.effective_model(req),
            "messages": messages,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| tool_to_openai(t, strict))
                .collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        } else if req.intent_probe {
            body["max_tokens"] = serde_json::json!(8);
        }
        body
    }
}

#[async_trait::async_trait]
impl Provider for OpenAiCompatProvider {
    async fn stream_turn(
        &self,
        req: TurnRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let model = self.effective_model(&req);
        let strict = self.capability(&model).tool_schema_mode == ToolSchemaMode::StrictJson;
        let body = self.build_body(&req, strict);
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
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
        // index → call_id assembly state for the chunked tool_calls array.
        let mut index_ids: HashMap<u64, String> = HashMap::new();
        Ok(sse_event_stream(response, move |data, normalizer| {
            parse_chunk(data, &provider_id, &mut index_ids, normalizer)
        }))
    }

    fn capability(&self, model: &str) -> ProviderCapability {
        let mut cap = ProviderCapability::fallback(&self.id, model);
        cap.supports_parallel_tools = true;
        cap.supports_strict_json = true;
        cap.supports_image_input = true;
        cap.max_output_tokens = 16_384;
        cap.tool_schema_mode = ToolSchemaMode::StrictJson;
        cap
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_to_str(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    }
}

fn msg_to_openai(msg: &ChatMessage) -> Value {
    match msg.role {
        ChatRole::Tool => tool_result_to_openai(msg),
        ChatRole::Assistant => assistant_to_openai(msg),
        _ => serde_json::json!({
            "role": role_to_str(msg.role),
            "content": msg.content.extract_all_text(),
        }),
    }
}

fn assistant_to_openai(msg: &ChatMessage) -> Value {
    let mut obj = serde_json::json!({"role": "assistant"});
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    match &msg.content {
        ChatContent::Text(t) => text_parts.push(t.clone()),
        ChatContent::Parts(parts) => {
            for part in parts {
                match part {
                    ChatPart::Text { text } => text_parts.push(text.clone()),
                    ChatPart::ToolUse { id, name, input } => {
                        tool_calls.push(serde_json::json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            }
                        }));
                    }
                    ChatPart::ToolResult { .. } => {}
                }
            }
        }
    }

    if text_parts.is_empty() {
        obj["content"] = Value::Null;
    } else {
        obj["content"] = Value::String(text_parts.join("\n"));
    }
    if !tool_calls.is_empty() {
        obj["tool_calls"] = Value::Array(tool_calls);
    }
    obj
}

fn tool_result_to_openai(msg: &ChatMessage) -> Value {
    if let ChatContent::Parts(parts) = &msg.content {
        for part in parts {
            if let ChatPart::ToolResult {
                tool_call_id,
                content,
                ..
            } = part
            {
                return serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "content": content,
                });
            }
        }
    }
    serde_json::json!({
        "role": "tool",
        "tool_call_id": "",
        "content": msg.content.extract_all_text(),
    })
}

fn tool_to_openai(tool: &ToolDefinition, strict: bool) -> Value {
    let mut function = serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.parameters,
    });
    if strict {
        function["strict"] = Value::Bool(true);
    }
    serde_json::json!({ "type": "function", "function": function })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chunk parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn map_finish_reason(raw: &str) -> FinishReason {
    match raw {
        "stop" => FinishReason::Stop,
        "tool_calls" => FinishReason::ToolCalls,
        "length" => FinishReason::Length,
        _ => FinishReason::Incomplete,
    }
}

fn parse_chunk(
    data: &str,
    provider_id: &str,
    index_ids: &mut HashMap<u64, String>,
    normalizer: &mut StreamNormalizer,
) -> Vec<Result<StreamEvent>> {
    if data == "[DONE]" {
        // The normalizer infers completion from accumulated state.
        return Vec::new();
    }
    let chunk: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "skipping malformed chat completion chunk");
            return Vec::new();
        }
    };

    if let Some(err) = chunk.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown provider error");
        return vec![Err(classify_provider_error(provider_id, message))];
    }

    normalizer.note_response(
        chunk.get("id").and_then(|v| v.as_str()).map(String::from),
        chunk.get("model").and_then(|v| v.as_str()).map(String::from),
    );

    let mut events: Vec<Result<StreamEvent>> = Vec::new();

    if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
        events.push(Ok(StreamEvent::Usage {
            usage: Usage {
                input_tokens: usage
                    .get("prompt_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
                output_tokens: usage
                    .get("completion_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
                reasoning_tokens: usage
                    .pointer("/completion_tokens_details/reasoning_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
            },
        }));
    }

    let Some(choice) = chunk
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
    else {
        return events;
    };

    if let Some(delta) = choice.get("delta") {
        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                events.push(Ok(StreamEvent::TextDelta { text: text.into() }));
            }
        }
        if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for tc in tool_calls {
                let index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let name = tc
                    .pointer("/function/name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let args = tc
                    .pointer("/function/arguments")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");

                if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                    index_ids.insert(index, id.to_string());
                    events.push(Ok(StreamEvent::ToolCallAdded {
                        id: id.to_string(),
                        name: name.to_string(),
                        args_partial: args.to_string(),
                    }));
                } else if let Some(id) = index_ids.get(&index) {
                    events.push(Ok(StreamEvent::ToolCallDelta {
                        id: id.clone(),
                        delta: args.to_string(),
                    }));
                } else {
                    tracing::warn!(index, "tool call delta for unknown index");
                }
            }
        }
    }

    if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
        events.push(Ok(StreamEvent::Completed {
            finish_reason: map_finish_reason(reason),
            response_id: None,
            model: None,
        }));
    }

    events
}
