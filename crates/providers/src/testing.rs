//! Scripted provider for engine and classifier tests.
//!
//! Replays canned event scripts, one script per `stream_turn` call, so
//! multi-turn engine behavior can be exercised without network access.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use strand_domain::capability::ProviderCapability;
use strand_domain::error::Result;
use strand_domain::stream::{BoxStream, FinishReason, StreamEvent, Usage};

use crate::normalize::classify_provider_error;
use crate::traits::{Provider, TurnRequest};

/// One scripted stream item.
#[derive(Debug, Clone)]
pub enum ScriptItem {
    Event(StreamEvent),
    /// Yields `Err(classify_provider_error("scripted", message))`, so a
    /// message containing "tool_call_id is not found" produces the
    /// reference-error classification.
    Error(String),
}

pub struct ScriptedProvider {
    id: String,
    scripts: Mutex<VecDeque<Vec<ScriptItem>>>,
    /// Every request seen, for assertions.
    pub requests: Arc<Mutex<Vec<TurnRequest>>>,
    capability: ProviderCapability,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<ScriptItem>>) -> Self {
        Self {
            id: "scripted".into(),
            scripts: Mutex::new(scripts.into()),
            requests: Arc::new(Mutex::new(Vec::new())),
            capability: ProviderCapability::fallback("scripted", "scripted-model"),
        }
    }

    pub fn named(id: &str) -> Self {
        let mut p = Self::new(Vec::new());
        p.id = id.to_string();
        p
    }

    /// Adjust the advertised capability (e.g. shrink the context window to
    /// force compaction).
    pub fn with_capability(mut self, capability: ProviderCapability) -> Self {
        self.capability = capability;
        self
    }

    /// One text-only turn per reply, each ending in a clean stop.
    pub fn text_replies(replies: &[&str]) -> Self {
        let scripts = replies
            .iter()
            .map(|text| Self::text_turn(text))
            .collect();
        Self::new(scripts)
    }

    /// Script for a text answer with usage and completion.
    pub fn text_turn(text: &str) -> Vec<ScriptItem> {
        vec![
            ScriptItem::Event(StreamEvent::TextDelta { text: text.into() }),
            ScriptItem::Event(StreamEvent::Usage {
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                    reasoning_tokens: 0,
                },
            }),
            ScriptItem::Event(StreamEvent::Completed {
                finish_reason: FinishReason::Stop,
                response_id: Some("scripted-resp".into()),
                model: Some("scripted-model".into()),
            }),
        ]
    }

    /// Script for a turn that calls one tool.
    pub fn tool_call_turn(call_id: &str, name: &str, args_json: &str) -> Vec<ScriptItem> {
        vec![
            ScriptItem::Event(StreamEvent::ToolCallAdded {
                id: call_id.into(),
                name: name.into(),
                args_partial: String::new(),
            }),
            ScriptItem::Event(StreamEvent::ToolCallDone {
                id: call_id.into(),
                name: name.into(),
                args_json: args_json.into(),
            }),
            ScriptItem::Event(StreamEvent::Completed {
                finish_reason: FinishReason::ToolCalls,
                response_id: None,
                model: Some("scripted-model".into()),
            }),
        ]
    }

    /// Script for a silent completion with no content at all.
    pub fn empty_turn() -> Vec<ScriptItem> {
        vec![ScriptItem::Event(StreamEvent::Completed {
            finish_reason: FinishReason::Stop,
            response_id: None,
            model: Some("scripted-model".into()),
        })]
    }

    /// Script that hangs until the stream is dropped (for cancellation
    /// tests).
    pub fn stalled_turn() -> Vec<ScriptItem> {
        vec![ScriptItem::Event(StreamEvent::TextDelta {
            text: "__stall__".into(),
        })]
    }

    pub fn push_script(&self, script: Vec<ScriptItem>) {
        self.scripts.lock().push_back(script);
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    async fn stream_turn(
        &self,
        req: TurnRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        self.requests.lock().push(req);
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(Self::empty_turn);

        let stream = async_stream::stream! {
            for item in script {
                match item {
                    ScriptItem::Event(StreamEvent::TextDelta { text })
                        if text == "__stall__" =>
                    {
                        // Park until the consumer drops the stream.
                        std::future::pending::<()>().await;
                    }
                    ScriptItem::Event(event) => yield Ok(event),
                    ScriptItem::Error(message) => {
                        yield Err(classify_provider_error("scripted", &message));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn capability(&self, _model: &str) -> ProviderCapability {
        self.capability.clone()
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn scripts_replay_in_order() {
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::text_turn("first"),
            ScriptedProvider::text_turn("second"),
        ]);

        for expected in ["first", "second"] {
            let mut stream = provider
                .stream_turn(TurnRequest::default())
                .await
                .unwrap();
            let mut text = String::new();
            while let Some(ev) = stream.next().await {
                if let Ok(StreamEvent::TextDelta { text: t }) = ev {
                    text.push_str(&t);
                }
            }
            assert_eq!(text, expected);
        }
        assert_eq!(provider.requests.lock().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_scripts_yield_empty_completion() {
        let provider = ScriptedProvider::new(Vec::new());
        let mut stream = provider.stream_turn(TurnRequest::default()).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(
            first,
            StreamEvent::Completed {
                finish_reason: FinishReason::Stop,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn error_items_classify() {
        let provider = ScriptedProvider::new(vec![vec![ScriptItem::Error(
            "tool_call_id is not found".into(),
        )]]);
        let mut stream = provider.stream_turn(TurnRequest::default()).await.unwrap();
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_tool_call_reference());
    }
}
