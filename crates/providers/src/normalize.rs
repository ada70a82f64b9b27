//! Stream normalization shared by every adapter.
//!
//! Providers disagree on tool-call emission: some send
//! `tool_call_added` + `tool_call_done` with no deltas, others send only
//! deltas. The normalizer unifies both into the canonical sequence and
//! guarantees exactly one terminal event per stream: when the upstream
//! closes silently, a `completed` is inferred (`tool_calls` if any tool
//! call finished, else `stop`).

use std::collections::HashMap;

use strand_domain::error::Error;
use strand_domain::stream::{FinishReason, StreamEvent};

/// Error payload pattern classified as a tool-call reference error.
const TOOL_REF_PATTERN: &str = "tool_call_id is not found";

/// Classify a provider error payload into the shared error type.
///
/// Messages matching the reference-error pattern become
/// [`Error::ProviderToolCallReference`] so the run engine can rerun
/// history hygiene and retry once.
pub fn classify_provider_error(provider: &str, message: &str) -> Error {
    if message.contains(TOOL_REF_PATTERN) {
        Error::ProviderToolCallReference {
            provider: provider.to_string(),
            message: message.to_string(),
        }
    } else {
        Error::Provider {
            provider: provider.to_string(),
            message: message.to_string(),
        }
    }
}

/// Stateful per-stream normalizer. Feed every raw adapter event through
/// [`StreamNormalizer::push`]; call [`StreamNormalizer::finish`] when the
/// upstream closes.
#[derive(Default)]
pub struct StreamNormalizer {
    /// call_id → (name, accumulated args) for in-flight tool calls.
    open_calls: HashMap<String, (String, String)>,
    /// Order in which call ids were first seen.
    call_order: Vec<String>,
    any_tool_done: bool,
    terminal_seen: bool,
    response_id: Option<String>,
    model: Option<String>,
}

impl StreamNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the response metadata used by an inferred completion.
    pub fn note_response(&mut self, response_id: Option<String>, model: Option<String>) {
        if response_id.is_some() {
            self.response_id = response_id;
        }
        if model.is_some() {
            self.model = model;
        }
    }

    /// Normalize one raw event into zero or more canonical events.
    pub fn push(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        match event {
            StreamEvent::ToolCallAdded {
                id,
                name,
                args_partial,
            } => {
                let entry = self
                    .open_calls
                    .entry(id.clone())
                    .or_insert_with(|| (name.clone(), String::new()));
                entry.0 = name.clone();
                entry.1.push_str(&args_partial);
                if !self.call_order.contains(&id) {
                    self.call_order.push(id.clone());
                }
                vec![StreamEvent::ToolCallAdded {
                    id,
                    name,
                    args_partial,
                }]
            }
            StreamEvent::ToolCallDelta { id, delta } => {
                // Delta-only providers: synthesize the declaration on the
                // first delta for an unknown id.
                let mut out = Vec::new();
                if !self.open_calls.contains_key(&id) {
                    self.open_calls
                        .insert(id.clone(), (String::new(), String::new()));
                    self.call_order.push(id.clone());
                    out.push(StreamEvent::ToolCallAdded {
                        id: id.clone(),
                        name: String::new(),
                        args_partial: String::new(),
                    });
                }
                if let Some((_, args)) = self.open_calls.get_mut(&id) {
                    args.push_str(&delta);
                }
                out.push(StreamEvent::ToolCallDelta { id, delta });
                out
            }
            StreamEvent::ToolCallDone { id, name, args_json } => {
                self.open_calls.remove(&id);
                self.any_tool_done = true;
                vec![StreamEvent::ToolCallDone { id, name, args_json }]
            }
            StreamEvent::Completed {
                finish_reason,
                response_id,
                model,
            } => {
                self.terminal_seen = true;
                let mut out = self.flush_open_calls();
                out.push(StreamEvent::Completed {
                    finish_reason,
                    response_id: response_id.or_else(|| self.response_id.clone()),
                    model: model.or_else(|| self.model.clone()),
                });
                out
            }
            StreamEvent::Error { code, message } => {
                self.terminal_seen = true;
                vec![StreamEvent::Error { code, message }]
            }
            other @ (StreamEvent::TextDelta { .. } | StreamEvent::Usage { .. }) => vec![other],
        }
    }

    /// Close any tool calls that only ever saw added/delta events.
    fn flush_open_calls(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        for id in std::mem::take(&mut self.call_order) {
            if let Some((name, args)) = self.open_calls.remove(&id) {
                let args_json = if args.trim().is_empty() {
                    "{}".to_string()
                } else {
                    args
                };
                self.any_tool_done = true;
                out.push(StreamEvent::ToolCallDone {
                    id,
                    name,
                    args_json,
                });
            }
        }
        out
    }

    /// The upstream closed. Returns the inferred terminal events when the
    /// stream never produced one.
    pub fn finish(mut self) -> Vec<StreamEvent> {
        if self.terminal_seen {
            return Vec::new();
        }
        let mut out = self.flush_open_calls();
        let finish_reason = if self.any_tool_done {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        };
        out.push(StreamEvent::Completed {
            finish_reason,
            response_id: self.response_id,
            model: self.model,
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_close_infers_stop() {
        let mut n = StreamNormalizer::new();
        let _ = n.push(StreamEvent::TextDelta { text: "hi".into() });
        let tail = n.finish();
        assert!(matches!(
            tail.as_slice(),
            [StreamEvent::Completed {
                finish_reason: FinishReason::Stop,
                ..
            }]
        ));
    }

    #[test]
    fn silent_close_after_tool_done_infers_tool_calls() {
        let mut n = StreamNormalizer::new();
        let _ = n.push(StreamEvent::ToolCallDone {
            id: "tc_1".into(),
            name: "web.search".into(),
            args_json: "{}".into(),
        });
        let tail = n.finish();
        assert!(matches!(
            tail.as_slice(),
            [StreamEvent::Completed {
                finish_reason: FinishReason::ToolCalls,
                ..
            }]
        ));
    }

    #[test]
    fn delta_only_provider_gets_synthesized_added_and_done() {
        let mut n = StreamNormalizer::new();
        let first = n.push(StreamEvent::ToolCallDelta {
            id: "tc_1".into(),
            delta: r#"{"q":"#.into(),
        });
        assert!(matches!(first[0], StreamEvent::ToolCallAdded { .. }));

        let _ = n.push(StreamEvent::ToolCallDelta {
            id: "tc_1".into(),
            delta: r#""rust"}"#.into(),
        });
        let tail = n.finish();
        match &tail[0] {
            StreamEvent::ToolCallDone { id, args_json, .. } => {
                assert_eq!(id, "tc_1");
                assert_eq!(args_json, r#"{"q":"rust"}"#);
            }
            other => panic!("expected ToolCallDone, got {other:?}"),
        }
        assert!(matches!(
            tail[1],
            StreamEvent::Completed {
                finish_reason: FinishReason::ToolCalls,
                ..
            }
        ));
    }

    #[test]
    fn added_done_provider_passes_through() {
        let mut n = StreamNormalizer::new();
        let _ = n.push(StreamEvent::ToolCallAdded {
            id: "tc_1".into(),
            name: "t".into(),
            args_partial: String::new(),
        });
        let done = n.push(StreamEvent::ToolCallDone {
            id: "tc_1".into(),
            name: "t".into(),
            args_json: "{}".into(),
        });
        assert_eq!(done.len(), 1);
        // Explicit completion: finish() emits nothing more.
        let _ = n.push(StreamEvent::Completed {
            finish_reason: FinishReason::ToolCalls,
            response_id: None,
            model: None,
        });
        assert!(n.finish().is_empty());
    }

    #[test]
    fn explicit_completion_flushes_unfinished_calls_first() {
        let mut n = StreamNormalizer::new();
        let _ = n.push(StreamEvent::ToolCallAdded {
            id: "tc_1".into(),
            name: "t".into(),
            args_partial: r#"{"a":1}"#.into(),
        });
        let out = n.push(StreamEvent::Completed {
            finish_reason: FinishReason::ToolCalls,
            response_id: None,
            model: None,
        });
        assert!(matches!(out[0], StreamEvent::ToolCallDone { .. }));
        assert!(matches!(out[1], StreamEvent::Completed { .. }));
    }

    #[test]
    fn reference_error_classification() {
        let err = classify_provider_error("openai", "tool_call_id is not found: tc_9");
        assert!(err.is_tool_call_reference());
        let err = classify_provider_error("openai", "rate limited");
        assert!(!err.is_tool_call_reference());
        assert!(err.is_transient());
    }

    #[test]
    fn empty_args_default_to_object() {
        let mut n = StreamNormalizer::new();
        let _ = n.push(StreamEvent::ToolCallAdded {
            id: "tc_1".into(),
            name: "t".into(),
            args_partial: String::new(),
        });
        let tail = n.finish();
        match &tail[0] {
            StreamEvent::ToolCallDone { args_json, .. } => assert_eq!(args_json, "{}"),
            other => panic!("expected ToolCallDone, got {other:?}"),
        }
    }
}
