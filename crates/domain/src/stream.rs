//! Normalized provider stream events.
//!
//! Every adapter converts its wire format into this canonical sequence so
//! the run engine never sees provider-specific shapes.

use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Token usage for one provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Incomplete,
    Error,
}

/// Events emitted during a streamed provider turn (provider-agnostic).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Partial assistant text.
    TextDelta { text: String },

    /// A tool call has been declared (arguments may still be partial).
    ToolCallAdded {
        id: String,
        name: String,
        #[serde(default)]
        args_partial: String,
    },

    /// Incremental tool call argument data.
    ToolCallDelta { id: String, delta: String },

    /// A tool call is complete with final argument JSON text.
    ToolCallDone {
        id: String,
        name: String,
        args_json: String,
    },

    /// Token usage for the call.
    Usage { usage: Usage },

    /// The turn finished.
    Completed {
        finish_reason: FinishReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },

    /// An error occurred during streaming.
    Error { code: String, message: String },
}
