//! The provider contract.

use strand_domain::capability::ProviderCapability;
use strand_domain::chat::{ChatMessage, ToolDefinition};
use strand_domain::error::Result;
use strand_domain::stream::{BoxStream, StreamEvent};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic streamed turn request.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    /// The conversation messages to send.
    pub messages: Vec<ChatMessage>,
    /// Tool definitions the model may invoke. Converted to the model's
    /// preferred schema mode by the adapter.
    pub tools: Vec<ToolDefinition>,
    /// Sampling temperature. `None` lets the provider choose.
    pub temperature: Option<f32>,
    /// Maximum tokens in the response. `None` lets the provider choose.
    pub max_tokens: Option<u32>,
    /// Model identifier override. `None` uses the adapter default.
    pub model: Option<String>,
    /// Marks the one-shot intent-classifier request shape; adapters keep
    /// these short (low token cap, no tools).
    pub intent_probe: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every LLM adapter implements.
///
/// Adapters translate between [`TurnRequest`]/[`StreamEvent`] and each
/// backend's wire format. All of them run their raw events through the
/// [`crate::normalize::StreamNormalizer`] so downstream code can rely on
/// the canonical sequence (every stream terminates in exactly one
/// `Completed` or `Error`).
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Send a turn request and stream normalized events.
    async fn stream_turn(
        &self,
        req: TurnRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;

    /// Advertised capabilities of this provider/model combination.
    fn capability(&self, model: &str) -> ProviderCapability;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;
}
