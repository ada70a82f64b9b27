//! Provider/model capabilities — cached per `(provider_id, model_name)` and
//! used by the prompt packer to derive token targets and by the adapters to
//! pick a tool-schema mode.

use serde::{Deserialize, Serialize};

/// Preferred shape for tool definitions sent to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolSchemaMode {
    /// Plain JSON-schema function definitions.
    #[default]
    Functions,
    /// Strict mode: the provider validates arguments against the schema.
    StrictJson,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCapability {
    pub provider_id: String,
    pub model_name: String,
    pub supports_tools: bool,
    pub supports_parallel_tools: bool,
    pub supports_strict_json: bool,
    pub supports_image_input: bool,
    pub supports_file_input: bool,
    pub supports_reasoning_tokens: bool,
    pub max_context_tokens: u64,
    pub max_output_tokens: u64,
    #[serde(default)]
    pub tool_schema_mode: ToolSchemaMode,
}

impl ProviderCapability {
    /// Conservative defaults for an unknown model: tools, no parallel
    /// dispatch, a 128k window.
    pub fn fallback(provider_id: &str, model_name: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            model_name: model_name.to_string(),
            supports_tools: true,
            supports_parallel_tools: false,
            supports_strict_json: false,
            supports_image_input: false,
            supports_file_input: false,
            supports_reasoning_tokens: false,
            max_context_tokens: 128_000,
            max_output_tokens: 4_096,
            tool_schema_mode: ToolSchemaMode::Functions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_is_conservative() {
        let cap = ProviderCapability::fallback("openai", "mystery-model");
        assert!(cap.supports_tools);
        assert!(!cap.supports_parallel_tools);
        assert_eq!(cap.tool_schema_mode, ToolSchemaMode::Functions);
    }
}
