use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token/cost usage reported by (or estimated for) a single model call.
///
/// `total_tokens` is derived from `prompt_tokens + completion_tokens` when
/// absent; negative counts are clamped to zero by `LLMUsage::normalized`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LLMUsage {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<i64>,
    /// Provider-reported cost in USD, when the provider bills per-call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Raw upstream response body, inspected by the pricing resolver for
    /// litellm-style cost fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl LLMUsage {
    pub fn total(&self) -> i64 {
        self.total_tokens
            .unwrap_or_else(|| self.prompt_tokens.max(0) + self.completion_tokens.max(0))
    }

    /// Clamp negative token counts to zero and fill a missing `total_tokens`.
    pub fn normalized(mut self) -> Self {
        self.prompt_tokens = self.prompt_tokens.max(0);
        self.completion_tokens = self.completion_tokens.max(0);
        if self.total_tokens.map(|t| t < 0).unwrap_or(false) {
            self.total_tokens = None;
        }
        if self.total_tokens.is_none() {
            self.total_tokens = Some(self.prompt_tokens + self.completion_tokens);
        }
        self
    }
}
