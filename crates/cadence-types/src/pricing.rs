use serde::{Deserialize, Serialize};

/// Provenance tag on a resolved cost — which tier of the pricing fallback
/// produced the number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingSource {
    Provider,
    Litellm,
    Registry,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingEntry {
    /// USD per 1K prompt tokens.
    pub input_price: f64,
    /// USD per 1K completion tokens.
    pub output_price: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_date: Option<String>,
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownPricingMode {
    Warn,
    Block,
}

impl Default for UnknownPricingMode {
    fn default() -> Self {
        UnknownPricingMode::Block
    }
}

impl UnknownPricingMode {
    pub fn from_env_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "warn" => Some(UnknownPricingMode::Warn),
            "block" => Some(UnknownPricingMode::Block),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub max_cost_per_run: f64,
    pub max_cost_per_session: f64,
    pub warning_threshold: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_cost_per_run: 5.0,
            max_cost_per_session: 20.0,
            warning_threshold: 0.8,
        }
    }
}
