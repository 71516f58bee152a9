use std::collections::HashMap;

use cadence_types::{LLMUsage, PricingEntry, PricingSource};
use tokio::sync::RwLock;

/// Result of pricing a single usage sample against the registry or the
/// provider-reported cost.
#[derive(Debug, Clone)]
pub struct CostCalculation {
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    pub currency: String,
    pub pricing_source: PricingSource,
}

fn catalog_key(provider: &str, model: &str) -> String {
    format!("{provider}:{model}")
}

/// In-memory `"provider:model" -> PricingEntry` table, seeded from a static
/// catalog at construction and mutable afterwards. Reads are frequent and
/// lock-shared; writes (`register_price`) are rare and take the writer lock.
pub struct PricingRegistry {
    prices: RwLock<HashMap<String, PricingEntry>>,
}

impl PricingRegistry {
    /// Loads the embedded default catalog. `fail_closed` governs what
    /// happens if the catalog is malformed: in production this must not
    /// silently start with an empty table.
    pub fn with_default_catalog(fail_closed: bool) -> anyhow::Result<Self> {
        const DEFAULT_CATALOG: &str = include_str!("catalog/pricing.default.json");
        match serde_json::from_str::<HashMap<String, PricingEntry>>(DEFAULT_CATALOG) {
            Ok(prices) => Ok(Self {
                prices: RwLock::new(prices),
            }),
            Err(err) if fail_closed => Err(anyhow::anyhow!(
                "failed to load default pricing catalog: {err}"
            )),
            Err(err) => {
                tracing::warn!(error = %err, "default pricing catalog failed to parse, starting empty");
                Ok(Self {
                    prices: RwLock::new(HashMap::new()),
                })
            }
        }
    }

    pub fn empty() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_price(&self, provider: &str, model: &str) -> Option<PricingEntry> {
        self.prices.read().await.get(&catalog_key(provider, model)).cloned()
    }

    pub async fn register_price(&self, provider: &str, model: &str, entry: PricingEntry) {
        self.prices
            .write()
            .await
            .insert(catalog_key(provider, model), entry);
    }

    pub async fn load_from_json(&self, raw: &str) -> anyhow::Result<()> {
        let parsed: HashMap<String, PricingEntry> = serde_json::from_str(raw)?;
        self.prices.write().await.extend(parsed);
        Ok(())
    }

    pub async fn get_all_prices(&self) -> HashMap<String, PricingEntry> {
        self.prices.read().await.clone()
    }

    pub async fn clear(&self) {
        self.prices.write().await.clear();
    }

    /// Pricing tier 1 (provider-reported) and tier 3 (registry lookup) of
    /// the resolver's fallback, per the formula: cost-per-1K-tokens times
    /// tokens-in-thousands.
    pub async fn calculate_cost(&self, usage: &LLMUsage) -> CostCalculation {
        if let Some(cost) = usage.cost.filter(|c| *c > 0.0) {
            return CostCalculation {
                input_cost: 0.0,
                output_cost: 0.0,
                total_cost: cost,
                currency: "USD".to_string(),
                pricing_source: PricingSource::Provider,
            };
        }

        if let Some(entry) = self.get_price(&usage.provider, &usage.model).await {
            let input_cost = (usage.prompt_tokens as f64 / 1000.0) * entry.input_price;
            let output_cost = (usage.completion_tokens as f64 / 1000.0) * entry.output_price;
            return CostCalculation {
                input_cost,
                output_cost,
                total_cost: input_cost + output_cost,
                currency: entry.currency,
                pricing_source: PricingSource::Registry,
            };
        }

        CostCalculation {
            input_cost: 0.0,
            output_cost: 0.0,
            total_cost: 0.0,
            currency: "USD".to_string(),
            pricing_source: PricingSource::Unknown,
        }
    }
}
