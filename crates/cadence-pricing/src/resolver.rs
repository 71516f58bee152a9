use std::sync::Arc;

use cadence_types::{LLMUsage, PricingSource, UnknownPricingMode};
use serde_json::Value;

use crate::registry::PricingRegistry;

#[derive(Debug, Clone)]
pub struct ResolvedPricing {
    pub provider_cost_usd: Option<f64>,
    pub calculated_cost_usd: f64,
    pub pricing_source: PricingSource,
    pub should_block: bool,
}

const TOP_LEVEL_COST_KEYS: &[&str] = &[
    "response_cost",
    "litellm_response_cost",
    "litellm_cost",
    "cost",
    "total_cost",
];

fn positive_number(value: &Value) -> Option<f64> {
    value.as_f64().filter(|v| *v > 0.0)
}

/// Tier 2 of the fallback: upstream/litellm-reported cost hiding in the raw
/// response body, either at the top level or one level under `usage`.
fn extract_litellm_cost(raw: &Value) -> Option<f64> {
    for key in TOP_LEVEL_COST_KEYS {
        if let Some(cost) = raw.get(key).and_then(positive_number) {
            return Some(cost);
        }
    }
    let usage = raw.get("usage")?;
    usage
        .get("total_cost")
        .and_then(positive_number)
        .or_else(|| usage.get("cost").and_then(positive_number))
}

/// Implements the three-tier pricing fallback in `§4.2`: provider-reported,
/// then upstream/litellm-reported, then a registry lookup, then `unknown`.
pub struct PricingResolver {
    registry: Arc<PricingRegistry>,
    unknown_pricing_mode: UnknownPricingMode,
}

impl PricingResolver {
    pub fn new(registry: Arc<PricingRegistry>, unknown_pricing_mode: UnknownPricingMode) -> Self {
        Self {
            registry,
            unknown_pricing_mode,
        }
    }

    pub async fn resolve(&self, usage: &LLMUsage, raw: Option<&Value>) -> ResolvedPricing {
        if let Some(cost) = usage.cost.filter(|c| *c > 0.0) {
            return ResolvedPricing {
                provider_cost_usd: Some(cost),
                calculated_cost_usd: cost,
                pricing_source: PricingSource::Provider,
                should_block: false,
            };
        }

        let raw_body = raw.or(usage.raw.as_ref());
        if let Some(cost) = raw_body.and_then(extract_litellm_cost) {
            return ResolvedPricing {
                provider_cost_usd: Some(cost),
                calculated_cost_usd: cost,
                pricing_source: PricingSource::Litellm,
                should_block: false,
            };
        }

        let calc = self.registry.calculate_cost(usage).await;
        match calc.pricing_source {
            PricingSource::Registry => ResolvedPricing {
                provider_cost_usd: None,
                calculated_cost_usd: calc.total_cost,
                pricing_source: PricingSource::Registry,
                should_block: false,
            },
            _ => ResolvedPricing {
                provider_cost_usd: None,
                calculated_cost_usd: 0.0,
                pricing_source: PricingSource::Unknown,
                should_block: matches!(self.unknown_pricing_mode, UnknownPricingMode::Block),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::PricingEntry;
    use serde_json::json;

    fn usage(provider: &str, model: &str) -> LLMUsage {
        LLMUsage {
            provider: provider.to_string(),
            model: model.to_string(),
            prompt_tokens: 120,
            completion_tokens: 60,
            total_tokens: Some(180),
            cost: None,
            raw: None,
        }
    }

    #[tokio::test]
    async fn resolves_provider_reported_first() {
        let registry = Arc::new(PricingRegistry::empty());
        let resolver = PricingResolver::new(registry, UnknownPricingMode::Block);
        let mut u = usage("openai", "gpt-4o");
        u.cost = Some(1.23);
        let resolved = resolver.resolve(&u, None).await;
        assert!(matches!(resolved.pricing_source, PricingSource::Provider));
        assert_eq!(resolved.calculated_cost_usd, 1.23);
        assert!(!resolved.should_block);
    }

    #[tokio::test]
    async fn resolves_litellm_reported_from_raw_top_level() {
        let registry = Arc::new(PricingRegistry::empty());
        let resolver = PricingResolver::new(registry, UnknownPricingMode::Block);
        let raw = json!({ "litellm_response_cost": 0.0042 });
        let resolved = resolver.resolve(&usage("custom", "m"), Some(&raw)).await;
        assert!(matches!(resolved.pricing_source, PricingSource::Litellm));
        assert_eq!(resolved.calculated_cost_usd, 0.0042);
    }

    #[tokio::test]
    async fn resolves_litellm_reported_nested_under_usage() {
        let registry = Arc::new(PricingRegistry::empty());
        let resolver = PricingResolver::new(registry, UnknownPricingMode::Block);
        let raw = json!({ "usage": { "total_cost": 0.01 } });
        let resolved = resolver.resolve(&usage("custom", "m"), Some(&raw)).await;
        assert!(matches!(resolved.pricing_source, PricingSource::Litellm));
        assert_eq!(resolved.calculated_cost_usd, 0.01);
    }

    #[tokio::test]
    async fn falls_back_to_registry() {
        let registry = Arc::new(PricingRegistry::empty());
        registry
            .register_price(
                "openai",
                "gpt-4o",
                PricingEntry {
                    input_price: 0.005,
                    output_price: 0.015,
                    currency: "USD".to_string(),
                    effective_date: None,
                },
            )
            .await;
        let resolver = PricingResolver::new(registry, UnknownPricingMode::Block);
        let resolved = resolver.resolve(&usage("openai", "gpt-4o"), None).await;
        assert!(matches!(resolved.pricing_source, PricingSource::Registry));
        assert!((resolved.calculated_cost_usd - 0.0015).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unknown_blocks_in_block_mode_and_warns_otherwise() {
        let registry = Arc::new(PricingRegistry::empty());
        let blocking = PricingResolver::new(registry.clone(), UnknownPricingMode::Block);
        let resolved = blocking.resolve(&usage("unknown", "m"), None).await;
        assert!(resolved.should_block);
        assert_eq!(resolved.calculated_cost_usd, 0.0);

        let warning = PricingResolver::new(registry, UnknownPricingMode::Warn);
        let resolved = warning.resolve(&usage("unknown", "m"), None).await;
        assert!(!resolved.should_block);
    }
}
