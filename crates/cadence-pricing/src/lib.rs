pub mod registry;
pub mod resolver;

pub use registry::{CostCalculation, PricingRegistry};
pub use resolver::{PricingResolver, ResolvedPricing};

use cadence_types::UnknownPricingMode;

/// Reads `COST_UNKNOWN_PRICING_MODE` (`warn` or `block`); defaults to
/// `block` in production and `warn` otherwise, per the environment's
/// `CADENCE_ENV` (unset or anything other than `production` is non-prod).
pub fn unknown_pricing_mode_from_env() -> UnknownPricingMode {
    if let Ok(raw) = std::env::var("COST_UNKNOWN_PRICING_MODE") {
        if let Some(mode) = UnknownPricingMode::from_env_str(&raw) {
            return mode;
        }
    }
    match std::env::var("CADENCE_ENV").as_deref() {
        Ok("production") => UnknownPricingMode::Block,
        _ => UnknownPricingMode::Warn,
    }
}
