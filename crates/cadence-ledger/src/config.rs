use cadence_types::BudgetConfig;

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or(default)
}

/// Reads `BUDGET_MAX_COST_PER_RUN`, `BUDGET_MAX_COST_PER_SESSION`, and
/// `BUDGET_WARNING_THRESHOLD`, falling back to `BudgetConfig::default()`.
pub fn budget_config_from_env() -> BudgetConfig {
    let defaults = BudgetConfig::default();
    BudgetConfig {
        max_cost_per_run: env_f64("BUDGET_MAX_COST_PER_RUN", defaults.max_cost_per_run),
        max_cost_per_session: env_f64(
            "BUDGET_MAX_COST_PER_SESSION",
            defaults.max_cost_per_session,
        ),
        warning_threshold: env_f64("BUDGET_WARNING_THRESHOLD", defaults.warning_threshold),
    }
}
