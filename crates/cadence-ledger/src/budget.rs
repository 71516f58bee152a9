use std::collections::HashMap;
use std::sync::Arc;

use cadence_pricing::PricingRegistry;
use cadence_types::{BudgetConfig, LLMCallContext, LLMUsage};
use tokio::sync::RwLock;

use crate::errors::BudgetError;
use crate::ledger::CostLedger;
use crate::store::DurableStore;

/// A conservative per-call estimate used only when neither the provider nor
/// the registry has a price for the call; preflight must never estimate
/// zero for an unpriced call.
const FALLBACK_INPUT_PRICE_PER_1K: f64 = 0.005;
const FALLBACK_OUTPUT_PRICE_PER_1K: f64 = 0.015;

#[derive(Debug, Clone, Default)]
pub struct BudgetConfigPatch {
    pub max_cost_per_run: Option<f64>,
    pub max_cost_per_session: Option<f64>,
    pub warning_threshold: Option<f64>,
}

/// Admission-control policy used by the gateway: preflight denies on
/// *estimated* cost before a model is invoked, post-commit advances the
/// session accumulator on *actual* cost after a successful ledger append.
pub struct BudgetManager {
    config: RwLock<BudgetConfig>,
    ledger: Arc<CostLedger>,
    pricing_registry: Arc<PricingRegistry>,
    store: Arc<dyn DurableStore>,
    session_costs: RwLock<HashMap<String, f64>>,
}

impl BudgetManager {
    pub fn new(
        config: BudgetConfig,
        ledger: Arc<CostLedger>,
        pricing_registry: Arc<PricingRegistry>,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            ledger,
            pricing_registry,
            store,
            session_costs: RwLock::new(HashMap::new()),
        }
    }

    /// Preloads the in-memory session accumulator for a known set of
    /// sessions from durable state. Call on boot before serving traffic.
    pub async fn load_session_costs(&self, session_ids: &[String]) -> anyhow::Result<()> {
        let mut costs = self.session_costs.write().await;
        for session_id in session_ids {
            let total = self.store.get_session_total(session_id).await?;
            costs.insert(session_id.clone(), total);
        }
        Ok(())
    }

    async fn session_cost(&self, session_id: &str) -> anyhow::Result<f64> {
        if let Some(cost) = self.session_costs.read().await.get(session_id) {
            return Ok(*cost);
        }
        let total = self.store.get_session_total(session_id).await?;
        self.session_costs
            .write()
            .await
            .insert(session_id.to_string(), total);
        Ok(total)
    }

    async fn estimate_call_cost(&self, estimated_usage: &LLMUsage) -> f64 {
        if let Some(cost) = estimated_usage.cost.filter(|c| *c > 0.0) {
            return cost;
        }
        if let Some(entry) = self
            .pricing_registry
            .get_price(&estimated_usage.provider, &estimated_usage.model)
            .await
        {
            let input_cost = (estimated_usage.prompt_tokens as f64 / 1000.0) * entry.input_price;
            let output_cost =
                (estimated_usage.completion_tokens as f64 / 1000.0) * entry.output_price;
            return input_cost + output_cost;
        }
        let input_cost =
            (estimated_usage.prompt_tokens as f64 / 1000.0) * FALLBACK_INPUT_PRICE_PER_1K;
        let output_cost =
            (estimated_usage.completion_tokens as f64 / 1000.0) * FALLBACK_OUTPUT_PRICE_PER_1K;
        input_cost + output_cost
    }

    pub async fn preflight(
        &self,
        context: &LLMCallContext,
        estimated_usage: &LLMUsage,
    ) -> Result<(), BudgetError> {
        let estimated_call_cost = self.estimate_call_cost(estimated_usage).await;
        let config = *self.config.read().await;

        let current_run = self
            .ledger
            .get_current_cost(&context.run_id)
            .await
            .unwrap_or(0.0);
        let projected_run = current_run + estimated_call_cost;

        let current_session = self.session_cost(&context.session_id).await.unwrap_or(0.0);
        let projected_session = current_session + estimated_call_cost;

        if projected_run > config.max_cost_per_run {
            return Err(BudgetError::BudgetExceeded {
                run_id: context.run_id.clone(),
                projected: projected_run,
                cap: config.max_cost_per_run,
            });
        }
        if projected_session > config.max_cost_per_session {
            return Err(BudgetError::SessionBudgetExceeded {
                session_id: context.session_id.clone(),
                projected: projected_session,
                cap: config.max_cost_per_session,
            });
        }

        if config.max_cost_per_run > 0.0
            && current_run / config.max_cost_per_run >= config.warning_threshold
        {
            tracing::warn!(
                run_id = %context.run_id,
                current_run,
                cap = config.max_cost_per_run,
                "run is approaching its cost cap"
            );
        }

        Ok(())
    }

    /// Invoked exactly once by the gateway, after a successful ledger
    /// append, to advance the in-memory session accumulator and persist it.
    pub async fn post_commit(
        &self,
        context: &LLMCallContext,
        actual_cost: f64,
    ) -> anyhow::Result<()> {
        let mut costs = self.session_costs.write().await;
        let current = match costs.get(&context.session_id) {
            Some(value) => *value,
            None => self.store.get_session_total(&context.session_id).await?,
        };
        let updated = current + actual_cost;
        costs.insert(context.session_id.clone(), updated);
        drop(costs);
        self.store
            .put_session_total(&context.session_id, updated)
            .await
    }

    pub async fn get_remaining_budget(&self, run_id: &str) -> anyhow::Result<f64> {
        let current = self.ledger.get_current_cost(run_id).await?;
        let cap = self.config.read().await.max_cost_per_run;
        Ok((cap - current).max(0.0))
    }

    pub async fn is_over_budget(&self, run_id: &str) -> anyhow::Result<bool> {
        let current = self.ledger.get_current_cost(run_id).await?;
        let cap = self.config.read().await.max_cost_per_run;
        Ok(current >= cap)
    }

    pub async fn update_config(&self, patch: BudgetConfigPatch) {
        let mut config = self.config.write().await;
        if let Some(value) = patch.max_cost_per_run {
            config.max_cost_per_run = value;
        }
        if let Some(value) = patch.max_cost_per_session {
            config.max_cost_per_session = value;
        }
        if let Some(value) = patch.warning_threshold {
            config.warning_threshold = value;
        }
    }

    pub async fn get_config(&self) -> BudgetConfig {
        *self.config.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDurableStore;
    use cadence_types::Phase;

    fn context() -> LLMCallContext {
        LLMCallContext {
            run_id: "run-1".to_string(),
            session_id: "session-1".to_string(),
            task_id: None,
            agent_type: "planner".to_string(),
            phase: Phase::Planning,
            idempotency_key: None,
        }
    }

    fn usage() -> LLMUsage {
        LLMUsage {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            prompt_tokens: 120,
            completion_tokens: 60,
            total_tokens: Some(180),
            cost: None,
            raw: None,
        }
    }

    #[tokio::test]
    async fn preflight_denies_when_projected_run_cost_exceeds_cap() {
        let store = Arc::new(InMemoryDurableStore::new());
        let ledger = Arc::new(CostLedger::new(store.clone()));
        let registry = Arc::new(PricingRegistry::empty());
        let manager = BudgetManager::new(
            BudgetConfig {
                max_cost_per_run: 0.00001,
                max_cost_per_session: 20.0,
                warning_threshold: 0.8,
            },
            ledger,
            registry,
            store,
        );

        let err = manager.preflight(&context(), &usage()).await.unwrap_err();
        assert!(matches!(err, BudgetError::BudgetExceeded { .. }));
    }

    #[tokio::test]
    async fn post_commit_advances_session_accumulator() {
        let store = Arc::new(InMemoryDurableStore::new());
        let ledger = Arc::new(CostLedger::new(store.clone()));
        let registry = Arc::new(PricingRegistry::empty());
        let manager = BudgetManager::new(BudgetConfig::default(), ledger, registry, store.clone());

        manager.post_commit(&context(), 0.5).await.unwrap();
        manager.post_commit(&context(), 0.25).await.unwrap();

        let total = store.get_session_total("session-1").await.unwrap();
        assert_eq!(total, 0.75);
    }
}
