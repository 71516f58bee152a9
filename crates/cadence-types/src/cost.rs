use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pricing::PricingSource;
use crate::run::Phase;

/// A single append-only cost record, written once per committed LLM call.
///
/// `idempotency_key` is the dedup key a `DurableStore` enforces uniqueness
/// on; `event_id` only identifies the record itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEvent {
    pub event_id: String,
    pub idempotency_key: String,
    pub run_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub agent_type: String,
    pub phase: Phase,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_cost_usd: Option<f64>,
    pub calculated_cost_usd: f64,
    pub pricing_source: PricingSource,
    pub created_at: DateTime<Utc>,
}

impl CostEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        idempotency_key: impl Into<String>,
        run_id: impl Into<String>,
        session_id: impl Into<String>,
        task_id: Option<String>,
        agent_type: impl Into<String>,
        phase: Phase,
        provider: impl Into<String>,
        model: impl Into<String>,
        prompt_tokens: i64,
        completion_tokens: i64,
        provider_cost_usd: Option<f64>,
        calculated_cost_usd: f64,
        pricing_source: PricingSource,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            idempotency_key: idempotency_key.into(),
            run_id: run_id.into(),
            session_id: session_id.into(),
            task_id,
            agent_type: agent_type.into(),
            phase,
            provider: provider.into(),
            model: model.into(),
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            provider_cost_usd,
            calculated_cost_usd,
            pricing_source,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CostByModel {
    pub provider: String,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CostByProvider {
    pub provider: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost: f64,
}

/// A point-in-time aggregate over a run's `CostEvent`s, returned by
/// `CostLedger::aggregate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSnapshot {
    pub run_id: String,
    pub total_cost: f64,
    pub total_tokens: i64,
    pub event_count: usize,
    pub by_model: Vec<CostByModel>,
    pub by_provider: Vec<CostByProvider>,
    pub timestamp: DateTime<Utc>,
}

impl CostSnapshot {
    pub fn from_events(run_id: impl Into<String>, events: &[CostEvent]) -> Self {
        let mut by_model: Vec<CostByModel> = Vec::new();
        let mut by_provider: Vec<CostByProvider> = Vec::new();

        for event in events {
            match by_model
                .iter_mut()
                .find(|m| m.provider == event.provider && m.model == event.model)
            {
                Some(entry) => {
                    entry.prompt_tokens += event.prompt_tokens;
                    entry.completion_tokens += event.completion_tokens;
                    entry.total_tokens += event.total_tokens;
                    entry.cost += event.calculated_cost_usd;
                }
                None => by_model.push(CostByModel {
                    provider: event.provider.clone(),
                    model: event.model.clone(),
                    prompt_tokens: event.prompt_tokens,
                    completion_tokens: event.completion_tokens,
                    total_tokens: event.total_tokens,
                    cost: event.calculated_cost_usd,
                }),
            }
            match by_provider
                .iter_mut()
                .find(|p| p.provider == event.provider)
            {
                Some(entry) => {
                    entry.prompt_tokens += event.prompt_tokens;
                    entry.completion_tokens += event.completion_tokens;
                    entry.total_tokens += event.total_tokens;
                    entry.cost += event.calculated_cost_usd;
                }
                None => by_provider.push(CostByProvider {
                    provider: event.provider.clone(),
                    prompt_tokens: event.prompt_tokens,
                    completion_tokens: event.completion_tokens,
                    total_tokens: event.total_tokens,
                    cost: event.calculated_cost_usd,
                }),
            }
        }

        Self {
            run_id: run_id.into(),
            total_cost: events.iter().map(|e| e.calculated_cost_usd).sum(),
            total_tokens: events.iter().map(|e| e.total_tokens).sum(),
            event_count: events.len(),
            by_model,
            by_provider,
            timestamp: Utc::now(),
        }
    }
}
