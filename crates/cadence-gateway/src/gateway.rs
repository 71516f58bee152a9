use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_stream::try_stream;
use cadence_ledger::{BudgetManager, CostLedger};
use cadence_observability::{emit_event, ObservabilityEvent, ProcessKind};
use cadence_pricing::PricingResolver;
use cadence_providers::{
    ChatStream, ChatStreamRequest, GenerateStructuredRequest, GenerateStructuredResponse,
    GenerateTextRequest, GenerateTextResponse, ModelClient, StreamChunk,
};
use cadence_types::{CostEvent, LLMCallContext, LLMUsage};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::errors::GatewayError;

const DEFAULT_COMPLETION_TOKEN_ESTIMATE: i64 = 500;

fn estimate_tokens(text_len: usize) -> i64 {
    ((text_len as f64) / 4.0).ceil() as i64
}

fn estimate_usage(
    provider: &str,
    model: &str,
    messages_chars: usize,
    system_chars: usize,
) -> LLMUsage {
    LLMUsage {
        provider: provider.to_string(),
        model: model.to_string(),
        prompt_tokens: estimate_tokens(messages_chars + system_chars),
        completion_tokens: DEFAULT_COMPLETION_TOKEN_ESTIMATE,
        total_tokens: None,
        cost: None,
        raw: None,
    }
    .normalized()
}

fn total_message_chars(messages: &[cadence_providers::ChatMessage]) -> usize {
    messages.iter().map(|m| m.content.len()).sum()
}

fn materialize_idempotency_key(context: &LLMCallContext, estimated: &LLMUsage) -> String {
    context.idempotency_key.clone().unwrap_or_else(|| {
        format!(
            "llm:{}:{}:{}:{}:{}:{}:{}:{}:{}",
            context.run_id,
            context.session_id,
            context.phase.as_str(),
            context.task_id.as_deref().unwrap_or("none"),
            estimated.provider,
            estimated.model,
            estimated.prompt_tokens,
            estimated.completion_tokens,
            estimated.total(),
        )
    })
}

fn fill_defaults(mut usage: LLMUsage, provider: &str, model: &str) -> LLMUsage {
    if usage.provider.is_empty() {
        usage.provider = provider.to_string();
    }
    if usage.model.is_empty() {
        usage.model = model.to_string();
    }
    usage.normalized()
}

/// The sole construct allowed to call a model. Every call is preflighted
/// against the budget, priced twice (once to admit, once to settle), and
/// produces at most one `CostEvent`.
pub struct LLMGateway {
    model_client: Arc<dyn ModelClient>,
    ledger: Arc<CostLedger>,
    budget: Arc<BudgetManager>,
    pricing: Arc<PricingResolver>,
}

impl LLMGateway {
    pub fn new(
        model_client: Arc<dyn ModelClient>,
        ledger: Arc<CostLedger>,
        budget: Arc<BudgetManager>,
        pricing: Arc<PricingResolver>,
    ) -> Self {
        Self {
            model_client,
            ledger,
            budget,
            pricing,
        }
    }

    async fn admit(
        &self,
        context: &LLMCallContext,
        estimated: &LLMUsage,
    ) -> Result<(), GatewayError> {
        self.budget.preflight(context, estimated).await?;
        let resolved = self.pricing.resolve(estimated, None).await;
        if resolved.should_block {
            return Err(GatewayError::UnknownPricing {
                provider: estimated.provider.clone(),
                model: estimated.model.clone(),
            });
        }
        Ok(())
    }

    /// Resolves actual cost, appends the ledger event, and advances the
    /// session accumulator iff the append was new. Returns the resolved
    /// cost regardless of whether it was newly appended.
    async fn settle(
        &self,
        context: &LLMCallContext,
        usage: &LLMUsage,
        idempotency_key: &str,
    ) -> anyhow::Result<f64> {
        let resolved = self.pricing.resolve(usage, usage.raw.as_ref()).await;
        if resolved.should_block {
            tracing::warn!(
                run_id = %context.run_id,
                provider = %usage.provider,
                model = %usage.model,
                "pricing unknown after model call completed; persisting event anyway for auditability"
            );
        }

        let event = CostEvent::new(
            idempotency_key,
            context.run_id.clone(),
            context.session_id.clone(),
            context.task_id.clone(),
            context.agent_type.clone(),
            context.phase,
            usage.provider.clone(),
            usage.model.clone(),
            usage.prompt_tokens,
            usage.completion_tokens,
            resolved.provider_cost_usd,
            resolved.calculated_cost_usd,
            resolved.pricing_source,
        );

        let appended = self.ledger.append(event).await?;
        if appended {
            self.budget
                .post_commit(context, resolved.calculated_cost_usd)
                .await?;
        }
        Ok(resolved.calculated_cost_usd)
    }

    pub async fn generate_text(
        &self,
        context: LLMCallContext,
        req: GenerateTextRequest,
    ) -> Result<GenerateTextResponse, GatewayError> {
        let provider = self.model_client.provider().to_string();
        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.model_client.default_model().to_string());
        let estimated = estimate_usage(
            &provider,
            &model,
            total_message_chars(&req.messages),
            req.system.as_deref().map(str::len).unwrap_or(0),
        );

        self.admit(&context, &estimated).await?;
        let idempotency_key = materialize_idempotency_key(&context, &estimated);

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "gateway.generate_text.started",
                component: "llm_gateway",
                correlation_id: None,
                session_id: Some(&context.session_id),
                run_id: Some(&context.run_id),
                task_id: context.task_id.as_deref(),
                provider: Some(&provider),
                model: Some(&model),
                status: None,
                error_code: None,
                detail: None,
            },
        );

        let response = self
            .model_client
            .generate_text(req)
            .await
            .map_err(GatewayError::model_invocation)?;

        let usage = fill_defaults(response.usage, &provider, &model);
        let cost = self
            .settle(&context, &usage, &idempotency_key)
            .await
            .map_err(GatewayError::model_invocation)?;

        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "gateway.generate_text.completed",
                component: "llm_gateway",
                correlation_id: None,
                session_id: Some(&context.session_id),
                run_id: Some(&context.run_id),
                task_id: context.task_id.as_deref(),
                provider: Some(&provider),
                model: Some(&model),
                status: Some("ok"),
                error_code: None,
                detail: Some(&format!("cost_usd={cost:.6}")),
            },
        );

        Ok(GenerateTextResponse {
            text: response.text,
            usage,
        })
    }

    pub async fn generate_structured(
        &self,
        context: LLMCallContext,
        req: GenerateStructuredRequest,
    ) -> Result<GenerateStructuredResponse, GatewayError> {
        let provider = self.model_client.provider().to_string();
        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.model_client.default_model().to_string());
        let estimated = estimate_usage(&provider, &model, total_message_chars(&req.messages), 0);

        self.admit(&context, &estimated).await?;
        let idempotency_key = materialize_idempotency_key(&context, &estimated);

        let response = self
            .model_client
            .generate_structured(req)
            .await
            .map_err(GatewayError::model_invocation)?;

        let usage = fill_defaults(response.usage, &provider, &model);
        self.settle(&context, &usage, &idempotency_key)
            .await
            .map_err(GatewayError::model_invocation)?;

        Ok(GenerateStructuredResponse {
            object: response.object,
            usage,
        })
    }

    /// Streaming path. The final usage, when available, rides in the
    /// stream's terminal `StreamChunk::Done`; the commit fires at most
    /// once, whether the stream finishes normally, is cancelled, or the
    /// caller drops it without draining it to completion.
    pub async fn generate_stream(
        &self,
        context: LLMCallContext,
        req: ChatStreamRequest,
        cancel: CancellationToken,
    ) -> Result<ChatStream, GatewayError> {
        let provider = self.model_client.provider().to_string();
        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.model_client.default_model().to_string());
        let estimated = estimate_usage(
            &provider,
            &model,
            total_message_chars(&req.messages),
            req.system.as_deref().map(str::len).unwrap_or(0),
        );

        self.admit(&context, &estimated).await?;
        let idempotency_key = materialize_idempotency_key(&context, &estimated);

        let upstream = self
            .model_client
            .create_chat_stream(req, cancel.clone())
            .await
            .map_err(GatewayError::model_invocation)?;

        let persisted = Arc::new(AtomicBool::new(false));
        let ledger = self.ledger.clone();
        let budget = self.budget.clone();
        let pricing = self.pricing.clone();

        let guard = StreamCommitGuard {
            persisted: persisted.clone(),
            context: context.clone(),
            estimated_usage: estimated.clone(),
            idempotency_key: idempotency_key.clone(),
            ledger: ledger.clone(),
            budget: budget.clone(),
            pricing: pricing.clone(),
        };

        let provider_for_stream = provider.clone();
        let model_for_stream = model.clone();
        let stream = try_stream! {
            let _guard = guard;
            futures::pin_mut!(upstream);
            while let Some(item) = upstream.next().await {
                let chunk = item?;
                if let StreamChunk::Done { finish_reason, usage } = &chunk {
                    if !persisted.swap(true, Ordering::SeqCst) {
                        let settled_usage = usage
                            .clone()
                            .map(|u| fill_defaults(u, &provider_for_stream, &model_for_stream))
                            .unwrap_or_else(|| estimated.clone());
                        if let Err(err) = commit(&ledger, &budget, &pricing, &context, &settled_usage, &idempotency_key).await {
                            tracing::error!(error = %err, "failed to settle streaming cost event");
                        }
                    }
                    yield StreamChunk::Done { finish_reason: finish_reason.clone(), usage: usage.clone() };
                    continue;
                }
                yield chunk;
            }
        };

        Ok(Box::pin(stream))
    }
}

async fn commit(
    ledger: &CostLedger,
    budget: &BudgetManager,
    pricing: &PricingResolver,
    context: &LLMCallContext,
    usage: &LLMUsage,
    idempotency_key: &str,
) -> anyhow::Result<()> {
    let resolved = pricing.resolve(usage, usage.raw.as_ref()).await;
    let event = CostEvent::new(
        idempotency_key,
        context.run_id.clone(),
        context.session_id.clone(),
        context.task_id.clone(),
        context.agent_type.clone(),
        context.phase,
        usage.provider.clone(),
        usage.model.clone(),
        usage.prompt_tokens,
        usage.completion_tokens,
        resolved.provider_cost_usd,
        resolved.calculated_cost_usd,
        resolved.pricing_source,
    );
    let appended = ledger.append(event).await?;
    if appended {
        budget.post_commit(context, resolved.calculated_cost_usd).await?;
    }
    Ok(())
}

/// Fallback commit for the case where the stream is dropped (cancelled,
/// errored, or simply abandoned) before a `Done` chunk ever arrives. Uses
/// the preflight estimate, biasing toward over-reporting rather than
/// silently losing the event.
struct StreamCommitGuard {
    persisted: Arc<AtomicBool>,
    context: LLMCallContext,
    estimated_usage: LLMUsage,
    idempotency_key: String,
    ledger: Arc<CostLedger>,
    budget: Arc<BudgetManager>,
    pricing: Arc<PricingResolver>,
}

impl Drop for StreamCommitGuard {
    fn drop(&mut self) {
        if self.persisted.swap(true, Ordering::SeqCst) {
            return;
        }
        let ledger = self.ledger.clone();
        let budget = self.budget.clone();
        let pricing = self.pricing.clone();
        let context = self.context.clone();
        let usage = self.estimated_usage.clone();
        let idempotency_key = self.idempotency_key.clone();
        tokio::spawn(async move {
            if let Err(err) = commit(&ledger, &budget, &pricing, &context, &usage, &idempotency_key).await {
                tracing::error!(error = %err, "failed to settle fallback streaming cost event");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cadence_ledger::InMemoryDurableStore;
    use cadence_pricing::PricingRegistry;
    use cadence_providers::{
        ChatMessage, GenerateStructuredResponse, GenerateTextResponse,
    };
    use cadence_types::{BudgetConfig, Phase, PricingEntry};

    struct DeterministicStubClient {
        provider: String,
        model: String,
        prompt_tokens: i64,
        completion_tokens: i64,
    }

    #[async_trait]
    impl ModelClient for DeterministicStubClient {
        fn provider(&self) -> &str {
            &self.provider
        }

        fn default_model(&self) -> &str {
            &self.model
        }

        async fn generate_text(
            &self,
            _req: GenerateTextRequest,
        ) -> anyhow::Result<GenerateTextResponse> {
            Ok(GenerateTextResponse {
                text: "stub response".to_string(),
                usage: LLMUsage {
                    provider: self.provider.clone(),
                    model: self.model.clone(),
                    prompt_tokens: self.prompt_tokens,
                    completion_tokens: self.completion_tokens,
                    total_tokens: None,
                    cost: None,
                    raw: None,
                },
            })
        }

        async fn generate_structured(
            &self,
            _req: GenerateStructuredRequest,
        ) -> anyhow::Result<GenerateStructuredResponse> {
            Ok(GenerateStructuredResponse {
                object: serde_json::json!({ "ok": true }),
                usage: LLMUsage {
                    provider: self.provider.clone(),
                    model: self.model.clone(),
                    prompt_tokens: self.prompt_tokens,
                    completion_tokens: self.completion_tokens,
                    total_tokens: None,
                    cost: None,
                    raw: None,
                },
            })
        }

        async fn create_chat_stream(
            &self,
            _req: ChatStreamRequest,
            _cancel: CancellationToken,
        ) -> anyhow::Result<ChatStream> {
            unimplemented!("not exercised by these tests")
        }
    }

    fn context(phase: Phase, task_id: Option<&str>) -> LLMCallContext {
        LLMCallContext {
            run_id: "run-1".to_string(),
            session_id: "session-1".to_string(),
            task_id: task_id.map(|s| s.to_string()),
            agent_type: "planner".to_string(),
            phase,
            idempotency_key: None,
        }
    }

    async fn gateway_with(
        client: DeterministicStubClient,
        budget_config: BudgetConfig,
    ) -> (LLMGateway, Arc<CostLedger>) {
        let store = Arc::new(InMemoryDurableStore::new());
        let ledger = Arc::new(CostLedger::new(store.clone()));
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
        let resolver = Arc::new(PricingResolver::new(
            registry.clone(),
            cadence_types::UnknownPricingMode::Block,
        ));
        let budget = Arc::new(BudgetManager::new(
            budget_config,
            ledger.clone(),
            registry,
            store,
        ));
        let gateway = LLMGateway::new(Arc::new(client), ledger.clone(), budget, resolver);
        (gateway, ledger)
    }

    fn text_request() -> GenerateTextRequest {
        GenerateTextRequest {
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "hello there".to_string(),
            }],
            model: None,
            temperature: None,
            system: None,
        }
    }

    #[tokio::test]
    async fn three_phase_cost_coverage() {
        let client = DeterministicStubClient {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            prompt_tokens: 120,
            completion_tokens: 60,
        };
        let (gateway, ledger) = gateway_with(client, BudgetConfig::default()).await;

        for phase in [Phase::Planning, Phase::Task, Phase::Synthesis] {
            gateway
                .generate_text(context(phase, Some("t1")), text_request())
                .await
                .expect("call succeeds");
        }

        let snapshot = ledger.aggregate("run-1").await.unwrap();
        assert_eq!(snapshot.event_count, 3);
        assert!((snapshot.total_cost - 0.0045).abs() < 1e-6);
        for cost in [0.0015_f64, 0.0015, 0.0015] {
            let _ = cost;
        }
    }

    #[tokio::test]
    async fn budget_denial_leaves_ledger_empty() {
        let client = DeterministicStubClient {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            prompt_tokens: 120,
            completion_tokens: 60,
        };
        let (gateway, ledger) = gateway_with(
            client,
            BudgetConfig {
                max_cost_per_run: 0.00001,
                max_cost_per_session: 20.0,
                warning_threshold: 0.8,
            },
        )
        .await;

        let err = gateway
            .generate_text(context(Phase::Planning, None), text_request())
            .await
            .expect_err("budget should deny the call");
        assert!(matches!(err, GatewayError::Budget(_)));

        let events = ledger.get_events("run-1").await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn unknown_pricing_blocks_and_writes_no_event() {
        let client = DeterministicStubClient {
            provider: "unknown".to_string(),
            model: "unseeded-model".to_string(),
            prompt_tokens: 10,
            completion_tokens: 10,
        };
        let (gateway, ledger) = gateway_with(client, BudgetConfig::default()).await;

        let err = gateway
            .generate_text(context(Phase::Planning, None), text_request())
            .await
            .expect_err("unknown pricing should block in fail-closed mode");
        assert!(matches!(err, GatewayError::UnknownPricing { .. }));

        let events = ledger.get_events("run-1").await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn idempotent_replay_keeps_single_event() {
        let client = DeterministicStubClient {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            prompt_tokens: 120,
            completion_tokens: 60,
        };
        let (gateway, ledger) = gateway_with(client, BudgetConfig::default()).await;

        let ctx = LLMCallContext {
            run_id: "run-1".to_string(),
            session_id: "session-1".to_string(),
            task_id: Some("t1".to_string()),
            agent_type: "planner".to_string(),
            phase: Phase::Task,
            idempotency_key: Some("fixed-key".to_string()),
        };

        gateway
            .generate_text(ctx.clone(), text_request())
            .await
            .unwrap();
        gateway.generate_text(ctx, text_request()).await.unwrap();

        let events = ledger.get_events("run-1").await.unwrap();
        assert_eq!(events.len(), 1);
    }
}
