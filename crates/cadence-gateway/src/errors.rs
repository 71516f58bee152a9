use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Budget(#[from] cadence_ledger::BudgetError),
    #[error("pricing for {provider}:{model} is unknown and unknown-pricing mode is block")]
    UnknownPricing { provider: String, model: String },
    #[error("model invocation failed: {0}")]
    ModelInvocation(anyhow::Error),
}

impl GatewayError {
    pub fn model_invocation(err: anyhow::Error) -> Self {
        GatewayError::ModelInvocation(err)
    }
}
