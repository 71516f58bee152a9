use thiserror::Error;

use crate::plan_validation::PlanValidationError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    PlanValidation(#[from] PlanValidationError),
    #[error("task `{task_id}` failed: {detail}")]
    TaskExecution { task_id: String, detail: String },
    #[error("ledger integrity failure for run `{run_id}`: {detail}")]
    LedgerIntegrity { run_id: String, detail: String },
}
