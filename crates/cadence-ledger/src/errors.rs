use thiserror::Error;

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("run {run_id} would reach ${projected:.4}, exceeding the per-run cap of ${cap:.4}")]
    BudgetExceeded {
        run_id: String,
        projected: f64,
        cap: f64,
    },
    #[error(
        "session {session_id} would reach ${projected:.4}, exceeding the per-session cap of ${cap:.4}"
    )]
    SessionBudgetExceeded {
        session_id: String,
        projected: f64,
        cap: f64,
    },
}

/// Surfaced when a durable store can't be trusted: a persisted table failed
/// to parse, or a partial write left it inconsistent. `context` names the
/// run, session, or backing file the failure was detected against.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger integrity error for {context}: {detail}")]
    Integrity { context: String, detail: String },
}
