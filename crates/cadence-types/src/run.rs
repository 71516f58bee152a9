use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The class of an LLM call a run makes on the way to a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Task,
    Synthesis,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Task => "task",
            Phase::Synthesis => "synthesis",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Planning,
    Executing,
    Synthesizing,
    Completed,
    Failed,
    Blocked,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Blocked
        )
    }
}

/// Reason a run landed in the terminal `blocked` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedReason {
    BudgetExceeded,
    SessionBudgetExceeded,
    UnknownPricing,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub session_id: String,
    pub agent_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<BlockedReason>,
}

impl Run {
    pub fn new(session_id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            agent_type: agent_type.into(),
            correlation_id: None,
            created_at: Utc::now(),
            status: RunStatus::Pending,
            blocked_reason: None,
        }
    }
}

/// The call context threaded through every gateway invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMCallContext {
    pub run_id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub agent_type: String,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}
