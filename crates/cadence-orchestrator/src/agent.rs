use async_trait::async_trait;
use cadence_types::{Capability, Plan, SerializedTask, Task, TaskResult};

/// Prior conversation turns supplied to `Agent::plan`, oldest first.
#[derive(Debug, Clone, Default)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub run_id: String,
    pub session_id: String,
    pub prompt: String,
    pub history: Vec<HistoryTurn>,
}

#[derive(Debug, Clone)]
pub struct TaskContext {
    pub run_id: String,
    pub session_id: String,
    pub dependencies: Vec<TaskResult>,
}

#[derive(Debug, Clone)]
pub struct SynthesizeRequest {
    pub run_id: String,
    pub session_id: String,
    pub completed_tasks: Vec<SerializedTask>,
    pub original_prompt: String,
}

/// An agent binding: the engine drives a run by calling `plan`, then
/// `execute_task` for every dispatched task, then `synthesize`. Every model
/// call an implementation makes on these paths must go through the gateway
/// injected at construction time, never directly against a `ModelClient`.
#[async_trait]
pub trait Agent: Send + Sync {
    fn agent_type(&self) -> &str;
    async fn plan(&self, req: PlanRequest) -> anyhow::Result<Plan>;
    async fn execute_task(&self, task: Task, ctx: TaskContext) -> anyhow::Result<TaskResult>;
    async fn synthesize(&self, req: SynthesizeRequest) -> anyhow::Result<String>;
    fn capabilities(&self) -> Vec<Capability>;
}
