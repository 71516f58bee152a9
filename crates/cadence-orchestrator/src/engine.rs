use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cadence_gateway::GatewayError;
use cadence_ledger::{BudgetError, LedgerError};
use cadence_types::{
    BlockedReason, Run, RunStatus, SerializedTask, Task, TaskResult, TaskStatus,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, HistoryTurn, PlanRequest, SynthesizeRequest, TaskContext};
use crate::errors::EngineError;
use crate::event_bus::{EventBus, RunLifecycleEvent};
use crate::plan_validation::validate_plan;
use crate::policy::TaskPolicy;

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub session_id: String,
    pub agent_type: String,
    pub correlation_id: Option<String>,
    pub prompt: String,
    pub history: Vec<HistoryTurn>,
}

/// The terminal state of a run, returned whether it completed, failed, or
/// was blocked — only a join failure inside the dispatch loop surfaces as
/// an `Err` from `RunEngine::run`.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: Run,
    pub task_results: Vec<TaskResult>,
    pub synthesis: Option<String>,
}

/// Per-run plan/execute/synthesize state machine. One `RunEngine` instance
/// drives exactly one run to a terminal state; it holds no cross-run state
/// of its own (the gateway it calls through owns the ledger and budget
/// accounting).
pub struct RunEngine {
    agent: Arc<dyn Agent>,
    events: EventBus,
    max_concurrent_tasks: usize,
    policy: Option<TaskPolicy>,
}

impl RunEngine {
    pub fn new(
        agent: Arc<dyn Agent>,
        events: EventBus,
        max_concurrent_tasks: usize,
        policy: Option<TaskPolicy>,
    ) -> Self {
        let max_concurrent_tasks = max_concurrent_tasks.max(1);
        let max_concurrent_tasks = match &policy {
            Some(policy) => policy.effective_concurrency(max_concurrent_tasks),
            None => max_concurrent_tasks,
        };
        Self {
            agent,
            events,
            max_concurrent_tasks,
            policy,
        }
    }

    pub async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunOutcome> {
        let mut run = Run::new(request.session_id.clone(), request.agent_type.clone());
        run.correlation_id = request.correlation_id.clone();
        run.status = RunStatus::Planning;

        self.events.publish(RunLifecycleEvent::PlanningStarted {
            run_id: run.run_id.clone(),
        });

        let plan = match self
            .agent
            .plan(PlanRequest {
                run_id: run.run_id.clone(),
                session_id: run.session_id.clone(),
                prompt: request.prompt.clone(),
                history: request.history.clone(),
            })
            .await
        {
            Ok(plan) => plan,
            Err(err) => return Ok(self.fail_or_block(run, err, Vec::new())),
        };

        if let Err(validation_err) = validate_plan(&plan) {
            let engine_err = EngineError::from(validation_err);
            run.status = RunStatus::Failed;
            self.events.publish(RunLifecycleEvent::RunFailed {
                run_id: run.run_id.clone(),
                reason: engine_err.to_string(),
            });
            return Ok(RunOutcome {
                run,
                task_results: Vec::new(),
                synthesis: None,
            });
        }

        self.events.publish(RunLifecycleEvent::PlanningEnded {
            run_id: run.run_id.clone(),
        });

        run.status = RunStatus::Executing;

        let by_id: HashMap<String, Task> = plan
            .tasks
            .iter()
            .cloned()
            .map(|t| (t.id.clone(), t))
            .collect();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for task in &plan.tasks {
            for dep in &task.depends_on {
                dependents.entry(dep.clone()).or_default().push(task.id.clone());
            }
        }

        let mut results: HashMap<String, TaskResult> = HashMap::new();
        let mut ordered_results: Vec<TaskResult> = Vec::new();
        let mut running: HashSet<String> = HashSet::new();
        let mut join_set: JoinSet<(String, anyhow::Result<TaskResult>)> = JoinSet::new();
        let mut any_failed = false;
        let mut blocked_reason: Option<BlockedReason> = None;

        loop {
            let accepting = blocked_reason.is_none() && !any_failed && !cancel.is_cancelled();
            if accepting {
                loop {
                    if running.len() >= self.max_concurrent_tasks {
                        break;
                    }
                    let next = by_id
                        .values()
                        .filter(|t| !running.contains(&t.id) && !results.contains_key(&t.id))
                        .filter(|t| {
                            t.depends_on.iter().all(|dep| {
                                matches!(results.get(dep), Some(r) if r.status == TaskStatus::Done)
                            })
                        })
                        .min_by(|a, b| a.id.cmp(&b.id))
                        .cloned();
                    let Some(task) = next else { break };

                    if let Some(policy) = &self.policy {
                        if !policy.permits(task.task_type) {
                            any_failed = true;
                            let result = TaskResult::failed(
                                task.id.clone(),
                                format!("task type `{:?}` denied by policy", task.task_type),
                            );
                            self.absorb(&task.id, result, &dependents, &mut results, &mut ordered_results);
                            continue;
                        }
                    }

                    running.insert(task.id.clone());
                    self.events.publish(RunLifecycleEvent::TaskStarted {
                        run_id: run.run_id.clone(),
                        task_id: task.id.clone(),
                    });

                    let agent = self.agent.clone();
                    let ctx = TaskContext {
                        run_id: run.run_id.clone(),
                        session_id: run.session_id.clone(),
                        dependencies: task
                            .depends_on
                            .iter()
                            .filter_map(|dep| results.get(dep).cloned())
                            .collect(),
                    };
                    let task_id = task.id.clone();
                    join_set.spawn(async move {
                        let outcome = agent.execute_task(task, ctx).await;
                        (task_id, outcome)
                    });
                }
            }

            if running.is_empty() {
                break;
            }

            let joined = match join_set.join_next().await {
                Some(joined) => joined,
                None => break,
            };
            let (task_id, outcome) =
                joined.map_err(|err| anyhow::anyhow!("task `{}` panicked: {err}", "join"))?;
            running.remove(&task_id);
            self.events.publish(RunLifecycleEvent::TaskEnded {
                run_id: run.run_id.clone(),
                task_id: task_id.clone(),
            });

            match outcome {
                Ok(result) => {
                    if results.contains_key(&task_id) {
                        tracing::warn!(task_id = %task_id, "duplicate task result ignored");
                        continue;
                    }
                    if result.status == TaskStatus::Failed {
                        any_failed = true;
                    }
                    self.absorb(&task_id, result, &dependents, &mut results, &mut ordered_results);
                }
                Err(err) => match classify_blocking_error(&err) {
                    Some(reason) => blocked_reason = Some(reason),
                    None => {
                        any_failed = true;
                        let detail = describe_task_failure(&task_id, &run.run_id, &err);
                        let result = TaskResult::failed(task_id.clone(), detail);
                        self.absorb(&task_id, result, &dependents, &mut results, &mut ordered_results);
                    }
                },
            }
        }

        if any_failed {
            run.status = RunStatus::Failed;
            self.events.publish(RunLifecycleEvent::RunFailed {
                run_id: run.run_id.clone(),
                reason: "one or more tasks failed".to_string(),
            });
            return Ok(RunOutcome {
                run,
                task_results: ordered_results,
                synthesis: None,
            });
        }

        if cancel.is_cancelled() && blocked_reason.is_none() {
            blocked_reason = Some(BlockedReason::Cancelled);
        }

        if let Some(reason) = blocked_reason {
            run.status = RunStatus::Blocked;
            run.blocked_reason = Some(reason.clone());
            self.events.publish(RunLifecycleEvent::RunBlocked {
                run_id: run.run_id.clone(),
                reason,
            });
            return Ok(RunOutcome {
                run,
                task_results: ordered_results,
                synthesis: None,
            });
        }

        run.status = RunStatus::Synthesizing;
        self.events.publish(RunLifecycleEvent::SynthesizingStarted {
            run_id: run.run_id.clone(),
        });

        let serialized: Vec<SerializedTask> = ordered_results
            .iter()
            .filter_map(|result| {
                by_id.get(&result.task_id).map(|task| SerializedTask {
                    task: task.clone(),
                    result: result.clone(),
                })
            })
            .collect();

        let synth_outcome = self
            .agent
            .synthesize(SynthesizeRequest {
                run_id: run.run_id.clone(),
                session_id: run.session_id.clone(),
                completed_tasks: serialized,
                original_prompt: request.prompt,
            })
            .await;

        match synth_outcome {
            Ok(text) => {
                run.status = RunStatus::Completed;
                self.events.publish(RunLifecycleEvent::SynthesizingEnded {
                    run_id: run.run_id.clone(),
                });
                self.events.publish(RunLifecycleEvent::RunCompleted {
                    run_id: run.run_id.clone(),
                });
                Ok(RunOutcome {
                    run,
                    task_results: ordered_results,
                    synthesis: Some(text),
                })
            }
            Err(err) => Ok(self.fail_or_block(run, err, ordered_results)),
        }
    }

    fn absorb(
        &self,
        task_id: &str,
        result: TaskResult,
        dependents: &HashMap<String, Vec<String>>,
        results: &mut HashMap<String, TaskResult>,
        ordered_results: &mut Vec<TaskResult>,
    ) {
        let failed = result.status == TaskStatus::Failed;
        results.insert(task_id.to_string(), result.clone());
        ordered_results.push(result);
        if failed {
            cascade_skip(task_id, dependents, results, ordered_results);
        }
    }

    fn fail_or_block(
        &self,
        mut run: Run,
        err: anyhow::Error,
        task_results: Vec<TaskResult>,
    ) -> RunOutcome {
        if let Some(reason) = classify_blocking_error(&err) {
            run.status = RunStatus::Blocked;
            run.blocked_reason = Some(reason.clone());
            self.events.publish(RunLifecycleEvent::RunBlocked {
                run_id: run.run_id.clone(),
                reason,
            });
        } else {
            run.status = RunStatus::Failed;
            self.events.publish(RunLifecycleEvent::RunFailed {
                run_id: run.run_id.clone(),
                reason: err.to_string(),
            });
        }
        RunOutcome {
            run,
            task_results,
            synthesis: None,
        }
    }
}

fn cascade_skip(
    failed_id: &str,
    dependents: &HashMap<String, Vec<String>>,
    results: &mut HashMap<String, TaskResult>,
    ordered_results: &mut Vec<TaskResult>,
) {
    let mut stack = vec![failed_id.to_string()];
    while let Some(id) = stack.pop() {
        let Some(children) = dependents.get(&id) else {
            continue;
        };
        for child in children {
            if !results.contains_key(child) {
                let skipped = TaskResult::skipped(child.clone());
                results.insert(child.clone(), skipped.clone());
                ordered_results.push(skipped);
                stack.push(child.clone());
            }
        }
    }
}

/// Builds the recorded failure detail for a task whose execution returned
/// an error. A `LedgerError` surfacing through the task boundary (the
/// agent's durable store is corrupt or mid-write) is recorded as a ledger
/// integrity failure rather than an ordinary task error, so the two causes
/// stay distinguishable in the run's history.
fn describe_task_failure(task_id: &str, run_id: &str, err: &anyhow::Error) -> String {
    match err.downcast_ref::<LedgerError>() {
        Some(ledger_err) => EngineError::LedgerIntegrity {
            run_id: run_id.to_string(),
            detail: ledger_err.to_string(),
        }
        .to_string(),
        None => EngineError::TaskExecution {
            task_id: task_id.to_string(),
            detail: err.to_string(),
        }
        .to_string(),
    }
}

/// Maps gateway-level admission failures to a run's `blocked` reason. Any
/// other error (model invocation failure, task-internal error) is a normal
/// failure, not a block.
fn classify_blocking_error(err: &anyhow::Error) -> Option<BlockedReason> {
    match err.downcast_ref::<GatewayError>() {
        Some(GatewayError::Budget(BudgetError::BudgetExceeded { .. })) => {
            Some(BlockedReason::BudgetExceeded)
        }
        Some(GatewayError::Budget(BudgetError::SessionBudgetExceeded { .. })) => {
            Some(BlockedReason::SessionBudgetExceeded)
        }
        Some(GatewayError::UnknownPricing { .. }) => Some(BlockedReason::UnknownPricing),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cadence_types::{Capability, Plan, PlanMetadata, TaskType};
    use std::sync::Mutex;

    struct StubAgent {
        plan: Plan,
        fail_task: Option<String>,
    }

    #[async_trait]
    impl Agent for StubAgent {
        fn agent_type(&self) -> &str {
            "stub"
        }

        async fn plan(&self, _req: PlanRequest) -> anyhow::Result<Plan> {
            Ok(self.plan.clone())
        }

        async fn execute_task(&self, task: Task, _ctx: TaskContext) -> anyhow::Result<TaskResult> {
            if self.fail_task.as_deref() == Some(task.id.as_str()) {
                return Ok(TaskResult::failed(task.id, "boom"));
            }
            Ok(TaskResult::done(task.id, serde_json::json!({"ok": true})))
        }

        async fn synthesize(&self, req: SynthesizeRequest) -> anyhow::Result<String> {
            Ok(format!("{} tasks synthesized", req.completed_tasks.len()))
        }

        fn capabilities(&self) -> Vec<Capability> {
            vec![]
        }
    }

    fn task(id: &str, deps: &[&str]) -> Task {
        Task {
            id: id.to_string(),
            task_type: TaskType::Analyze,
            description: String::new(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            expected_output: None,
        }
    }

    fn request() -> RunRequest {
        RunRequest {
            session_id: "session-1".to_string(),
            agent_type: "stub".to_string(),
            correlation_id: None,
            prompt: "do the thing".to_string(),
            history: Vec::new(),
        }
    }

    #[tokio::test]
    async fn completes_a_simple_chain() {
        let plan = Plan {
            tasks: vec![task("t1", &[]), task("t2", &["t1"])],
            metadata: PlanMetadata::default(),
        };
        let engine = RunEngine::new(
            Arc::new(StubAgent { plan, fail_task: None }),
            EventBus::new(),
            1,
            None,
        );
        let outcome = engine.run(request(), CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.run.status, RunStatus::Completed);
        assert_eq!(outcome.task_results.len(), 2);
        assert_eq!(outcome.synthesis.unwrap(), "2 tasks synthesized");
    }

    #[tokio::test]
    async fn dependency_skip_on_failure() {
        let plan = Plan {
            tasks: vec![task("t1", &[]), task("t2", &["t1"]), task("t3", &["t2"])],
            metadata: PlanMetadata::default(),
        };
        let engine = RunEngine::new(
            Arc::new(StubAgent {
                plan,
                fail_task: Some("t1".to_string()),
            }),
            EventBus::new(),
            1,
            None,
        );
        let outcome = engine.run(request(), CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.run.status, RunStatus::Failed);
        assert!(outcome.synthesis.is_none());

        let by_id: HashMap<_, _> = outcome
            .task_results
            .into_iter()
            .map(|r| (r.task_id.clone(), r))
            .collect();
        assert_eq!(by_id["t1"].status, TaskStatus::Failed);
        assert_eq!(by_id["t2"].status, TaskStatus::Skipped);
        assert_eq!(by_id["t3"].status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn empty_plan_goes_straight_to_synthesis() {
        let plan = Plan {
            tasks: Vec::new(),
            metadata: PlanMetadata::default(),
        };
        let engine = RunEngine::new(
            Arc::new(StubAgent { plan, fail_task: None }),
            EventBus::new(),
            1,
            None,
        );
        let outcome = engine.run(request(), CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.run.status, RunStatus::Completed);
        assert!(outcome.task_results.is_empty());
        assert_eq!(outcome.synthesis.unwrap(), "0 tasks synthesized");
    }

    #[tokio::test]
    async fn invalid_plan_fails_without_executing_any_task() {
        let plan = Plan {
            tasks: vec![task("t1", &["ghost"])],
            metadata: PlanMetadata::default(),
        };
        let executed = Arc::new(Mutex::new(false));

        struct TrackingAgent {
            plan: Plan,
            executed: Arc<Mutex<bool>>,
        }

        #[async_trait]
        impl Agent for TrackingAgent {
            fn agent_type(&self) -> &str {
                "tracking"
            }
            async fn plan(&self, _req: PlanRequest) -> anyhow::Result<Plan> {
                Ok(self.plan.clone())
            }
            async fn execute_task(
                &self,
                task: Task,
                _ctx: TaskContext,
            ) -> anyhow::Result<TaskResult> {
                *self.executed.lock().unwrap() = true;
                Ok(TaskResult::done(task.id, serde_json::Value::Null))
            }
            async fn synthesize(&self, _req: SynthesizeRequest) -> anyhow::Result<String> {
                Ok("should not run".to_string())
            }
            fn capabilities(&self) -> Vec<Capability> {
                vec![]
            }
        }

        let engine = RunEngine::new(
            Arc::new(TrackingAgent {
                plan,
                executed: executed.clone(),
            }),
            EventBus::new(),
            1,
            None,
        );
        let outcome = engine.run(request(), CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.run.status, RunStatus::Failed);
        assert!(!*executed.lock().unwrap());
    }

    #[tokio::test]
    async fn task_errors_are_classified_by_cause() {
        struct ErroringAgent {
            plan: Plan,
        }

        #[async_trait]
        impl Agent for ErroringAgent {
            fn agent_type(&self) -> &str {
                "erroring"
            }
            async fn plan(&self, _req: PlanRequest) -> anyhow::Result<Plan> {
                Ok(self.plan.clone())
            }
            async fn execute_task(&self, task: Task, _ctx: TaskContext) -> anyhow::Result<TaskResult> {
                if task.id == "ledger-task" {
                    return Err(LedgerError::Integrity {
                        context: "run-x".to_string(),
                        detail: "truncated event file".to_string(),
                    }
                    .into());
                }
                Err(anyhow::anyhow!("model unreachable"))
            }
            async fn synthesize(&self, _req: SynthesizeRequest) -> anyhow::Result<String> {
                Ok("should not run".to_string())
            }
            fn capabilities(&self) -> Vec<Capability> {
                vec![]
            }
        }

        let plan = Plan {
            tasks: vec![task("ledger-task", &[])],
            metadata: PlanMetadata::default(),
        };
        let engine = RunEngine::new(Arc::new(ErroringAgent { plan }), EventBus::new(), 1, None);
        let outcome = engine.run(request(), CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.run.status, RunStatus::Failed);
        let result = &outcome.task_results[0];
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error.as_deref().unwrap_or_default().contains("ledger integrity"));

        let plan = Plan {
            tasks: vec![task("other-task", &[])],
            metadata: PlanMetadata::default(),
        };
        let engine = RunEngine::new(Arc::new(ErroringAgent { plan }), EventBus::new(), 1, None);
        let outcome = engine.run(request(), CancellationToken::new()).await.unwrap();
        let result = &outcome.task_results[0];
        assert!(result.error.as_deref().unwrap_or_default().contains("model unreachable"));
    }
}
