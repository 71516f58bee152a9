pub mod agent;
pub mod config;
pub mod engine;
pub mod errors;
pub mod event_bus;
pub mod plan_validation;
pub mod policy;

pub use agent::{Agent, HistoryTurn, PlanRequest, SynthesizeRequest, TaskContext};
pub use config::max_concurrent_tasks_from_env;
pub use engine::{RunEngine, RunOutcome, RunRequest};
pub use errors::EngineError;
pub use event_bus::{EventBus, RunLifecycleEvent};
pub use plan_validation::{validate_plan, PlanValidationError};
pub use policy::TaskPolicy;
