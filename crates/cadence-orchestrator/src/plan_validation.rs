use std::collections::{HashMap, HashSet};

use cadence_types::Plan;
use thiserror::Error;

/// Invariant violations in a freshly emitted `Plan`, checked before a run is
/// allowed to leave the `planning` state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanValidationError {
    #[error("duplicate task id `{0}` in plan")]
    DuplicateTaskId(String),
    #[error("task `{task_id}` depends on unknown task `{dependency_id}`")]
    UnknownDependency {
        task_id: String,
        dependency_id: String,
    },
    #[error("dependency cycle detected, starting at task `{0}`")]
    CycleDetected(String),
}

/// Checks task-id uniqueness, that every `dependsOn` target exists in the
/// same plan, and that the dependency graph is acyclic.
pub fn validate_plan(plan: &Plan) -> Result<(), PlanValidationError> {
    let mut seen = HashSet::with_capacity(plan.tasks.len());
    for task in &plan.tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(PlanValidationError::DuplicateTaskId(task.id.clone()));
        }
    }

    let by_id: HashMap<&str, &cadence_types::Task> =
        plan.tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    for task in &plan.tasks {
        for dep in &task.depends_on {
            if !by_id.contains_key(dep.as_str()) {
                return Err(PlanValidationError::UnknownDependency {
                    task_id: task.id.clone(),
                    dependency_id: dep.clone(),
                });
            }
        }
    }

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    fn visit<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a cadence_types::Task>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<(), PlanValidationError> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(PlanValidationError::CycleDetected(id.to_string())),
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        if let Some(task) = by_id.get(id) {
            for dep in &task.depends_on {
                visit(dep, by_id, marks)?;
            }
        }
        marks.insert(id, Mark::Done);
        Ok(())
    }

    for task in &plan.tasks {
        visit(&task.id, &by_id, &mut marks)?;
    }

    Ok(())
}
