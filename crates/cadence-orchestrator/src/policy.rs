use cadence_types::TaskType;

/// Optional, off-by-default authorization layer gating which task types a
/// run may dispatch and how much dispatch concurrency it is allowed. Absent
/// a policy, every declared `TaskType` is permitted and concurrency defaults
/// to the engine's own `max_concurrent_tasks`.
#[derive(Debug, Clone, Default)]
pub struct TaskPolicy {
    pub allowed_task_types: Option<Vec<TaskType>>,
    pub max_concurrent_tasks: Option<u32>,
}

impl TaskPolicy {
    pub fn permits(&self, task_type: TaskType) -> bool {
        match &self.allowed_task_types {
            Some(allowed) => allowed.contains(&task_type),
            None => true,
        }
    }

    /// Tightens `engine_default` to the policy's own cap, if it has one and
    /// it's lower. Never raises the engine's own bound.
    pub fn effective_concurrency(&self, engine_default: usize) -> usize {
        match self.max_concurrent_tasks {
            Some(cap) => engine_default.min(cap as usize).max(1),
            None => engine_default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_allowlist_permits_everything() {
        let policy = TaskPolicy::default();
        assert!(policy.permits(TaskType::Shell));
    }

    #[test]
    fn allowlist_restricts_task_types() {
        let policy = TaskPolicy {
            allowed_task_types: Some(vec![TaskType::Analyze, TaskType::Review]),
            max_concurrent_tasks: None,
        };
        assert!(policy.permits(TaskType::Review));
        assert!(!policy.permits(TaskType::Shell));
    }

    #[test]
    fn absent_cap_keeps_engine_default() {
        let policy = TaskPolicy::default();
        assert_eq!(policy.effective_concurrency(4), 4);
    }

    #[test]
    fn cap_only_tightens_never_loosens() {
        let policy = TaskPolicy {
            allowed_task_types: None,
            max_concurrent_tasks: Some(2),
        };
        assert_eq!(policy.effective_concurrency(4), 2);
        assert_eq!(policy.effective_concurrency(1), 1);
    }
}
