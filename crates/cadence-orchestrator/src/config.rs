/// Default dispatch concurrency: strict determinism, one task in flight at
/// a time. Raised via `MAX_CONCURRENT_TASKS` for independent branches.
const DEFAULT_MAX_CONCURRENT_TASKS: usize = 1;

pub fn max_concurrent_tasks_from_env() -> usize {
    match std::env::var("MAX_CONCURRENT_TASKS") {
        Ok(raw) => match raw.trim().parse::<usize>() {
            Ok(value) if value > 0 => value,
            _ => {
                tracing::warn!(
                    raw = %raw,
                    "MAX_CONCURRENT_TASKS is not a positive integer, defaulting to {}",
                    DEFAULT_MAX_CONCURRENT_TASKS
                );
                DEFAULT_MAX_CONCURRENT_TASKS
            }
        },
        Err(_) => DEFAULT_MAX_CONCURRENT_TASKS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_default_when_unset() {
        std::env::remove_var("MAX_CONCURRENT_TASKS");
        assert_eq!(max_concurrent_tasks_from_env(), DEFAULT_MAX_CONCURRENT_TASKS);
    }
}
