use tokio::sync::broadcast;

use cadence_types::BlockedReason;

/// Best-effort lifecycle notifications published by `RunEngine`. Subscriber
/// failure (a full or dropped channel) never affects run correctness.
#[derive(Debug, Clone)]
pub enum RunLifecycleEvent {
    PlanningStarted { run_id: String },
    PlanningEnded { run_id: String },
    TaskStarted { run_id: String, task_id: String },
    TaskEnded { run_id: String, task_id: String },
    SynthesizingStarted { run_id: String },
    SynthesizingEnded { run_id: String },
    RunCompleted { run_id: String },
    RunFailed { run_id: String, reason: String },
    RunBlocked { run_id: String, reason: BlockedReason },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunLifecycleEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunLifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: RunLifecycleEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(RunLifecycleEvent::PlanningStarted {
            run_id: "run-1".to_string(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, RunLifecycleEvent::PlanningStarted { run_id } if run_id == "run-1"));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(RunLifecycleEvent::RunCompleted {
            run_id: "run-1".to_string(),
        });
    }
}
