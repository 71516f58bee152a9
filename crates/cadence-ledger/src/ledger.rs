use std::collections::HashMap;
use std::sync::Arc;

use cadence_types::{CostEvent, CostSnapshot};
use tokio::sync::{Mutex, RwLock};

use crate::store::DurableStore;

/// Per-run append-only log of `CostEvent`s. Callers reach every mutation
/// through `append`, which acquires a run-scoped lock spanning the whole
/// read-check-write sequence so concurrent appends to the same run are
/// serialized while different runs proceed in parallel.
pub struct CostLedger {
    store: Arc<dyn DurableStore>,
    run_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl CostLedger {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            run_locks: RwLock::new(HashMap::new()),
        }
    }

    async fn lock_for_run(&self, run_id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.run_locks.read().await.get(run_id) {
            return lock.clone();
        }
        let mut locks = self.run_locks.write().await;
        locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Appends `event` to its run's log unless an event with the same
    /// `idempotency_key` is already indexed. Returns whether a new event
    /// was actually appended.
    pub async fn append(&self, event: CostEvent) -> anyhow::Result<bool> {
        let run_id = event.run_id.clone();
        let lock = self.lock_for_run(&run_id).await;
        let _guard = lock.lock().await;

        if self
            .store
            .has_idempotency_key(&run_id, &event.idempotency_key)
            .await?
        {
            tracing::debug!(
                run_id = %run_id,
                idempotency_key = %event.idempotency_key,
                "cost event already recorded, skipping duplicate append"
            );
            return Ok(false);
        }

        let mut events = self.store.get_events(&run_id).await?;
        let event_id = event.event_id.clone();
        let idempotency_key = event.idempotency_key.clone();
        events.push(event);
        self.store.put_events(&run_id, &events).await?;
        self.store
            .put_idempotency_key(&run_id, &idempotency_key, &event_id)
            .await?;
        Ok(true)
    }

    pub async fn get_events(&self, run_id: &str) -> anyhow::Result<Vec<CostEvent>> {
        self.store.get_events(run_id).await
    }

    /// Recomputes the snapshot fresh from the event list on every call —
    /// never cached.
    pub async fn aggregate(&self, run_id: &str) -> anyhow::Result<CostSnapshot> {
        let events = self.store.get_events(run_id).await?;
        Ok(CostSnapshot::from_events(run_id, &events))
    }

    pub async fn get_current_cost(&self, run_id: &str) -> anyhow::Result<f64> {
        Ok(self.aggregate(run_id).await?.total_cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDurableStore;
    use cadence_types::{Phase, PricingSource};

    fn event(run_id: &str, key: &str, cost: f64) -> CostEvent {
        CostEvent::new(
            key,
            run_id,
            "session-1",
            None,
            "planner",
            Phase::Planning,
            "openai",
            "gpt-4o",
            120,
            60,
            None,
            cost,
            PricingSource::Registry,
        )
    }

    #[tokio::test]
    async fn append_is_idempotent_by_key() {
        let ledger = CostLedger::new(Arc::new(InMemoryDurableStore::new()));
        let appended_first = ledger.append(event("run-1", "k1", 0.0015)).await.unwrap();
        let appended_second = ledger.append(event("run-1", "k1", 9.0)).await.unwrap();

        assert!(appended_first);
        assert!(!appended_second);
        let events = ledger.get_events("run-1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].calculated_cost_usd, 0.0015);
    }

    #[tokio::test]
    async fn aggregate_sums_events() {
        let ledger = CostLedger::new(Arc::new(InMemoryDurableStore::new()));
        ledger.append(event("run-1", "k1", 0.0015)).await.unwrap();
        ledger.append(event("run-1", "k2", 0.0030)).await.unwrap();

        let snapshot = ledger.aggregate("run-1").await.unwrap();
        assert_eq!(snapshot.event_count, 2);
        assert!((snapshot.total_cost - 0.0045).abs() < 1e-9);
        assert_eq!(snapshot.total_tokens, 360);

        assert_eq!(snapshot.by_model.len(), 1);
        assert_eq!(snapshot.by_model[0].provider, "openai");
        assert_eq!(snapshot.by_model[0].model, "gpt-4o");
        assert_eq!(snapshot.by_model[0].prompt_tokens, 240);
        assert_eq!(snapshot.by_model[0].completion_tokens, 120);
        assert_eq!(snapshot.by_provider.len(), 1);
        assert_eq!(snapshot.by_provider[0].provider, "openai");
        assert_eq!(snapshot.by_provider[0].total_tokens, 360);
    }

    #[tokio::test]
    async fn concurrent_appends_to_same_run_serialize() {
        let ledger = Arc::new(CostLedger::new(Arc::new(InMemoryDurableStore::new())));
        let mut handles = Vec::new();
        for i in 0..20 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .append(event("run-1", &format!("k{i}"), 0.001))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let snapshot = ledger.aggregate("run-1").await.unwrap();
        assert_eq!(snapshot.event_count, 20);
    }
}
