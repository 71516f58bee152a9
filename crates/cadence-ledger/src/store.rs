use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cadence_types::CostEvent;
use tokio::fs;
use tokio::sync::RwLock;

use crate::errors::LedgerError;

/// Parses a persisted JSON table, surfacing a corrupt or truncated file as
/// a typed integrity error instead of silently falling back to empty state.
fn parse_table<T: serde::de::DeserializeOwned>(
    raw: &str,
    file_name: &str,
) -> Result<T, LedgerError> {
    serde_json::from_str(raw).map_err(|err| LedgerError::Integrity {
        context: file_name.to_string(),
        detail: err.to_string(),
    })
}

/// Storage contract the ledger and budget manager are built against.
/// Instances are conceptually scoped per run, but a single implementation
/// may multiplex many runs behind its own keying.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get_events(&self, run_id: &str) -> anyhow::Result<Vec<CostEvent>>;
    async fn put_events(&self, run_id: &str, events: &[CostEvent]) -> anyhow::Result<()>;
    async fn has_idempotency_key(&self, run_id: &str, key: &str) -> anyhow::Result<bool>;
    async fn put_idempotency_key(
        &self,
        run_id: &str,
        key: &str,
        event_id: &str,
    ) -> anyhow::Result<()>;
    async fn get_session_total(&self, session_id: &str) -> anyhow::Result<f64>;
    async fn put_session_total(&self, session_id: &str, total: f64) -> anyhow::Result<()>;
}

#[derive(Default)]
struct MemoryState {
    events: HashMap<String, Vec<CostEvent>>,
    idempotency: HashMap<String, HashMap<String, String>>,
    session_totals: HashMap<String, f64>,
}

/// In-process `DurableStore`, used by tests and by callers that don't need
/// cross-process durability.
#[derive(Default)]
pub struct InMemoryDurableStore {
    state: RwLock<MemoryState>,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn get_events(&self, run_id: &str) -> anyhow::Result<Vec<CostEvent>> {
        Ok(self
            .state
            .read()
            .await
            .events
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn put_events(&self, run_id: &str, events: &[CostEvent]) -> anyhow::Result<()> {
        self.state
            .write()
            .await
            .events
            .insert(run_id.to_string(), events.to_vec());
        Ok(())
    }

    async fn has_idempotency_key(&self, run_id: &str, key: &str) -> anyhow::Result<bool> {
        Ok(self
            .state
            .read()
            .await
            .idempotency
            .get(run_id)
            .map(|keys| keys.contains_key(key))
            .unwrap_or(false))
    }

    async fn put_idempotency_key(
        &self,
        run_id: &str,
        key: &str,
        event_id: &str,
    ) -> anyhow::Result<()> {
        self.state
            .write()
            .await
            .idempotency
            .entry(run_id.to_string())
            .or_default()
            .insert(key.to_string(), event_id.to_string());
        Ok(())
    }

    async fn get_session_total(&self, session_id: &str) -> anyhow::Result<f64> {
        Ok(self
            .state
            .read()
            .await
            .session_totals
            .get(session_id)
            .copied()
            .unwrap_or(0.0))
    }

    async fn put_session_total(&self, session_id: &str, total: f64) -> anyhow::Result<()> {
        self.state
            .write()
            .await
            .session_totals
            .insert(session_id.to_string(), total);
        Ok(())
    }
}

/// JSON-file-backed `DurableStore`, one directory tree per root. Mirrors the
/// in-memory table under a `RwLock` and flushes the whole table to disk on
/// every write — simple and correct, not optimized for write throughput.
pub struct FileDurableStore {
    base: PathBuf,
    events: RwLock<HashMap<String, Vec<CostEvent>>>,
    idempotency: RwLock<HashMap<String, HashMap<String, String>>>,
    session_totals: RwLock<HashMap<String, f64>>,
}

impl FileDurableStore {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;

        let events_path = base.join("cost_events.json");
        let events = if events_path.exists() {
            let raw = fs::read_to_string(&events_path).await?;
            parse_table(&raw, "cost_events.json")?
        } else {
            HashMap::new()
        };

        let idempotency_path = base.join("cost_idempotency.json");
        let idempotency = if idempotency_path.exists() {
            let raw = fs::read_to_string(&idempotency_path).await?;
            parse_table(&raw, "cost_idempotency.json")?
        } else {
            HashMap::new()
        };

        let sessions_path = base.join("session_totals.json");
        let session_totals = if sessions_path.exists() {
            let raw = fs::read_to_string(&sessions_path).await?;
            parse_table(&raw, "session_totals.json")?
        } else {
            HashMap::new()
        };

        Ok(Self {
            base,
            events: RwLock::new(events),
            idempotency: RwLock::new(idempotency),
            session_totals: RwLock::new(session_totals),
        })
    }

    async fn flush_events(&self) -> anyhow::Result<()> {
        let snapshot = self.events.read().await.clone();
        let payload = serde_json::to_string_pretty(&snapshot)?;
        fs::write(self.base.join("cost_events.json"), payload).await?;
        Ok(())
    }

    async fn flush_idempotency(&self) -> anyhow::Result<()> {
        let snapshot = self.idempotency.read().await.clone();
        let payload = serde_json::to_string_pretty(&snapshot)?;
        fs::write(self.base.join("cost_idempotency.json"), payload).await?;
        Ok(())
    }

    async fn flush_session_totals(&self) -> anyhow::Result<()> {
        let snapshot = self.session_totals.read().await.clone();
        let payload = serde_json::to_string_pretty(&snapshot)?;
        fs::write(self.base.join("session_totals.json"), payload).await?;
        Ok(())
    }
}

#[async_trait]
impl DurableStore for FileDurableStore {
    async fn get_events(&self, run_id: &str) -> anyhow::Result<Vec<CostEvent>> {
        Ok(self
            .events
            .read()
            .await
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn put_events(&self, run_id: &str, events: &[CostEvent]) -> anyhow::Result<()> {
        self.events
            .write()
            .await
            .insert(run_id.to_string(), events.to_vec());
        self.flush_events().await
    }

    async fn has_idempotency_key(&self, run_id: &str, key: &str) -> anyhow::Result<bool> {
        Ok(self
            .idempotency
            .read()
            .await
            .get(run_id)
            .map(|keys| keys.contains_key(key))
            .unwrap_or(false))
    }

    async fn put_idempotency_key(
        &self,
        run_id: &str,
        key: &str,
        event_id: &str,
    ) -> anyhow::Result<()> {
        self.idempotency
            .write()
            .await
            .entry(run_id.to_string())
            .or_default()
            .insert(key.to_string(), event_id.to_string());
        self.flush_idempotency().await
    }

    async fn get_session_total(&self, session_id: &str) -> anyhow::Result<f64> {
        Ok(self
            .session_totals
            .read()
            .await
            .get(session_id)
            .copied()
            .unwrap_or(0.0))
    }

    async fn put_session_total(&self, session_id: &str, total: f64) -> anyhow::Result<()> {
        self.session_totals
            .write()
            .await
            .insert(session_id.to_string(), total);
        self.flush_session_totals().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::{Phase, PricingSource};

    fn sample_event(run_id: &str, key: &str) -> CostEvent {
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
            0.0015,
            PricingSource::Registry,
        )
    }

    #[tokio::test]
    async fn in_memory_store_round_trips_events() {
        let store = InMemoryDurableStore::new();
        let event = sample_event("run-1", "k1");
        store.put_events("run-1", &[event]).await.unwrap();
        let events = store.get_events("run-1").await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileDurableStore::new(dir.path()).await.unwrap();
            let event = sample_event("run-1", "k1");
            store.put_events("run-1", &[event]).await.unwrap();
            store
                .put_idempotency_key("run-1", "k1", "event-1")
                .await
                .unwrap();
            store.put_session_total("session-1", 0.0015).await.unwrap();
        }

        let reopened = FileDurableStore::new(dir.path()).await.unwrap();
        assert_eq!(reopened.get_events("run-1").await.unwrap().len(), 1);
        assert!(reopened
            .has_idempotency_key("run-1", "k1")
            .await
            .unwrap());
        assert_eq!(reopened.get_session_total("session-1").await.unwrap(), 0.0015);
    }

    #[tokio::test]
    async fn corrupt_events_file_surfaces_as_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("cost_events.json"), b"not json")
            .await
            .unwrap();

        let err = FileDurableStore::new(dir.path()).await.unwrap_err();
        let ledger_err = err.downcast_ref::<LedgerError>().expect("typed integrity error");
        assert!(matches!(ledger_err, LedgerError::Integrity { context, .. } if context == "cost_events.json"));
    }
}
