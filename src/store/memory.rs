//! In-process store for tests.

use super::{most_recent_completed, ProcessLogStore, SystemStore};
use crate::error::{CoreError, CoreResult};
use crate::models::{ProcessLogPatch, ProcessLogRecord, ProcessScope, System};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{Mutex, RwLock};

/// Systems and process logs held in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    systems: RwLock<HashMap<String, System>>,
    logs: Mutex<Vec<ProcessLogRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store seeded with systems, keyed by their ids.
    pub fn with_systems(systems: impl IntoIterator<Item = System>) -> Self {
        let map = systems.into_iter().map(|s| (s.id.clone(), s)).collect();
        Self {
            systems: RwLock::new(map),
            logs: Mutex::new(Vec::new()),
        }
    }

    /// Every process log record, in insertion order.
    pub async fn records(&self) -> Vec<ProcessLogRecord> {
        self.logs.lock().await.clone()
    }
}

#[async_trait]
impl SystemStore for MemoryStore {
    async fn get(&self, id: &str) -> CoreResult<System> {
        self.systems
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("system '{}'", id)))
    }

    async fn put(&self, id: &str, system: &System) -> CoreResult<()> {
        self.systems
            .write()
            .await
            .insert(id.to_string(), system.clone());
        Ok(())
    }
}

#[async_trait]
impl ProcessLogStore for MemoryStore {
    async fn insert(&self, record: ProcessLogRecord) -> CoreResult<String> {
        let id = record.id.clone();
        self.logs.lock().await.push(record);
        Ok(id)
    }

    async fn update(&self, id: &str, patch: &ProcessLogPatch) -> CoreResult<ProcessLogRecord> {
        let mut logs = self.logs.lock().await;
        let record = logs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| CoreError::not_found(format!("process log '{}'", id)))?;
        record.apply(patch);
        Ok(record.clone())
    }

    async fn get(&self, id: &str) -> CoreResult<ProcessLogRecord> {
        self.logs
            .lock()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("process log '{}'", id)))
    }

    async fn select_recent(
        &self,
        scope: ProcessScope,
        n: usize,
    ) -> CoreResult<Vec<ProcessLogRecord>> {
        let logs = self.logs.lock().await;
        Ok(most_recent_completed(&logs, scope, n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProcessStatus;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_get_missing_system() {
        let store = MemoryStore::new();
        assert!(matches!(
            SystemStore::get(&store, "nope").await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = MemoryStore::new();
        let system = System {
            id: "a".to_string(),
            name: "A".to_string(),
            ..System::default()
        };
        store.put("a", &system).await.unwrap();
        assert_eq!(SystemStore::get(&store, "a").await.unwrap(), system);
    }

    #[tokio::test]
    async fn test_select_recent_filters_and_orders() {
        let store = MemoryStore::new();
        let now = Utc::now();

        for i in 0..4 {
            let mut record = ProcessLogRecord::start(ProcessScope::Batch, "s", "u", 10);
            record.ended_at = Some(now - Duration::minutes(i));
            record.status = if i == 2 {
                ProcessStatus::Aborted
            } else {
                ProcessStatus::Completed
            };
            record.processed_indicators = i as usize;
            store.insert(record).await.unwrap();
        }
        let mut single = ProcessLogRecord::start(ProcessScope::Single, "s", "u", 1);
        single.status = ProcessStatus::Completed;
        store.insert(single).await.unwrap();

        let recent = store.select_recent(ProcessScope::Batch, 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].processed_indicators, 0);
        assert_eq!(recent[1].processed_indicators, 1);
    }

    #[tokio::test]
    async fn test_update_unknown_log() {
        let store = MemoryStore::new();
        let result = store.update("missing", &ProcessLogPatch::processed(1)).await;
        assert!(matches!(result, Err(CoreError::NotFound(_))));
    }
}
