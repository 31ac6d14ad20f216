//! File-backed store.
//!
//! Layout under the data directory:
//!
//! ```text
//! <data_dir>/systems/<system_id>.json
//! <data_dir>/process_log.json
//! ```
//!
//! Every write goes to a temporary sibling file that is then renamed over
//! the target, so a failed write leaves the previous document intact.

use super::{most_recent_completed, ProcessLogStore, SystemStore};
use crate::error::{CoreError, CoreResult};
use crate::models::{ProcessLogPatch, ProcessLogRecord, ProcessScope, System};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

const SYSTEMS_DIR: &str = "systems";
const PROCESS_LOG_FILE: &str = "process_log.json";

/// JSON documents under a data directory.
#[derive(Debug)]
pub struct JsonStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles on the process log file.
    log_lock: Mutex<()>,
}

impl JsonStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> CoreResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(SYSTEMS_DIR))
            .await
            .map_err(|e| {
                CoreError::persistence(format!("cannot create {}: {}", root.display(), e))
            })?;

        Ok(Self {
            root,
            log_lock: Mutex::new(()),
        })
    }

    fn system_path(&self, id: &str) -> CoreResult<PathBuf> {
        validate_id(id)?;
        Ok(self.root.join(SYSTEMS_DIR).join(format!("{}.json", id)))
    }

    fn log_path(&self) -> PathBuf {
        self.root.join(PROCESS_LOG_FILE)
    }

    async fn read_logs(&self) -> CoreResult<Vec<ProcessLogRecord>> {
        Ok(read_json(&self.log_path()).await?.unwrap_or_default())
    }

    async fn write_logs(&self, logs: &[ProcessLogRecord]) -> CoreResult<()> {
        write_json(&self.log_path(), &logs).await
    }
}

/// Ids become file names, so keep them to a safe alphabet.
fn validate_id(id: &str) -> CoreResult<()> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(CoreError::validation(format!("invalid system id '{}'", id)))
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> CoreResult<Option<T>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CoreError::persistence(format!(
                "failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };

    serde_json::from_str(&content).map(Some).map_err(|e| {
        CoreError::persistence(format!("failed to parse {}: {}", path.display(), e))
    })
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> CoreResult<()> {
    let content = serde_json::to_string_pretty(value)
        .map_err(|e| CoreError::persistence(format!("failed to serialize document: {}", e)))?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await.map_err(|e| {
        CoreError::persistence(format!("failed to write {}: {}", tmp.display(), e))
    })?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| {
        CoreError::persistence(format!("failed to replace {}: {}", path.display(), e))
    })?;

    debug!("Wrote {}", path.display());
    Ok(())
}

#[async_trait]
impl SystemStore for JsonStore {
    async fn get(&self, id: &str) -> CoreResult<System> {
        let path = self.system_path(id)?;
        read_json(&path)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("system '{}'", id)))
    }

    async fn put(&self, id: &str, system: &System) -> CoreResult<()> {
        let path = self.system_path(id)?;
        write_json(&path, system).await
    }
}

#[async_trait]
impl ProcessLogStore for JsonStore {
    async fn insert(&self, record: ProcessLogRecord) -> CoreResult<String> {
        let _guard = self.log_lock.lock().await;
        let mut logs = self.read_logs().await?;
        let id = record.id.clone();
        logs.push(record);
        self.write_logs(&logs).await?;
        Ok(id)
    }

    async fn update(&self, id: &str, patch: &ProcessLogPatch) -> CoreResult<ProcessLogRecord> {
        let _guard = self.log_lock.lock().await;
        let mut logs = self.read_logs().await?;
        let record = logs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| CoreError::not_found(format!("process log '{}'", id)))?;
        record.apply(patch);
        let updated = record.clone();
        self.write_logs(&logs).await?;
        Ok(updated)
    }

    async fn get(&self, id: &str) -> CoreResult<ProcessLogRecord> {
        self.read_logs()
            .await?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| CoreError::not_found(format!("process log '{}'", id)))
    }

    async fn select_recent(
        &self,
        scope: ProcessScope,
        n: usize,
    ) -> CoreResult<Vec<ProcessLogRecord>> {
        let logs = self.read_logs().await?;
        Ok(most_recent_completed(&logs, scope, n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::IndicatorKey;
    use crate::models::{ProcessStatus, Step, ValueEntry};
    use tempfile::TempDir;

    fn system(id: &str) -> System {
        let mut step = Step {
            name: "Wheat".to_string(),
            ..Step::default()
        };
        step.values
            .insert(ValueEntry::user(IndicatorKey::RendementTms, 7.0));
        System {
            id: id.to_string(),
            name: "Test".to_string(),
            surface: 5.0,
            steps: vec![step],
            ..System::default()
        }
    }

    #[tokio::test]
    async fn test_system_round_trip_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonStore::open(temp_dir.path()).await.unwrap();

        store.put("sys-1", &system("sys-1")).await.unwrap();
        let loaded = SystemStore::get(&store, "sys-1").await.unwrap();
        assert_eq!(loaded, system("sys-1"));
        assert!(temp_dir.path().join("systems/sys-1.json").exists());
        assert!(!temp_dir.path().join("systems/sys-1.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_and_invalid_ids() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonStore::open(temp_dir.path()).await.unwrap();

        assert!(matches!(
            SystemStore::get(&store, "absent").await,
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(
            SystemStore::get(&store, "../etc/passwd").await,
            Err(CoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_document_is_a_persistence_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonStore::open(temp_dir.path()).await.unwrap();
        std::fs::write(temp_dir.path().join("systems/bad.json"), "{ not json").unwrap();

        assert!(matches!(
            SystemStore::get(&store, "bad").await,
            Err(CoreError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn test_process_log_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonStore::open(temp_dir.path()).await.unwrap();

        let record = ProcessLogRecord::start(ProcessScope::Batch, "sys-1", "alice", 12);
        let id = store.insert(record).await.unwrap();

        store
            .update(&id, &ProcessLogPatch::processed(5))
            .await
            .unwrap();
        let done = store
            .update(&id, &ProcessLogPatch::finish(ProcessStatus::Completed, 12))
            .await
            .unwrap();
        assert_eq!(done.status, ProcessStatus::Completed);

        let reopened = JsonStore::open(temp_dir.path()).await.unwrap();
        let loaded = ProcessLogStore::get(&reopened, &id).await.unwrap();
        assert_eq!(loaded.processed_indicators, 12);

        let recent = reopened
            .select_recent(ProcessScope::Batch, 5)
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
    }
}
