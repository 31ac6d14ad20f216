//! Persistence seams for systems and process logs.
//!
//! Both stores are last-writer-wins document stores. `JsonStore` writes JSON
//! files under a data directory; the in-process `MemoryStore` backs tests.

pub mod json;
#[cfg(test)]
pub mod memory;

pub use json::JsonStore;
#[cfg(test)]
pub use memory::MemoryStore;

use crate::error::CoreResult;
use crate::models::{ProcessLogPatch, ProcessLogRecord, ProcessScope, System};
use async_trait::async_trait;

/// Whole-document storage of cropping systems.
#[async_trait]
pub trait SystemStore: Send + Sync {
    /// Load a system. Missing systems are `NotFound`.
    async fn get(&self, id: &str) -> CoreResult<System>;

    /// Replace the stored document.
    async fn put(&self, id: &str, system: &System) -> CoreResult<()>;
}

/// Storage of process log records.
#[async_trait]
pub trait ProcessLogStore: Send + Sync {
    /// Store a new record and return its id.
    async fn insert(&self, record: ProcessLogRecord) -> CoreResult<String>;

    /// Apply a patch and return the updated record.
    async fn update(&self, id: &str, patch: &ProcessLogPatch) -> CoreResult<ProcessLogRecord>;

    async fn get(&self, id: &str) -> CoreResult<ProcessLogRecord>;

    /// The `n` most recently finished `completed` records of `scope`.
    async fn select_recent(
        &self,
        scope: ProcessScope,
        n: usize,
    ) -> CoreResult<Vec<ProcessLogRecord>>;
}

/// Shared selection rule for `select_recent`.
pub(crate) fn most_recent_completed(
    records: &[ProcessLogRecord],
    scope: ProcessScope,
    n: usize,
) -> Vec<ProcessLogRecord> {
    let mut completed: Vec<_> = records
        .iter()
        .filter(|r| r.scope == scope && r.status == crate::models::ProcessStatus::Completed)
        .cloned()
        .collect();

    completed.sort_by_key(|r| std::cmp::Reverse(r.ended_at.unwrap_or(r.started_at)));
    completed.truncate(n);
    completed
}
