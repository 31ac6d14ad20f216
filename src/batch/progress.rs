//! Typed batch events and the terminal summary.

use crate::indicators::IndicatorKey;
use crate::models::Status;
use crate::scanner::WorkItem;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

/// Lifecycle of a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchState {
    Idle,
    Scheduled,
    Running,
    Completed,
    Aborted,
    Error,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchState::Idle => "idle",
            BatchState::Scheduled => "scheduled",
            BatchState::Running => "running",
            BatchState::Completed => "completed",
            BatchState::Aborted => "aborted",
            BatchState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Emitted after each finished work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
    pub current_indicator: IndicatorKey,
    pub step_name: String,
    pub intervention_name: String,
    pub percentage: f64,
}

impl Progress {
    pub fn new(
        current: usize,
        total: usize,
        current_indicator: IndicatorKey,
        step_name: impl Into<String>,
        intervention_name: impl Into<String>,
    ) -> Self {
        let percentage = if total == 0 {
            100.0
        } else {
            (current as f64 / total as f64) * 100.0
        };
        Self {
            current,
            total,
            current_indicator,
            step_name: step_name.into(),
            intervention_name: intervention_name.into(),
            percentage,
        }
    }
}

/// Per-indicator outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorTally {
    pub calculated: usize,
    pub not_applicable: usize,
    pub failed: usize,
}

/// A work item whose gateway call failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub item: WorkItem,
    pub step_name: String,
    pub intervention_name: String,
    pub error: String,
}

/// Terminal summary of a batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub process_log_id: String,
    pub state: BatchState,
    pub total: usize,
    pub processed: usize,
    pub calculated_count: usize,
    pub not_applicable_count: usize,
    pub error_count: usize,
    pub per_indicator: BTreeMap<IndicatorKey, IndicatorTally>,
    pub failures: Vec<ItemFailure>,
    pub duration_seconds: f64,
}

impl BatchSummary {
    pub fn new(process_log_id: impl Into<String>, total: usize) -> Self {
        Self {
            process_log_id: process_log_id.into(),
            state: BatchState::Idle,
            total,
            processed: 0,
            calculated_count: 0,
            not_applicable_count: 0,
            error_count: 0,
            per_indicator: BTreeMap::new(),
            failures: Vec::new(),
            duration_seconds: 0.0,
        }
    }

    /// Count a successful gateway result.
    pub fn record_success(&mut self, key: IndicatorKey, status: Status) {
        let tally = self.per_indicator.entry(key).or_default();
        if status == Status::NotApplicable {
            tally.not_applicable += 1;
            self.not_applicable_count += 1;
        } else {
            tally.calculated += 1;
            self.calculated_count += 1;
        }
    }

    /// Count a failed gateway call.
    pub fn record_failure(&mut self, failure: ItemFailure) {
        self.per_indicator.entry(failure.item.key).or_default().failed += 1;
        self.error_count += 1;
        self.failures.push(failure);
    }
}

/// Events sent to the caller while a batch runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum BatchEvent {
    Progress(Progress),
    Complete(BatchSummary),
    Error { message: String },
}

/// Send an event; a dropped receiver does not stop the batch.
pub fn emit(events: &mpsc::UnboundedSender<BatchEvent>, event: BatchEvent) {
    if events.send(event).is_err() {
        debug!("Progress receiver dropped, event discarded");
    }
}
