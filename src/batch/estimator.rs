//! Batch duration estimates from process log history.

use crate::error::CoreResult;
use crate::models::{ProcessLogRecord, ProcessScope};
use crate::scanner::ScanCounts;
use crate::store::ProcessLogStore;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Throughput-based estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeEstimator {
    /// How many recent completed runs to average over.
    pub history_window: usize,
    /// Used when no usable history exists.
    pub fallback_seconds_per_indicator: f64,
}

impl Default for TimeEstimator {
    fn default() -> Self {
        Self {
            history_window: 5,
            fallback_seconds_per_indicator: 4.0,
        }
    }
}

/// Estimated durations for both batch modes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DurationEstimate {
    pub seconds_per_indicator: f64,
    /// Whether the rate came from history rather than the fallback.
    pub from_history: bool,
    pub gap_fill_seconds: f64,
    pub full_recompute_seconds: f64,
}

impl TimeEstimator {
    /// `Σ duration / Σ processed` over finished records, `None` without
    /// usable history.
    pub fn seconds_per_indicator(&self, records: &[ProcessLogRecord]) -> Option<f64> {
        let (seconds, processed) = records
            .iter()
            .filter(|r| r.processed_indicators > 0)
            .filter_map(|r| r.duration_seconds().map(|d| (d, r.processed_indicators)))
            .fold((0.0, 0usize), |(s, p), (d, n)| (s + d, p + n));

        if processed == 0 {
            None
        } else {
            Some(seconds / processed as f64)
        }
    }

    /// Estimate both modes from the given history.
    pub fn estimate(&self, records: &[ProcessLogRecord], counts: ScanCounts) -> DurationEstimate {
        let (rate, from_history) = match self.seconds_per_indicator(records) {
            Some(rate) => (rate, true),
            None => (self.fallback_seconds_per_indicator, false),
        };

        DurationEstimate {
            seconds_per_indicator: rate,
            from_history,
            gap_fill_seconds: rate * counts.without_value as f64,
            full_recompute_seconds: rate * counts.all_calculable as f64,
        }
    }

    /// Read the recent batch history from `store` and estimate.
    pub async fn estimate_from_store(
        &self,
        store: &dyn ProcessLogStore,
        counts: ScanCounts,
    ) -> CoreResult<DurationEstimate> {
        let history = store
            .select_recent(ProcessScope::Batch, self.history_window)
            .await?;
        let estimate = self.estimate(&history, counts);
        debug!(
            runs = history.len(),
            rate = estimate.seconds_per_indicator,
            "Estimated batch duration"
        );
        Ok(estimate)
    }
}

/// Format seconds as `1h 02m`, `3m 20s` or `45s`.
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}h {:02}m", h, m)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}
