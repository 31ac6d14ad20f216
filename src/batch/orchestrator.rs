//! Bounded-concurrency AI batch runner.
//!
//! One driver task keeps up to `concurrency` gateway calls in flight,
//! applies each result to a working copy of the system as it completes,
//! and refills free slots until the work list is exhausted or an abort is
//! seen in the process log. The working copy has a single writer (the
//! driver), and patches target disjoint slots.

use crate::agent::{Calculation, CalculationContext, CalculationGateway, GatewayError};
use crate::analysis::recompute;
use crate::batch::progress::{emit, BatchEvent, BatchState, BatchSummary, ItemFailure, Progress};
use crate::error::{CoreError, CoreResult};
use crate::models::{ProcessLogPatch, ProcessStatus, System};
use crate::scanner::WorkItem;
use crate::store::{ProcessLogStore, SystemStore};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Configuration for batch runs.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum in-flight gateway calls.
    pub concurrency: usize,
    /// Upper bound on a single gateway call.
    pub task_timeout: Duration,
    /// When false every batch is refused.
    pub ai_enabled: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            task_timeout: Duration::from_secs(180),
            ai_enabled: true,
        }
    }
}

/// Input of one batch run.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub system_id: String,
    pub system: System,
    pub work: Vec<WorkItem>,
    pub process_log_id: String,
    /// Overrides the configured concurrency.
    pub concurrency: Option<usize>,
}

/// Drives gateway calls for a work list.
pub struct BatchOrchestrator {
    gateway: Arc<dyn CalculationGateway>,
    systems: Arc<dyn SystemStore>,
    logs: Arc<dyn ProcessLogStore>,
    config: BatchConfig,
}

impl BatchOrchestrator {
    pub fn new(
        gateway: Arc<dyn CalculationGateway>,
        systems: Arc<dyn SystemStore>,
        logs: Arc<dyn ProcessLogStore>,
        config: BatchConfig,
    ) -> Self {
        Self {
            gateway,
            systems,
            logs,
            config,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Check that a batch may start and resolve its concurrency.
    pub fn check_runnable(&self, concurrency: Option<usize>) -> CoreResult<usize> {
        if !self.config.ai_enabled {
            return Err(CoreError::validation("AI calculation is disabled"));
        }
        let concurrency = concurrency.unwrap_or(self.config.concurrency);
        if concurrency == 0 {
            return Err(CoreError::validation("concurrency must be at least 1"));
        }
        Ok(concurrency)
    }

    /// Run a batch to completion or abort.
    ///
    /// Validation and missing process logs fail before anything is
    /// dispatched. The process log start time is restamped when dispatch
    /// begins. Gateway failures are recorded in the summary. A failure
    /// to persist the final system fails the run and marks the process log
    /// `error`.
    pub async fn run(
        &self,
        job: BatchJob,
        events: &mpsc::UnboundedSender<BatchEvent>,
    ) -> CoreResult<BatchSummary> {
        let started = Instant::now();
        let BatchJob {
            system_id,
            system,
            work,
            process_log_id,
            concurrency,
        } = job;

        let concurrency = self.check_runnable(concurrency)?;

        let snapshot = Arc::new(system);
        let contexts = build_contexts(&snapshot, work)?;
        let total = contexts.len();

        let mut summary = BatchSummary::new(process_log_id.clone(), total);
        let mut state = BatchState::Idle;

        self.logs
            .update(
                &process_log_id,
                &ProcessLogPatch {
                    started_at: Some(Utc::now()),
                    total_indicators: Some(total),
                    ..ProcessLogPatch::default()
                },
            )
            .await?;
        transition(&mut state, BatchState::Scheduled);

        info!(
            system = %system_id,
            process_log = %process_log_id,
            total,
            concurrency,
            "Starting AI batch"
        );

        let mut working = (*snapshot).clone();
        let mut pending = contexts.into_iter().peekable();
        let mut in_flight = FuturesUnordered::new();
        let mut processed = 0usize;
        transition(&mut state, BatchState::Running);

        loop {
            while state == BatchState::Running
                && in_flight.len() < concurrency
                && pending.peek().is_some()
            {
                if self.abort_requested(&process_log_id).await {
                    info!(
                        process_log = %process_log_id,
                        processed,
                        in_flight = in_flight.len(),
                        "Abort requested, no further dispatch"
                    );
                    transition(&mut state, BatchState::Aborted);
                    break;
                }
                if let Some(ctx) = pending.next() {
                    debug!(item = %ctx.item, "Dispatching");
                    in_flight.push(self.dispatch(ctx));
                }
            }

            let Some((ctx, result)) = in_flight.next().await else {
                break;
            };

            processed += 1;
            self.apply_result(&mut working, &ctx, result, &mut summary);

            if let Err(e) = self
                .logs
                .update(&process_log_id, &ProcessLogPatch::processed(processed))
                .await
            {
                warn!("Failed to record progress for {}: {}", process_log_id, e);
            }

            let step = ctx.step();
            emit(
                events,
                BatchEvent::Progress(Progress::new(
                    processed,
                    total,
                    ctx.item.key,
                    step.name.clone(),
                    ctx.intervention().name.clone(),
                )),
            );
        }

        // An abort can land after the last dispatch
        if state == BatchState::Running && self.abort_requested(&process_log_id).await {
            info!(process_log = %process_log_id, processed, "Abort requested after last dispatch");
            transition(&mut state, BatchState::Aborted);
        }
        if state == BatchState::Running {
            transition(&mut state, BatchState::Completed);
        }
        summary.processed = processed;

        let finalized = recompute(&working);
        if let Err(e) = self.systems.put(&system_id, &finalized).await {
            error!("Failed to persist system {}: {}", system_id, e);
            transition(&mut state, BatchState::Error);
            let patch = ProcessLogPatch {
                error: Some(e.to_string()),
                ..ProcessLogPatch::finish(ProcessStatus::Error, processed)
            };
            if let Err(log_err) = self.logs.update(&process_log_id, &patch).await {
                warn!("Failed to mark {} as error: {}", process_log_id, log_err);
            }
            emit(
                events,
                BatchEvent::Error {
                    message: e.to_string(),
                },
            );
            return Err(e);
        }

        let final_status = if state == BatchState::Aborted {
            ProcessStatus::Aborted
        } else {
            ProcessStatus::Completed
        };
        if let Err(e) = self
            .logs
            .update(
                &process_log_id,
                &ProcessLogPatch::finish(final_status, processed),
            )
            .await
        {
            warn!("Failed to finalize {}: {}", process_log_id, e);
        }

        summary.state = state;
        summary.duration_seconds = started.elapsed().as_secs_f64();

        info!(
            process_log = %process_log_id,
            state = %state,
            processed,
            calculated = summary.calculated_count,
            not_applicable = summary.not_applicable_count,
            errors = summary.error_count,
            "AI batch finished"
        );

        emit(events, BatchEvent::Complete(summary.clone()));
        Ok(summary)
    }

    /// One gateway call bounded by the task timeout.
    fn dispatch(
        &self,
        ctx: CalculationContext,
    ) -> impl Future<Output = (CalculationContext, Result<Calculation, GatewayError>)> {
        let gateway = Arc::clone(&self.gateway);
        let timeout = self.config.task_timeout;

        async move {
            let result = match tokio::time::timeout(timeout, gateway.compute(&ctx)).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout(timeout.as_secs())),
            };
            (ctx, result)
        }
    }

    /// Patch the working copy with one result and tally it.
    fn apply_result(
        &self,
        working: &mut System,
        ctx: &CalculationContext,
        result: Result<Calculation, GatewayError>,
        summary: &mut BatchSummary,
    ) {
        let item = ctx.item;

        match result {
            Ok(calculation) => {
                let status = calculation.status;
                if let Some(intervention) =
                    working.intervention_mut(item.step_index, item.intervention_index)
                {
                    let entry = intervention.values.entry_mut(item.key);
                    if entry.is_user() && entry.has_value() {
                        debug!(item = %item, "Keeping user value");
                    } else {
                        calculation.apply_to(entry);
                    }
                }
                summary.record_success(item.key, status);
            }
            Err(e) => {
                warn!(item = %item, "Calculation failed: {}", e);
                summary.record_failure(ItemFailure {
                    item,
                    step_name: ctx.step().name.clone(),
                    intervention_name: ctx.intervention().name.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    /// Whether the persisted process log was flipped to `aborted`.
    async fn abort_requested(&self, process_log_id: &str) -> bool {
        match self.logs.get(process_log_id).await {
            Ok(record) => record.status == ProcessStatus::Aborted,
            Err(e) => {
                warn!("Cannot read process log {}: {}", process_log_id, e);
                false
            }
        }
    }
}

fn transition(state: &mut BatchState, next: BatchState) {
    debug!("Batch state {} -> {}", state, next);
    *state = next;
}

/// Validate every item against the snapshot and drop duplicates.
fn build_contexts(snapshot: &Arc<System>, work: Vec<WorkItem>) -> CoreResult<Vec<CalculationContext>> {
    let mut seen = HashSet::new();
    let mut contexts = Vec::with_capacity(work.len());

    for item in work {
        if !seen.insert(item) {
            debug!(item = %item, "Skipping duplicate work item");
            continue;
        }
        contexts.push(CalculationContext::new(Arc::clone(snapshot), item)?);
    }

    Ok(contexts)
}
