//! Operations exposed to front ends.
//!
//! `IndicatorService` ties the stores, the gateway and the batch
//! orchestrator together. Every operation loads the system from the store,
//! works on a copy and writes the whole document back.

use crate::agent::{CalculationContext, CalculationGateway, GatewayError};
use crate::analysis::recompute;
use crate::batch::{
    BatchConfig, BatchEvent, BatchJob, BatchOrchestrator, BatchSummary, TimeEstimator,
};
use crate::error::{CoreError, CoreResult};
use crate::indicators::{IndicatorKey, IndicatorRegistry};
use crate::models::{
    ProcessLogPatch, ProcessLogRecord, ProcessScope, ProcessStatus, System, ValueEntry,
};
use crate::scanner::{scan, ScanCounts, WorkItem};
use crate::store::{ProcessLogStore, SystemStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Settings shared by all service operations.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Indicators the gateway may fill.
    pub registry: IndicatorRegistry,
    pub batch: BatchConfig,
    pub estimator: TimeEstimator,
}

/// What a batch would do, returned before it starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPlan {
    pub process_log_id: String,
    pub counts: ScanCounts,
    pub seconds_per_indicator: f64,
    pub gap_fill_seconds: f64,
    pub full_recompute_seconds: f64,
}

/// Parameters of a batch run.
#[derive(Debug, Clone, Default)]
pub struct BatchRequest {
    pub system_id: String,
    /// Record created by `prepare_batch`; a new one is created when absent.
    pub process_log_id: Option<String>,
    pub user_id: String,
    /// Recompute every non-user slot instead of filling gaps only.
    pub recalculate_all: bool,
    pub concurrency: Option<usize>,
}

/// Address of a single indicator slot.
#[derive(Debug, Clone)]
pub struct SlotRequest {
    pub system_id: String,
    pub step_index: usize,
    pub intervention_index: usize,
    pub key: IndicatorKey,
    pub user_id: String,
}

impl SlotRequest {
    fn item(&self) -> WorkItem {
        WorkItem {
            step_index: self.step_index,
            intervention_index: self.intervention_index,
            key: self.key,
        }
    }
}

/// Core facade over stores, gateway and orchestrator.
pub struct IndicatorService {
    systems: Arc<dyn SystemStore>,
    logs: Arc<dyn ProcessLogStore>,
    gateway: Arc<dyn CalculationGateway>,
    orchestrator: BatchOrchestrator,
    registry: IndicatorRegistry,
    estimator: TimeEstimator,
}

impl IndicatorService {
    pub fn new(
        systems: Arc<dyn SystemStore>,
        logs: Arc<dyn ProcessLogStore>,
        gateway: Arc<dyn CalculationGateway>,
        config: ServiceConfig,
    ) -> Self {
        let orchestrator = BatchOrchestrator::new(
            Arc::clone(&gateway),
            Arc::clone(&systems),
            Arc::clone(&logs),
            config.batch,
        );
        Self {
            systems,
            logs,
            gateway,
            orchestrator,
            registry: config.registry,
            estimator: config.estimator,
        }
    }

    /// Store a system document after recomputing its aggregates.
    pub async fn import_system(&self, system: System) -> CoreResult<System> {
        if system.id.trim().is_empty() {
            return Err(CoreError::validation("system id is empty"));
        }
        let system = recompute(&system);
        self.systems.put(&system.id, &system).await?;
        info!(system = %system.id, steps = system.steps.len(), "Imported system");
        Ok(system)
    }

    /// Parse a JSON system document and import it. Unknown indicator keys
    /// and malformed documents are validation errors.
    pub async fn import_json(&self, document: &str) -> CoreResult<System> {
        let system: System = serde_json::from_str(document)
            .map_err(|e| CoreError::validation(format!("invalid system document: {}", e)))?;
        self.import_system(system).await
    }

    pub async fn system(&self, system_id: &str) -> CoreResult<System> {
        self.systems.get(system_id).await
    }

    /// Most recent completed batch on `system_id`.
    pub async fn last_batch(&self, system_id: &str) -> CoreResult<Option<ProcessLogRecord>> {
        let recent = self
            .logs
            .select_recent(ProcessScope::Batch, usize::MAX)
            .await?;
        Ok(recent.into_iter().find(|r| r.system_id == system_id))
    }

    /// Scan a system, estimate both batch modes and open a process log.
    pub async fn prepare_batch(&self, system_id: &str, user_id: &str) -> CoreResult<BatchPlan> {
        self.ensure_ai_enabled()?;
        let system = self.systems.get(system_id).await?;
        let counts = scan(&system, &self.registry).counts();
        let estimate = self
            .estimator
            .estimate_from_store(self.logs.as_ref(), counts)
            .await?;

        let record = ProcessLogRecord::start(
            ProcessScope::Batch,
            system_id,
            user_id,
            counts.without_value,
        );
        let process_log_id = self.logs.insert(record).await?;

        info!(
            system = %system_id,
            process_log = %process_log_id,
            without_value = counts.without_value,
            all_calculable = counts.all_calculable,
            "Prepared batch"
        );

        Ok(BatchPlan {
            process_log_id,
            counts,
            seconds_per_indicator: estimate.seconds_per_indicator,
            gap_fill_seconds: estimate.gap_fill_seconds,
            full_recompute_seconds: estimate.full_recompute_seconds,
        })
    }

    /// Run a gap-fill or full-recompute batch.
    ///
    /// A prepared record that was aborted before the run is `Aborted`;
    /// any other finished record is rejected.
    pub async fn run_batch(
        &self,
        request: BatchRequest,
        events: &mpsc::UnboundedSender<BatchEvent>,
    ) -> CoreResult<BatchSummary> {
        self.orchestrator.check_runnable(request.concurrency)?;
        let system = self.systems.get(&request.system_id).await?;
        let work = scan(&system, &self.registry).select(request.recalculate_all);

        let process_log_id = match request.process_log_id {
            Some(id) => {
                let record = self.logs.get(&id).await?;
                if record.system_id != request.system_id {
                    return Err(CoreError::validation(format!(
                        "process log {} belongs to system '{}'",
                        id, record.system_id
                    )));
                }
                if record.status == ProcessStatus::Aborted {
                    return Err(CoreError::Aborted(format!(
                        "process log {} was aborted before it started",
                        id
                    )));
                }
                if record.status.is_terminal() {
                    return Err(CoreError::validation(format!(
                        "process log {} is already {}",
                        id, record.status
                    )));
                }
                id
            }
            None => {
                let record = ProcessLogRecord::start(
                    ProcessScope::Batch,
                    &request.system_id,
                    &request.user_id,
                    work.len(),
                );
                self.logs.insert(record).await?
            }
        };

        let job = BatchJob {
            system_id: request.system_id,
            system,
            work,
            process_log_id,
            concurrency: request.concurrency,
        };
        self.orchestrator.run(job, events).await
    }

    /// Flag a running batch as aborted. Finished records are returned
    /// unchanged.
    pub async fn abort_batch(&self, process_log_id: &str) -> CoreResult<ProcessLogRecord> {
        let record = self.logs.get(process_log_id).await?;
        if record.status != ProcessStatus::Started {
            info!(
                process_log = %process_log_id,
                status = %record.status,
                "Abort ignored, process already finished"
            );
            return Ok(record);
        }

        let record = self
            .logs
            .update(
                process_log_id,
                &ProcessLogPatch {
                    status: Some(ProcessStatus::Aborted),
                    ended_at: Some(chrono::Utc::now()),
                    ..ProcessLogPatch::default()
                },
            )
            .await?;
        info!(process_log = %process_log_id, "Abort requested");
        Ok(record)
    }

    /// Estimate one indicator and persist the result.
    pub async fn compute_one(&self, request: SlotRequest) -> CoreResult<ValueEntry> {
        self.calculate_slot(request, None).await
    }

    /// Continue the conversation of one indicator with a user message.
    pub async fn refine_one(
        &self,
        request: SlotRequest,
        user_message: &str,
    ) -> CoreResult<ValueEntry> {
        if user_message.trim().is_empty() {
            return Err(CoreError::validation("refinement message is empty"));
        }
        self.calculate_slot(request, Some(user_message)).await
    }

    /// Recompute every aggregate of a stored system.
    pub async fn recompute_totals(&self, system_id: &str) -> CoreResult<System> {
        let system = self.systems.get(system_id).await?;
        let updated = recompute(&system);
        self.systems.put(system_id, &updated).await?;
        Ok(updated)
    }

    fn ensure_ai_enabled(&self) -> CoreResult<()> {
        if self.orchestrator.config().ai_enabled {
            Ok(())
        } else {
            Err(CoreError::validation("AI calculation is disabled"))
        }
    }

    async fn calculate_slot(
        &self,
        request: SlotRequest,
        user_message: Option<&str>,
    ) -> CoreResult<ValueEntry> {
        self.ensure_ai_enabled()?;
        if !self.registry.contains(request.key) {
            return Err(CoreError::validation(format!(
                "indicator '{}' is not AI-calculable",
                request.key
            )));
        }

        let system = Arc::new(self.systems.get(&request.system_id).await?);
        let item = request.item();
        let ctx = CalculationContext::new(Arc::clone(&system), item)?;

        let mut record = ProcessLogRecord::start(
            ProcessScope::Single,
            &request.system_id,
            &request.user_id,
            1,
        );
        record.indicator = Some(request.key);
        let process_log_id = self.logs.insert(record).await?;

        let timeout = self.orchestrator.config().task_timeout;
        let call = async {
            match user_message {
                Some(message) => {
                    let prior = ctx
                        .current_entry()
                        .map(|e| e.conversation.clone())
                        .unwrap_or_default();
                    self.gateway.refine(&ctx, &prior, message).await
                }
                None => self.gateway.compute(&ctx).await,
            }
        };
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(timeout.as_secs())),
        };

        let calculation = match result {
            Ok(calculation) => calculation,
            Err(e) => {
                warn!(item = %item, "Calculation failed: {}", e);
                self.fail_log(&process_log_id, &e.to_string()).await;
                return Err(e.into());
            }
        };

        let mut working = (*system).clone();
        let entry = match working.intervention_mut(item.step_index, item.intervention_index) {
            Some(intervention) => {
                let entry = intervention.values.entry_mut(item.key);
                calculation.apply_to(entry);
                entry.clone()
            }
            None => {
                return Err(CoreError::not_found(format!("intervention at {}", item)));
            }
        };

        let updated = recompute(&working);
        if let Err(e) = self.systems.put(&request.system_id, &updated).await {
            self.fail_log(&process_log_id, &e.to_string()).await;
            return Err(e);
        }

        if let Err(e) = self
            .logs
            .update(
                &process_log_id,
                &ProcessLogPatch::finish(ProcessStatus::Completed, 1),
            )
            .await
        {
            warn!("Failed to finalize {}: {}", process_log_id, e);
        }

        info!(item = %item, status = %entry.status, "Indicator calculated");
        Ok(entry)
    }

    async fn fail_log(&self, process_log_id: &str, message: &str) {
        let patch = ProcessLogPatch {
            error: Some(message.to_string()),
            ..ProcessLogPatch::finish(ProcessStatus::Error, 0)
        };
        if let Err(e) = self.logs.update(process_log_id, &patch).await {
            warn!("Failed to mark {} as error: {}", process_log_id, e);
        }
    }
}
