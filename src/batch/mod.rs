//! AI batch calculation: orchestration, progress events and estimates.

pub mod estimator;
pub mod orchestrator;
pub mod progress;

pub use estimator::{format_duration, TimeEstimator};
pub use orchestrator::{BatchConfig, BatchJob, BatchOrchestrator};
pub use progress::{BatchEvent, BatchState, BatchSummary};
