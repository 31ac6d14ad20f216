//! The AI calculation seam.
//!
//! The orchestrator and the service only know about `CalculationGateway`;
//! the Ollama client is one implementation, tests use scripted fakes.

use crate::error::{CoreError, CoreResult};
use crate::models::{
    Confidence, ConversationMessage, IndicatorValue, Intervention, Status, Step, System,
    ValueEntry,
};
use crate::scanner::WorkItem;
use async_trait::async_trait;
use std::sync::Arc;

/// Failure of a single gateway call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("cannot connect to model server: {0}")]
    Connection(String),

    #[error("model server error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid model response: {0}")]
    InvalidResponse(String),

    #[error("AI calculation is disabled")]
    Disabled,
}

impl GatewayError {
    /// Errors worth another attempt.
    pub fn is_retriable(&self) -> bool {
        match self {
            GatewayError::Timeout(_) | GatewayError::Connection(_) => true,
            GatewayError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Free-text hints at each level of the hierarchy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssumptionHints {
    pub system: Option<String>,
    pub step: Option<String>,
    pub intervention: Option<String>,
}

impl AssumptionHints {
    pub fn is_empty(&self) -> bool {
        self.system.is_none() && self.step.is_none() && self.intervention.is_none()
    }
}

/// Everything a gateway needs to estimate one indicator.
#[derive(Debug, Clone)]
pub struct CalculationContext {
    pub system: Arc<System>,
    pub item: WorkItem,
    pub assumptions: AssumptionHints,
}

impl CalculationContext {
    /// Build a context, checking that the coordinates exist.
    pub fn new(system: Arc<System>, item: WorkItem) -> CoreResult<Self> {
        let step = system.step(item.step_index).ok_or_else(|| {
            CoreError::validation(format!(
                "step index {} out of range ({} steps)",
                item.step_index,
                system.steps.len()
            ))
        })?;
        let intervention = step.interventions.get(item.intervention_index).ok_or_else(|| {
            CoreError::validation(format!(
                "intervention index {} out of range ({} interventions in '{}')",
                item.intervention_index,
                step.interventions.len(),
                step.name
            ))
        })?;

        let assumptions = AssumptionHints {
            system: non_blank(system.assumptions.as_deref()),
            step: non_blank(step.assumptions.as_deref()),
            intervention: non_blank(intervention.assumptions.as_deref()),
        };

        Ok(Self {
            system,
            item,
            assumptions,
        })
    }

    pub fn step(&self) -> &Step {
        &self.system.steps[self.item.step_index]
    }

    pub fn intervention(&self) -> &Intervention {
        &self.step().interventions[self.item.intervention_index]
    }

    /// Current entry for the target slot, if any.
    pub fn current_entry(&self) -> Option<&ValueEntry> {
        self.intervention().values.get(self.item.key)
    }
}

fn non_blank(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

/// Result of a gateway call.
#[derive(Debug, Clone, PartialEq)]
pub struct Calculation {
    pub value: Option<IndicatorValue>,
    /// `ia` or `n/a`.
    pub status: Status,
    pub confidence: Option<Confidence>,
    /// Messages to append to the entry's conversation.
    pub conversation: Vec<ConversationMessage>,
    pub sources: Vec<String>,
}

impl Calculation {
    /// Write this result into an entry. Not-applicable results store 0 so
    /// the slot no longer counts as missing.
    pub fn apply_to(self, entry: &mut ValueEntry) {
        entry.value = match (self.status, self.value) {
            (Status::NotApplicable, None) => Some(IndicatorValue::Number(0.0)),
            (_, value) => value,
        };
        entry.status = self.status;
        entry.confidence = self.confidence;
        entry.append_conversation(self.conversation);
    }
}

/// Computes or refines one indicator value.
#[async_trait]
pub trait CalculationGateway: Send + Sync {
    /// Estimate the indicator addressed by `ctx`.
    async fn compute(&self, ctx: &CalculationContext) -> Result<Calculation, GatewayError>;

    /// Continue the conversation of an existing estimate.
    async fn refine(
        &self,
        ctx: &CalculationContext,
        prior: &[ConversationMessage],
        user_message: &str,
    ) -> Result<Calculation, GatewayError>;
}

/// Gateway used when AI calculation is switched off.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledGateway;

#[async_trait]
impl CalculationGateway for DisabledGateway {
    async fn compute(&self, _ctx: &CalculationContext) -> Result<Calculation, GatewayError> {
        Err(GatewayError::Disabled)
    }

    async fn refine(
        &self,
        _ctx: &CalculationContext,
        _prior: &[ConversationMessage],
        _user_message: &str,
    ) -> Result<Calculation, GatewayError> {
        Err(GatewayError::Disabled)
    }
}
