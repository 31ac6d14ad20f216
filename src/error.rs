//! Error taxonomy of the indicator engine.

use crate::agent::GatewayError;

/// Errors surfaced by the core operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Bad ids, indices or arguments. No side effects happened.
    #[error("validation error: {0}")]
    Validation(String),

    /// A system, intervention or process log record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// AI gateway failure or timeout.
    #[error("upstream error: {0}")]
    Upstream(#[from] GatewayError),

    /// Store read or write failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The process was cancelled by the user before it could run.
    #[error("aborted: {0}")]
    Aborted(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        CoreError::NotFound(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        CoreError::Persistence(msg.into())
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
