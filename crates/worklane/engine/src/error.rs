use thiserror::Error;
use worklane_escrow::GatewayError;
use worklane_storage::StorageError;
use worklane_types::Denial;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// User-facing failure taxonomy for the lifecycle engine.
///
/// Authorization and precondition failures are expected, frequent outcomes;
/// they are returned as values and the operation they belong to mutates
/// nothing.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("forbidden: {0}")]
    Forbidden(#[from] Denial),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("escrow gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("orphan escrow event: no payment matches hold {0}")]
    OrphanEvent(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable code for the API layer.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Forbidden(_) => "FORBIDDEN",
            EngineError::InvalidState(_) => "INVALID_STATE",
            EngineError::InvalidTransition(_) => "INVALID_TRANSITION",
            EngineError::Validation(_) => "VALIDATION",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Conflict(_) => "CONFLICT",
            EngineError::GatewayUnavailable(_) => "GATEWAY_UNAVAILABLE",
            EngineError::OrphanEvent(_) => "ORPHAN_EVENT",
            EngineError::Internal(_) => "INTERNAL",
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(msg) => Self::NotFound(msg),
            // Unique-constraint and stale optimistic checks both surface as
            // CONFLICT; so do cross-entity desyncs observed mid-transaction.
            StorageError::Conflict(msg) | StorageError::InvariantViolation(msg) => {
                Self::Conflict(msg)
            }
            StorageError::InvalidInput(msg) => Self::Validation(msg),
            StorageError::Serialization(msg) | StorageError::Backend(msg) => Self::Internal(msg),
        }
    }
}

impl From<GatewayError> for EngineError {
    fn from(value: GatewayError) -> Self {
        match value {
            // A business rejection by the processor is terminal for the
            // attempt and safe to show to the caller.
            GatewayError::Rejected { code, message } => {
                Self::Validation(format!("gateway rejected ({code}): {message}"))
            }
            GatewayError::Unavailable(msg) => Self::GatewayUnavailable(msg),
        }
    }
}
