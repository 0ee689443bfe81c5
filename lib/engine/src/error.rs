//! Error types for the engine crate.
//!
//! One enum spans the engine surface; lower-layer errors wrap without
//! losing their classification, and [`Coded`] exposes the taxonomy code
//! the retry executor and callers branch on.

use escapement_core::{Coded, ErrorCode};
use escapement_flow::{ExprError, GraphError, StoreError};
use escapement_scheduler::SchedulerError;
use escapement_service::ServiceError;
use std::fmt;

/// Errors from engine operations.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The referenced entity does not exist.
    NotFound { entity: &'static str, id: String },
    /// A caller-supplied parameter is missing or malformed.
    InvalidParam { reason: String },
    /// Static validation failed.
    Validation { reason: String },
    /// Runtime validation failed (no route matched, bad coercion).
    ValidationFailed { reason: String },
    /// The entity is not in a status that permits the operation.
    InvalidStatus {
        entity: &'static str,
        status: String,
        operation: &'static str,
    },
    /// An operation exceeded its deadline.
    Timeout { what: String },
    /// A bounded queue or pool refused the work.
    ResourceExhausted { what: String },
    /// A handler or provider ran and failed.
    Execution { message: String },
    /// A notification channel's rolling window was exceeded.
    RateLimited { channel: String },
    /// The operation is recognized but disabled for this entity.
    NotSupported { operation: String },
    /// Internal engine fault.
    System { message: String },
    /// Persistence failure.
    Store(StoreError),
    /// Template graph failure.
    Graph(GraphError),
    /// Expression failure.
    Expr(ExprError),
    /// Service layer failure.
    Service(ServiceError),
    /// Scheduler failure.
    Scheduler(SchedulerError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::InvalidParam { reason } => write!(f, "invalid parameter: {reason}"),
            Self::Validation { reason } => write!(f, "validation failed: {reason}"),
            Self::ValidationFailed { reason } => {
                write!(f, "runtime validation failed: {reason}")
            }
            Self::InvalidStatus {
                entity,
                status,
                operation,
            } => {
                write!(f, "cannot {operation} {entity} in status {status}")
            }
            Self::Timeout { what } => write!(f, "{what} timed out"),
            Self::ResourceExhausted { what } => write!(f, "{what} exhausted"),
            Self::Execution { message } => write!(f, "execution failed: {message}"),
            Self::RateLimited { channel } => {
                write!(f, "rate limit exceeded for channel {channel}")
            }
            Self::NotSupported { operation } => write!(f, "{operation} is not allowed here"),
            Self::System { message } => write!(f, "engine fault: {message}"),
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Graph(e) => write!(f, "graph error: {e}"),
            Self::Expr(e) => write!(f, "expression error: {e}"),
            Self::Service(e) => write!(f, "service error: {e}"),
            Self::Scheduler(e) => write!(f, "scheduler error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl Coded for EngineError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::InvalidParam { .. } => ErrorCode::InvalidParam,
            Self::Validation { .. } => ErrorCode::Validation,
            Self::ValidationFailed { .. } => ErrorCode::ValidationFailed,
            Self::InvalidStatus { .. } => ErrorCode::InvalidStatus,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::ResourceExhausted { .. } => ErrorCode::ResourceExhausted,
            Self::Execution { .. } => ErrorCode::ExecutionFailed,
            Self::RateLimited { .. } => ErrorCode::RateLimit,
            Self::NotSupported { .. } => ErrorCode::NotSupported,
            Self::System { .. } => ErrorCode::System,
            Self::Store(e) => e.code(),
            Self::Graph(e) => e.code(),
            Self::Expr(e) => e.code(),
            Self::Service(e) => e.code(),
            Self::Scheduler(e) => e.code(),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<GraphError> for EngineError {
    fn from(e: GraphError) -> Self {
        Self::Graph(e)
    }
}

impl From<ExprError> for EngineError {
    fn from(e: ExprError) -> Self {
        Self::Expr(e)
    }
}

impl From<ServiceError> for EngineError {
    fn from(e: ServiceError) -> Self {
        Self::Service(e)
    }
}

impl From<SchedulerError> for EngineError {
    fn from(e: SchedulerError) -> Self {
        Self::Scheduler(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_errors_keep_their_codes() {
        let err = EngineError::from(StoreError::not_found("process", "p1"));
        assert_eq!(err.code(), ErrorCode::NotFound);

        let err = EngineError::from(ServiceError::Timeout);
        assert_eq!(err.code(), ErrorCode::Timeout);
        assert!(err.code().is_retryable());

        let err = EngineError::ValidationFailed {
            reason: "no route".to_string(),
        };
        assert!(!err.code().is_retryable());
    }

    #[test]
    fn invalid_status_message() {
        let err = EngineError::InvalidStatus {
            entity: "task",
            status: "completed".to_string(),
            operation: "complete",
        };
        assert_eq!(err.to_string(), "cannot complete task in status completed");
    }
}
