//! Error types for the service crate.

use escapement_core::{Coded, ErrorCode};
use std::fmt;

/// Errors from service providers and the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The request failed provider validation.
    InvalidRequest { reason: String },
    /// No provider is registered under the requested name.
    ProviderNotFound { name: String },
    /// Transport-level failure reaching the service.
    Network { message: String },
    /// The call exceeded its deadline.
    Timeout,
    /// The service's circuit is open; the call was not attempted.
    CircuitOpen { service: String },
    /// The provider executed and failed.
    Execution { message: String },
    /// The operation is not implemented by this provider.
    NotImplemented { operation: String },
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest { reason } => write!(f, "invalid service request: {reason}"),
            Self::ProviderNotFound { name } => write!(f, "service provider not found: {name}"),
            Self::Network { message } => write!(f, "network error: {message}"),
            Self::Timeout => write!(f, "service call timed out"),
            Self::CircuitOpen { service } => {
                write!(f, "circuit open for service '{service}'")
            }
            Self::Execution { message } => write!(f, "service execution failed: {message}"),
            Self::NotImplemented { operation } => {
                write!(f, "operation not implemented: {operation}")
            }
        }
    }
}

impl std::error::Error for ServiceError {}

impl Coded for ServiceError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidRequest { .. } => ErrorCode::InvalidParam,
            Self::ProviderNotFound { .. } => ErrorCode::NotFound,
            Self::Network { .. } => ErrorCode::Network,
            Self::Timeout => ErrorCode::Timeout,
            Self::CircuitOpen { .. } => ErrorCode::ServiceUnavailable,
            Self::Execution { .. } => ErrorCode::ExecutionFailed,
            Self::NotImplemented { .. } => ErrorCode::NotImplemented,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_taxonomy() {
        assert_eq!(ServiceError::Timeout.code(), ErrorCode::Timeout);
        assert_eq!(
            ServiceError::CircuitOpen {
                service: "s".to_string()
            }
            .code(),
            ErrorCode::ServiceUnavailable
        );
        assert!(ServiceError::Timeout.code().is_retryable());
        assert!(
            !ServiceError::InvalidRequest {
                reason: "r".to_string()
            }
            .code()
            .is_retryable()
        );
    }
}
