//! Error handling foundation for the escapement platform.
//!
//! This module provides the `Result` alias using rootcause and the closed
//! `ErrorCode` taxonomy shared by every crate. Each crate defines its own
//! domain-specific error types in its own error module; every such error
//! maps onto one of the codes here so that retry classification and
//! API-facing behavior stay uniform across the engine.

use rootcause::Report;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A Result type alias using rootcause's Report for error handling.
///
/// Each layer adds its own context as errors propagate.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

/// The closed set of engine error codes.
///
/// Codes, not type names: a `TaskError::AlreadyCompleted` and a
/// `ProcessError::Terminal` both carry [`ErrorCode::InvalidStatus`], and
/// callers branch on the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Operation exceeded its deadline.
    Timeout,
    /// Internal failure (poisoned state, runtime fault).
    System,
    /// Transport-level failure reaching a collaborator.
    Network,
    /// A dependency refused service (circuit open, overload).
    ServiceUnavailable,
    /// A caller-supplied parameter is malformed or missing.
    InvalidParam,
    /// Static validation of a template or configuration failed.
    Validation,
    /// Runtime validation failed (no route matched, condition error).
    ValidationFailed,
    /// The referenced entity does not exist.
    NotFound,
    /// Concurrent mutation conflict.
    Conflict,
    /// The entity is not in a status that permits the operation.
    InvalidStatus,
    /// A bounded queue or pool refused the work.
    ResourceExhausted,
    /// A handler or provider ran and failed.
    ExecutionFailed,
    /// A rolling-window rate limit was exceeded.
    RateLimit,
    /// The operation is recognized but disabled for this entity.
    NotSupported,
    /// The operation is not implemented by this provider.
    NotImplemented,
    /// Unclassified failure.
    Unknown,
}

impl ErrorCode {
    /// Returns true if errors with this code are worth retrying.
    ///
    /// `InvalidParam` is retryable only when the caller opts in; see
    /// [`crate::retry::RetryPolicy::retry_invalid_param`].
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::System | Self::Network | Self::ServiceUnavailable | Self::Unknown
        )
    }

    /// Returns the wire name of this code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::System => "system",
            Self::Network => "network",
            Self::ServiceUnavailable => "service_unavailable",
            Self::InvalidParam => "invalid_param",
            Self::Validation => "validation",
            Self::ValidationFailed => "validation_failed",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::InvalidStatus => "invalid_status",
            Self::ResourceExhausted => "resource_exhausted",
            Self::ExecutionFailed => "execution_failed",
            Self::RateLimit => "rate_limit",
            Self::NotSupported => "not_supported",
            Self::NotImplemented => "not_implemented",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for errors that carry an engine error code.
///
/// Implemented by every crate-level error enum so the retry executor and
/// the engine facade can classify failures without downcasting.
pub trait Coded {
    /// Returns the engine error code for this error.
    fn code(&self) -> ErrorCode;
}
