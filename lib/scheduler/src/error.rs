//! Error types for the scheduler crate.

use crate::task::ScheduledKind;
use escapement_core::{Coded, ErrorCode};
use std::fmt;

/// Errors from scheduling and firing timed obligations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The bounded queue for this kind refused the task.
    QueueFull { kind: ScheduledKind },
    /// A timer configuration failed to parse.
    InvalidTimer { reason: String },
    /// The scheduler is not running.
    Stopped,
    /// Firing a task failed downstream.
    Fire { message: String },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull { kind } => write!(f, "{kind} queue is full"),
            Self::InvalidTimer { reason } => write!(f, "invalid timer: {reason}"),
            Self::Stopped => write!(f, "scheduler is stopped"),
            Self::Fire { message } => write!(f, "failed to fire scheduled task: {message}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

impl Coded for SchedulerError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::QueueFull { .. } => ErrorCode::ResourceExhausted,
            Self::InvalidTimer { .. } => ErrorCode::Validation,
            Self::Stopped => ErrorCode::InvalidStatus,
            Self::Fire { .. } => ErrorCode::ExecutionFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_full_is_resource_exhausted() {
        let err = SchedulerError::QueueFull {
            kind: ScheduledKind::Timer,
        };
        assert_eq!(err.code(), ErrorCode::ResourceExhausted);
        assert!(err.to_string().contains("timer queue is full"));
    }
}
