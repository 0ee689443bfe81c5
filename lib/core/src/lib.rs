//! Core domain types and utilities for the escapement platform.
//!
//! This crate provides the foundational pieces shared by every other
//! escapement crate:
//!
//! - **Typed ids**: prefixed, ULID-backed identifiers for processes,
//!   nodes, tasks, and the other persisted entities
//! - **Error taxonomy**: the closed set of engine error codes and the
//!   `Result` alias used at crate boundaries
//! - **Retry**: exponential-backoff retry policies and the executor that
//!   drives fallible async operations under them

pub mod error;
pub mod id;
pub mod retry;

pub use error::{Coded, ErrorCode, Result};
pub use id::{
    DelegationId, HistoryId, NodeInstanceId, ParseIdError, ProcessId, RuleId, TaskId, TemplateId,
    UserId,
};
pub use retry::{RetryExecutor, RetryObserver, RetryPolicy};
