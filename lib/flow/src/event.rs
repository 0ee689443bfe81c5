//! Engine events published to the event bus.

use crate::process::Variables;
use crate::status::TaskAction;
use chrono::{DateTime, Utc};
use escapement_core::{ProcessId, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

/// Everything the engine announces to the outside world.
///
/// Events are fire-and-forget; consumers must tolerate loss and
/// duplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    ProcessStarted {
        process_id: ProcessId,
        template_code: String,
        initiator: String,
        at: DateTime<Utc>,
    },
    ProcessCompleted {
        process_id: ProcessId,
        at: DateTime<Utc>,
    },
    ProcessSuspended {
        process_id: ProcessId,
        at: DateTime<Utc>,
    },
    ProcessResumed {
        process_id: ProcessId,
        at: DateTime<Utc>,
    },
    ProcessTerminated {
        process_id: ProcessId,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    NodeStarted {
        process_id: ProcessId,
        node_key: String,
        at: DateTime<Utc>,
    },
    NodeCompleted {
        process_id: ProcessId,
        node_key: String,
        at: DateTime<Utc>,
    },
    NodeFailed {
        process_id: ProcessId,
        node_key: String,
        error: String,
        at: DateTime<Utc>,
    },
    NodeError {
        process_id: ProcessId,
        node_key: String,
        error: String,
        at: DateTime<Utc>,
    },
    TaskCompleted {
        process_id: ProcessId,
        task_id: TaskId,
        action: TaskAction,
        actor: String,
        at: DateTime<Utc>,
    },
    TaskCancelled {
        process_id: ProcessId,
        task_id: TaskId,
        at: DateTime<Utc>,
    },
    TaskWithdrawn {
        process_id: ProcessId,
        task_id: TaskId,
        actor: String,
        at: DateTime<Utc>,
    },
    TaskDelegated {
        process_id: ProcessId,
        task_id: TaskId,
        delegated_to: TaskId,
        from_user: String,
        to_user: String,
        at: DateTime<Utc>,
    },
    TaskTransferred {
        process_id: ProcessId,
        task_id: TaskId,
        from_user: String,
        to_user: String,
        at: DateTime<Utc>,
    },
    TaskUrged {
        process_id: ProcessId,
        task_id: TaskId,
        urge_count: u32,
        at: DateTime<Utc>,
    },
    TaskTimeout {
        process_id: ProcessId,
        task_id: TaskId,
        at: DateTime<Utc>,
    },
    TaskClaimed {
        process_id: ProcessId,
        task_id: TaskId,
        actor: String,
        at: DateTime<Utc>,
    },
    TaskAssigned {
        process_id: ProcessId,
        task_id: TaskId,
        assignees: Vec<String>,
        at: DateTime<Utc>,
    },
    TaskReminder {
        process_id: ProcessId,
        task_id: TaskId,
        at: DateTime<Utc>,
    },
    ApprovalApproved {
        process_id: ProcessId,
        node_key: String,
        at: DateTime<Utc>,
    },
    ApprovalRejected {
        process_id: ProcessId,
        node_key: String,
        at: DateTime<Utc>,
    },
    ServiceCancelled {
        process_id: ProcessId,
        node_key: String,
        provider: String,
        at: DateTime<Utc>,
    },
    ServiceTimeout {
        process_id: ProcessId,
        node_key: String,
        provider: String,
        at: DateTime<Utc>,
    },
    ServiceError {
        process_id: ProcessId,
        node_key: String,
        provider: String,
        error: String,
        at: DateTime<Utc>,
    },
    ServiceMetrics {
        provider: String,
        duration_ms: u64,
        success: bool,
        at: DateTime<Utc>,
    },
    HandlerError {
        handler: String,
        error: String,
        at: DateTime<Utc>,
    },
    VariablesUpdated {
        process_id: ProcessId,
        variables: Variables,
        at: DateTime<Utc>,
    },
    NodeJumped {
        process_id: ProcessId,
        from_node_key: Option<String>,
        to_node_key: String,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Returns the dotted wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProcessStarted { .. } => "process.started",
            Self::ProcessCompleted { .. } => "process.completed",
            Self::ProcessSuspended { .. } => "process.suspended",
            Self::ProcessResumed { .. } => "process.resumed",
            Self::ProcessTerminated { .. } => "process.terminated",
            Self::NodeStarted { .. } => "node.started",
            Self::NodeCompleted { .. } => "node.completed",
            Self::NodeFailed { .. } => "node.failed",
            Self::NodeError { .. } => "node.error",
            Self::TaskCompleted { .. } => "task.completed",
            Self::TaskCancelled { .. } => "task.cancelled",
            Self::TaskWithdrawn { .. } => "task.withdrawn",
            Self::TaskDelegated { .. } => "task.delegated",
            Self::TaskTransferred { .. } => "task.transferred",
            Self::TaskUrged { .. } => "task.urged",
            Self::TaskTimeout { .. } => "task.timeout",
            Self::TaskClaimed { .. } => "task.claimed",
            Self::TaskAssigned { .. } => "task.assigned",
            Self::TaskReminder { .. } => "task.reminder",
            Self::ApprovalApproved { .. } => "approval.approved",
            Self::ApprovalRejected { .. } => "approval.rejected",
            Self::ServiceCancelled { .. } => "service.cancelled",
            Self::ServiceTimeout { .. } => "service.timeout",
            Self::ServiceError { .. } => "service.error",
            Self::ServiceMetrics { .. } => "service.metrics",
            Self::HandlerError { .. } => "handler.error",
            Self::VariablesUpdated { .. } => "workflow.variables.updated",
            Self::NodeJumped { .. } => "workflow.node.jumped",
        }
    }

    /// Returns the process this event concerns, when there is one.
    #[must_use]
    pub fn process_id(&self) -> Option<ProcessId> {
        match self {
            Self::ProcessStarted { process_id, .. }
            | Self::ProcessCompleted { process_id, .. }
            | Self::ProcessSuspended { process_id, .. }
            | Self::ProcessResumed { process_id, .. }
            | Self::ProcessTerminated { process_id, .. }
            | Self::NodeStarted { process_id, .. }
            | Self::NodeCompleted { process_id, .. }
            | Self::NodeFailed { process_id, .. }
            | Self::NodeError { process_id, .. }
            | Self::TaskCompleted { process_id, .. }
            | Self::TaskCancelled { process_id, .. }
            | Self::TaskWithdrawn { process_id, .. }
            | Self::TaskDelegated { process_id, .. }
            | Self::TaskTransferred { process_id, .. }
            | Self::TaskUrged { process_id, .. }
            | Self::TaskTimeout { process_id, .. }
            | Self::TaskClaimed { process_id, .. }
            | Self::TaskAssigned { process_id, .. }
            | Self::TaskReminder { process_id, .. }
            | Self::ApprovalApproved { process_id, .. }
            | Self::ApprovalRejected { process_id, .. }
            | Self::ServiceCancelled { process_id, .. }
            | Self::ServiceTimeout { process_id, .. }
            | Self::ServiceError { process_id, .. }
            | Self::VariablesUpdated { process_id, .. }
            | Self::NodeJumped { process_id, .. } => Some(*process_id),
            Self::ServiceMetrics { .. } | Self::HandlerError { .. } => None,
        }
    }

    /// Returns the event as a loggable payload.
    #[must_use]
    pub fn payload(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "event": self.name() }))
    }
}
