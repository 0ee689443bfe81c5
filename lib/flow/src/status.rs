//! Status machines for processes, node executions, tasks, and components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The overall status of a process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    /// Created but not yet started.
    Pending,
    /// Actively executing nodes.
    Active,
    /// Paused by an operator; active nodes are cancelled.
    Suspended,
    /// Reached an end node.
    Completed,
    /// Stopped by an operator before completion.
    Terminated,
    /// Failed and rolled back to an error state.
    Error,
    /// Compensation ran for every completed node.
    Rollbacked,
}

impl ProcessStatus {
    /// Returns true if this is a terminal status.
    ///
    /// A process in a terminal status never transitions again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Terminated | Self::Error | Self::Rollbacked
        )
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Terminated => "terminated",
            Self::Error => "error",
            Self::Rollbacked => "rollbacked",
        };
        f.write_str(s)
    }
}

/// The execution status of a single node instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Waiting for predecessors.
    Pending,
    /// Eligible to run (predecessors satisfied, or reset by rollback).
    Ready,
    /// Currently executing, or waiting on tasks/timers it created.
    Active,
    /// Finished successfully.
    Completed,
    /// An approval node converged with a rejecting outcome.
    Rejected,
    /// Execution failed.
    Failed,
    /// Cancelled by suspension, termination, or a jump.
    Cancelled,
    /// Deadline elapsed before completion.
    Timeout,
    /// Compensation ran for this node.
    Rollbacked,
}

impl ExecutionStatus {
    /// Returns true if this is a terminal status.
    ///
    /// `Rollbacked` is terminal until the engine explicitly resets the
    /// node to `Ready` as part of a rollback-and-rerun cycle.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Rejected
                | Self::Failed
                | Self::Cancelled
                | Self::Timeout
                | Self::Rollbacked
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::Rollbacked => "rollbacked",
        };
        f.write_str(s)
    }
}

/// The status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting for a claim or assignment to settle.
    Pending,
    /// Assigned and actionable.
    Active,
    /// Completed with an action.
    Completed,
    /// Cancelled by the engine (node converged without it, escalation).
    Cancelled,
    /// Withdrawn by its initiator.
    Withdrawn,
    /// Deadline elapsed without completion.
    Timeout,
}

impl TaskStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Withdrawn | Self::Timeout
        )
    }

    /// Returns true if the task can still be acted on.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Withdrawn => "withdrawn",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// The action recorded when a task is acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Approve,
    Reject,
    Delegate,
    Transfer,
    Urge,
    Claim,
    Withdraw,
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Delegate => "delegate",
            Self::Transfer => "transfer",
            Self::Urge => "urge",
            Self::Claim => "claim",
            Self::Withdraw => "withdraw",
        };
        f.write_str(s)
    }
}

/// Lifecycle state shared by the engine and by handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Constructed, dependencies not yet wired.
    Initializing,
    /// Wired and startable.
    Ready,
    /// Accepting work.
    Running,
    /// Temporarily not accepting work.
    Paused,
    /// Shut down.
    Stopped,
    /// Failed irrecoverably.
    Error,
}

impl LifecycleState {
    /// Returns true if work can be accepted in this state.
    #[must_use]
    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true if `next` is a legal transition from this state.
    #[must_use]
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::{Error, Initializing, Paused, Ready, Running, Stopped};
        matches!(
            (self, next),
            (Initializing, Ready)
                | (Ready, Running)
                | (Running, Paused)
                | (Running, Stopped)
                | (Paused, Running)
                | (Paused, Stopped)
                | (Stopped, Stopped)
                | (_, Error)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_terminal_statuses() {
        assert!(!ProcessStatus::Pending.is_terminal());
        assert!(!ProcessStatus::Active.is_terminal());
        assert!(!ProcessStatus::Suspended.is_terminal());
        assert!(ProcessStatus::Completed.is_terminal());
        assert!(ProcessStatus::Terminated.is_terminal());
        assert!(ProcessStatus::Error.is_terminal());
        assert!(ProcessStatus::Rollbacked.is_terminal());
    }

    #[test]
    fn execution_terminal_statuses() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Ready.is_terminal());
        assert!(!ExecutionStatus::Active.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Rejected.is_terminal());
        assert!(ExecutionStatus::Timeout.is_terminal());
    }

    #[test]
    fn task_open_statuses() {
        assert!(TaskStatus::Pending.is_open());
        assert!(TaskStatus::Active.is_open());
        assert!(!TaskStatus::Completed.is_open());
        assert!(!TaskStatus::Withdrawn.is_open());
    }

    #[test]
    fn lifecycle_transitions() {
        assert!(LifecycleState::Initializing.can_transition_to(LifecycleState::Ready));
        assert!(LifecycleState::Ready.can_transition_to(LifecycleState::Running));
        assert!(LifecycleState::Running.can_transition_to(LifecycleState::Paused));
        assert!(LifecycleState::Paused.can_transition_to(LifecycleState::Running));
        assert!(!LifecycleState::Stopped.can_transition_to(LifecycleState::Running));
        assert!(!LifecycleState::Ready.can_transition_to(LifecycleState::Paused));
    }

    #[test]
    fn status_serde_uses_snake_case() {
        let json = serde_json::to_string(&ProcessStatus::Rollbacked).expect("serialize");
        assert_eq!(json, "\"rollbacked\"");
        let json = serde_json::to_string(&TaskStatus::Withdrawn).expect("serialize");
        assert_eq!(json, "\"withdrawn\"");
    }
}
