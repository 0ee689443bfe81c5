//! Tasks: the externalized units of human work.

use crate::process::Variables;
use crate::status::{TaskAction, TaskStatus};
use chrono::{DateTime, Utc};
use escapement_core::{ProcessId, TaskId};
use serde::{Deserialize, Serialize};

/// A unit of human work emitted by an approval or user node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: TaskId,
    /// The owning process.
    pub process_id: ProcessId,
    /// The node that emitted the task.
    pub node_key: String,
    /// Human-readable name.
    pub name: String,
    /// Assignees, in priority order. Non-empty while the task is open.
    pub assignees: Vec<String>,
    /// Current status.
    pub status: TaskStatus,
    /// Action taken when the task settled.
    pub action: Option<TaskAction>,
    /// Comment supplied with the settling action.
    pub comment: Option<String>,
    /// Task-local variables, merged into the process on completion.
    pub variables: Variables,
    /// Deadline, when one applies.
    pub due_at: Option<DateTime<Utc>>,
    /// Scheduling priority.
    pub priority: i32,
    /// Times the task has been urged.
    pub urge_count: u32,
    /// Task this one was delegated from, preserving provenance.
    pub delegated_from: Option<TaskId>,
    /// User who claimed the task, if claimed.
    pub claimed_by: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the task settled.
    pub ended_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Creates an active task for the given assignees.
    #[must_use]
    pub fn new(
        process_id: ProcessId,
        node_key: impl Into<String>,
        name: impl Into<String>,
        assignees: Vec<String>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            process_id,
            node_key: node_key.into(),
            name: name.into(),
            assignees,
            status: TaskStatus::Active,
            action: None,
            comment: None,
            variables: Variables::new(),
            due_at: None,
            priority: 0,
            urge_count: 0,
            delegated_from: None,
            claimed_by: None,
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Creates an unassigned task awaiting auto-assignment.
    #[must_use]
    pub fn unassigned(
        process_id: ProcessId,
        node_key: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let mut task = Self::new(process_id, node_key, name, Vec::new());
        task.status = TaskStatus::Pending;
        task
    }

    /// Sets the deadline.
    #[must_use]
    pub fn with_due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = Some(due_at);
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Returns true if `user` is among the assignees or claimed the task.
    #[must_use]
    pub fn is_assigned_to(&self, user: &str) -> bool {
        self.claimed_by.as_deref() == Some(user) || self.assignees.iter().any(|a| a == user)
    }

    /// Returns true if the deadline has passed.
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status.is_open() && self.due_at.is_some_and(|due| due < now)
    }

    /// Claims the task for one user.
    pub fn claim(&mut self, user: impl Into<String>) {
        self.claimed_by = Some(user.into());
        self.status = TaskStatus::Active;
    }

    /// Settles the task with an action.
    pub fn complete(&mut self, action: TaskAction, comment: Option<String>) {
        self.status = TaskStatus::Completed;
        self.action = Some(action);
        self.comment = comment;
        self.ended_at = Some(Utc::now());
    }

    /// Cancels the task.
    pub fn cancel(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.ended_at = Some(Utc::now());
    }

    /// Withdraws the task.
    pub fn withdraw(&mut self) {
        self.status = TaskStatus::Withdrawn;
        self.action = Some(TaskAction::Withdraw);
        self.ended_at = Some(Utc::now());
    }

    /// Marks the task timed out.
    pub fn mark_timeout(&mut self) {
        self.status = TaskStatus::Timeout;
        self.ended_at = Some(Utc::now());
    }

    /// Records an urge.
    pub fn urge(&mut self) {
        self.urge_count += 1;
    }

    /// Replaces the assignee set (transfer).
    pub fn transfer_to(&mut self, user: impl Into<String>) {
        self.assignees = vec![user.into()];
        self.claimed_by = None;
    }

    /// Derives a delegated copy of this task for `delegatee`.
    #[must_use]
    pub fn delegate_to(&self, delegatee: impl Into<String>) -> Self {
        let mut delegated = Self::new(
            self.process_id,
            self.node_key.clone(),
            self.name.clone(),
            vec![delegatee.into()],
        );
        delegated.variables = self.variables.clone();
        delegated.due_at = self.due_at;
        delegated.priority = self.priority;
        delegated.delegated_from = Some(self.id);
        delegated
    }
}
