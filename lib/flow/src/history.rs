//! Append-only audit records for node and task events.

use crate::process::Variables;
use chrono::{DateTime, Utc};
use escapement_core::{HistoryId, ProcessId, TaskId};
use serde::{Deserialize, Serialize};

/// One audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Unique identifier.
    pub id: HistoryId,
    /// The owning process.
    pub process_id: ProcessId,
    /// Node the event occurred on.
    pub node_key: String,
    /// Task involved, if any.
    pub task_id: Option<TaskId>,
    /// Who acted: a user, or `"system"` for engine-driven events.
    pub actor: String,
    /// What happened (`"approve"`, `"node_completed"`, `"urge"`, …).
    pub action: String,
    /// Free-form detail.
    pub detail: Option<String>,
    /// Snapshot of the variables at the time of the event.
    pub variables: Variables,
    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,
}

impl HistoryRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(
        process_id: ProcessId,
        node_key: impl Into<String>,
        actor: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: HistoryId::new(),
            process_id,
            node_key: node_key.into(),
            task_id: None,
            actor: actor.into(),
            action: action.into(),
            detail: None,
            variables: Variables::new(),
            occurred_at: Utc::now(),
        }
    }

    /// Attaches the task involved.
    #[must_use]
    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Attaches a detail message.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Attaches a variables snapshot.
    #[must_use]
    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }
}
