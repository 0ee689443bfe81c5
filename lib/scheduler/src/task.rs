//! Scheduled task records.

use chrono::{DateTime, Utc};
use escapement_core::ProcessId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// The three timed-obligation categories, each with its own queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledKind {
    /// A task deadline.
    Timeout,
    /// An overdue-task reminder.
    Reminder,
    /// A timer node firing.
    Timer,
}

impl ScheduledKind {
    /// Returns the wire name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Reminder => "reminder",
            Self::Timer => "timer",
        }
    }

    /// All kinds, in queue order.
    pub const ALL: [ScheduledKind; 3] = [Self::Timeout, Self::Reminder, Self::Timer];
}

impl fmt::Display for ScheduledKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timed obligation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Deterministic key; rescheduling under the same key replaces.
    pub key: String,
    /// Obligation category.
    pub kind: ScheduledKind,
    /// The owning process.
    pub process_id: ProcessId,
    /// The node (or the node owning the task) this obligation concerns.
    pub node_key: String,
    /// When to fire. Past instants fire immediately.
    pub trigger_at: DateTime<Utc>,
    /// Delivery attempts made so far.
    pub retry_count: u32,
    /// Replaced-entry detector; only the newest revision fires.
    pub revision: u64,
    /// Kind-specific payload (timer cycle counters, task ids, …).
    pub data: JsonValue,
}

impl ScheduledTask {
    /// Builds the deterministic key for a kind/process/node triple.
    #[must_use]
    pub fn key_for(kind: ScheduledKind, process_id: ProcessId, node_key: &str) -> String {
        format!("{}-{}-{}", kind.as_str(), process_id, node_key)
    }

    /// Creates a task with its deterministic key.
    #[must_use]
    pub fn new(
        kind: ScheduledKind,
        process_id: ProcessId,
        node_key: impl Into<String>,
        trigger_at: DateTime<Utc>,
    ) -> Self {
        let node_key = node_key.into();
        Self {
            key: Self::key_for(kind, process_id, &node_key),
            kind,
            process_id,
            node_key,
            trigger_at,
            retry_count: 0,
            revision: 0,
            data: JsonValue::Null,
        }
    }

    /// Attaches a payload.
    #[must_use]
    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = data;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_deterministic() {
        let process_id = ProcessId::new();
        let a = ScheduledTask::new(ScheduledKind::Timer, process_id, "wait", Utc::now());
        let b = ScheduledTask::new(ScheduledKind::Timer, process_id, "wait", Utc::now());
        assert_eq!(a.key, b.key);
        assert!(a.key.starts_with("timer-"));

        let other = ScheduledTask::new(ScheduledKind::Timeout, process_id, "wait", Utc::now());
        assert_ne!(a.key, other.key);
    }
}
