//! Process instances: the runtime shadow of a running template.

use crate::status::ProcessStatus;
use chrono::{DateTime, Utc};
use escapement_core::{ProcessId, TemplateId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;

/// Variable map carried by processes, tasks, and history snapshots.
pub type Variables = serde_json::Map<String, JsonValue>;

/// Link from a child process back to the subprocess node that spawned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    /// The parent process.
    pub process_id: ProcessId,
    /// The subprocess node within the parent.
    pub node_key: String,
}

/// A running instance of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    /// Unique identifier.
    pub id: ProcessId,
    /// External business key correlating this process to its subject.
    pub process_key: String,
    /// The template this instance was materialized from.
    pub template_id: TemplateId,
    /// Template code, denormalized for delegation scoping.
    pub template_code: String,
    /// Module the process belongs to.
    pub module_code: String,
    /// Form the process renders.
    pub form_code: String,
    /// User that started the process.
    pub initiator: String,
    /// Key of the most recently dispatched node.
    pub current_node_key: Option<String>,
    /// Keys of nodes currently active.
    pub active_node_keys: BTreeSet<String>,
    /// Process variables.
    pub variables: Variables,
    /// Current status.
    pub status: ProcessStatus,
    /// Set while the process is suspended.
    pub is_suspended: bool,
    /// Set once the process is terminated.
    pub is_terminated: bool,
    /// Scheduling priority; higher runs first where contention exists.
    pub priority: i32,
    /// Subprocess link, when this instance is a child.
    pub parent: Option<ParentLink>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When execution began.
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal status was reached.
    pub ended_at: Option<DateTime<Utc>>,
}

impl ProcessInstance {
    /// Creates a pending instance of a template.
    #[must_use]
    pub fn new(
        template_id: TemplateId,
        template_code: impl Into<String>,
        process_key: impl Into<String>,
        initiator: impl Into<String>,
    ) -> Self {
        Self {
            id: ProcessId::new(),
            process_key: process_key.into(),
            template_id,
            template_code: template_code.into(),
            module_code: String::new(),
            form_code: String::new(),
            initiator: initiator.into(),
            current_node_key: None,
            active_node_keys: BTreeSet::new(),
            variables: Variables::new(),
            status: ProcessStatus::Pending,
            is_suspended: false,
            is_terminated: false,
            priority: 0,
            parent: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    /// Sets the module code.
    #[must_use]
    pub fn with_module(mut self, module_code: impl Into<String>) -> Self {
        self.module_code = module_code.into();
        self
    }

    /// Sets the form code.
    #[must_use]
    pub fn with_form(mut self, form_code: impl Into<String>) -> Self {
        self.form_code = form_code.into();
        self
    }

    /// Seeds initial variables.
    #[must_use]
    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    /// Sets the scheduling priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Links this instance under a parent subprocess node.
    #[must_use]
    pub fn with_parent(mut self, parent: ParentLink) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Returns true if the process can still make progress.
    #[must_use]
    pub fn is_runnable(&self) -> bool {
        self.status == ProcessStatus::Active && !self.is_suspended && !self.is_terminated
    }

    /// Starts the process.
    pub fn start(&mut self) {
        self.status = ProcessStatus::Active;
        self.started_at = Some(Utc::now());
    }

    /// Suspends the process.
    pub fn suspend(&mut self) {
        self.status = ProcessStatus::Suspended;
        self.is_suspended = true;
    }

    /// Resumes a suspended process.
    pub fn resume(&mut self) {
        self.status = ProcessStatus::Active;
        self.is_suspended = false;
    }

    /// Completes the process.
    pub fn complete(&mut self) {
        self.status = ProcessStatus::Completed;
        self.active_node_keys.clear();
        self.ended_at = Some(Utc::now());
    }

    /// Terminates the process.
    pub fn terminate(&mut self) {
        self.status = ProcessStatus::Terminated;
        self.is_terminated = true;
        self.active_node_keys.clear();
        self.ended_at = Some(Utc::now());
    }

    /// Marks the process failed.
    pub fn fail(&mut self) {
        self.status = ProcessStatus::Error;
        self.active_node_keys.clear();
        self.ended_at = Some(Utc::now());
    }

    /// Marks the process rolled back.
    pub fn mark_rollbacked(&mut self) {
        self.status = ProcessStatus::Rollbacked;
        self.active_node_keys.clear();
        self.ended_at = Some(Utc::now());
    }

    /// Records a node becoming active.
    pub fn node_activated(&mut self, node_key: &str) {
        self.current_node_key = Some(node_key.to_string());
        self.active_node_keys.insert(node_key.to_string());
    }

    /// Records a node leaving the active set.
    pub fn node_settled(&mut self, node_key: &str) {
        self.active_node_keys.remove(node_key);
    }

    /// Sets one variable, returning the previous value.
    pub fn set_variable(&mut self, name: impl Into<String>, value: JsonValue) -> Option<JsonValue> {
        self.variables.insert(name.into(), value)
    }

    /// Reads one variable.
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&JsonValue> {
        self.variables.get(name)
    }

    /// Merges another variable map over this one.
    pub fn merge_variables(&mut self, other: &Variables) {
        for (key, value) in other {
            self.variables.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProcessInstance {
        ProcessInstance::new(TemplateId::new(), "expense", "EXP-1", "u0")
    }

    #[test]
    fn new_process_is_pending() {
        let process = sample();
        assert_eq!(process.status, ProcessStatus::Pending);
        assert!(!process.is_runnable());
        assert!(process.active_node_keys.is_empty());
    }

    #[test]
    fn lifecycle_transitions() {
        let mut process = sample();
        process.start();
        assert!(process.is_runnable());
        assert!(process.started_at.is_some());

        process.suspend();
        assert_eq!(process.status, ProcessStatus::Suspended);
        assert!(!process.is_runnable());

        process.resume();
        assert!(process.is_runnable());

        process.complete();
        assert_eq!(process.status, ProcessStatus::Completed);
        assert!(process.ended_at.is_some());
        assert!(process.status.is_terminal());
    }

    #[test]
    fn active_node_bookkeeping() {
        let mut process = sample();
        process.start();
        process.node_activated("a");
        process.node_activated("b");
        assert_eq!(process.current_node_key.as_deref(), Some("b"));
        assert_eq!(process.active_node_keys.len(), 2);

        process.node_settled("a");
        assert_eq!(process.active_node_keys.len(), 1);
        assert!(process.active_node_keys.contains("b"));
    }

    #[test]
    fn variable_merge_overwrites() {
        let mut process = sample();
        process.set_variable("x", serde_json::json!(1));

        let mut incoming = Variables::new();
        incoming.insert("x".to_string(), serde_json::json!(2));
        incoming.insert("y".to_string(), serde_json::json!("z"));
        process.merge_variables(&incoming);

        assert_eq!(process.variable("x"), Some(&serde_json::json!(2)));
        assert_eq!(process.variable("y"), Some(&serde_json::json!("z")));
    }

    #[test]
    fn terminate_clears_active_nodes() {
        let mut process = sample();
        process.start();
        process.node_activated("a");
        process.terminate();
        assert!(process.active_node_keys.is_empty());
        assert!(process.is_terminated);
        assert!(process.status.is_terminal());
    }
}
