//! The persistence seam.
//!
//! The engine owns runtime behavior; rows live in a relational store owned
//! by the surrounding platform. These repository-style traits are the
//! entire contract between the two. Table names are fixed by the platform
//! schema and exported in [`tables`] for the SQL layer.

use crate::delegation::Delegation;
use crate::error::{GraphError, StoreError};
use crate::graph::TemplateGraph;
use crate::history::HistoryRecord;
use crate::node::{NodeDefinition, NodeInstance};
use crate::process::ProcessInstance;
use crate::rule::AssignmentRule;
use crate::status::ProcessStatus;
use crate::task::Task;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use escapement_core::{NodeInstanceId, ProcessId, TaskId, TemplateId};
use serde::{Deserialize, Serialize};

/// Canonical table names of the backing schema.
pub mod tables {
    pub const BUSINESS: &str = "ncse_flow_business";
    pub const DELEGATION: &str = "ncse_flow_delegation";
    pub const HISTORY: &str = "ncse_flow_history";
    pub const NODE: &str = "ncse_flow_node";
    pub const PROCESS: &str = "ncse_flow_process";
    pub const PROCESS_DESIGN: &str = "ncse_flow_process_design";
    pub const RULE: &str = "ncse_flow_rule";
    pub const TASK: &str = "ncse_flow_task";
    pub const TEMPLATE: &str = "ncse_flow_template";
}

/// Offset/limit paging for list operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Rows to skip.
    pub offset: usize,
    /// Rows to return.
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

impl Page {
    /// Creates a page.
    #[must_use]
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }
}

/// An authored process template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    /// Unique identifier.
    pub id: TemplateId,
    /// Stable external code used to start processes.
    pub code: String,
    /// Human-readable name.
    pub name: String,
    /// Monotonic version.
    pub version: u32,
    /// The authored node graph, flat.
    pub nodes: Vec<NodeDefinition>,
    /// Whether new processes may start from this template.
    pub enabled: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Template {
    /// Creates an enabled version-1 template.
    #[must_use]
    pub fn new(code: impl Into<String>, name: impl Into<String>, nodes: Vec<NodeDefinition>) -> Self {
        Self {
            id: TemplateId::new(),
            code: code.into(),
            name: name.into(),
            version: 1,
            nodes,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    /// Builds the template's graph.
    ///
    /// # Errors
    ///
    /// Returns an error if the node list does not form a valid graph.
    pub fn graph(&self) -> Result<TemplateGraph, GraphError> {
        TemplateGraph::build(self.nodes.clone())
    }
}

/// Persistence for process instances.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    /// Fetches a process by id.
    async fn get(&self, id: ProcessId) -> Result<ProcessInstance, StoreError>;

    /// Lists processes in a given status.
    async fn list_by_status(
        &self,
        status: ProcessStatus,
        page: Page,
    ) -> Result<Vec<ProcessInstance>, StoreError>;

    /// Persists a new process.
    async fn create(&self, process: ProcessInstance) -> Result<ProcessInstance, StoreError>;

    /// Persists changes to a process.
    async fn update(&self, process: ProcessInstance) -> Result<ProcessInstance, StoreError>;

    /// Removes a process.
    async fn delete(&self, id: ProcessId) -> Result<(), StoreError>;
}

/// Persistence for node instances.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Fetches a node instance by id.
    async fn get(&self, id: NodeInstanceId) -> Result<NodeInstance, StoreError>;

    /// Fetches a node instance by process and node key.
    async fn get_by_key(
        &self,
        process_id: ProcessId,
        node_key: &str,
    ) -> Result<NodeInstance, StoreError>;

    /// Lists every node instance of a process.
    async fn list_for_process(&self, process_id: ProcessId)
    -> Result<Vec<NodeInstance>, StoreError>;

    /// Persists a new node instance.
    async fn create(&self, node: NodeInstance) -> Result<NodeInstance, StoreError>;

    /// Persists changes to a node instance.
    async fn update(&self, node: NodeInstance) -> Result<NodeInstance, StoreError>;
}

/// Persistence for tasks.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Fetches a task by id.
    async fn get(&self, id: TaskId) -> Result<Task, StoreError>;

    /// Lists every task of a process.
    async fn list_for_process(&self, process_id: ProcessId) -> Result<Vec<Task>, StoreError>;

    /// Lists tasks assigned to or claimed by a user.
    async fn list_for_user(&self, user: &str) -> Result<Vec<Task>, StoreError>;

    /// Lists every open (pending or active) task.
    async fn list_open(&self) -> Result<Vec<Task>, StoreError>;

    /// Persists a new task.
    async fn create(&self, task: Task) -> Result<Task, StoreError>;

    /// Persists changes to a task.
    async fn update(&self, task: Task) -> Result<Task, StoreError>;

    /// Removes a task.
    async fn delete(&self, id: TaskId) -> Result<(), StoreError>;
}

/// Persistence for history records.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Appends a record.
    async fn append(&self, record: HistoryRecord) -> Result<(), StoreError>;

    /// Lists a process's records, oldest first.
    async fn list_for_process(
        &self,
        process_id: ProcessId,
    ) -> Result<Vec<HistoryRecord>, StoreError>;
}

/// Persistence for delegations.
#[async_trait]
pub trait DelegationStore: Send + Sync {
    /// Lists delegations where `user` is the delegator.
    async fn list_for_delegator(&self, user: &str) -> Result<Vec<Delegation>, StoreError>;

    /// Persists a new delegation.
    async fn create(&self, delegation: Delegation) -> Result<Delegation, StoreError>;
}

/// Persistence for assignment rules.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Lists enabled rules, highest priority first.
    async fn list_enabled(&self) -> Result<Vec<AssignmentRule>, StoreError>;

    /// Persists a new rule.
    async fn create(&self, rule: AssignmentRule) -> Result<AssignmentRule, StoreError>;
}

/// Persistence for templates.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Fetches a template by id.
    async fn get(&self, id: TemplateId) -> Result<Template, StoreError>;

    /// Fetches the newest enabled template with the given code.
    async fn get_by_code(&self, code: &str) -> Result<Template, StoreError>;

    /// Persists a new template.
    async fn create(&self, template: Template) -> Result<Template, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeKind;

    #[test]
    fn table_names_are_canonical() {
        assert_eq!(tables::PROCESS, "ncse_flow_process");
        assert_eq!(tables::TASK, "ncse_flow_task");
        assert_eq!(tables::PROCESS_DESIGN, "ncse_flow_process_design");
    }

    #[test]
    fn template_graph_builds() {
        let template = Template::new(
            "t1",
            "Linear",
            vec![
                NodeDefinition::new("s", "Start", NodeKind::Start).with_next(["e"]),
                NodeDefinition::new("e", "End", NodeKind::End),
            ],
        );
        let graph = template.graph().expect("graph");
        assert_eq!(graph.node_count(), 2);
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn default_page() {
        let page = Page::default();
        assert_eq!(page.offset, 0);
        assert_eq!(page.limit, 100);
    }
}
