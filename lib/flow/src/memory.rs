//! In-memory implementation of the persistence seam.
//!
//! Backs tests and single-node embeddings. All collections live behind
//! std `RwLock`s; locks are never held across awaits.

use crate::delegation::Delegation;
use crate::error::StoreError;
use crate::history::HistoryRecord;
use crate::node::NodeInstance;
use crate::process::ProcessInstance;
use crate::rule::AssignmentRule;
use crate::status::ProcessStatus;
use crate::store::{
    DelegationStore, HistoryStore, NodeStore, Page, ProcessStore, RuleStore, TaskStore, Template,
    TemplateStore,
};
use crate::task::Task;
use async_trait::async_trait;
use escapement_core::{NodeInstanceId, ProcessId, TaskId, TemplateId};
use std::collections::HashMap;
use std::sync::RwLock;

/// One store implementing every persistence trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    processes: RwLock<HashMap<ProcessId, ProcessInstance>>,
    nodes: RwLock<HashMap<NodeInstanceId, NodeInstance>>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    history: RwLock<Vec<HistoryRecord>>,
    delegations: RwLock<Vec<Delegation>>,
    rules: RwLock<Vec<AssignmentRule>>,
    templates: RwLock<HashMap<TemplateId, Template>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many processes are stored.
    #[must_use]
    pub fn process_count(&self) -> usize {
        self.processes.read().expect("lock").len()
    }

    /// Returns how many tasks are stored.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.read().expect("lock").len()
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn get(&self, id: ProcessId) -> Result<ProcessInstance, StoreError> {
        self.processes
            .read()
            .expect("lock")
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("process", id))
    }

    async fn list_by_status(
        &self,
        status: ProcessStatus,
        page: Page,
    ) -> Result<Vec<ProcessInstance>, StoreError> {
        let mut processes: Vec<ProcessInstance> = self
            .processes
            .read()
            .expect("lock")
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        processes.sort_by_key(|p| p.id);
        Ok(processes
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }

    async fn create(&self, process: ProcessInstance) -> Result<ProcessInstance, StoreError> {
        self.processes
            .write()
            .expect("lock")
            .insert(process.id, process.clone());
        Ok(process)
    }

    async fn update(&self, process: ProcessInstance) -> Result<ProcessInstance, StoreError> {
        let mut processes = self.processes.write().expect("lock");
        if !processes.contains_key(&process.id) {
            return Err(StoreError::not_found("process", process.id));
        }
        processes.insert(process.id, process.clone());
        Ok(process)
    }

    async fn delete(&self, id: ProcessId) -> Result<(), StoreError> {
        self.processes.write().expect("lock").remove(&id);
        Ok(())
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn get(&self, id: NodeInstanceId) -> Result<NodeInstance, StoreError> {
        self.nodes
            .read()
            .expect("lock")
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("node", id))
    }

    async fn get_by_key(
        &self,
        process_id: ProcessId,
        node_key: &str,
    ) -> Result<NodeInstance, StoreError> {
        self.nodes
            .read()
            .expect("lock")
            .values()
            .find(|n| n.process_id == process_id && n.node_key() == node_key)
            .cloned()
            .ok_or_else(|| StoreError::not_found("node", format!("{process_id}/{node_key}")))
    }

    async fn list_for_process(
        &self,
        process_id: ProcessId,
    ) -> Result<Vec<NodeInstance>, StoreError> {
        let mut nodes: Vec<NodeInstance> = self
            .nodes
            .read()
            .expect("lock")
            .values()
            .filter(|n| n.process_id == process_id)
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }

    async fn create(&self, node: NodeInstance) -> Result<NodeInstance, StoreError> {
        self.nodes
            .write()
            .expect("lock")
            .insert(node.id, node.clone());
        Ok(node)
    }

    async fn update(&self, node: NodeInstance) -> Result<NodeInstance, StoreError> {
        let mut nodes = self.nodes.write().expect("lock");
        if !nodes.contains_key(&node.id) {
            return Err(StoreError::not_found("node", node.id));
        }
        nodes.insert(node.id, node.clone());
        Ok(node)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn get(&self, id: TaskId) -> Result<Task, StoreError> {
        self.tasks
            .read()
            .expect("lock")
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("task", id))
    }

    async fn list_for_process(&self, process_id: ProcessId) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .expect("lock")
            .values()
            .filter(|t| t.process_id == process_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn list_for_user(&self, user: &str) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .expect("lock")
            .values()
            .filter(|t| t.is_assigned_to(user))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn list_open(&self) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .expect("lock")
            .values()
            .filter(|t| t.status.is_open())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn create(&self, task: Task) -> Result<Task, StoreError> {
        self.tasks
            .write()
            .expect("lock")
            .insert(task.id, task.clone());
        Ok(task)
    }

    async fn update(&self, task: Task) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().expect("lock");
        if !tasks.contains_key(&task.id) {
            return Err(StoreError::not_found("task", task.id));
        }
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn delete(&self, id: TaskId) -> Result<(), StoreError> {
        self.tasks.write().expect("lock").remove(&id);
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn append(&self, record: HistoryRecord) -> Result<(), StoreError> {
        self.history.write().expect("lock").push(record);
        Ok(())
    }

    async fn list_for_process(
        &self,
        process_id: ProcessId,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        Ok(self
            .history
            .read()
            .expect("lock")
            .iter()
            .filter(|r| r.process_id == process_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DelegationStore for MemoryStore {
    async fn list_for_delegator(&self, user: &str) -> Result<Vec<Delegation>, StoreError> {
        Ok(self
            .delegations
            .read()
            .expect("lock")
            .iter()
            .filter(|d| d.delegator == user)
            .cloned()
            .collect())
    }

    async fn create(&self, delegation: Delegation) -> Result<Delegation, StoreError> {
        self.delegations
            .write()
            .expect("lock")
            .push(delegation.clone());
        Ok(delegation)
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn list_enabled(&self) -> Result<Vec<AssignmentRule>, StoreError> {
        let mut rules: Vec<AssignmentRule> = self
            .rules
            .read()
            .expect("lock")
            .iter()
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority));
        Ok(rules)
    }

    async fn create(&self, rule: AssignmentRule) -> Result<AssignmentRule, StoreError> {
        self.rules.write().expect("lock").push(rule.clone());
        Ok(rule)
    }
}

#[async_trait]
impl TemplateStore for MemoryStore {
    async fn get(&self, id: TemplateId) -> Result<Template, StoreError> {
        self.templates
            .read()
            .expect("lock")
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("template", id))
    }

    async fn get_by_code(&self, code: &str) -> Result<Template, StoreError> {
        self.templates
            .read()
            .expect("lock")
            .values()
            .filter(|t| t.code == code && t.enabled)
            .max_by_key(|t| t.version)
            .cloned()
            .ok_or_else(|| StoreError::not_found("template", code))
    }

    async fn create(&self, template: Template) -> Result<Template, StoreError> {
        self.templates
            .write()
            .expect("lock")
            .insert(template.id, template.clone());
        Ok(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeDefinition, NodeKind};
    use crate::status::TaskStatus;

    #[tokio::test]
    async fn process_crud() {
        let store = MemoryStore::new();
        let process = ProcessInstance::new(TemplateId::new(), "t", "key", "u0");
        let id = process.id;

        ProcessStore::create(&store, process.clone()).await.unwrap();
        let fetched = ProcessStore::get(&store, id).await.unwrap();
        assert_eq!(fetched.process_key, "key");

        let missing = ProcessStore::get(&store, ProcessId::new()).await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn node_lookup_by_key() {
        let store = MemoryStore::new();
        let process_id = ProcessId::new();
        let node = NodeInstance::new(
            process_id,
            NodeDefinition::new("approve", "Approve", NodeKind::Start),
        );
        NodeStore::create(&store, node).await.unwrap();

        let fetched = store.get_by_key(process_id, "approve").await.unwrap();
        assert_eq!(fetched.node_key(), "approve");
        assert!(store.get_by_key(process_id, "other").await.is_err());
    }

    #[tokio::test]
    async fn open_tasks_filter() {
        let store = MemoryStore::new();
        let process_id = ProcessId::new();

        let open = Task::new(process_id, "n", "open", vec!["u1".to_string()]);
        let mut done = Task::new(process_id, "n", "done", vec!["u1".to_string()]);
        done.complete(crate::status::TaskAction::Approve, None);

        TaskStore::create(&store, open).await.unwrap();
        TaskStore::create(&store, done).await.unwrap();

        let open_tasks = store.list_open().await.unwrap();
        assert_eq!(open_tasks.len(), 1);
        assert_eq!(open_tasks[0].status, TaskStatus::Active);

        let user_tasks = store.list_for_user("u1").await.unwrap();
        assert_eq!(user_tasks.len(), 2);
    }

    #[tokio::test]
    async fn template_code_resolves_newest_enabled() {
        let store = MemoryStore::new();
        let mut v1 = Template::new("expense", "Expense v1", Vec::new());
        v1.version = 1;
        let mut v2 = Template::new("expense", "Expense v2", Vec::new());
        v2.version = 2;

        TemplateStore::create(&store, v1).await.unwrap();
        TemplateStore::create(&store, v2).await.unwrap();

        let fetched = store.get_by_code("expense").await.unwrap();
        assert_eq!(fetched.version, 2);
    }
}
