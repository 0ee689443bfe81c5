//! Shared state threaded through executors and handlers.
//!
//! Executors and handlers reference each other (a task completion drives
//! a node forward; a parallel gateway drives node executions). The cycle
//! is broken by wiring: the context is built first with its collaborator
//! seams, and the executors, handler registry, and scheduler are injected
//! once after construction.

use crate::config::EngineSettings;
use crate::error::EngineError;
use crate::executor::node::NodeExecutor;
use crate::executor::task::TaskExecutor;
use crate::handler::HandlerRegistry;
use crate::hooks::HookRegistry;
use crate::identity::IdentityResolver;
use crate::metrics::MetricsCollector;
use chrono::Utc;
use escapement_core::{ProcessId, TaskId, TemplateId};
use escapement_flow::{
    DelegationStore, EngineEvent, EventBus, Evaluator, HistoryRecord, HistoryStore, NodeStore,
    ProcessInstance, ProcessStore, RuleStore, TaskStore, TemplateGraph, TemplateStore,
};
use escapement_scheduler::Scheduler;
use escapement_service::ServiceRegistry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::warn;

/// Join bookkeeping for one parallel convergence point.
#[derive(Debug, Clone, Copy)]
pub struct JoinContext {
    /// Inbound completions required to open the gate.
    pub required: u32,
    /// Inbound completions seen so far.
    pub completed: u32,
}

/// In-memory tracking entry for a process the engine is driving.
#[derive(Debug, Clone, Copy)]
pub struct RunningEntry {
    /// Nodes currently being driven.
    pub active_nodes: usize,
    /// When the engine last touched the process.
    pub touched: Instant,
}

/// The collaborator seams and runtime maps shared engine-wide.
pub struct EngineContext {
    pub settings: EngineSettings,
    pub processes: Arc<dyn ProcessStore>,
    pub nodes: Arc<dyn NodeStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub history: Arc<dyn HistoryStore>,
    pub delegations: Arc<dyn DelegationStore>,
    pub rules: Arc<dyn RuleStore>,
    pub templates: Arc<dyn TemplateStore>,
    pub bus: Arc<dyn EventBus>,
    pub evaluator: Arc<dyn Evaluator>,
    pub identity: Arc<dyn IdentityResolver>,
    pub services: Arc<ServiceRegistry>,
    pub metrics: Arc<MetricsCollector>,
    pub hooks: Arc<HookRegistry>,

    scheduler: OnceLock<Scheduler>,
    node_executor: OnceLock<Arc<NodeExecutor>>,
    task_executor: OnceLock<Arc<TaskExecutor>>,
    handlers: OnceLock<Arc<HandlerRegistry>>,

    graphs: Mutex<HashMap<TemplateId, Arc<TemplateGraph>>>,
    running: Mutex<HashMap<ProcessId, RunningEntry>>,
    cancellations: Mutex<HashMap<ProcessId, watch::Sender<bool>>>,
    joins: Mutex<HashMap<(ProcessId, String), JoinContext>>,
    branches: Mutex<HashMap<(ProcessId, String), Vec<AbortHandle>>>,
    node_locks: Mutex<HashMap<(ProcessId, String), Arc<tokio::sync::Mutex<()>>>>,
    user_tasks: Mutex<HashMap<String, HashSet<TaskId>>>,
}

impl EngineContext {
    /// Assembles a context around its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: EngineSettings,
        processes: Arc<dyn ProcessStore>,
        nodes: Arc<dyn NodeStore>,
        tasks: Arc<dyn TaskStore>,
        history: Arc<dyn HistoryStore>,
        delegations: Arc<dyn DelegationStore>,
        rules: Arc<dyn RuleStore>,
        templates: Arc<dyn TemplateStore>,
        bus: Arc<dyn EventBus>,
        evaluator: Arc<dyn Evaluator>,
        identity: Arc<dyn IdentityResolver>,
        services: Arc<ServiceRegistry>,
    ) -> Self {
        Self {
            settings,
            processes,
            nodes,
            tasks,
            history,
            delegations,
            rules,
            templates,
            bus,
            evaluator,
            identity,
            services,
            metrics: Arc::new(MetricsCollector::new()),
            hooks: Arc::new(HookRegistry::new()),
            scheduler: OnceLock::new(),
            node_executor: OnceLock::new(),
            task_executor: OnceLock::new(),
            handlers: OnceLock::new(),
            graphs: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            cancellations: Mutex::new(HashMap::new()),
            joins: Mutex::new(HashMap::new()),
            branches: Mutex::new(HashMap::new()),
            node_locks: Mutex::new(HashMap::new()),
            user_tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Injects the executors and handler registry. Called once during
    /// engine assembly.
    pub fn wire(
        &self,
        node_executor: Arc<NodeExecutor>,
        task_executor: Arc<TaskExecutor>,
        handlers: Arc<HandlerRegistry>,
    ) {
        let _ = self.node_executor.set(node_executor);
        let _ = self.task_executor.set(task_executor);
        let _ = self.handlers.set(handlers);
    }

    /// Injects the running scheduler. Called from engine start.
    pub fn attach_scheduler(&self, scheduler: Scheduler) {
        let _ = self.scheduler.set(scheduler);
    }

    /// Returns the node executor.
    ///
    /// # Panics
    ///
    /// Panics if called before [`wire`](Self::wire); that is an assembly
    /// bug, not a runtime condition.
    #[must_use]
    pub fn node_executor(&self) -> Arc<NodeExecutor> {
        self.node_executor.get().expect("executors wired").clone()
    }

    /// Returns the task executor.
    #[must_use]
    pub fn task_executor(&self) -> Arc<TaskExecutor> {
        self.task_executor.get().expect("executors wired").clone()
    }

    /// Returns the handler registry.
    #[must_use]
    pub fn handlers(&self) -> Arc<HandlerRegistry> {
        self.handlers.get().expect("handlers wired").clone()
    }

    /// Returns the scheduler, when the engine is started.
    #[must_use]
    pub fn scheduler(&self) -> Option<&Scheduler> {
        self.scheduler.get()
    }

    /// Returns the template graph for a process, building and caching it
    /// on first use.
    pub async fn graph_for(
        &self,
        process: &ProcessInstance,
    ) -> Result<Arc<TemplateGraph>, EngineError> {
        if let Some(graph) = self
            .graphs
            .lock()
            .expect("graph cache lock")
            .get(&process.template_id)
        {
            return Ok(graph.clone());
        }
        let template = self.templates.get(process.template_id).await?;
        let graph = Arc::new(template.graph()?);
        self.graphs
            .lock()
            .expect("graph cache lock")
            .insert(process.template_id, graph.clone());
        Ok(graph)
    }

    /// Returns (creating if needed) the cancellation receiver for a
    /// process. Fires `true` when the process is suspended, terminated,
    /// or jumped.
    #[must_use]
    pub fn cancel_token(&self, process_id: ProcessId) -> watch::Receiver<bool> {
        let mut cancellations = self.cancellations.lock().expect("cancel lock");
        cancellations
            .entry(process_id)
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    /// Cancels every in-flight execution of a process.
    pub fn trigger_cancel(&self, process_id: ProcessId) {
        if let Some(sender) = self
            .cancellations
            .lock()
            .expect("cancel lock")
            .get(&process_id)
        {
            let _ = sender.send(true);
        }
    }

    /// Re-arms the cancellation channel after a suspend/resume cycle.
    pub fn reset_cancel(&self, process_id: ProcessId) {
        self.cancellations
            .lock()
            .expect("cancel lock")
            .insert(process_id, watch::channel(false).0);
    }

    /// Drops cancellation state for a settled process.
    pub fn drop_cancel(&self, process_id: ProcessId) {
        self.cancellations
            .lock()
            .expect("cancel lock")
            .remove(&process_id);
    }

    /// Records a node execution starting; keeps the running map honest.
    pub fn track_node_start(&self, process_id: ProcessId) {
        let mut running = self.running.lock().expect("running lock");
        let entry = running.entry(process_id).or_insert(RunningEntry {
            active_nodes: 0,
            touched: Instant::now(),
        });
        entry.active_nodes += 1;
        entry.touched = Instant::now();
    }

    /// Records a node execution ending; removes the process once no node
    /// is being driven.
    pub fn track_node_end(&self, process_id: ProcessId) {
        let mut running = self.running.lock().expect("running lock");
        if let Some(entry) = running.get_mut(&process_id) {
            entry.active_nodes = entry.active_nodes.saturating_sub(1);
            entry.touched = Instant::now();
            if entry.active_nodes == 0 {
                running.remove(&process_id);
            }
        }
    }

    /// Returns how many processes the engine is actively driving.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.lock().expect("running lock").len()
    }

    /// Returns the tracked processes older than the given age.
    #[must_use]
    pub fn stale_processes(&self, older_than: std::time::Duration) -> Vec<ProcessId> {
        self.running
            .lock()
            .expect("running lock")
            .iter()
            .filter(|(_, entry)| entry.touched.elapsed() > older_than)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drops a process from the running map entirely.
    pub fn untrack_process(&self, process_id: ProcessId) {
        self.running.lock().expect("running lock").remove(&process_id);
    }

    /// Records an inbound completion for a join node. Returns true for
    /// the caller that opened the gate; the context is deleted then.
    pub fn join_arrival(&self, process_id: ProcessId, node_key: &str, required: u32) -> bool {
        let mut joins = self.joins.lock().expect("join lock");
        let key = (process_id, node_key.to_string());
        let entry = joins.entry(key.clone()).or_insert(JoinContext {
            required,
            completed: 0,
        });
        entry.completed += 1;
        if entry.completed >= entry.required {
            joins.remove(&key);
            true
        } else {
            false
        }
    }

    /// Drops join state for a process (terminate, jump, rollback).
    pub fn clear_joins(&self, process_id: ProcessId) {
        self.joins
            .lock()
            .expect("join lock")
            .retain(|(pid, _), _| *pid != process_id);
    }

    /// Records an in-flight branch of a parallel gateway so rollback and
    /// cancellation can reach it later.
    pub fn track_branch(&self, process_id: ProcessId, node_key: &str, handle: AbortHandle) {
        self.branches
            .lock()
            .expect("branch lock")
            .entry((process_id, node_key.to_string()))
            .or_default()
            .push(handle);
    }

    /// Aborts and drops every outstanding branch of one gateway.
    /// Aborting an already-finished branch is a no-op. Returns how many
    /// handles were aborted.
    pub fn abort_branches(&self, process_id: ProcessId, node_key: &str) -> usize {
        let handles = self
            .branches
            .lock()
            .expect("branch lock")
            .remove(&(process_id, node_key.to_string()))
            .unwrap_or_default();
        let count = handles.len();
        for handle in handles {
            handle.abort();
        }
        count
    }

    /// Drops branch bookkeeping for a settled gateway without aborting.
    pub fn clear_branches(&self, process_id: ProcessId, node_key: &str) {
        self.branches
            .lock()
            .expect("branch lock")
            .remove(&(process_id, node_key.to_string()));
    }

    /// Aborts and drops every outstanding branch of a process
    /// (rollback, terminate). Returns how many handles were aborted.
    pub fn abort_branches_for_process(&self, process_id: ProcessId) -> usize {
        let mut branches = self.branches.lock().expect("branch lock");
        let keys: Vec<(ProcessId, String)> = branches
            .keys()
            .filter(|(pid, _)| *pid == process_id)
            .cloned()
            .collect();
        let mut count = 0;
        for key in keys {
            if let Some(handles) = branches.remove(&key) {
                count += handles.len();
                for handle in handles {
                    handle.abort();
                }
            }
        }
        count
    }

    /// Drops branch bookkeeping for a settled process without aborting.
    pub fn clear_branches_for_process(&self, process_id: ProcessId) {
        self.branches
            .lock()
            .expect("branch lock")
            .retain(|(pid, _), _| *pid != process_id);
    }

    /// Returns the per-node serialization lock used for approval-record
    /// appends.
    #[must_use]
    pub fn node_lock(&self, process_id: ProcessId, node_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.node_locks
            .lock()
            .expect("node lock map")
            .entry((process_id, node_key.to_string()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Adds a task to each user's index entry.
    pub fn index_task(&self, users: &[String], task_id: TaskId) {
        let mut index = self.user_tasks.lock().expect("user index lock");
        for user in users {
            index.entry(user.clone()).or_default().insert(task_id);
        }
    }

    /// Removes a task from every user's index entry.
    pub fn unindex_task(&self, task_id: TaskId) {
        let mut index = self.user_tasks.lock().expect("user index lock");
        index.retain(|_, tasks| {
            tasks.remove(&task_id);
            !tasks.is_empty()
        });
    }

    /// Returns how many indexed open tasks a user holds.
    #[must_use]
    pub fn user_load(&self, user: &str) -> usize {
        self.user_tasks
            .lock()
            .expect("user index lock")
            .get(user)
            .map_or(0, HashSet::len)
    }

    /// Publishes an event, absorbing nothing: the bus is fire-and-forget.
    pub async fn publish(&self, event: EngineEvent) {
        self.bus.publish(event).await;
    }

    /// Appends a history record, logging (not failing) on store trouble.
    pub async fn record(&self, record: HistoryRecord) {
        if let Err(error) = self.history.append(record).await {
            warn!(error = %error, "failed to append history record");
        }
    }

    /// Builds a history record stamped `system`.
    #[must_use]
    pub fn system_record(
        &self,
        process_id: ProcessId,
        node_key: &str,
        action: &str,
    ) -> HistoryRecord {
        let mut record = HistoryRecord::new(process_id, node_key, "system", action);
        record.occurred_at = Utc::now();
        record
    }
}
