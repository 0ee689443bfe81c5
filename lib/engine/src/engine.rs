//! The engine facade: lifecycle and the external API surface.

use crate::config::EngineSettings;
use crate::context::EngineContext;
use crate::error::EngineError;
use crate::executor::node::NodeExecutor;
use crate::executor::task::TaskExecutor;
use crate::handler::{HandlerRegistry, timer};
use crate::identity::{IdentityResolver, StubIdentityResolver};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use escapement_core::Result as CoreResult;
use escapement_core::{ProcessId, TaskId};
use escapement_flow::{
    DelegationStore, EngineEvent, EventBus, Evaluator, ExecutionStatus, FastevalEvaluator,
    HistoryStore, LifecycleState, MemoryEventBus, MemoryStore, NodeInstance, NodeStore,
    ProcessInstance, ProcessStatus, ProcessStore, RuleStore, TaskAction, TaskStore, TemplateStore,
    TracingEventBus, Variables,
};
use escapement_scheduler::{
    NoopTaskSource, ScheduledKind, ScheduledTask, Scheduler, SchedulerError, TaskSink,
};
use escapement_service::ServiceRegistry;
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Request to start a process.
#[derive(Debug, Clone, Default)]
pub struct StartProcessRequest {
    pub template_code: String,
    pub business_key: String,
    pub module_code: String,
    pub form_code: String,
    pub initiator: String,
    pub variables: Variables,
    pub priority: i32,
}

impl StartProcessRequest {
    /// Creates a request with the two required fields.
    #[must_use]
    pub fn new(template_code: impl Into<String>, initiator: impl Into<String>) -> Self {
        Self {
            template_code: template_code.into(),
            initiator: initiator.into(),
            ..Self::default()
        }
    }

    /// Sets the business key.
    #[must_use]
    pub fn with_business_key(mut self, business_key: impl Into<String>) -> Self {
        self.business_key = business_key.into();
        self
    }

    /// Seeds initial variables.
    #[must_use]
    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// What [`Engine::start_process`] returns. Execution continues
/// asynchronously after this reply.
#[derive(Debug, Clone, PartialEq)]
pub struct StartProcessReply {
    pub process_id: ProcessId,
    pub status: ProcessStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub variables: Variables,
}

/// Point-in-time resource accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceUsage {
    /// Processes the engine is actively driving.
    pub running_processes: usize,
    /// Open tasks across all processes.
    pub open_tasks: usize,
    /// Obligations pending in the scheduler.
    pub pending_scheduled: usize,
}

/// Routes fired obligations back into the executors.
struct EngineSink {
    ctx: Arc<EngineContext>,
}

#[async_trait]
impl TaskSink for EngineSink {
    async fn fire(&self, task: &ScheduledTask) -> Result<(), SchedulerError> {
        let result: Result<(), EngineError> = match task.kind {
            ScheduledKind::Timeout => {
                self.ctx
                    .task_executor()
                    .handle_node_timeout(task.process_id, &task.node_key)
                    .await
            }
            ScheduledKind::Reminder => {
                let executor = self.ctx.task_executor();
                let open = self
                    .ctx
                    .tasks
                    .list_for_process(task.process_id)
                    .await
                    .map_err(EngineError::from);
                match open {
                    Ok(tasks) => {
                        for t in tasks
                            .into_iter()
                            .filter(|t| t.node_key == task.node_key && t.status.is_open())
                        {
                            if let Err(error) = executor.remind_task(t.id).await {
                                warn!(task_id = %t.id, error = %error, "reminder failed");
                            }
                        }
                        Ok(())
                    }
                    Err(error) => Err(error),
                }
            }
            ScheduledKind::Timer => timer::handle_timer_fire(&self.ctx, task).await,
        };
        result.map_err(|error| SchedulerError::Fire {
            message: error.to_string(),
        })
    }
}

/// The workflow engine.
pub struct Engine {
    ctx: Arc<EngineContext>,
    state: Mutex<LifecycleState>,
    shutdown: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Assembles an engine over the given collaborators.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
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
    ) -> Arc<Self> {
        let ctx = Arc::new(EngineContext::new(
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
        ));

        let node_executor = Arc::new(NodeExecutor::new(ctx.clone()));
        let task_executor = Arc::new(TaskExecutor::new(ctx.clone()));
        let handlers = Arc::new(HandlerRegistry::standard());
        ctx.wire(node_executor, task_executor, handlers);

        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            ctx,
            state: Mutex::new(LifecycleState::Ready),
            shutdown,
            background: Mutex::new(Vec::new()),
        })
    }

    /// Assembles an engine over an in-memory store, a recording bus, and
    /// the default evaluator. Intended for tests and embeddings.
    #[must_use]
    pub fn in_memory(settings: EngineSettings) -> (Arc<Self>, Arc<MemoryStore>, MemoryEventBus) {
        let store = Arc::new(MemoryStore::new());
        let bus = MemoryEventBus::new();
        let engine = Self::new(
            settings,
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(bus.clone()),
            Arc::new(FastevalEvaluator::new()),
            Arc::new(StubIdentityResolver),
            Arc::new(ServiceRegistry::with_builtins()),
        );
        (engine, store, bus)
    }

    /// Assembles an engine over an in-memory store with the tracing bus.
    #[must_use]
    pub fn in_memory_quiet(settings: EngineSettings) -> (Arc<Self>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine = Self::new(
            settings,
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(TracingEventBus),
            Arc::new(FastevalEvaluator::new()),
            Arc::new(StubIdentityResolver),
            Arc::new(ServiceRegistry::with_builtins()),
        );
        (engine, store)
    }

    /// The shared context, for advanced wiring (custom notification
    /// providers, hook registration).
    #[must_use]
    pub fn context(&self) -> Arc<EngineContext> {
        self.ctx.clone()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.lock().expect("engine state lock")
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        let state = self.state();
        if state.accepts_work() {
            Ok(())
        } else {
            Err(EngineError::InvalidStatus {
                entity: "engine",
                status: state.to_string(),
                operation: "serve",
            })
        }
    }

    /// Starts the engine: scheduler, task scans, background loops.
    ///
    /// Legal only from the ready state.
    pub fn start(&self) -> CoreResult<(), EngineError> {
        {
            let mut state = self.state.lock().expect("engine state lock");
            if *state != LifecycleState::Ready {
                return Err(EngineError::InvalidStatus {
                    entity: "engine",
                    status: state.to_string(),
                    operation: "start",
                }
                .into());
            }
            *state = LifecycleState::Running;
        }

        let sink = Arc::new(EngineSink {
            ctx: self.ctx.clone(),
        });
        let scheduler = Scheduler::start(
            self.ctx.settings.scheduler.to_scheduler_config(),
            sink,
            Arc::new(NoopTaskSource),
        );
        self.ctx.attach_scheduler(scheduler);

        let mut background = self.background.lock().expect("background lock");
        background.extend(
            self.ctx
                .task_executor()
                .start_scans(self.shutdown.subscribe()),
        );
        background.push(self.spawn_health_loop());
        background.push(self.spawn_resource_loop());

        info!("engine started");
        Ok(())
    }

    /// Stops the engine. Idempotent from the running state.
    pub fn stop(&self) -> CoreResult<(), EngineError> {
        {
            let mut state = self.state.lock().expect("engine state lock");
            match *state {
                LifecycleState::Stopped => return Ok(()),
                LifecycleState::Running | LifecycleState::Paused => {
                    *state = LifecycleState::Stopped;
                }
                _ => {
                    return Err(EngineError::InvalidStatus {
                        entity: "engine",
                        status: state.to_string(),
                        operation: "stop",
                    }
                    .into());
                }
            }
        }

        let _ = self.shutdown.send(true);
        if let Some(scheduler) = self.ctx.scheduler() {
            scheduler.stop();
        }
        for handle in self.background.lock().expect("background lock").drain(..) {
            handle.abort();
        }
        self.ctx.handlers().stop_all();
        info!("engine stopped");
        Ok(())
    }

    fn spawn_health_loop(&self) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let mut shutdown = self.shutdown.subscribe();
        let interval = Duration::from_millis(ctx.settings.engine.health_interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => return,
                }
                let handlers = ctx.handlers();
                let unhealthy = handlers.all().filter(|h| !h.is_healthy()).count();
                ctx.metrics
                    .gauge("engine.unhealthy_handlers", unhealthy as f64);
                if unhealthy > 0 {
                    warn!(unhealthy, "handlers reporting unhealthy");
                }
            }
        })
    }

    fn spawn_resource_loop(&self) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let mut shutdown = self.shutdown.subscribe();
        let interval = Duration::from_millis(ctx.settings.engine.resource_interval_ms);
        let stale_after = Duration::from_millis(ctx.settings.engine.stale_after_ms);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => return,
                }

                let running = ctx.running_count();
                ctx.metrics.gauge("engine.running_processes", running as f64);
                if running > ctx.settings.engine.max_processes {
                    warn!(
                        running,
                        limit = ctx.settings.engine.max_processes,
                        "running process limit exceeded"
                    );
                }

                if let Ok(open) = ctx.tasks.list_open().await {
                    ctx.metrics.gauge("engine.open_tasks", open.len() as f64);
                    if open.len() > ctx.settings.engine.max_tasks {
                        warn!(
                            open = open.len(),
                            limit = ctx.settings.engine.max_tasks,
                            "open task limit exceeded"
                        );
                    }
                }

                for process_id in ctx.stale_processes(stale_after) {
                    warn!(process_id = %process_id, "stale tracked process dropped");
                    ctx.untrack_process(process_id);
                }
            }
        })
    }

    /// Starts a process and begins driving it asynchronously.
    #[instrument(skip(self, request), fields(template = %request.template_code))]
    pub async fn start_process(
        &self,
        request: StartProcessRequest,
    ) -> CoreResult<StartProcessReply, EngineError> {
        self.ensure_running()?;
        if request.initiator.is_empty() {
            return Err(EngineError::InvalidParam {
                reason: "initiator is required".to_string(),
            }
            .into());
        }

        let template = self
            .ctx
            .templates
            .get_by_code(&request.template_code)
            .await
            .map_err(EngineError::from)?;
        let graph = template.graph().map_err(EngineError::from)?;
        graph.validate().map_err(EngineError::from)?;

        let mut process = ProcessInstance::new(
            template.id,
            template.code.clone(),
            request.business_key,
            request.initiator,
        )
        .with_module(request.module_code)
        .with_form(request.form_code)
        .with_variables(request.variables)
        .with_priority(request.priority);
        process.start();

        let process = self
            .ctx
            .processes
            .create(process)
            .await
            .map_err(EngineError::from)?;
        let process_id = process.id;

        let executor = self.ctx.node_executor();
        executor.materialize_nodes(process_id, &template).await?;

        self.ctx.metrics.incr("engine.processes_started", 1);
        self.ctx
            .publish(EngineEvent::ProcessStarted {
                process_id,
                template_code: template.code.clone(),
                initiator: process.initiator.clone(),
                at: Utc::now(),
            })
            .await;
        self.ctx
            .record(self.ctx.system_record(process_id, "", "process_started"))
            .await;

        // The caller gets the reply now; execution continues on its own.
        tokio::spawn(async move {
            if let Err(error) = executor.execute_process(process_id).await {
                executor.fail_process(process_id, &error).await;
            }
        });

        Ok(StartProcessReply {
            process_id,
            status: process.status,
            started_at: process.started_at,
            variables: process.variables,
        })
    }

    /// Drives a process synchronously from its start node.
    pub async fn execute(&self, process_id: ProcessId) -> CoreResult<(), EngineError> {
        self.ensure_running()?;
        let executor = self.ctx.node_executor();
        if let Err(error) = executor.execute_process(process_id).await {
            executor.fail_process(process_id, &error).await;
            return Err(error.into());
        }
        Ok(())
    }

    /// Forces a process into the completed status.
    pub async fn complete_process(&self, process_id: ProcessId) -> CoreResult<(), EngineError> {
        self.ensure_running()?;
        self.ctx.node_executor().complete_process(process_id).await?;
        Ok(())
    }

    /// Suspends a process, cancelling its active node contexts.
    pub async fn suspend_process(&self, process_id: ProcessId) -> CoreResult<(), EngineError> {
        self.ensure_running()?;
        let mut process = self
            .ctx
            .processes
            .get(process_id)
            .await
            .map_err(EngineError::from)?;
        if process.status != ProcessStatus::Active {
            return Err(EngineError::InvalidStatus {
                entity: "process",
                status: process.status.to_string(),
                operation: "suspend",
            }
            .into());
        }

        self.ctx.trigger_cancel(process_id);
        if let Some(scheduler) = self.ctx.scheduler() {
            scheduler.cancel_for_process(process_id);
        }

        process.suspend();
        self.ctx
            .processes
            .update(process)
            .await
            .map_err(EngineError::from)?;
        self.ctx
            .publish(EngineEvent::ProcessSuspended {
                process_id,
                at: Utc::now(),
            })
            .await;
        debug!(process_id = %process_id, "process suspended");
        Ok(())
    }

    /// Resumes a suspended process from its current node.
    pub async fn resume_process(&self, process_id: ProcessId) -> CoreResult<(), EngineError> {
        self.ensure_running()?;
        let mut process = self
            .ctx
            .processes
            .get(process_id)
            .await
            .map_err(EngineError::from)?;
        if process.status != ProcessStatus::Suspended {
            return Err(EngineError::InvalidStatus {
                entity: "process",
                status: process.status.to_string(),
                operation: "resume",
            }
            .into());
        }

        self.ctx.reset_cancel(process_id);
        process.resume();
        let current = process.current_node_key.clone();
        self.ctx
            .processes
            .update(process)
            .await
            .map_err(EngineError::from)?;
        self.ctx
            .publish(EngineEvent::ProcessResumed {
                process_id,
                at: Utc::now(),
            })
            .await;

        if let Some(node_key) = current {
            // Replay the node that was interrupted. A node still driven by
            // open tasks (a waiting approval) is not replayed: re-executing
            // it would duplicate its tasks.
            let mut node = self
                .ctx
                .nodes
                .get_by_key(process_id, &node_key)
                .await
                .map_err(EngineError::from)?;
            let has_open_tasks = self
                .ctx
                .tasks
                .list_for_process(process_id)
                .await
                .map_err(EngineError::from)?
                .iter()
                .any(|t| t.node_key == node_key && t.status.is_open());
            if has_open_tasks {
                return Ok(());
            }
            if node.status == ExecutionStatus::Cancelled || node.status == ExecutionStatus::Active
            {
                node.mark_ready();
                self.ctx
                    .nodes
                    .update(node)
                    .await
                    .map_err(EngineError::from)?;
            }
            let executor = self.ctx.node_executor();
            tokio::spawn(async move {
                if let Err(error) = executor.execute_node(process_id, &node_key).await {
                    executor.fail_process(process_id, &error).await;
                }
            });
        }
        Ok(())
    }

    /// Terminates a process, cancelling active work and open tasks.
    pub async fn terminate_process(
        &self,
        process_id: ProcessId,
        reason: Option<String>,
    ) -> CoreResult<(), EngineError> {
        self.ensure_running()?;
        let mut process = self
            .ctx
            .processes
            .get(process_id)
            .await
            .map_err(EngineError::from)?;
        if process.status.is_terminal() {
            return Err(EngineError::InvalidStatus {
                entity: "process",
                status: process.status.to_string(),
                operation: "terminate",
            }
            .into());
        }

        self.ctx.trigger_cancel(process_id);
        self.ctx.abort_branches_for_process(process_id);
        if let Some(scheduler) = self.ctx.scheduler() {
            scheduler.cancel_for_process(process_id);
        }

        let task_executor = self.ctx.task_executor();
        let open = self
            .ctx
            .tasks
            .list_for_process(process_id)
            .await
            .map_err(EngineError::from)?;
        for task in open.into_iter().filter(|t| t.status.is_open()) {
            if let Err(error) = task_executor.cancel_task(task.id).await {
                warn!(task_id = %task.id, error = %error, "task cancel on terminate failed");
            }
        }

        process.terminate();
        self.ctx
            .processes
            .update(process)
            .await
            .map_err(EngineError::from)?;
        self.ctx
            .publish(EngineEvent::ProcessTerminated {
                process_id,
                reason,
                at: Utc::now(),
            })
            .await;
        self.ctx
            .record(self.ctx.system_record(process_id, "", "process_terminated"))
            .await;

        self.ctx.clear_joins(process_id);
        self.ctx.untrack_process(process_id);
        self.ctx.drop_cancel(process_id);
        Ok(())
    }

    /// Completes a task on behalf of a user.
    pub async fn complete_task(
        &self,
        task_id: TaskId,
        user: &str,
        action: TaskAction,
        comment: Option<String>,
        variables: Variables,
    ) -> CoreResult<(), EngineError> {
        self.ensure_running()?;
        self.ctx
            .task_executor()
            .complete_task(task_id, user, action, comment, variables)
            .await?;
        Ok(())
    }

    /// Delegates a task to another user.
    pub async fn delegate_task(
        &self,
        task_id: TaskId,
        from: &str,
        to: &str,
    ) -> CoreResult<TaskId, EngineError> {
        self.ensure_running()?;
        let delegated = self
            .ctx
            .task_executor()
            .delegate_task(task_id, from, to)
            .await?;
        Ok(delegated.id)
    }

    /// Transfers a task to another user.
    pub async fn transfer_task(
        &self,
        task_id: TaskId,
        from: &str,
        to: &str,
    ) -> CoreResult<(), EngineError> {
        self.ensure_running()?;
        self.ctx
            .task_executor()
            .transfer_task(task_id, from, to)
            .await?;
        Ok(())
    }

    /// Withdraws a task.
    pub async fn withdraw_task(&self, task_id: TaskId, user: &str) -> CoreResult<(), EngineError> {
        self.ensure_running()?;
        self.ctx.task_executor().withdraw_task(task_id, user).await?;
        Ok(())
    }

    /// Urges a task.
    pub async fn urge_task(&self, task_id: TaskId, user: &str) -> CoreResult<(), EngineError> {
        self.ensure_running()?;
        self.ctx.task_executor().urge_task(task_id, user).await?;
        Ok(())
    }

    /// Claims a task.
    pub async fn claim_task(&self, task_id: TaskId, user: &str) -> CoreResult<(), EngineError> {
        self.ensure_running()?;
        self.ctx.task_executor().claim_task(task_id, user).await?;
        Ok(())
    }

    /// Rolls one completed node back to the ready state.
    pub async fn rollback_node(
        &self,
        process_id: ProcessId,
        node_key: &str,
    ) -> CoreResult<(), EngineError> {
        self.ensure_running()?;
        let process = self
            .ctx
            .processes
            .get(process_id)
            .await
            .map_err(EngineError::from)?;
        let mut node = self
            .ctx
            .nodes
            .get_by_key(process_id, node_key)
            .await
            .map_err(EngineError::from)?;
        if node.status != ExecutionStatus::Completed {
            return Err(EngineError::InvalidStatus {
                entity: "node",
                status: node.status.to_string(),
                operation: "rollback",
            }
            .into());
        }

        if let Some(handler) = self.ctx.handlers().get(node.kind().name()) {
            handler.rollback(&self.ctx, &process, &node).await?;
        }
        node.rollback();
        node.mark_ready();
        self.ctx
            .nodes
            .update(node)
            .await
            .map_err(EngineError::from)?;
        self.ctx
            .record(self.ctx.system_record(process_id, node_key, "node_rollback"))
            .await;
        Ok(())
    }

    /// Cancels active work and jumps execution to another node.
    pub async fn jump_to_node(
        &self,
        process_id: ProcessId,
        target_key: &str,
    ) -> CoreResult<(), EngineError> {
        self.ensure_running()?;
        let mut process = self
            .ctx
            .processes
            .get(process_id)
            .await
            .map_err(EngineError::from)?;
        if !process.is_runnable() {
            return Err(EngineError::InvalidStatus {
                entity: "process",
                status: process.status.to_string(),
                operation: "jump",
            }
            .into());
        }
        let mut target = self
            .ctx
            .nodes
            .get_by_key(process_id, target_key)
            .await
            .map_err(EngineError::from)?;

        // Cancel whatever is in flight before moving the cursor.
        self.ctx.trigger_cancel(process_id);
        self.ctx.clear_joins(process_id);
        if let Some(scheduler) = self.ctx.scheduler() {
            scheduler.cancel_for_process(process_id);
        }
        self.ctx.reset_cancel(process_id);

        let from = process.current_node_key.clone();
        process.active_node_keys.clear();
        process.current_node_key = Some(target_key.to_string());
        self.ctx
            .processes
            .update(process)
            .await
            .map_err(EngineError::from)?;

        if target.status.is_terminal() || target.status == ExecutionStatus::Active {
            target.mark_ready();
            self.ctx
                .nodes
                .update(target)
                .await
                .map_err(EngineError::from)?;
        }

        self.ctx
            .publish(EngineEvent::NodeJumped {
                process_id,
                from_node_key: from,
                to_node_key: target_key.to_string(),
                at: Utc::now(),
            })
            .await;

        let executor = self.ctx.node_executor();
        let target_key = target_key.to_string();
        tokio::spawn(async move {
            if let Err(error) = executor.execute_node(process_id, &target_key).await {
                executor.fail_process(process_id, &error).await;
            }
        });
        Ok(())
    }

    /// Sets one process variable.
    pub async fn set_variable(
        &self,
        process_id: ProcessId,
        name: &str,
        value: JsonValue,
    ) -> CoreResult<(), EngineError> {
        self.ensure_running()?;
        let mut process = self
            .ctx
            .processes
            .get(process_id)
            .await
            .map_err(EngineError::from)?;
        process.set_variable(name, value.clone());
        self.ctx
            .processes
            .update(process)
            .await
            .map_err(EngineError::from)?;

        let mut changed = Variables::new();
        changed.insert(name.to_string(), value);
        self.ctx
            .publish(EngineEvent::VariablesUpdated {
                process_id,
                variables: changed,
                at: Utc::now(),
            })
            .await;
        Ok(())
    }

    /// Reads one process variable.
    pub async fn get_variable(
        &self,
        process_id: ProcessId,
        name: &str,
    ) -> CoreResult<Option<JsonValue>, EngineError> {
        let process = self
            .ctx
            .processes
            .get(process_id)
            .await
            .map_err(EngineError::from)?;
        Ok(process.variable(name).cloned())
    }

    /// Returns a process's status.
    pub async fn get_process_status(
        &self,
        process_id: ProcessId,
    ) -> CoreResult<ProcessStatus, EngineError> {
        let process = self
            .ctx
            .processes
            .get(process_id)
            .await
            .map_err(EngineError::from)?;
        Ok(process.status)
    }

    /// Returns the keys of a process's active nodes.
    pub async fn get_active_nodes(
        &self,
        process_id: ProcessId,
    ) -> CoreResult<Vec<String>, EngineError> {
        let process = self
            .ctx
            .processes
            .get(process_id)
            .await
            .map_err(EngineError::from)?;
        Ok(process.active_node_keys.iter().cloned().collect())
    }

    /// Returns the template successors of a node.
    pub async fn get_next_nodes(
        &self,
        process_id: ProcessId,
        node_key: &str,
    ) -> CoreResult<Vec<String>, EngineError> {
        let process = self
            .ctx
            .processes
            .get(process_id)
            .await
            .map_err(EngineError::from)?;
        let graph = self.ctx.graph_for(&process).await?;
        Ok(graph
            .successors(node_key)
            .into_iter()
            .map(|n| n.node_key.clone())
            .collect())
    }

    /// Returns one node instance.
    pub async fn get_node_info(
        &self,
        process_id: ProcessId,
        node_key: &str,
    ) -> CoreResult<NodeInstance, EngineError> {
        Ok(self
            .ctx
            .nodes
            .get_by_key(process_id, node_key)
            .await
            .map_err(EngineError::from)?)
    }

    /// Returns resource accounting.
    pub async fn get_resource_usage(&self) -> CoreResult<ResourceUsage, EngineError> {
        let open_tasks = self
            .ctx
            .tasks
            .list_open()
            .await
            .map_err(EngineError::from)?
            .len();
        Ok(ResourceUsage {
            running_processes: self.ctx.running_count(),
            open_tasks,
            pending_scheduled: self
                .ctx
                .scheduler()
                .map_or(0, escapement_scheduler::Scheduler::pending_count),
        })
    }

    /// Returns nested metrics per component.
    #[must_use]
    pub fn get_metrics(&self) -> JsonValue {
        let mut snapshot = self.ctx.metrics.snapshot();
        if let Some(scheduler) = self.ctx.scheduler()
            && let JsonValue::Object(map) = &mut snapshot
        {
            let counters = scheduler.counters();
            let mut scheduler_map = serde_json::Map::new();
            for (kind, counter) in counters {
                scheduler_map.insert(
                    kind.as_str().to_string(),
                    serde_json::json!({
                        "scheduled": counter.scheduled,
                        "completed": counter.completed,
                        "failed": counter.failed,
                    }),
                );
            }
            map.insert("scheduler".to_string(), JsonValue::Object(scheduler_map));
        }
        snapshot
    }

    /// Re-dispatches every active process: crash recovery on startup.
    pub async fn resume_processes(&self) -> CoreResult<usize, EngineError> {
        self.ensure_running()?;
        let actives = self
            .ctx
            .processes
            .list_by_status(
                ProcessStatus::Active,
                escapement_flow::Page::new(0, usize::MAX),
            )
            .await
            .map_err(EngineError::from)?;

        let mut resumed = 0;
        for process in actives {
            let process_id = process.id;
            let executor = self.ctx.node_executor();

            match process.current_node_key {
                Some(node_key) => {
                    // A node waiting on open tasks resumes through task
                    // completion, not through replay.
                    let waiting_on_tasks = self
                        .ctx
                        .tasks
                        .list_for_process(process_id)
                        .await
                        .map(|tasks| {
                            tasks
                                .iter()
                                .any(|t| t.node_key == node_key && t.status.is_open())
                        })
                        .unwrap_or(false);
                    if waiting_on_tasks {
                        resumed += 1;
                        continue;
                    }
                    // The node in flight at crash time replays.
                    if let Ok(mut node) = self.ctx.nodes.get_by_key(process_id, &node_key).await
                        && node.status == ExecutionStatus::Active
                    {
                        node.mark_ready();
                        let _ = self.ctx.nodes.update(node).await;
                    }
                    tokio::spawn(async move {
                        if let Err(error) = executor.execute_node(process_id, &node_key).await {
                            executor.fail_process(process_id, &error).await;
                        }
                    });
                }
                None => {
                    tokio::spawn(async move {
                        if let Err(error) = executor.execute_process(process_id).await {
                            executor.fail_process(process_id, &error).await;
                        }
                    });
                }
            }
            resumed += 1;
        }
        debug!(resumed, "active processes re-dispatched");
        Ok(resumed)
    }

    /// Validates a process's template graph.
    pub async fn validate(&self, process_id: ProcessId) -> CoreResult<(), EngineError> {
        let process = self
            .ctx
            .processes
            .get(process_id)
            .await
            .map_err(EngineError::from)?;
        let graph = self.ctx.graph_for(&process).await?;
        graph.validate().map_err(EngineError::from)?;

        let handlers = self.ctx.handlers();
        for definition in graph.nodes() {
            if let Some(handler) = handlers.get(definition.kind.name()) {
                handler.validate(definition)?;
            }
        }
        Ok(())
    }
}
