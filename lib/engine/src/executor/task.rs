//! The task executor: the lifecycle of human work items.
//!
//! Every operation checks its status precondition, persists, maintains
//! the user index, appends history, and publishes an event. Completion
//! additionally drives approval convergence. Background scans cover
//! deadlines, reminders, and auto-assignment.

use crate::context::EngineContext;
use crate::error::EngineError;
use crate::hooks::{HookEvent, HookStage};
use chrono::{Duration as ChronoDuration, Utc};
use escapement_core::{ProcessId, TaskId};
use escapement_flow::{
    AssignMode, EngineEvent, HistoryRecord, NodeKind, Task, TaskAction, TimeoutStrategy, Variables,
    coerce_bool,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

/// Actor name used for engine-driven task transitions.
const SYSTEM_ACTOR: &str = "system";

/// Drives tasks through their lifecycle.
pub struct TaskExecutor {
    ctx: Arc<EngineContext>,
}

impl TaskExecutor {
    /// Creates the executor over the shared context.
    #[must_use]
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Persists and indexes a new task.
    pub async fn create_task(&self, task: Task) -> Result<Task, EngineError> {
        let task = self.ctx.tasks.create(task).await?;
        self.ctx.index_task(&task.assignees, task.id);
        self.ctx.metrics.incr("tasks.created", 1);
        self.ctx
            .publish(EngineEvent::TaskAssigned {
                process_id: task.process_id,
                task_id: task.id,
                assignees: task.assignees.clone(),
                at: Utc::now(),
            })
            .await;
        self.ctx
            .record(
                HistoryRecord::new(task.process_id, &task.node_key, SYSTEM_ACTOR, "task_created")
                    .with_task(task.id),
            )
            .await;
        Ok(task)
    }

    async fn load_open(&self, task_id: TaskId, operation: &'static str) -> Result<Task, EngineError> {
        let task = self.ctx.tasks.get(task_id).await?;
        if !task.status.is_open() {
            return Err(EngineError::InvalidStatus {
                entity: "task",
                status: task.status.to_string(),
                operation,
            });
        }
        Ok(task)
    }

    async fn converge_if_approval(&self, process_id: ProcessId, node_key: &str) {
        let Ok(node) = self.ctx.nodes.get_by_key(process_id, node_key).await else {
            return;
        };
        if matches!(node.kind(), NodeKind::Approval(_)) {
            let approval = self.ctx.handlers().approval();
            if let Err(error) = approval
                .handle_task_settled(&self.ctx, process_id, node_key)
                .await
            {
                warn!(node_key, error = %error, "approval convergence failed");
            }
        }
    }

    /// Completes a task with an action.
    #[instrument(skip(self, variables), fields(task_id = %task_id, user))]
    pub async fn complete_task(
        &self,
        task_id: TaskId,
        user: &str,
        action: TaskAction,
        comment: Option<String>,
        variables: Variables,
    ) -> Result<Task, EngineError> {
        let mut task = self.load_open(task_id, "complete").await?;
        if user != SYSTEM_ACTOR && !task.is_assigned_to(user) {
            return Err(EngineError::InvalidParam {
                reason: format!("user '{user}' is not assigned to task {task_id}"),
            });
        }

        for (key, value) in &variables {
            task.variables.insert(key.clone(), value.clone());
        }
        task.complete(action, comment);
        self.ctx.tasks.update(task.clone()).await?;
        self.ctx.unindex_task(task.id);

        // Task variables flow into the process.
        if !task.variables.is_empty() {
            let mut process = self.ctx.processes.get(task.process_id).await?;
            process.merge_variables(&task.variables);
            self.ctx.processes.update(process).await?;
        }

        self.ctx.hooks.fire(&HookEvent {
            stage: HookStage::AfterTask,
            process_id: task.process_id,
            node_key: task.node_key.clone(),
            task_id: Some(task.id),
        });
        self.ctx.metrics.incr("tasks.completed", 1);
        self.ctx
            .publish(EngineEvent::TaskCompleted {
                process_id: task.process_id,
                task_id: task.id,
                action,
                actor: user.to_string(),
                at: Utc::now(),
            })
            .await;
        self.ctx
            .record(
                HistoryRecord::new(task.process_id, &task.node_key, user, action.to_string())
                    .with_task(task.id)
                    .with_variables(task.variables.clone()),
            )
            .await;

        self.converge_if_approval(task.process_id, &task.node_key).await;
        Ok(task)
    }

    /// Claims a task for one of its assignees.
    pub async fn claim_task(&self, task_id: TaskId, user: &str) -> Result<Task, EngineError> {
        let mut task = self.load_open(task_id, "claim").await?;
        if !task.is_assigned_to(user) {
            return Err(EngineError::InvalidParam {
                reason: format!("user '{user}' is not assigned to task {task_id}"),
            });
        }
        if task.claimed_by.is_some() {
            return Err(EngineError::InvalidStatus {
                entity: "task",
                status: "claimed".to_string(),
                operation: "claim",
            });
        }
        task.claim(user);
        self.ctx.tasks.update(task.clone()).await?;
        self.ctx
            .publish(EngineEvent::TaskClaimed {
                process_id: task.process_id,
                task_id: task.id,
                actor: user.to_string(),
                at: Utc::now(),
            })
            .await;
        Ok(task)
    }

    /// Cancels a task.
    pub async fn cancel_task(&self, task_id: TaskId) -> Result<Task, EngineError> {
        let mut task = self.load_open(task_id, "cancel").await?;
        task.cancel();
        self.ctx.tasks.update(task.clone()).await?;
        self.ctx.unindex_task(task.id);
        self.ctx
            .publish(EngineEvent::TaskCancelled {
                process_id: task.process_id,
                task_id: task.id,
                at: Utc::now(),
            })
            .await;
        self.converge_if_approval(task.process_id, &task.node_key).await;
        Ok(task)
    }

    /// Withdraws a task; only the process initiator may.
    pub async fn withdraw_task(&self, task_id: TaskId, user: &str) -> Result<Task, EngineError> {
        let mut task = self.load_open(task_id, "withdraw").await?;
        let process = self.ctx.processes.get(task.process_id).await?;
        if process.initiator != user {
            return Err(EngineError::InvalidParam {
                reason: format!("only the initiator may withdraw task {task_id}"),
            });
        }
        task.withdraw();
        self.ctx.tasks.update(task.clone()).await?;
        self.ctx.unindex_task(task.id);
        self.ctx
            .publish(EngineEvent::TaskWithdrawn {
                process_id: task.process_id,
                task_id: task.id,
                actor: user.to_string(),
                at: Utc::now(),
            })
            .await;
        self.ctx
            .record(
                HistoryRecord::new(task.process_id, &task.node_key, user, "withdraw")
                    .with_task(task.id),
            )
            .await;
        self.converge_if_approval(task.process_id, &task.node_key).await;
        Ok(task)
    }

    fn approval_config_of(&self, node: &escapement_flow::NodeInstance) -> Option<escapement_flow::ApprovalConfig> {
        match node.kind() {
            NodeKind::Approval(config) => Some(config.clone()),
            _ => None,
        }
    }

    /// Delegates a task: the original is cancelled, a provenance-keeping
    /// copy goes to the delegatee. A task may be delegated once.
    pub async fn delegate_task(
        &self,
        task_id: TaskId,
        from: &str,
        to: &str,
    ) -> Result<Task, EngineError> {
        let mut task = self.load_open(task_id, "delegate").await?;
        if !task.is_assigned_to(from) {
            return Err(EngineError::InvalidParam {
                reason: format!("user '{from}' is not assigned to task {task_id}"),
            });
        }
        if task.delegated_from.is_some() {
            return Err(EngineError::InvalidStatus {
                entity: "task",
                status: "delegated".to_string(),
                operation: "delegate",
            });
        }
        let node = self.ctx.nodes.get_by_key(task.process_id, &task.node_key).await?;
        if let Some(config) = self.approval_config_of(&node)
            && !config.allow_delegate
        {
            return Err(EngineError::NotSupported {
                operation: format!("delegation on node '{}'", task.node_key),
            });
        }

        let delegated = self.create_task(task.delegate_to(to)).await?;

        task.cancel();
        self.ctx.tasks.update(task.clone()).await?;
        self.ctx.unindex_task(task.id);
        self.ctx
            .publish(EngineEvent::TaskDelegated {
                process_id: task.process_id,
                task_id: task.id,
                delegated_to: delegated.id,
                from_user: from.to_string(),
                to_user: to.to_string(),
                at: Utc::now(),
            })
            .await;
        self.ctx
            .record(
                HistoryRecord::new(task.process_id, &task.node_key, from, "delegate")
                    .with_task(task.id)
                    .with_detail(format!("to {to}")),
            )
            .await;
        Ok(delegated)
    }

    /// Transfers a task: the assignee set is replaced.
    pub async fn transfer_task(
        &self,
        task_id: TaskId,
        from: &str,
        to: &str,
    ) -> Result<Task, EngineError> {
        let mut task = self.load_open(task_id, "transfer").await?;
        if !task.is_assigned_to(from) {
            return Err(EngineError::InvalidParam {
                reason: format!("user '{from}' is not assigned to task {task_id}"),
            });
        }
        let node = self.ctx.nodes.get_by_key(task.process_id, &task.node_key).await?;
        if let Some(config) = self.approval_config_of(&node)
            && !config.allow_transfer
        {
            return Err(EngineError::NotSupported {
                operation: format!("transfer on node '{}'", task.node_key),
            });
        }

        self.ctx.unindex_task(task.id);
        task.transfer_to(to);
        self.ctx.tasks.update(task.clone()).await?;
        self.ctx.index_task(&task.assignees, task.id);
        self.ctx
            .publish(EngineEvent::TaskTransferred {
                process_id: task.process_id,
                task_id: task.id,
                from_user: from.to_string(),
                to_user: to.to_string(),
                at: Utc::now(),
            })
            .await;
        Ok(task)
    }

    /// Urges a task, possibly escalating it.
    pub async fn urge_task(&self, task_id: TaskId, user: &str) -> Result<Task, EngineError> {
        let mut task = self.load_open(task_id, "urge").await?;
        task.urge();
        self.ctx.tasks.update(task.clone()).await?;
        self.ctx
            .publish(EngineEvent::TaskUrged {
                process_id: task.process_id,
                task_id: task.id,
                urge_count: task.urge_count,
                at: Utc::now(),
            })
            .await;
        self.ctx
            .record(
                HistoryRecord::new(task.process_id, &task.node_key, user, "urge")
                    .with_task(task.id),
            )
            .await;
        self.remind_task(task_id).await?;

        let node = self.ctx.nodes.get_by_key(task.process_id, &task.node_key).await?;
        if let Some(config) = self.approval_config_of(&node)
            && config.auto_escalate
            && config.max_urges > 0
            && task.urge_count >= config.max_urges
        {
            debug!(task_id = %task.id, "urge limit reached, escalating");
            self.ctx
                .handlers()
                .approval()
                .escalate(&self.ctx, &task, &config)
                .await?;
        }
        Ok(task)
    }

    /// Sends a reminder for a task.
    pub async fn remind_task(&self, task_id: TaskId) -> Result<(), EngineError> {
        let task = self.ctx.tasks.get(task_id).await?;
        self.ctx
            .publish(EngineEvent::TaskReminder {
                process_id: task.process_id,
                task_id: task.id,
                at: Utc::now(),
            })
            .await;
        Ok(())
    }

    /// Replaces a task's assignees.
    pub async fn assign_task(
        &self,
        task_id: TaskId,
        assignees: Vec<String>,
    ) -> Result<Task, EngineError> {
        if assignees.is_empty() {
            return Err(EngineError::InvalidParam {
                reason: "assignee list is empty".to_string(),
            });
        }
        let mut task = self.load_open(task_id, "assign").await?;
        self.ctx.unindex_task(task.id);
        task.assignees = assignees;
        task.status = escapement_flow::TaskStatus::Active;
        self.ctx.tasks.update(task.clone()).await?;
        self.ctx.index_task(&task.assignees, task.id);
        self.ctx
            .publish(EngineEvent::TaskAssigned {
                process_id: task.process_id,
                task_id: task.id,
                assignees: task.assignees.clone(),
                at: Utc::now(),
            })
            .await;
        Ok(task)
    }

    /// Reassigns a task (alias for replacing the assignee set).
    pub async fn reassign_task(
        &self,
        task_id: TaskId,
        assignees: Vec<String>,
    ) -> Result<Task, EngineError> {
        self.assign_task(task_id, assignees).await
    }

    /// Runs the assignment rules over one unassigned task.
    ///
    /// Returns the assignees chosen, or `None` when no rule matched.
    pub async fn auto_assign_task(
        &self,
        task_id: TaskId,
    ) -> Result<Option<Vec<String>>, EngineError> {
        let task = self.load_open(task_id, "auto-assign").await?;
        if !task.assignees.is_empty() {
            return Ok(Some(task.assignees));
        }

        let process = self.ctx.processes.get(task.process_id).await?;
        let mut scope = process.variables.clone();
        for (key, value) in &task.variables {
            scope.insert(key.clone(), value.clone());
        }

        let rules = self.ctx.rules.list_enabled().await?;
        for rule in rules {
            if let Some(expression) = &rule.expression {
                let matched = self
                    .ctx
                    .evaluator
                    .evaluate(expression, &scope)
                    .and_then(|value| coerce_bool(&value))
                    .unwrap_or(false);
                if !matched {
                    continue;
                }
            }

            let chosen: Vec<String> = match rule.mode {
                AssignMode::All => rule.assignees.clone(),
                AssignMode::Any => rule
                    .assignees
                    .iter()
                    .min_by_key(|user| self.ctx.user_load(user))
                    .cloned()
                    .into_iter()
                    .collect(),
                AssignMode::Percentage { percent } => {
                    let count = rule.percentage_count(percent);
                    rule.assignees.iter().take(count).cloned().collect()
                }
            };

            if !chosen.is_empty() {
                debug!(task_id = %task_id, rule = %rule.name, "auto-assigned");
                self.assign_task(task_id, chosen.clone()).await?;
                return Ok(Some(chosen));
            }
        }
        Ok(None)
    }

    /// Applies the owning node's timeout strategy to every overdue open
    /// task of a node.
    pub async fn handle_node_timeout(
        &self,
        process_id: ProcessId,
        node_key: &str,
    ) -> Result<(), EngineError> {
        let node = self.ctx.nodes.get_by_key(process_id, node_key).await?;
        let strategy = self
            .approval_config_of(&node)
            .map(|c| c.timeout_strategy)
            .unwrap_or_default();

        let now = Utc::now();
        let overdue: Vec<Task> = self
            .ctx
            .tasks
            .list_for_process(process_id)
            .await?
            .into_iter()
            .filter(|t| t.node_key == node_key && t.is_overdue(now))
            .collect();

        for task in overdue {
            match strategy {
                TimeoutStrategy::AutoPass => {
                    self.complete_task(
                        task.id,
                        SYSTEM_ACTOR,
                        TaskAction::Approve,
                        Some("deadline passed, auto-approved".to_string()),
                        Variables::new(),
                    )
                    .await?;
                }
                TimeoutStrategy::AutoReject => {
                    self.complete_task(
                        task.id,
                        SYSTEM_ACTOR,
                        TaskAction::Reject,
                        Some("deadline passed, auto-rejected".to_string()),
                        Variables::new(),
                    )
                    .await?;
                }
                TimeoutStrategy::Alert => {
                    self.remind_task(task.id).await?;
                }
                TimeoutStrategy::None => {
                    let mut task = task;
                    task.mark_timeout();
                    self.ctx.tasks.update(task.clone()).await?;
                    self.ctx.unindex_task(task.id);
                    self.ctx
                        .publish(EngineEvent::TaskTimeout {
                            process_id,
                            task_id: task.id,
                            at: Utc::now(),
                        })
                        .await;
                    self.converge_if_approval(process_id, node_key).await;
                }
            }
        }
        Ok(())
    }

    /// Spawns the timeout, reminder, and auto-assign scans.
    pub fn start_scans(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let settings = &self.ctx.settings.tasks;
        vec![
            self.clone().spawn_scan(
                Duration::from_millis(settings.timeout_scan_interval_ms),
                shutdown.clone(),
                ScanKind::Timeout,
            ),
            self.clone().spawn_scan(
                Duration::from_millis(settings.reminder_scan_interval_ms),
                shutdown.clone(),
                ScanKind::Reminder,
            ),
            self.clone().spawn_scan(
                Duration::from_millis(settings.auto_assign_interval_ms),
                shutdown,
                ScanKind::AutoAssign,
            ),
        ]
    }

    fn spawn_scan(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
        kind: ScanKind,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => return,
                }
                if let Err(error) = self.run_scan(kind).await {
                    warn!(scan = ?kind, error = %error, "task scan failed");
                }
            }
        })
    }

    async fn run_scan(&self, kind: ScanKind) -> Result<(), EngineError> {
        let open = self.ctx.tasks.list_open().await?;
        let now = Utc::now();

        match kind {
            ScanKind::Timeout => {
                let mut nodes: BTreeSet<(ProcessId, String)> = BTreeSet::new();
                for task in open.iter().filter(|t| t.is_overdue(now)) {
                    nodes.insert((task.process_id, task.node_key.clone()));
                }
                for (process_id, node_key) in nodes {
                    self.handle_node_timeout(process_id, &node_key).await?;
                }
            }
            ScanKind::Reminder => {
                let lead = ChronoDuration::milliseconds(
                    i64::try_from(self.ctx.settings.tasks.reminder_lead_ms).unwrap_or(i64::MAX),
                );
                for task in open {
                    let Some(due) = task.due_at else { continue };
                    if due - now <= lead {
                        self.remind_task(task.id).await?;
                    }
                }
            }
            ScanKind::AutoAssign => {
                for task in open.into_iter().filter(|t| t.assignees.is_empty()) {
                    self.auto_assign_task(task.id).await?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum ScanKind {
    Timeout,
    Reminder,
    AutoAssign,
}
