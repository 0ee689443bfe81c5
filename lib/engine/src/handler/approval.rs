//! Approval handler: human sign-off with pluggable convergence.
//!
//! Execution resolves the approver set (static candidates, a dynamic
//! variable, role and department expansion), applies standing
//! delegations, and opens one task per approver. Convergence runs on
//! every task settlement under a per-node lock and asks the strategy
//! whether the node is decided.

use crate::context::EngineContext;
use crate::error::EngineError;
use crate::handler::{HandlerCore, HandlerResult, NodeHandler};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use escapement_core::ProcessId;
use escapement_flow::{
    ApprovalConfig, ApprovalTally, EngineEvent, NodeInstance, NodeKind, ProcessInstance, Task,
    TaskAction, TaskStatus, coerce_bool,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// One recorded decision on an approval node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub task_id: escapement_core::TaskId,
    pub approver: String,
    pub action: TaskAction,
    pub comment: Option<String>,
    pub at: chrono::DateTime<Utc>,
}

/// Drives approval nodes.
pub struct ApprovalHandler {
    core: HandlerCore,
}

impl ApprovalHandler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: HandlerCore::new("approval"),
        }
    }

    /// Resolves the full approver list, deduped and order-preserving.
    async fn resolve_approvers(
        ctx: &Arc<EngineContext>,
        process: &ProcessInstance,
        config: &ApprovalConfig,
    ) -> Vec<String> {
        let mut approvers: Vec<String> = Vec::new();
        let mut push = |user: String| {
            if !user.is_empty() && !approvers.contains(&user) {
                approvers.push(user);
            }
        };

        for candidate in &config.candidates {
            push(candidate.clone());
        }
        if let Some(variable) = &config.dynamic_var
            && let Some(serde_json::Value::Array(users)) = process.variable(variable)
        {
            for user in users {
                if let serde_json::Value::String(user) = user {
                    push(user.clone());
                }
            }
        }
        for role in &config.roles {
            for user in ctx.identity.expand_role(role).await {
                push(user);
            }
        }
        for department in &config.departments {
            for user in ctx.identity.expand_department(department).await {
                push(user);
            }
        }

        approvers
    }

    /// Applies standing delegations to one approver, returning the
    /// effective assignee.
    async fn apply_delegation(
        ctx: &Arc<EngineContext>,
        process: &ProcessInstance,
        node_key: &str,
        approver: &str,
    ) -> String {
        let Ok(delegations) = ctx.delegations.list_for_delegator(approver).await else {
            return approver.to_string();
        };
        let now = Utc::now();
        for delegation in delegations {
            if !delegation.is_applicable(now, &process.template_code, node_key) {
                continue;
            }
            if let Some(condition) = &delegation.condition {
                let holds = ctx
                    .evaluator
                    .evaluate(condition, &process.variables)
                    .and_then(|value| coerce_bool(&value))
                    .unwrap_or(false);
                if !holds {
                    continue;
                }
            }
            debug!(
                from = approver,
                to = %delegation.delegatee,
                node_key,
                "standing delegation applied"
            );
            return delegation.delegatee.clone();
        }
        approver.to_string()
    }

    /// Counts decisions on the node's tasks.
    fn tally(tasks: &[Task]) -> ApprovalTally {
        let countable: Vec<&Task> = tasks
            .iter()
            .filter(|t| !matches!(t.status, TaskStatus::Cancelled | TaskStatus::Withdrawn))
            .collect();

        let decided = countable
            .iter()
            .filter(|t| {
                t.status == TaskStatus::Completed
                    && matches!(t.action, Some(TaskAction::Approve | TaskAction::Reject))
            })
            .count();
        let approved = countable
            .iter()
            .filter(|t| t.action == Some(TaskAction::Approve))
            .count();

        // Sequential progress: leading run of decided tasks in roster
        // order (task ids are time-ordered, so creation order holds).
        let order_index = countable
            .iter()
            .take_while(|t| t.status == TaskStatus::Completed && t.action.is_some())
            .count();

        ApprovalTally {
            total: countable.len(),
            decided,
            approved,
            order_index,
        }
    }

    /// Re-evaluates convergence after one of the node's tasks settled.
    ///
    /// Called by the task executor; serialized per node.
    pub async fn handle_task_settled(
        &self,
        ctx: &Arc<EngineContext>,
        process_id: ProcessId,
        node_key: &str,
    ) -> Result<(), EngineError> {
        let lock = ctx.node_lock(process_id, node_key);
        let _guard = lock.lock().await;

        let node = ctx.nodes.get_by_key(process_id, node_key).await?;
        if node.status.is_terminal() {
            return Ok(());
        }
        let NodeKind::Approval(config) = node.kind() else {
            return Ok(());
        };

        let tasks: Vec<Task> = ctx
            .tasks
            .list_for_process(process_id)
            .await?
            .into_iter()
            .filter(|t| t.node_key == node_key)
            .collect();

        let tally = Self::tally(&tasks);
        if !config.strategy.is_complete(tally) {
            return Ok(());
        }
        let approved = config.strategy.is_approved(tally);

        // The node is decided: nothing left for the open tasks to say.
        for task in &tasks {
            if task.status.is_open() {
                let mut task = task.clone();
                task.cancel();
                ctx.tasks.update(task.clone()).await?;
                ctx.unindex_task(task.id);
                ctx.publish(EngineEvent::TaskCancelled {
                    process_id,
                    task_id: task.id,
                    at: Utc::now(),
                })
                .await;
            }
        }

        if let Some(scheduler) = ctx.scheduler() {
            scheduler.cancel(
                escapement_scheduler::ScheduledKind::Timeout,
                process_id,
                node_key,
            );
        }

        let event = if approved {
            EngineEvent::ApprovalApproved {
                process_id,
                node_key: node_key.to_string(),
                at: Utc::now(),
            }
        } else {
            EngineEvent::ApprovalRejected {
                process_id,
                node_key: node_key.to_string(),
                at: Utc::now(),
            }
        };
        ctx.publish(event).await;
        debug!(node_key, approved, "approval converged");

        // The decision trail goes to history with the convergence.
        let records: Vec<ApprovalRecord> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .filter_map(|t| {
                let action = t.action?;
                Some(ApprovalRecord {
                    task_id: t.id,
                    approver: t
                        .claimed_by
                        .clone()
                        .or_else(|| t.assignees.first().cloned())
                        .unwrap_or_default(),
                    action,
                    comment: t.comment.clone(),
                    at: t.ended_at.unwrap_or_else(Utc::now),
                })
            })
            .collect();
        ctx.record(
            escapement_flow::HistoryRecord::new(
                process_id,
                node_key,
                "system",
                if approved {
                    "approval_approved"
                } else {
                    "approval_rejected"
                },
            )
            .with_detail(serde_json::to_string(&records).unwrap_or_default()),
        )
        .await;

        ctx.node_executor()
            .finish_waiting_node(process_id, node_key, approved)
            .await
    }

    /// Escalates a task whose urges ran out: new task for the escalation
    /// approvers, original cancelled.
    pub async fn escalate(
        &self,
        ctx: &Arc<EngineContext>,
        task: &Task,
        config: &ApprovalConfig,
    ) -> Result<(), EngineError> {
        let escalated_to = ctx
            .identity
            .escalate(&task.assignees, config.escalate_skip_levels)
            .await;
        if escalated_to.is_empty() {
            warn!(task_id = %task.id, "escalation produced no approvers");
            return Ok(());
        }

        let mut replacement = Task::new(
            task.process_id,
            task.node_key.clone(),
            format!("{} (escalated)", task.name),
            escalated_to,
        );
        replacement.variables = task.variables.clone();
        replacement.due_at = task.due_at;
        replacement.priority = task.priority + 1;
        ctx.task_executor().create_task(replacement).await?;

        let mut original = task.clone();
        original.cancel();
        ctx.tasks.update(original.clone()).await?;
        ctx.unindex_task(original.id);
        ctx.publish(EngineEvent::TaskCancelled {
            process_id: original.process_id,
            task_id: original.id,
            at: Utc::now(),
        })
        .await;
        Ok(())
    }
}

impl Default for ApprovalHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeHandler for ApprovalHandler {
    fn kind(&self) -> &'static str {
        "approval"
    }

    fn core(&self) -> &HandlerCore {
        &self.core
    }

    async fn execute(
        &self,
        ctx: &Arc<EngineContext>,
        process: &ProcessInstance,
        node: &NodeInstance,
    ) -> Result<HandlerResult, EngineError> {
        let NodeKind::Approval(config) = node.kind() else {
            return Err(EngineError::System {
                message: format!("approval handler given a {} node", node.kind().name()),
            });
        };

        let approvers = Self::resolve_approvers(ctx, process, config).await;
        if approvers.is_empty() {
            self.core.record(node.node_key(), false);
            return Err(EngineError::ValidationFailed {
                reason: format!("approval '{}' resolved no approvers", node.node_key()),
            });
        }

        let due_at = (config.timeout_hours > 0)
            .then(|| Utc::now() + ChronoDuration::hours(i64::from(config.timeout_hours)));

        let task_executor = ctx.task_executor();
        for approver in &approvers {
            let assignee =
                Self::apply_delegation(ctx, process, node.node_key(), approver).await;
            let mut task = Task::new(
                process.id,
                node.node_key(),
                node.definition.name.clone(),
                vec![assignee],
            )
            .with_priority(process.priority);
            task.due_at = due_at;
            task_executor.create_task(task).await?;
        }

        if let (Some(due), Some(scheduler)) = (due_at, ctx.scheduler()) {
            scheduler.schedule_timeout(
                process.id,
                node.node_key(),
                due,
                serde_json::Value::Null,
            )?;
        }

        debug!(
            node_key = node.node_key(),
            approvers = approvers.len(),
            due = ?due_at,
            "approval tasks opened"
        );
        self.core.record(node.node_key(), true);

        let mut result = HandlerResult::waiting();
        if let Some(due) = due_at {
            result = result.with_due_at(due);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with(action: Option<TaskAction>, status: TaskStatus) -> Task {
        let mut task = Task::new(ProcessId::new(), "approve", "Approve", vec!["u".to_string()]);
        task.status = status;
        task.action = action;
        task
    }

    #[test]
    fn tally_counts_decisions() {
        let tasks = vec![
            task_with(Some(TaskAction::Approve), TaskStatus::Completed),
            task_with(Some(TaskAction::Reject), TaskStatus::Completed),
            task_with(None, TaskStatus::Active),
        ];
        let tally = ApprovalHandler::tally(&tasks);
        assert_eq!(tally.total, 3);
        assert_eq!(tally.decided, 2);
        assert_eq!(tally.approved, 1);
        assert_eq!(tally.order_index, 2);
    }

    #[test]
    fn tally_ignores_cancelled() {
        let tasks = vec![
            task_with(Some(TaskAction::Approve), TaskStatus::Completed),
            task_with(None, TaskStatus::Cancelled),
        ];
        let tally = ApprovalHandler::tally(&tasks);
        assert_eq!(tally.total, 1);
        assert_eq!(tally.decided, 1);
        assert_eq!(tally.approved, 1);
    }

    #[test]
    fn order_index_stops_at_first_open_task() {
        let tasks = vec![
            task_with(Some(TaskAction::Approve), TaskStatus::Completed),
            task_with(None, TaskStatus::Active),
            task_with(Some(TaskAction::Approve), TaskStatus::Completed),
        ];
        let tally = ApprovalHandler::tally(&tasks);
        assert_eq!(tally.order_index, 1);
    }
}
