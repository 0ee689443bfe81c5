//! The node executor: drives single nodes and the completion recursion.
//!
//! One node's lifecycle is a serialized sequence (pre-hook, activate,
//! handler under retry, post-hook, status update, events) even though
//! the sequence as a whole may run on any worker. Completion queries the
//! template graph for successors and recurses; parallel joins gate on a
//! shared join context so exactly one arrival proceeds.

use crate::context::EngineContext;
use crate::error::EngineError;
use crate::handler::{HandlerOutcome, HandlerResult};
use crate::hooks::{HookEvent, HookStage};
use chrono::Utc;
use escapement_core::retry::{RetryExecutor, RetryPolicy};
use escapement_core::{Coded, ProcessId};
use futures::future::BoxFuture;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use escapement_flow::{EngineEvent, NodeKind, Template};

/// Drives nodes through execution and completion.
pub struct NodeExecutor {
    ctx: Arc<EngineContext>,
}

impl NodeExecutor {
    /// Creates the executor over the shared context.
    #[must_use]
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Materializes node instances for a fresh process from its template.
    pub async fn materialize_nodes(
        &self,
        process_id: ProcessId,
        template: &Template,
    ) -> Result<(), EngineError> {
        for definition in &template.nodes {
            self.ctx
                .nodes
                .create(escapement_flow::NodeInstance::new(
                    process_id,
                    definition.clone(),
                ))
                .await?;
        }
        Ok(())
    }

    /// Runs a process from its start node under the engine default
    /// deadline.
    #[instrument(skip(self), fields(process_id = %process_id))]
    pub async fn execute_process(&self, process_id: ProcessId) -> Result<(), EngineError> {
        let process = self.ctx.processes.get(process_id).await?;
        if !process.is_runnable() {
            return Err(EngineError::InvalidStatus {
                entity: "process",
                status: process.status.to_string(),
                operation: "execute",
            });
        }

        let nodes = self.ctx.nodes.list_for_process(process_id).await?;
        let start_keys: Vec<String> = nodes
            .iter()
            .filter(|n| n.kind().is_start())
            .map(|n| n.node_key().to_string())
            .collect();
        let start_key = match start_keys.as_slice() {
            [key] => key.clone(),
            [] => {
                return Err(EngineError::Validation {
                    reason: "process has no start node".to_string(),
                });
            }
            many => {
                return Err(EngineError::Validation {
                    reason: format!("process has {} start nodes", many.len()),
                });
            }
        };

        let deadline = self.ctx.settings.engine.default_timeout();
        tokio::time::timeout(deadline, self.execute_node(process_id, &start_key))
            .await
            .map_err(|_| EngineError::Timeout {
                what: format!("process {process_id}"),
            })?
    }

    /// Rolls the process back and marks it failed. Secondary failures are
    /// logged, not surfaced: the caller already has the primary error.
    pub async fn fail_process(&self, process_id: ProcessId, error: &EngineError) {
        warn!(process_id = %process_id, error = %error, "process failed");
        let aborted = self.ctx.abort_branches_for_process(process_id);
        if aborted > 0 {
            debug!(process_id = %process_id, aborted, "in-flight branches aborted");
        }
        if self.ctx.settings.executor.rollback_enabled {
            if let Err(rollback_error) = self.rollback_process(process_id).await {
                warn!(
                    process_id = %process_id,
                    error = %rollback_error,
                    "rollback failed"
                );
            }
        } else if let Ok(mut process) = self.ctx.processes.get(process_id).await
            && !process.status.is_terminal()
        {
            process.fail();
            let _ = self.ctx.processes.update(process).await;
        }
        self.ctx.untrack_process(process_id);
        self.ctx.clear_joins(process_id);
    }

    /// Compensates completed nodes in reverse completion order, then
    /// marks the process failed.
    pub async fn rollback_process(&self, process_id: ProcessId) -> Result<(), EngineError> {
        let process = self.ctx.processes.get(process_id).await?;
        let nodes = self.ctx.nodes.list_for_process(process_id).await?;
        let handlers = self.ctx.handlers();

        // Nodes still in flight (a gateway mid-fan-out when a sibling
        // failed) are cancelled before compensation walks the completed
        // ones.
        for node in nodes
            .iter()
            .filter(|n| n.status == escapement_flow::ExecutionStatus::Active)
        {
            if let Some(handler) = handlers.get(node.kind().name())
                && let Err(error) = handler.cancel(&self.ctx, &process, node).await
            {
                warn!(
                    node_key = node.node_key(),
                    error = %error,
                    "node cancel failed"
                );
            }
            let mut node = node.clone();
            node.cancel();
            self.ctx.nodes.update(node).await?;
        }

        let mut completed: Vec<_> = nodes
            .into_iter()
            .filter(|n| n.status == escapement_flow::ExecutionStatus::Completed)
            .collect();
        completed.sort_by(|a, b| b.ended_at.cmp(&a.ended_at));
        for mut node in completed {
            if let Some(handler) = handlers.get(node.kind().name())
                && let Err(error) = handler.rollback(&self.ctx, &process, &node).await
            {
                warn!(
                    node_key = node.node_key(),
                    error = %error,
                    "node compensation failed"
                );
            }
            node.rollback();
            self.ctx.nodes.update(node).await?;
        }

        let mut process = self.ctx.processes.get(process_id).await?;
        if !process.status.is_terminal() {
            process.fail();
            self.ctx.processes.update(process).await?;
        }
        self.ctx
            .record(
                self.ctx
                    .system_record(process_id, "", "process_rollback"),
            )
            .await;
        Ok(())
    }

    /// Drives one node. Boxed so completion can recurse.
    pub fn execute_node<'a>(
        &'a self,
        process_id: ProcessId,
        node_key: &'a str,
    ) -> BoxFuture<'a, Result<(), EngineError>> {
        Box::pin(self.execute_node_inner(process_id, node_key))
    }

    async fn execute_node_inner(
        &self,
        process_id: ProcessId,
        node_key: &str,
    ) -> Result<(), EngineError> {
        let mut process = self.ctx.processes.get(process_id).await?;
        if process.status.is_terminal() || process.is_suspended {
            debug!(process_id = %process_id, node_key, "process settled, node skipped");
            return Ok(());
        }

        let mut node = self.ctx.nodes.get_by_key(process_id, node_key).await?;
        if node.status.is_terminal() || node.status == escapement_flow::ExecutionStatus::Active {
            // Completed nodes never re-execute; active nodes are already
            // being driven (a join double-arrival lands here).
            return Ok(());
        }

        self.ctx.hooks.fire(&HookEvent {
            stage: HookStage::BeforeNode,
            process_id,
            node_key: node_key.to_string(),
            task_id: None,
        });

        node.activate();
        self.ctx.nodes.update(node.clone()).await?;
        process.node_activated(node_key);
        self.ctx.processes.update(process.clone()).await?;
        self.ctx.track_node_start(process_id);
        self.ctx.metrics.incr("engine.nodes_started", 1);
        self.ctx
            .publish(EngineEvent::NodeStarted {
                process_id,
                node_key: node_key.to_string(),
                at: Utc::now(),
            })
            .await;

        let handler = self.ctx.handlers().get(node.kind().name()).ok_or_else(|| {
            EngineError::NotSupported {
                operation: format!("node kind {}", node.kind().name()),
            }
        })?;

        // Service nodes retry inside the service layer; everything else
        // retries here under the node's (or the engine's) policy.
        let policy = node.definition.retry.clone().unwrap_or_else(|| {
            if matches!(node.kind(), NodeKind::Service(_)) {
                RetryPolicy::no_retry()
            } else {
                self.ctx.settings.retry.clone()
            }
        });
        let retry = RetryExecutor::new(policy);

        let ctx = self.ctx.clone();
        let retry_handler = handler.clone();
        let process_snapshot = process.clone();
        let node_snapshot = node.clone();
        let work = retry.run(move |_attempt| {
            let ctx = ctx.clone();
            let handler = retry_handler.clone();
            let process = process_snapshot.clone();
            let node = node_snapshot.clone();
            async move { handler.execute(&ctx, &process, &node).await }
        });

        let cancel = self.ctx.cancel_token(process_id);
        let node_deadline = node.definition.timeout_ms.map(Duration::from_millis);
        let outcome: Option<Result<HandlerResult, EngineError>> = {
            let cancelled = cancelled(cancel);
            tokio::pin!(cancelled);
            match node_deadline {
                Some(deadline) => tokio::select! {
                    result = tokio::time::timeout(deadline, work) => Some(
                        result.unwrap_or_else(|_| Err(EngineError::Timeout {
                            what: format!("node '{node_key}'"),
                        })),
                    ),
                    () = &mut cancelled => None,
                },
                None => tokio::select! {
                    result = work => Some(result),
                    () = &mut cancelled => None,
                },
            }
        };

        self.ctx.track_node_end(process_id);

        let Some(outcome) = outcome else {
            // Cancelled by suspend, terminate, or jump.
            if let Err(error) = handler.cancel(&self.ctx, &process, &node).await {
                warn!(node_key, error = %error, "handler cancel failed");
            }
            node.cancel();
            self.ctx.nodes.update(node).await?;
            if let Ok(mut process) = self.ctx.processes.get(process_id).await {
                process.node_settled(node_key);
                let _ = self.ctx.processes.update(process).await;
            }
            debug!(process_id = %process_id, node_key, "node cancelled");
            return Ok(());
        };

        match outcome {
            Err(error) => {
                node.fail(error.to_string());
                let kind = node.kind().name();
                self.ctx.nodes.update(node).await?;
                self.ctx.metrics.incr("engine.nodes_failed", 1);
                self.ctx
                    .publish(EngineEvent::NodeFailed {
                        process_id,
                        node_key: node_key.to_string(),
                        error: error.to_string(),
                        at: Utc::now(),
                    })
                    .await;
                if error.code() == escapement_core::ErrorCode::System {
                    // A fault in the machinery, not the node's work.
                    self.ctx
                        .publish(EngineEvent::NodeError {
                            process_id,
                            node_key: node_key.to_string(),
                            error: error.to_string(),
                            at: Utc::now(),
                        })
                        .await;
                    self.ctx
                        .publish(EngineEvent::HandlerError {
                            handler: kind.to_string(),
                            error: error.to_string(),
                            at: Utc::now(),
                        })
                        .await;
                }
                if let Ok(mut process) = self.ctx.processes.get(process_id).await {
                    process.node_settled(node_key);
                    let _ = self.ctx.processes.update(process).await;
                }
                Err(error)
            }
            Ok(result) => {
                self.apply_success(process_id, node_key, node, result)
                    .await
            }
        }
    }

    async fn apply_success(
        &self,
        process_id: ProcessId,
        node_key: &str,
        mut node: escapement_flow::NodeInstance,
        result: HandlerResult,
    ) -> Result<(), EngineError> {
        let mut process = self.ctx.processes.get(process_id).await?;
        if !result.variables.is_empty() {
            process.merge_variables(&result.variables);
        }
        if let Some(due_at) = result.due_at {
            node.due_at = Some(due_at);
        }

        self.ctx.hooks.fire(&HookEvent {
            stage: HookStage::AfterNode,
            process_id,
            node_key: node_key.to_string(),
            task_id: None,
        });

        match result.outcome {
            HandlerOutcome::Waiting => {
                self.ctx.nodes.update(node).await?;
                self.ctx.processes.update(process).await?;
                debug!(node_key, "node waiting");
                Ok(())
            }
            HandlerOutcome::Completed | HandlerOutcome::RouteTo(_) => {
                node.complete();
                self.ctx.nodes.update(node.clone()).await?;
                process.node_settled(node_key);
                self.ctx.processes.update(process.clone()).await?;
                self.ctx.metrics.incr("engine.nodes_completed", 1);
                self.ctx
                    .publish(EngineEvent::NodeCompleted {
                        process_id,
                        node_key: node_key.to_string(),
                        at: Utc::now(),
                    })
                    .await;
                self.ctx
                    .record(self.ctx.system_record(process_id, node_key, "node_completed"))
                    .await;

                if let Some(handler) = self.ctx.handlers().get(node.kind().name())
                    && let Err(error) = handler.complete(&self.ctx, &process, &node).await
                {
                    warn!(node_key, error = %error, "handler completion hook failed");
                }

                let route = match result.outcome {
                    HandlerOutcome::RouteTo(targets) => Some(targets),
                    _ => None,
                };
                if node.definition.auto_complete {
                    self.complete_node(process_id, node_key, route).await
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Advances from a settled node to its successors.
    ///
    /// `route` carries an exclusive gateway's chosen targets; everything
    /// else follows the definition's edges. End nodes (and dead ends with
    /// nothing active elsewhere) complete the process.
    pub async fn complete_node(
        &self,
        process_id: ProcessId,
        node_key: &str,
        route: Option<Vec<String>>,
    ) -> Result<(), EngineError> {
        let process = self.ctx.processes.get(process_id).await?;
        if !process.is_runnable() {
            return Ok(());
        }
        let node = self.ctx.nodes.get_by_key(process_id, node_key).await?;

        if node.kind().is_end() {
            return self.complete_process(process_id).await;
        }

        let successors = route.unwrap_or_else(|| node.definition.next_nodes.clone());
        if successors.is_empty() {
            return self.try_complete_process(process_id).await;
        }

        let graph = self.ctx.graph_for(&process).await?;
        for successor_key in successors {
            let Some(definition) = graph.get(&successor_key) else {
                return Err(EngineError::ValidationFailed {
                    reason: format!("successor '{successor_key}' does not exist"),
                });
            };

            // A parallel node with no branches of its own is a join:
            // gate until enough inbound completions arrive.
            if let NodeKind::Parallel(config) = &definition.kind
                && definition.parallel_nodes.is_empty()
            {
                let inbound = u32::try_from(graph.inbound_count(&successor_key)).unwrap_or(1);
                if inbound > 1 {
                    let required = config.required.unwrap_or(inbound);
                    if !self.ctx.join_arrival(process_id, &successor_key, required) {
                        debug!(
                            join = %successor_key,
                            "join waiting for more arrivals"
                        );
                        continue;
                    }
                    debug!(join = %successor_key, "join gate opened");
                }
            }

            self.execute_node(process_id, &successor_key).await?;
        }
        Ok(())
    }

    /// Settles a node that was waiting on external work (approval
    /// convergence, timer fire) and advances it.
    pub async fn finish_waiting_node(
        &self,
        process_id: ProcessId,
        node_key: &str,
        approved: bool,
    ) -> Result<(), EngineError> {
        let mut node = self.ctx.nodes.get_by_key(process_id, node_key).await?;
        if node.status.is_terminal() {
            return Ok(());
        }

        if approved {
            node.complete();
        } else {
            node.reject();
        }
        self.ctx.nodes.update(node.clone()).await?;

        let mut process = self.ctx.processes.get(process_id).await?;
        process.node_settled(node_key);
        process.set_variable(format!("{node_key}_approved"), json!(approved));
        self.ctx.processes.update(process).await?;

        self.ctx.metrics.incr("engine.nodes_completed", 1);
        self.ctx
            .publish(EngineEvent::NodeCompleted {
                process_id,
                node_key: node_key.to_string(),
                at: Utc::now(),
            })
            .await;

        if node.definition.auto_complete {
            self.complete_node(process_id, node_key, None).await
        } else {
            Ok(())
        }
    }

    /// Completes the process unconditionally (an end node was reached).
    pub async fn complete_process(&self, process_id: ProcessId) -> Result<(), EngineError> {
        let mut process = self.ctx.processes.get(process_id).await?;
        if process.status.is_terminal() {
            return Ok(());
        }
        process.complete();
        self.ctx.processes.update(process).await?;

        self.ctx.metrics.incr("engine.processes_completed", 1);
        self.ctx
            .publish(EngineEvent::ProcessCompleted {
                process_id,
                at: Utc::now(),
            })
            .await;
        self.ctx
            .record(self.ctx.system_record(process_id, "", "process_completed"))
            .await;

        if let Some(scheduler) = self.ctx.scheduler() {
            scheduler.cancel_for_process(process_id);
        }
        self.ctx.clear_joins(process_id);
        // Branches are all settled by now; drop the bookkeeping without
        // aborting, since this may run on a branch's own task.
        self.ctx.clear_branches_for_process(process_id);
        self.ctx.untrack_process(process_id);
        self.ctx.drop_cancel(process_id);
        debug!(process_id = %process_id, "process completed");
        Ok(())
    }

    /// Completes the process only when nothing else is active: a branch
    /// hit a dead end while siblings still run.
    async fn try_complete_process(&self, process_id: ProcessId) -> Result<(), EngineError> {
        let process = self.ctx.processes.get(process_id).await?;
        if process.status.is_terminal() || !process.active_node_keys.is_empty() {
            return Ok(());
        }
        self.complete_process(process_id).await
    }
}

/// Resolves when the watch channel signals cancellation; pends forever
/// if the sender disappears without signalling.
async fn cancelled(mut receiver: watch::Receiver<bool>) {
    loop {
        if *receiver.borrow() {
            return;
        }
        if receiver.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}
