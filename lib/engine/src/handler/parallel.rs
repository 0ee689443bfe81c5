//! Parallel handler: fan-out of concurrent branches.
//!
//! The gateway drives each branch as a full node execution (the branch
//! subtree advances through the usual completion recursion, converging at
//! the join). A semaphore caps branch concurrency; completion and error
//! modes decide when the gateway itself settles. Join gating lives in the
//! node executor's completion path.

use crate::context::EngineContext;
use crate::error::EngineError;
use crate::handler::{HandlerCore, HandlerResult, NodeHandler};
use async_trait::async_trait;
use escapement_flow::{CompletionMode, ErrorMode, NodeInstance, NodeKind, ProcessInstance};
use futures::future::{join_all, select_all};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Fans out parallel branches.
pub struct ParallelHandler {
    core: HandlerCore,
}

impl ParallelHandler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: HandlerCore::new("parallel"),
        }
    }
}

impl Default for ParallelHandler {
    fn default() -> Self {
        Self::new()
    }
}

type BranchResult = (String, Result<(), EngineError>);

#[async_trait]
impl NodeHandler for ParallelHandler {
    fn kind(&self) -> &'static str {
        "parallel"
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
        let NodeKind::Parallel(config) = node.kind() else {
            return Err(EngineError::System {
                message: format!("parallel handler given a {} node", node.kind().name()),
            });
        };

        let branches = node.definition.parallel_nodes.clone();
        if branches.is_empty() {
            // A join point: branches arrive through the completion path.
            self.core.record(node.node_key(), true);
            return Ok(HandlerResult::completed());
        }

        debug!(
            node_key = node.node_key(),
            branches = branches.len(),
            max_concurrent = config.max_concurrent,
            "fanning out"
        );

        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        let executor = ctx.node_executor();
        let process_id = process.id;

        let mut handles = Vec::with_capacity(branches.len());
        for branch_key in branches {
            let semaphore = semaphore.clone();
            let executor = executor.clone();
            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                let result = executor.execute_node(process_id, &branch_key).await;
                (branch_key, result)
            });
            // Rollback and cancellation reach in-flight branches through
            // the context's handle registry.
            ctx.track_branch(process_id, node.node_key(), handle.abort_handle());
            handles.push(handle);
        }

        let total = handles.len();
        let settled: Vec<BranchResult> = match config.completion {
            CompletionMode::All | CompletionMode::Majority => join_all(handles)
                .await
                .into_iter()
                .map(|joined| match joined {
                    Ok(outcome) => outcome,
                    Err(join_error) => (
                        "<branch>".to_string(),
                        Err(EngineError::System {
                            message: format!("branch task failed: {join_error}"),
                        }),
                    ),
                })
                .collect(),
            CompletionMode::Any => {
                let mut remaining = handles;
                let mut settled = Vec::new();
                loop {
                    if remaining.is_empty() {
                        break settled;
                    }
                    let (joined, _index, rest) = select_all(remaining).await;
                    remaining = rest;
                    match joined {
                        Ok((key, Ok(()))) => {
                            settled.push((key, Ok(())));
                            // The first success settles the gateway;
                            // the stragglers are aborted, not left
                            // running unsupervised.
                            for handle in remaining.drain(..) {
                                handle.abort();
                            }
                            break settled;
                        }
                        Ok(failure) => settled.push(failure),
                        Err(join_error) => settled.push((
                            "<branch>".to_string(),
                            Err(EngineError::System {
                                message: format!("branch task failed: {join_error}"),
                            }),
                        )),
                    }
                }
            }
        };
        ctx.clear_branches(process_id, node.node_key());

        let successes = settled.iter().filter(|(_, r)| r.is_ok()).count();
        let failures: Vec<String> = settled
            .iter()
            .filter_map(|(key, r)| r.as_ref().err().map(|e| format!("{key}: {e}")))
            .collect();

        let satisfied = match config.completion {
            CompletionMode::All => failures.is_empty(),
            CompletionMode::Any => successes >= 1,
            CompletionMode::Majority => successes * 2 > total,
        };

        if !failures.is_empty() {
            warn!(
                node_key = node.node_key(),
                failures = failures.len(),
                "parallel branches failed"
            );
        }

        if satisfied || config.error_mode == ErrorMode::Continue {
            self.core.record(node.node_key(), true);
            Ok(HandlerResult::completed())
        } else {
            self.core.record(node.node_key(), false);
            Err(EngineError::Execution {
                message: format!(
                    "parallel gateway '{}' failed: {}",
                    node.node_key(),
                    failures.join("; ")
                ),
            })
        }
    }

    async fn cancel(
        &self,
        ctx: &Arc<EngineContext>,
        process: &ProcessInstance,
        node: &NodeInstance,
    ) -> Result<(), EngineError> {
        let aborted = ctx.abort_branches(process.id, node.node_key());
        if aborted > 0 {
            debug!(
                node_key = node.node_key(),
                aborted, "in-flight branches aborted on cancel"
            );
        }
        Ok(())
    }

    async fn rollback(
        &self,
        ctx: &Arc<EngineContext>,
        process: &ProcessInstance,
        node: &NodeInstance,
    ) -> Result<(), EngineError> {
        let aborted = ctx.abort_branches(process.id, node.node_key());
        if aborted > 0 {
            debug!(
                node_key = node.node_key(),
                aborted, "in-flight branches aborted on rollback"
            );
        }
        Ok(())
    }
}
