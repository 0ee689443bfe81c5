//! Subprocess handler: child process execution with optional wait.

use crate::context::EngineContext;
use crate::error::EngineError;
use crate::handler::{HandlerCore, HandlerResult, NodeHandler};
use async_trait::async_trait;
use chrono::Utc;
use escapement_flow::{
    EngineEvent, NodeInstance, NodeKind, ParentLink, ProcessInstance, ProcessStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How often a waiting subprocess node polls its child.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Starts a child process, optionally waiting for it to settle.
pub struct SubprocessHandler {
    core: HandlerCore,
}

impl SubprocessHandler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: HandlerCore::new("subprocess"),
        }
    }
}

impl Default for SubprocessHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeHandler for SubprocessHandler {
    fn kind(&self) -> &'static str {
        "subprocess"
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
        let NodeKind::Subprocess(config) = node.kind() else {
            return Err(EngineError::System {
                message: format!("subprocess handler given a {} node", node.kind().name()),
            });
        };

        let template = ctx.templates.get_by_code(&config.template_code).await?;

        let mut child = ProcessInstance::new(
            template.id,
            template.code.clone(),
            format!("{}:{}", process.process_key, node.node_key()),
            process.initiator.clone(),
        )
        .with_parent(ParentLink {
            process_id: process.id,
            node_key: node.node_key().to_string(),
        })
        .with_variables(config.variables.clone())
        .with_priority(process.priority);
        child.start();
        let child = ctx.processes.create(child).await?;
        let child_id = child.id;

        let executor = ctx.node_executor();
        executor.materialize_nodes(child_id, &template).await?;

        ctx.publish(EngineEvent::ProcessStarted {
            process_id: child_id,
            template_code: template.code.clone(),
            initiator: child.initiator.clone(),
            at: Utc::now(),
        })
        .await;
        debug!(
            parent = %process.id,
            child = %child_id,
            template = %template.code,
            "subprocess started"
        );

        // The child runs on its own; the parent node decides whether to
        // watch it.
        let child_executor = executor.clone();
        tokio::spawn(async move {
            if let Err(error) = child_executor.execute_process(child_id).await {
                warn!(child = %child_id, error = %error, "subprocess execution failed");
                child_executor.fail_process(child_id, &error).await;
            }
        });

        if !config.wait_complete {
            self.core.record(node.node_key(), true);
            return Ok(HandlerResult::completed());
        }

        let deadline = tokio::time::Instant::now() + Duration::from_millis(config.timeout_ms);
        loop {
            if tokio::time::Instant::now() >= deadline {
                self.core.record(node.node_key(), false);
                return Err(EngineError::Timeout {
                    what: format!("subprocess '{}' on node '{}'", template.code, node.node_key()),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;

            let current = ctx.processes.get(child_id).await?;
            match current.status {
                ProcessStatus::Completed => {
                    self.core.record(node.node_key(), true);
                    // Child variables flow back into the parent.
                    return Ok(HandlerResult::completed().with_variables(current.variables));
                }
                ProcessStatus::Error
                | ProcessStatus::Terminated
                | ProcessStatus::Rollbacked => {
                    self.core.record(node.node_key(), false);
                    return Err(EngineError::Execution {
                        message: format!(
                            "subprocess '{}' ended in status {}",
                            template.code, current.status
                        ),
                    });
                }
                _ => {}
            }
        }
    }

    async fn rollback(
        &self,
        ctx: &Arc<EngineContext>,
        process: &ProcessInstance,
        node: &NodeInstance,
    ) -> Result<(), EngineError> {
        // Terminate any still-active child spawned from this node.
        let children = ctx
            .processes
            .list_by_status(ProcessStatus::Active, escapement_flow::Page::default())
            .await?;
        for mut child in children {
            let is_ours = child
                .parent
                .as_ref()
                .is_some_and(|p| p.process_id == process.id && p.node_key == node.node_key());
            if is_ours {
                child.terminate();
                ctx.processes.update(child.clone()).await?;
                ctx.trigger_cancel(child.id);
                ctx.publish(EngineEvent::ProcessTerminated {
                    process_id: child.id,
                    reason: Some("parent rolled back".to_string()),
                    at: Utc::now(),
                })
                .await;
            }
        }
        Ok(())
    }
}
