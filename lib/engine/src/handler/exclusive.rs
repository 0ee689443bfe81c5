//! Exclusive-gateway handler: conditional routing.

use crate::context::EngineContext;
use crate::error::EngineError;
use crate::handler::{HandlerCore, HandlerResult, NodeHandler};
use async_trait::async_trait;
use escapement_flow::{FailureMode, NodeInstance, NodeKind, ProcessInstance, coerce_bool};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Total budget for evaluating one gateway's conditions.
const EVALUATION_BUDGET: Duration = Duration::from_secs(5);

/// Routes to the first truthy condition, in descending priority.
pub struct ExclusiveHandler {
    core: HandlerCore,
}

impl ExclusiveHandler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: HandlerCore::new("exclusive"),
        }
    }
}

impl Default for ExclusiveHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeHandler for ExclusiveHandler {
    fn kind(&self) -> &'static str {
        "exclusive"
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
        let NodeKind::Exclusive(config) = node.kind() else {
            return Err(EngineError::System {
                message: format!("exclusive handler given a {} node", node.kind().name()),
            });
        };

        let mut conditions: Vec<_> = config.conditions.iter().collect();
        conditions.sort_by_key(|c| std::cmp::Reverse(c.priority));

        let started = Instant::now();
        for condition in conditions {
            if started.elapsed() > EVALUATION_BUDGET {
                self.core.record(node.node_key(), false);
                return Err(EngineError::Timeout {
                    what: format!("condition evaluation on '{}'", node.node_key()),
                });
            }

            let evaluated = ctx
                .evaluator
                .evaluate(&condition.expression, &process.variables)
                .and_then(|value| coerce_bool(&value));

            match evaluated {
                Ok(true) => {
                    debug!(
                        node_key = node.node_key(),
                        expression = %condition.expression,
                        target = %condition.next_node,
                        "route matched"
                    );
                    self.core.record(node.node_key(), true);
                    return Ok(HandlerResult::route_to(vec![condition.next_node.clone()]));
                }
                Ok(false) => {}
                Err(error) => match config.failure_mode {
                    FailureMode::Continue => {
                        warn!(
                            node_key = node.node_key(),
                            expression = %condition.expression,
                            error = %error,
                            "condition failed, continuing"
                        );
                    }
                    FailureMode::Fail => {
                        self.core.record(node.node_key(), false);
                        return Err(EngineError::from(error));
                    }
                },
            }
        }

        if let Some(default_path) = &config.default_path {
            debug!(node_key = node.node_key(), target = %default_path, "default route taken");
            self.core.record(node.node_key(), true);
            return Ok(HandlerResult::route_to(vec![default_path.clone()]));
        }

        self.core.record(node.node_key(), false);
        Err(EngineError::ValidationFailed {
            reason: format!("no route matched on gateway '{}'", node.node_key()),
        })
    }
}
