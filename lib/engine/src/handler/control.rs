//! Start and end handlers.

use crate::context::EngineContext;
use crate::error::EngineError;
use crate::handler::{HandlerCore, HandlerResult, NodeHandler};
use async_trait::async_trait;
use escapement_flow::{NodeInstance, ProcessInstance};
use std::sync::Arc;
use tracing::debug;

/// Entry point of a process; nothing to do but advance.
pub struct StartHandler {
    core: HandlerCore,
}

impl StartHandler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: HandlerCore::new("start"),
        }
    }
}

impl Default for StartHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeHandler for StartHandler {
    fn kind(&self) -> &'static str {
        "start"
    }

    fn core(&self) -> &HandlerCore {
        &self.core
    }

    async fn execute(
        &self,
        _ctx: &Arc<EngineContext>,
        process: &ProcessInstance,
        node: &NodeInstance,
    ) -> Result<HandlerResult, EngineError> {
        debug!(process_id = %process.id, node_key = node.node_key(), "process entry");
        self.core.record(node.node_key(), true);
        Ok(HandlerResult::completed())
    }
}

/// Terminal point of a process.
pub struct EndHandler {
    core: HandlerCore,
}

impl EndHandler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: HandlerCore::new("end"),
        }
    }
}

impl Default for EndHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeHandler for EndHandler {
    fn kind(&self) -> &'static str {
        "end"
    }

    fn core(&self) -> &HandlerCore {
        &self.core
    }

    async fn execute(
        &self,
        _ctx: &Arc<EngineContext>,
        process: &ProcessInstance,
        node: &NodeInstance,
    ) -> Result<HandlerResult, EngineError> {
        debug!(process_id = %process.id, node_key = node.node_key(), "process exit");
        self.core.record(node.node_key(), true);
        Ok(HandlerResult::completed())
    }
}
