//! Shared helpers for handler unit tests.

use crate::config::EngineSettings;
use crate::context::EngineContext;
use crate::executor::node::NodeExecutor;
use crate::executor::task::TaskExecutor;
use crate::handler::HandlerRegistry;
use crate::identity::StubIdentityResolver;
use escapement_core::TemplateId;
use escapement_flow::{FastevalEvaluator, MemoryEventBus, MemoryStore, ProcessInstance};
use escapement_service::ServiceRegistry;
use std::sync::Arc;

/// Builds a fully wired context over in-memory collaborators.
pub async fn test_context() -> Arc<EngineContext> {
    let store = Arc::new(MemoryStore::new());
    let ctx = Arc::new(EngineContext::new(
        EngineSettings::default(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store,
        Arc::new(MemoryEventBus::new()),
        Arc::new(FastevalEvaluator::new()),
        Arc::new(StubIdentityResolver),
        Arc::new(ServiceRegistry::with_builtins()),
    ));
    let node_executor = Arc::new(NodeExecutor::new(ctx.clone()));
    let task_executor = Arc::new(TaskExecutor::new(ctx.clone()));
    ctx.wire(
        node_executor,
        task_executor,
        Arc::new(HandlerRegistry::standard()),
    );
    ctx
}

/// A started process with no particular template behind it.
pub fn test_process() -> ProcessInstance {
    let mut process = ProcessInstance::new(TemplateId::new(), "test", "KEY-1", "u0");
    process.start();
    process
}
