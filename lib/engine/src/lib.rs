//! The escapement engine core.
//!
//! This crate assembles the runtime that drives long-lived business
//! processes:
//!
//! - **Engine facade** ([`Engine`]): lifecycle, process operations, task
//!   operations, introspection
//! - **Executors**: node driving with retry/timeout/cancellation and the
//!   completion recursion; the task lifecycle with background scans
//! - **Handler framework**: one handler per node kind (approval, service,
//!   exclusive, parallel, timer, script, subprocess, notification)
//! - **Configuration, metrics, hooks**: the ambient surface the rest of
//!   the platform tunes and observes

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handler;
pub mod hooks;
pub mod identity;
pub mod metrics;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{EngineSection, EngineSettings, ExecutorSection, SchedulerSection, TaskSection};
pub use context::EngineContext;
pub use engine::{Engine, ResourceUsage, StartProcessReply, StartProcessRequest};
pub use error::EngineError;
pub use executor::node::NodeExecutor;
pub use executor::task::TaskExecutor;
pub use handler::{
    HandlerCore, HandlerMetrics, HandlerOutcome, HandlerRegistry, HandlerResult, NodeHandler,
};
pub use hooks::{HookEvent, HookRegistry, HookStage, HookToken};
pub use identity::{IdentityResolver, StubIdentityResolver};
pub use metrics::{MetricsCollector, MetricsSink};
