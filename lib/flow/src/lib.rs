//! Domain model for the escapement workflow engine.
//!
//! This crate owns the in-memory shadows of everything the engine drives:
//!
//! - **Statuses**: process, node-execution, and task status machines
//! - **Entities**: process instances, node instances, tasks, history
//!   records, delegations, assignment rules
//! - **Node kinds**: a closed tagged union over the supported node types,
//!   each carrying its parsed configuration
//! - **Template graphs**: petgraph-backed directed graphs with static
//!   validation (dangling references, start nodes, cycles)
//! - **Events**: the engine event vocabulary and the event-bus seam
//! - **Persistence seams**: repository-style traits over the relational
//!   store, plus an in-memory implementation for tests and embedding
//! - **Expressions**: the evaluator seam with a fasteval-backed default

pub mod bus;
pub mod delegation;
pub mod error;
pub mod event;
pub mod expr;
pub mod graph;
pub mod history;
pub mod memory;
pub mod node;
pub mod process;
pub mod rule;
pub mod status;
pub mod store;
pub mod task;

pub use bus::{EventBus, MemoryEventBus, TracingEventBus};
pub use delegation::Delegation;
pub use error::{ExprError, GraphError, StoreError};
pub use event::EngineEvent;
pub use expr::{Evaluator, FastevalEvaluator, coerce_bool};
pub use graph::{EdgeKind, TemplateGraph};
pub use history::HistoryRecord;
pub use memory::MemoryStore;
pub use node::{
    ApprovalConfig, ApprovalStrategy, ApprovalTally, CompletionMode, ErrorMode, ExclusiveConfig,
    FailureMode, NodeDefinition, NodeInstance, NodeKind, NotificationChannel, NotificationConfig,
    ParallelConfig, RouteCondition, SandboxConfig, ScriptConfig, ServiceConfig, SubprocessConfig,
    TimeoutStrategy, TimerConfig, parse_duration,
};
pub use process::{ParentLink, ProcessInstance, Variables};
pub use rule::{AssignMode, AssignmentRule};
pub use status::{ExecutionStatus, LifecycleState, ProcessStatus, TaskAction, TaskStatus};
pub use store::{
    DelegationStore, HistoryStore, NodeStore, Page, ProcessStore, RuleStore, TaskStore, Template,
    TemplateStore, tables,
};
pub use task::Task;
