//! The handler framework.
//!
//! One handler per node kind. Handlers are stateless over node data:
//! everything they know about a node arrives as arguments and leaves in
//! the returned [`HandlerResult`]. Each carries a [`HandlerCore`] with
//! its lifecycle state, counters, and a bounded trace ring.

pub mod approval;
pub mod control;
pub mod exclusive;
pub mod notification;
pub mod parallel;
pub mod script;
pub mod service;
pub mod subprocess;
pub mod timer;

use crate::context::EngineContext;
use crate::error::EngineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use escapement_flow::{LifecycleState, NodeDefinition, NodeInstance, ProcessInstance, Variables};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What a handler decided about its node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The node finished; successors may be dispatched.
    Completed,
    /// The node stays active, waiting on tasks, timers, or a child
    /// process to drive it forward.
    Waiting,
    /// The node finished and routing chose these successors.
    RouteTo(Vec<String>),
}

/// A handler's result: the outcome plus side effects for the engine to
/// apply.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerResult {
    /// What happened.
    pub outcome: HandlerOutcome,
    /// Variables merged into the process on success.
    pub variables: Variables,
    /// Deadline stamped on the node, if one applies.
    pub due_at: Option<DateTime<Utc>>,
}

impl HandlerResult {
    /// A plain completion with no side effects.
    #[must_use]
    pub fn completed() -> Self {
        Self {
            outcome: HandlerOutcome::Completed,
            variables: Variables::new(),
            due_at: None,
        }
    }

    /// A plain wait with no side effects.
    #[must_use]
    pub fn waiting() -> Self {
        Self {
            outcome: HandlerOutcome::Waiting,
            variables: Variables::new(),
            due_at: None,
        }
    }

    /// A routed completion.
    #[must_use]
    pub fn route_to(targets: Vec<String>) -> Self {
        Self {
            outcome: HandlerOutcome::RouteTo(targets),
            variables: Variables::new(),
            due_at: None,
        }
    }

    /// Attaches variables to merge.
    #[must_use]
    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    /// Attaches a node deadline.
    #[must_use]
    pub fn with_due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = Some(due_at);
        self
    }
}

/// One entry in a handler's trace ring.
#[derive(Debug, Clone)]
pub struct ExecutionTrace {
    pub node_key: String,
    pub succeeded: bool,
    pub at: DateTime<Utc>,
}

/// Counters exposed by every handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandlerMetrics {
    pub executions: u64,
    pub failures: u64,
}

const TRACE_RING_SIZE: usize = 64;

/// Lifecycle state, counters, and trace ring shared by all handlers.
#[derive(Debug)]
pub struct HandlerCore {
    kind: &'static str,
    state: Mutex<LifecycleState>,
    executions: AtomicU64,
    failures: AtomicU64,
    traces: Mutex<VecDeque<ExecutionTrace>>,
}

impl HandlerCore {
    /// Creates a core in the ready state.
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            state: Mutex::new(LifecycleState::Ready),
            executions: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            traces: Mutex::new(VecDeque::with_capacity(TRACE_RING_SIZE)),
        }
    }

    /// Returns the handler kind this core belongs to.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.lock().expect("handler state lock")
    }

    fn transition(&self, next: LifecycleState) -> bool {
        let mut state = self.state.lock().expect("handler state lock");
        if state.can_transition_to(next) {
            *state = next;
            true
        } else {
            false
        }
    }

    /// Moves ready → running.
    pub fn start(&self) -> bool {
        self.transition(LifecycleState::Running)
    }

    /// Moves running/paused → stopped.
    pub fn stop(&self) -> bool {
        self.transition(LifecycleState::Stopped)
    }

    /// Returns to ready, clearing counters and traces.
    pub fn reset(&self) {
        *self.state.lock().expect("handler state lock") = LifecycleState::Ready;
        self.executions.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.traces.lock().expect("trace lock").clear();
    }

    /// Records one execution outcome.
    pub fn record(&self, node_key: &str, succeeded: bool) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        let mut traces = self.traces.lock().expect("trace lock");
        if traces.len() == TRACE_RING_SIZE {
            traces.pop_front();
        }
        traces.push_back(ExecutionTrace {
            node_key: node_key.to_string(),
            succeeded,
            at: Utc::now(),
        });
    }

    /// Returns the counters.
    #[must_use]
    pub fn metrics(&self) -> HandlerMetrics {
        HandlerMetrics {
            executions: self.executions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// A handler is healthy unless it entered the error state.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state() != LifecycleState::Error
    }

    /// Returns a copy of the trace ring, oldest first.
    #[must_use]
    pub fn traces(&self) -> Vec<ExecutionTrace> {
        self.traces.lock().expect("trace lock").iter().cloned().collect()
    }
}

/// A handler for one node kind.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// The node-kind name this handler serves.
    fn kind(&self) -> &'static str;

    /// The shared lifecycle core.
    fn core(&self) -> &HandlerCore;

    /// Performs the node's action.
    async fn execute(
        &self,
        ctx: &Arc<EngineContext>,
        process: &ProcessInstance,
        node: &NodeInstance,
    ) -> Result<HandlerResult, EngineError>;

    /// Post-convergence cleanup, after the engine settles the node.
    async fn complete(
        &self,
        _ctx: &Arc<EngineContext>,
        _process: &ProcessInstance,
        _node: &NodeInstance,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    /// Structural validation of a node definition of this kind.
    fn validate(&self, definition: &NodeDefinition) -> Result<(), EngineError> {
        definition
            .kind
            .validate()
            .map_err(|reason| EngineError::Validation { reason })
    }

    /// Compensates a completed node during rollback.
    async fn rollback(
        &self,
        _ctx: &Arc<EngineContext>,
        _process: &ProcessInstance,
        _node: &NodeInstance,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    /// Cancels in-flight work for a node.
    async fn cancel(
        &self,
        _ctx: &Arc<EngineContext>,
        _process: &ProcessInstance,
        _node: &NodeInstance,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    /// The capability names this handler implements.
    fn capabilities(&self) -> &'static [&'static str] {
        &["execute", "complete", "validate", "rollback", "cancel"]
    }

    /// The lifecycle state, from the core.
    fn state(&self) -> LifecycleState {
        self.core().state()
    }

    /// Health, from the core.
    fn is_healthy(&self) -> bool {
        self.core().is_healthy()
    }

    /// Counters, from the core.
    fn metrics(&self) -> HandlerMetrics {
        self.core().metrics()
    }
}

/// The closed registry of handlers, one per node kind.
pub struct HandlerRegistry {
    map: HashMap<&'static str, Arc<dyn NodeHandler>>,
    approval: Arc<approval::ApprovalHandler>,
}

impl HandlerRegistry {
    /// Builds the standard registry covering every node kind.
    #[must_use]
    pub fn standard() -> Self {
        let approval = Arc::new(approval::ApprovalHandler::new());

        let handlers: Vec<Arc<dyn NodeHandler>> = vec![
            Arc::new(control::StartHandler::new()),
            Arc::new(control::EndHandler::new()),
            approval.clone(),
            Arc::new(service::ServiceHandler::new()),
            Arc::new(exclusive::ExclusiveHandler::new()),
            Arc::new(parallel::ParallelHandler::new()),
            Arc::new(timer::TimerHandler::new()),
            Arc::new(script::ScriptHandler::new()),
            Arc::new(subprocess::SubprocessHandler::new()),
            Arc::new(notification::NotificationHandler::new()),
        ];

        let mut map: HashMap<&'static str, Arc<dyn NodeHandler>> = HashMap::new();
        for handler in handlers {
            handler.core().start();
            map.insert(handler.kind(), handler);
        }

        Self { map, approval }
    }

    /// Looks up the handler for a node-kind name.
    #[must_use]
    pub fn get(&self, kind: &str) -> Option<Arc<dyn NodeHandler>> {
        self.map.get(kind).cloned()
    }

    /// The approval handler, typed, for task-driven convergence.
    #[must_use]
    pub fn approval(&self) -> Arc<approval::ApprovalHandler> {
        self.approval.clone()
    }

    /// Every registered handler.
    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn NodeHandler>> {
        self.map.values()
    }

    /// Stops every handler.
    pub fn stop_all(&self) {
        for handler in self.map.values() {
            handler.core().stop();
        }
    }
}

/// Substitutes `$name` placeholders from a variable map.
///
/// Unresolved placeholders are returned as the error value so callers can
/// decide whether that is fatal.
pub fn render_template(template: &str, variables: &Variables) -> Result<String, String> {
    let mut output = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            output.push(c);
            continue;
        }
        // Collect the identifier after `$`.
        let mut name = String::new();
        while let Some(&(_, next)) = chars.peek() {
            if next.is_alphanumeric() || next == '_' {
                name.push(next);
                chars.next();
            } else {
                break;
            }
        }
        if name.is_empty() {
            output.push('$');
            continue;
        }
        match variables.get(&name) {
            Some(serde_json::Value::String(s)) => output.push_str(s),
            Some(other) => output.push_str(&other.to_string()),
            None => return Err(name),
        }
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registry_covers_every_kind() {
        let registry = HandlerRegistry::standard();
        for kind in [
            "start",
            "end",
            "approval",
            "service",
            "exclusive",
            "parallel",
            "timer",
            "script",
            "subprocess",
            "notification",
        ] {
            let handler = registry.get(kind).unwrap_or_else(|| panic!("missing {kind}"));
            assert_eq!(handler.kind(), kind);
            assert_eq!(handler.state(), LifecycleState::Running);
        }
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn core_counts_and_rings() {
        let core = HandlerCore::new("test");
        core.start();
        core.record("a", true);
        core.record("b", false);

        let metrics = core.metrics();
        assert_eq!(metrics.executions, 2);
        assert_eq!(metrics.failures, 1);
        assert!(core.is_healthy());
        assert_eq!(core.traces().len(), 2);

        core.reset();
        assert_eq!(core.metrics().executions, 0);
        assert_eq!(core.state(), LifecycleState::Ready);
    }

    #[test]
    fn render_substitutes_and_reports_missing() {
        let mut variables = Variables::new();
        variables.insert("user".to_string(), json!("ada"));
        variables.insert("amount".to_string(), json!(12));

        let rendered = render_template("hi $user, amount $amount", &variables).unwrap();
        assert_eq!(rendered, "hi ada, amount 12");

        let err = render_template("missing $nope", &variables).unwrap_err();
        assert_eq!(err, "nope");

        // A bare dollar sign passes through.
        assert_eq!(render_template("5$ off", &variables).unwrap(), "5$ off");
    }
}
