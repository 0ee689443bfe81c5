//! Node definitions, kinds, and typed configurations.
//!
//! A node's behavior is selected by its kind: a closed tagged union over
//! the supported node types. Each kind carries its configuration as a
//! typed struct parsed once at template load; free-form keys an authoring
//! tool attaches are preserved in an extras bag and never probed again.

use crate::status::ExecutionStatus;
use chrono::{DateTime, Utc};
use escapement_core::retry::RetryPolicy;
use escapement_core::{NodeInstanceId, ProcessId};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

fn default_true() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    8
}

fn default_subprocess_timeout_ms() -> u64 {
    300_000
}

fn default_method() -> String {
    "GET".to_string()
}

/// Convergence strategy for an approval node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ApprovalStrategy {
    /// One approval settles the node.
    Any,
    /// Every approver must approve.
    All,
    /// More than half of the approvers must approve.
    Majority,
    /// At least `percent` percent of approvers must approve.
    Percentage { percent: u8 },
    /// Approvers decide one at a time, in candidate order.
    Order,
}

/// A point-in-time summary of the decisions on an approval node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApprovalTally {
    /// Number of approvers.
    pub total: usize,
    /// Number of approvers that have decided either way.
    pub decided: usize,
    /// Number of approvals among the decided.
    pub approved: usize,
    /// For the `Order` strategy: index of the next approver in sequence.
    pub order_index: usize,
}

impl ApprovalStrategy {
    /// Returns true once enough decisions are in to settle the node.
    #[must_use]
    pub fn is_complete(&self, tally: ApprovalTally) -> bool {
        let all_decided = tally.decided >= tally.total;
        match self {
            Self::Any => tally.approved >= 1 || all_decided,
            Self::All | Self::Majority | Self::Percentage { .. } => all_decided,
            Self::Order => tally.order_index >= tally.total || all_decided,
        }
    }

    /// Returns true if the settled node counts as approved.
    #[must_use]
    pub fn is_approved(&self, tally: ApprovalTally) -> bool {
        if tally.total == 0 {
            return false;
        }
        match self {
            Self::Any => tally.approved >= 1,
            Self::All => tally.approved == tally.total,
            Self::Majority => tally.approved * 2 > tally.total,
            Self::Percentage { percent } => {
                tally.approved * 100 >= usize::from(*percent) * tally.total
            }
            Self::Order => tally.approved >= tally.order_index.min(tally.total),
        }
    }
}

/// What to do with an overdue task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStrategy {
    /// Complete the task with an approving action.
    AutoPass,
    /// Complete the task with a rejecting action.
    AutoReject,
    /// Emit a reminder/alert and leave the task open.
    Alert,
    /// Mark the task timed out and stop.
    #[default]
    None,
}

/// Configuration for approval nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Convergence strategy.
    pub strategy: ApprovalStrategy,
    /// Statically configured approvers, in priority order.
    #[serde(default)]
    pub candidates: Vec<String>,
    /// Name of a process variable holding additional approvers.
    #[serde(default)]
    pub dynamic_var: Option<String>,
    /// Roles expanded into approvers through the identity resolver.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Departments expanded into approvers through the identity resolver.
    #[serde(default)]
    pub departments: Vec<String>,
    /// Hours until tasks fall due; zero disables the deadline.
    #[serde(default)]
    pub timeout_hours: u32,
    /// Behavior when a task falls due.
    #[serde(default)]
    pub timeout_strategy: TimeoutStrategy,
    /// Urges tolerated before escalation is considered.
    #[serde(default)]
    pub max_urges: u32,
    /// Escalate to higher-level approvers once `max_urges` is reached.
    #[serde(default)]
    pub auto_escalate: bool,
    /// Organizational levels to skip when escalating.
    #[serde(default)]
    pub escalate_skip_levels: u32,
    /// Whether assignees may transfer their tasks.
    #[serde(default = "default_true")]
    pub allow_transfer: bool,
    /// Whether assignees may delegate their tasks.
    #[serde(default = "default_true")]
    pub allow_delegate: bool,
}

/// A prioritized routing condition on an exclusive gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteCondition {
    /// Boolean expression over process variables.
    pub expression: String,
    /// Node key to route to when the expression is truthy.
    pub next_node: String,
    /// Higher priorities are evaluated first.
    #[serde(default)]
    pub priority: i32,
}

/// Behavior when a routing condition fails to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Surface the evaluation error.
    #[default]
    Fail,
    /// Skip the condition and keep evaluating; fall through to the
    /// default path if nothing matches.
    Continue,
}

/// Configuration for exclusive gateways.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusiveConfig {
    /// Routing conditions, evaluated in descending priority.
    #[serde(default)]
    pub conditions: Vec<RouteCondition>,
    /// Node key taken when no condition matches.
    #[serde(default)]
    pub default_path: Option<String>,
    /// Behavior on condition evaluation failure.
    #[serde(default)]
    pub failure_mode: FailureMode,
}

/// When a parallel node's branch set counts as finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    /// Every branch must finish.
    #[default]
    All,
    /// The first finished branch settles the node.
    Any,
    /// More than half of the branches must finish.
    Majority,
}

/// How branch failures affect a parallel node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMode {
    /// Surface aggregated branch errors.
    #[default]
    Fail,
    /// Keep going with the surviving branches.
    Continue,
}

/// Configuration for parallel gateways and their joins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Cap on branches running at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Branch-set completion mode.
    #[serde(default)]
    pub completion: CompletionMode,
    /// Branch failure handling.
    #[serde(default)]
    pub error_mode: ErrorMode,
    /// Inbound completions required at the join; defaults to the number
    /// of configured inbound edges.
    #[serde(default)]
    pub required: Option<u32>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            completion: CompletionMode::default(),
            error_mode: ErrorMode::default(),
            required: None,
        }
    }
}

/// Configuration for timer nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimerConfig {
    /// Fire once after a duration (`"30s"`, `"5m"`, `"1h30m"`).
    Delay { duration: String },
    /// Fire on a 5-field cron expression.
    Cron { expression: String },
    /// Fire `count` times, `interval` apart.
    Cycle { count: u32, interval: String },
    /// Fire once at a fixed instant.
    Date { at: DateTime<Utc> },
}

impl TimerConfig {
    /// Structurally validates the timer configuration.
    ///
    /// Cron expressions are checked for field count here; full parsing
    /// happens at scheduling time.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Delay { duration } => parse_duration(duration).map(|_| ()),
            Self::Cron { expression } => {
                let parts = expression.split_whitespace().count();
                if parts == 5 {
                    Ok(())
                } else {
                    Err(format!("expected 5 cron fields, got {parts}"))
                }
            }
            Self::Cycle { count, interval } => {
                if *count == 0 {
                    return Err("cycle count must be positive".to_string());
                }
                parse_duration(interval).map(|_| ())
            }
            Self::Date { .. } => Ok(()),
        }
    }
}

/// Resource limits for the script sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Memory ceiling for script values, in bytes.
    pub max_memory_bytes: u64,
    /// Operation count ceiling.
    pub max_operations: u64,
    /// Call-nesting ceiling.
    pub max_call_depth: usize,
    /// Wall-clock budget in milliseconds.
    pub timeout_ms: u64,
    /// Longest string a script may build.
    pub max_string_size: usize,
    /// Largest array a script may build.
    pub max_array_size: usize,
    /// Module names scripts may import; empty means the built-ins only.
    #[serde(default)]
    pub allowed_modules: Vec<String>,
    /// Module names scripts may never import.
    #[serde(default)]
    pub blocked_modules: Vec<String>,
    /// Expose a `log` function wired into tracing.
    #[serde(default = "default_true")]
    pub expose_console: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 16 * 1024 * 1024,
            max_operations: 1_000_000,
            max_call_depth: 64,
            timeout_ms: 5_000,
            max_string_size: 1024 * 1024,
            max_array_size: 10_000,
            allowed_modules: Vec::new(),
            blocked_modules: Vec::new(),
            expose_console: true,
        }
    }
}

/// Configuration for script nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptConfig {
    /// Script source.
    pub source: String,
    /// Script variable name → process variable name bindings.
    #[serde(default)]
    pub inputs: HashMap<String, String>,
    /// Script variables read back and merged into process variables.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Per-node sandbox override; the engine default applies otherwise.
    #[serde(default)]
    pub sandbox: Option<SandboxConfig>,
}

/// Configuration for subprocess nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubprocessConfig {
    /// Template code of the child process.
    pub template_code: String,
    /// Initial variables seeded into the child.
    #[serde(default)]
    pub variables: JsonMap<String, JsonValue>,
    /// Block the node until the child reaches a terminal status.
    #[serde(default)]
    pub wait_complete: bool,
    /// Budget for the wait, in milliseconds.
    #[serde(default = "default_subprocess_timeout_ms")]
    pub timeout_ms: u64,
}

/// Delivery channel for notification nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    Sms,
    Push,
    Webhook,
}

impl NotificationChannel {
    /// Returns the wire name of the channel.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Push => "push",
            Self::Webhook => "webhook",
        }
    }
}

/// Configuration for notification nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Delivery channel.
    pub channel: NotificationChannel,
    /// Template body; `$name` placeholders resolve from process variables.
    pub template: String,
    /// Recipients (addresses, numbers, device tokens, or URLs).
    #[serde(default)]
    pub recipients: Vec<String>,
    /// Extra template variables overriding process variables.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// Configuration for service-call nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Registered provider name (`http`, `rest`, `soap`, `grpc`, or a
    /// custom registration).
    pub provider: String,
    /// Endpoint the provider should call.
    pub endpoint: String,
    /// Operation or HTTP method.
    #[serde(default = "default_method")]
    pub method: String,
    /// Headers merged into the request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Query or call parameters; ordered so cache keys are stable.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Request body.
    #[serde(default)]
    pub body: Option<JsonValue>,
    /// Serve repeated identical calls from the response cache.
    #[serde(default)]
    pub cache_enabled: bool,
    /// Cache entry lifetime in milliseconds.
    #[serde(default)]
    pub cache_ttl_ms: u64,
    /// Per-node retry override.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Per-call deadline in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// The closed set of node kinds and their configurations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry point of a process.
    Start,
    /// Terminal point of a process.
    End,
    /// Human approval with a convergence strategy.
    Approval(ApprovalConfig),
    /// External service invocation.
    Service(ServiceConfig),
    /// Conditional routing.
    Exclusive(ExclusiveConfig),
    /// Fan-out and join of concurrent branches.
    Parallel(ParallelConfig),
    /// Timed wait.
    Timer(TimerConfig),
    /// Sandboxed user script.
    Script(ScriptConfig),
    /// Child process execution.
    Subprocess(SubprocessConfig),
    /// Outbound notification.
    Notification(NotificationConfig),
}

impl NodeKind {
    /// Returns the wire name of this kind.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Approval(_) => "approval",
            Self::Service(_) => "service",
            Self::Exclusive(_) => "exclusive",
            Self::Parallel(_) => "parallel",
            Self::Timer(_) => "timer",
            Self::Script(_) => "script",
            Self::Subprocess(_) => "subprocess",
            Self::Notification(_) => "notification",
        }
    }

    /// Returns true for start nodes.
    #[must_use]
    pub fn is_start(&self) -> bool {
        matches!(self, Self::Start)
    }

    /// Returns true for end nodes.
    #[must_use]
    pub fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }

    /// Structurally validates the kind's configuration.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Start | Self::End => Ok(()),
            Self::Approval(config) => {
                if config.candidates.is_empty()
                    && config.dynamic_var.is_none()
                    && config.roles.is_empty()
                    && config.departments.is_empty()
                {
                    return Err("approval node has no approver source".to_string());
                }
                if let ApprovalStrategy::Percentage { percent } = config.strategy
                    && (percent == 0 || percent > 100)
                {
                    return Err(format!("approval percentage {percent} out of range"));
                }
                Ok(())
            }
            Self::Service(config) => {
                if config.provider.is_empty() {
                    return Err("service node names no provider".to_string());
                }
                if config.endpoint.is_empty() {
                    return Err("service node names no endpoint".to_string());
                }
                Ok(())
            }
            Self::Exclusive(config) => {
                if config.conditions.is_empty() && config.default_path.is_none() {
                    return Err("exclusive gateway has no conditions and no default".to_string());
                }
                Ok(())
            }
            Self::Parallel(config) => {
                if config.max_concurrent == 0 {
                    return Err("parallel max_concurrent must be positive".to_string());
                }
                Ok(())
            }
            Self::Timer(config) => config.validate(),
            Self::Script(config) => {
                if config.source.trim().is_empty() {
                    return Err("script node has no source".to_string());
                }
                Ok(())
            }
            Self::Subprocess(config) => {
                if config.template_code.is_empty() {
                    return Err("subprocess node names no template".to_string());
                }
                Ok(())
            }
            Self::Notification(config) => {
                if config.template.is_empty() {
                    return Err("notification node has no template".to_string());
                }
                Ok(())
            }
        }
    }
}

/// The authored definition of a node within a template graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique key of this node within its template.
    pub node_key: String,
    /// Human-readable name.
    pub name: String,
    /// Kind and configuration.
    pub kind: NodeKind,
    /// Upstream node keys.
    #[serde(default)]
    pub prev_nodes: Vec<String>,
    /// Downstream node keys.
    #[serde(default)]
    pub next_nodes: Vec<String>,
    /// Branch node keys for parallel gateways.
    #[serde(default)]
    pub parallel_nodes: Vec<String>,
    /// Complete the node (and advance) as soon as execution succeeds.
    #[serde(default = "default_true")]
    pub auto_complete: bool,
    /// Per-node retry override.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Per-node execution deadline in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Authoring-tool keys the engine carries but never interprets.
    #[serde(flatten)]
    pub extras: JsonMap<String, JsonValue>,
}

impl NodeDefinition {
    /// Creates a definition with the given key and kind.
    #[must_use]
    pub fn new(node_key: impl Into<String>, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            node_key: node_key.into(),
            name: name.into(),
            kind,
            prev_nodes: Vec::new(),
            next_nodes: Vec::new(),
            parallel_nodes: Vec::new(),
            auto_complete: true,
            retry: None,
            timeout_ms: None,
            extras: JsonMap::new(),
        }
    }

    /// Appends downstream node keys.
    #[must_use]
    pub fn with_next(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.next_nodes.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Appends parallel branch node keys.
    #[must_use]
    pub fn with_parallel(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.parallel_nodes.extend(keys.into_iter().map(Into::into));
        self
    }
}

/// The runtime shadow of a node within a process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInstance {
    /// Unique identifier of this instance.
    pub id: NodeInstanceId,
    /// The owning process.
    pub process_id: ProcessId,
    /// The definition this instance was materialized from.
    pub definition: NodeDefinition,
    /// Current execution status.
    pub status: ExecutionStatus,
    /// When execution began.
    pub started_at: Option<DateTime<Utc>>,
    /// When execution reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
    /// Deadline, when one applies.
    pub due_at: Option<DateTime<Utc>>,
    /// Last error message, if any.
    pub error: Option<String>,
    /// Runtime annotations (error timestamps, branch bookkeeping).
    #[serde(default)]
    pub properties: JsonMap<String, JsonValue>,
}

impl NodeInstance {
    /// Materializes an instance from a definition.
    #[must_use]
    pub fn new(process_id: ProcessId, definition: NodeDefinition) -> Self {
        Self {
            id: NodeInstanceId::new(),
            process_id,
            definition,
            status: ExecutionStatus::Pending,
            started_at: None,
            ended_at: None,
            due_at: None,
            error: None,
            properties: JsonMap::new(),
        }
    }

    /// Returns this node's key within its process.
    #[must_use]
    pub fn node_key(&self) -> &str {
        &self.definition.node_key
    }

    /// Returns this node's kind.
    #[must_use]
    pub fn kind(&self) -> &NodeKind {
        &self.definition.kind
    }

    /// Marks the node eligible to run.
    pub fn mark_ready(&mut self) {
        self.status = ExecutionStatus::Ready;
        self.error = None;
    }

    /// Marks the node active.
    pub fn activate(&mut self) {
        self.status = ExecutionStatus::Active;
        self.started_at = Some(Utc::now());
    }

    /// Marks the node completed.
    pub fn complete(&mut self) {
        self.status = ExecutionStatus::Completed;
        self.ended_at = Some(Utc::now());
    }

    /// Marks the node rejected.
    pub fn reject(&mut self) {
        self.status = ExecutionStatus::Rejected;
        self.ended_at = Some(Utc::now());
    }

    /// Marks the node failed, recording the error and its timestamp.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = ExecutionStatus::Failed;
        self.ended_at = Some(Utc::now());
        let message = error.into();
        self.properties.insert(
            "last_error_at".to_string(),
            JsonValue::String(Utc::now().to_rfc3339()),
        );
        self.error = Some(message);
    }

    /// Marks the node cancelled.
    pub fn cancel(&mut self) {
        self.status = ExecutionStatus::Cancelled;
        self.ended_at = Some(Utc::now());
    }

    /// Marks the node timed out.
    pub fn timeout(&mut self) {
        self.status = ExecutionStatus::Timeout;
        self.ended_at = Some(Utc::now());
    }

    /// Marks the node rolled back.
    pub fn rollback(&mut self) {
        self.status = ExecutionStatus::Rollbacked;
    }
}

/// Parses a compact duration string: `"500ms"`, `"30s"`, `"5m"`, `"2h"`,
/// `"1h30m"`, `"1d"`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            return Err(format!("unexpected unit in '{input}'"));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("bad number in '{input}'"))?;
        digits.clear();

        let unit = match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                Duration::from_millis(value)
            }
            's' => Duration::from_secs(value),
            'm' => Duration::from_secs(value * 60),
            'h' => Duration::from_secs(value * 3600),
            'd' => Duration::from_secs(value * 86_400),
            other => return Err(format!("unknown duration unit '{other}' in '{input}'")),
        };
        total += unit;
    }

    if !digits.is_empty() {
        // Bare number: seconds.
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("bad number in '{input}'"))?;
        total += Duration::from_secs(value);
    }

    if total.is_zero() {
        return Err(format!("duration '{input}' is zero"));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approval_config() -> ApprovalConfig {
        ApprovalConfig {
            strategy: ApprovalStrategy::Any,
            candidates: vec!["u1".to_string(), "u2".to_string()],
            dynamic_var: None,
            roles: Vec::new(),
            departments: Vec::new(),
            timeout_hours: 0,
            timeout_strategy: TimeoutStrategy::None,
            max_urges: 0,
            auto_escalate: false,
            escalate_skip_levels: 0,
            allow_transfer: true,
            allow_delegate: true,
        }
    }

    #[test]
    fn any_strategy_settles_on_first_approval() {
        let tally = ApprovalTally {
            total: 3,
            decided: 1,
            approved: 1,
            order_index: 0,
        };
        assert!(ApprovalStrategy::Any.is_complete(tally));
        assert!(ApprovalStrategy::Any.is_approved(tally));
    }

    #[test]
    fn any_strategy_settles_rejected_when_all_decide() {
        let tally = ApprovalTally {
            total: 2,
            decided: 2,
            approved: 0,
            order_index: 0,
        };
        assert!(ApprovalStrategy::Any.is_complete(tally));
        assert!(!ApprovalStrategy::Any.is_approved(tally));
    }

    #[test]
    fn all_strategy_requires_everyone() {
        let partial = ApprovalTally {
            total: 3,
            decided: 2,
            approved: 2,
            order_index: 0,
        };
        assert!(!ApprovalStrategy::All.is_complete(partial));

        let done = ApprovalTally {
            total: 3,
            decided: 3,
            approved: 3,
            order_index: 0,
        };
        assert!(ApprovalStrategy::All.is_complete(done));
        assert!(ApprovalStrategy::All.is_approved(done));

        let one_reject = ApprovalTally {
            total: 3,
            decided: 3,
            approved: 2,
            order_index: 0,
        };
        assert!(!ApprovalStrategy::All.is_approved(one_reject));
    }

    #[test]
    fn majority_strategy_is_strict() {
        let half = ApprovalTally {
            total: 4,
            decided: 4,
            approved: 2,
            order_index: 0,
        };
        assert!(!ApprovalStrategy::Majority.is_approved(half));

        let majority = ApprovalTally {
            total: 4,
            decided: 4,
            approved: 3,
            order_index: 0,
        };
        assert!(ApprovalStrategy::Majority.is_approved(majority));
    }

    #[test]
    fn percentage_strategy_rounds_in_favor_of_threshold() {
        let strategy = ApprovalStrategy::Percentage { percent: 60 };
        let below = ApprovalTally {
            total: 5,
            decided: 5,
            approved: 2,
            order_index: 0,
        };
        assert!(!strategy.is_approved(below));

        let at = ApprovalTally {
            total: 5,
            decided: 5,
            approved: 3,
            order_index: 0,
        };
        assert!(strategy.is_approved(at));
    }

    #[test]
    fn order_strategy_tracks_sequence() {
        let midway = ApprovalTally {
            total: 3,
            decided: 2,
            approved: 2,
            order_index: 2,
        };
        assert!(!ApprovalStrategy::Order.is_complete(midway));

        let finished = ApprovalTally {
            total: 3,
            decided: 3,
            approved: 3,
            order_index: 3,
        };
        assert!(ApprovalStrategy::Order.is_complete(finished));
        assert!(ApprovalStrategy::Order.is_approved(finished));
    }

    #[test]
    fn approval_without_sources_fails_validation() {
        let mut config = approval_config();
        config.candidates.clear();
        let kind = NodeKind::Approval(config);
        assert!(kind.validate().is_err());
    }

    #[test]
    fn exclusive_without_routes_fails_validation() {
        let kind = NodeKind::Exclusive(ExclusiveConfig {
            conditions: Vec::new(),
            default_path: None,
            failure_mode: FailureMode::Fail,
        });
        assert!(kind.validate().is_err());
    }

    #[test]
    fn timer_cron_field_count() {
        let ok = TimerConfig::Cron {
            expression: "0 7 * * 1".to_string(),
        };
        assert!(ok.validate().is_ok());

        let bad = TimerConfig::Cron {
            expression: "0 7 *".to_string(),
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn node_kind_serde_uses_type_tag() {
        let kind = NodeKind::Timer(TimerConfig::Delay {
            duration: "2s".to_string(),
        });
        let json = serde_json::to_value(&kind).expect("serialize");
        assert_eq!(json["type"], "timer");
        assert_eq!(json["kind"], "delay");

        let parsed: NodeKind = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, kind);
    }

    #[test]
    fn definition_preserves_extras() {
        let json = serde_json::json!({
            "node_key": "n1",
            "name": "Start",
            "kind": {"type": "start"},
            "next_nodes": ["n2"],
            "x": 120,
            "y": 80
        });
        let def: NodeDefinition = serde_json::from_value(json).expect("deserialize");
        assert_eq!(def.extras.get("x"), Some(&serde_json::json!(120)));
        assert!(def.auto_complete);
    }

    #[test]
    fn node_instance_lifecycle() {
        let def = NodeDefinition::new("n1", "Approve", NodeKind::Approval(approval_config()));
        let mut node = NodeInstance::new(ProcessId::new(), def);

        assert_eq!(node.status, ExecutionStatus::Pending);
        node.activate();
        assert_eq!(node.status, ExecutionStatus::Active);
        assert!(node.started_at.is_some());

        node.fail("boom");
        assert_eq!(node.status, ExecutionStatus::Failed);
        assert_eq!(node.error.as_deref(), Some("boom"));
        assert!(node.properties.contains_key("last_error_at"));
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("0s").is_err());
    }
}
