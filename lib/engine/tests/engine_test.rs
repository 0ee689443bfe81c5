//! End-to-end engine scenarios over in-memory collaborators.

use escapement_core::ProcessId;
use escapement_engine::{Engine, EngineSettings, StartProcessRequest};
use escapement_flow::{
    ApprovalConfig, ApprovalStrategy, ExclusiveConfig, ExecutionStatus, FailureMode, MemoryStore,
    NodeDefinition, NodeKind, NodeStore, ParallelConfig, ProcessStatus, ProcessStore,
    RouteCondition, ScriptConfig, TaskAction, TaskStatus, TaskStore, Template, TemplateStore,
    TimeoutStrategy, TimerConfig, Variables,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn start_node(next: &str) -> NodeDefinition {
    NodeDefinition::new("start", "Start", NodeKind::Start).with_next([next])
}

fn end_node() -> NodeDefinition {
    NodeDefinition::new("end", "End", NodeKind::End)
}

fn approval_node(key: &str, candidates: &[&str], strategy: ApprovalStrategy) -> NodeDefinition {
    NodeDefinition::new(
        key,
        "Approve request",
        NodeKind::Approval(ApprovalConfig {
            strategy,
            candidates: candidates.iter().map(ToString::to_string).collect(),
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
        }),
    )
}

fn passthrough(key: &str) -> NodeDefinition {
    // An already-due date timer completes synchronously.
    NodeDefinition::new(
        key,
        key,
        NodeKind::Timer(TimerConfig::Date {
            at: chrono::Utc::now() - chrono::Duration::minutes(1),
        }),
    )
}

async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn wait_for_status(store: &Arc<MemoryStore>, process_id: ProcessId, status: ProcessStatus) {
    let reached = eventually(|| async {
        ProcessStore::get(store.as_ref(), process_id)
            .await
            .map(|p| p.status == status)
            .unwrap_or(false)
    })
    .await;
    let current = ProcessStore::get(store.as_ref(), process_id).await.ok();
    assert!(
        reached,
        "process never reached {status}, currently {:?}",
        current.map(|p| p.status)
    );
}

#[tokio::test]
async fn linear_approval_any_strategy() {
    let (engine, store, bus) = Engine::in_memory(EngineSettings::default());
    engine.start().unwrap();

    let template = Template::new(
        "t1",
        "Linear approval",
        vec![
            start_node("approve"),
            approval_node("approve", &["u1", "u2"], ApprovalStrategy::Any).with_next(["end"]),
            end_node(),
        ],
    );
    TemplateStore::create(store.as_ref(), template).await.unwrap();

    let reply = engine
        .start_process(StartProcessRequest::new("t1", "u0").with_business_key("EXP-1"))
        .await
        .unwrap();
    assert_eq!(reply.status, ProcessStatus::Active);
    let process_id = reply.process_id;

    // One task per candidate appears.
    assert!(
        eventually(|| async {
            TaskStore::list_for_process(store.as_ref(), process_id)
                .await
                .map(|tasks| tasks.len() == 2)
                .unwrap_or(false)
        })
        .await,
        "approval tasks never appeared"
    );

    let tasks = TaskStore::list_for_process(store.as_ref(), process_id)
        .await
        .unwrap();
    let u1_task = tasks.iter().find(|t| t.is_assigned_to("u1")).unwrap();

    engine
        .complete_task(
            u1_task.id,
            "u1",
            TaskAction::Approve,
            Some("looks right".to_string()),
            Variables::new(),
        )
        .await
        .unwrap();

    wait_for_status(&store, process_id, ProcessStatus::Completed).await;

    // The sibling task was cancelled when the node converged.
    let tasks = TaskStore::list_for_process(store.as_ref(), process_id)
        .await
        .unwrap();
    let u2_task = tasks.iter().find(|t| t.is_assigned_to("u2")).unwrap();
    assert_eq!(u2_task.status, TaskStatus::Cancelled);

    assert_eq!(bus.count_of("approval.approved"), 1);
    assert_eq!(bus.count_of("process.completed"), 1);

    engine.stop().unwrap();
}

#[tokio::test]
async fn completing_a_task_twice_is_invalid_status() {
    let (engine, store, _bus) = Engine::in_memory(EngineSettings::default());
    engine.start().unwrap();

    let template = Template::new(
        "t-twice",
        "Approval",
        vec![
            start_node("approve"),
            approval_node("approve", &["u1", "u2"], ApprovalStrategy::All).with_next(["end"]),
            end_node(),
        ],
    );
    TemplateStore::create(store.as_ref(), template).await.unwrap();

    let reply = engine
        .start_process(StartProcessRequest::new("t-twice", "u0"))
        .await
        .unwrap();

    assert!(
        eventually(|| async {
            TaskStore::list_for_process(store.as_ref(), reply.process_id)
                .await
                .map(|tasks| tasks.len() == 2)
                .unwrap_or(false)
        })
        .await
    );
    let tasks = TaskStore::list_for_process(store.as_ref(), reply.process_id)
        .await
        .unwrap();
    let task = tasks.iter().find(|t| t.is_assigned_to("u1")).unwrap();

    engine
        .complete_task(task.id, "u1", TaskAction::Approve, None, Variables::new())
        .await
        .unwrap();

    let second = engine
        .complete_task(task.id, "u1", TaskAction::Approve, None, Variables::new())
        .await;
    assert!(second.is_err());

    engine.stop().unwrap();
}

#[tokio::test]
async fn parallel_fan_out_joins_exactly_once() {
    let (engine, store, bus) = Engine::in_memory(EngineSettings::default());
    engine.start().unwrap();

    let gateway = NodeDefinition::new(
        "split",
        "Split",
        NodeKind::Parallel(ParallelConfig::default()),
    )
    .with_parallel(["a", "b"]);
    let branch_a = passthrough("a").with_next(["join"]);
    let branch_b = passthrough("b").with_next(["join"]);
    let join = NodeDefinition::new(
        "join",
        "Join",
        NodeKind::Parallel(ParallelConfig {
            required: Some(2),
            ..ParallelConfig::default()
        }),
    )
    .with_next(["end"]);

    let template = Template::new(
        "t2",
        "Fan out and in",
        vec![start_node("split"), gateway, branch_a, branch_b, join, end_node()],
    );
    TemplateStore::create(store.as_ref(), template).await.unwrap();

    let reply = engine
        .start_process(StartProcessRequest::new("t2", "u0"))
        .await
        .unwrap();

    wait_for_status(&store, reply.process_id, ProcessStatus::Completed).await;

    // Both branches started; the join ran exactly once.
    let started_names: Vec<_> = bus
        .events()
        .into_iter()
        .filter_map(|e| match e {
            escapement_flow::EngineEvent::NodeStarted { node_key, .. } => Some(node_key),
            _ => None,
        })
        .collect();
    assert_eq!(started_names.iter().filter(|k| *k == "a").count(), 1);
    assert_eq!(started_names.iter().filter(|k| *k == "b").count(), 1);
    assert_eq!(started_names.iter().filter(|k| *k == "join").count(), 1);
    assert_eq!(bus.count_of("process.completed"), 1);

    engine.stop().unwrap();
}

fn routing_template(code: &str) -> Template {
    let route = NodeDefinition::new(
        "route",
        "Route",
        NodeKind::Exclusive(ExclusiveConfig {
            conditions: vec![
                RouteCondition {
                    expression: "x > 10".to_string(),
                    next_node: "p1".to_string(),
                    priority: 10,
                },
                RouteCondition {
                    expression: "x > 0".to_string(),
                    next_node: "p2".to_string(),
                    priority: 5,
                },
            ],
            default_path: Some("p3".to_string()),
            failure_mode: FailureMode::Fail,
        }),
    );
    Template::new(
        code,
        "Routing",
        vec![
            start_node("route"),
            route,
            passthrough("p1").with_next(["end"]),
            passthrough("p2").with_next(["end"]),
            passthrough("p3").with_next(["end"]),
            end_node(),
        ],
    )
}

async fn node_status(
    store: &Arc<MemoryStore>,
    process_id: ProcessId,
    node_key: &str,
) -> ExecutionStatus {
    NodeStore::get_by_key(store.as_ref(), process_id, node_key)
        .await
        .unwrap()
        .status
}

#[tokio::test]
async fn exclusive_routing_picks_by_priority_and_default() {
    let (engine, store, _bus) = Engine::in_memory(EngineSettings::default());
    engine.start().unwrap();

    let template = routing_template("t3");
    TemplateStore::create(store.as_ref(), template).await.unwrap();

    // x = 5 routes to p2.
    let mut variables = Variables::new();
    variables.insert("x".to_string(), json!(5));
    let reply = engine
        .start_process(StartProcessRequest::new("t3", "u0").with_variables(variables))
        .await
        .unwrap();
    wait_for_status(&store, reply.process_id, ProcessStatus::Completed).await;
    assert_eq!(
        node_status(&store, reply.process_id, "p2").await,
        ExecutionStatus::Completed
    );
    assert_eq!(
        node_status(&store, reply.process_id, "p1").await,
        ExecutionStatus::Pending
    );

    // x = -1 falls through to the default path.
    let mut variables = Variables::new();
    variables.insert("x".to_string(), json!(-1));
    let reply = engine
        .start_process(StartProcessRequest::new("t3", "u0").with_variables(variables))
        .await
        .unwrap();
    wait_for_status(&store, reply.process_id, ProcessStatus::Completed).await;
    assert_eq!(
        node_status(&store, reply.process_id, "p3").await,
        ExecutionStatus::Completed
    );

    engine.stop().unwrap();
}

#[tokio::test]
async fn exclusive_without_default_fails_the_process() {
    let (engine, store, _bus) = Engine::in_memory(EngineSettings::default());
    engine.start().unwrap();

    let route = NodeDefinition::new(
        "route",
        "Route",
        NodeKind::Exclusive(ExclusiveConfig {
            conditions: vec![RouteCondition {
                expression: "x > 0".to_string(),
                next_node: "p1".to_string(),
                priority: 1,
            }],
            default_path: None,
            failure_mode: FailureMode::Fail,
        }),
    );
    let template = Template::new(
        "t3b",
        "No default",
        vec![
            start_node("route"),
            route,
            passthrough("p1").with_next(["end"]),
            end_node(),
        ],
    );
    TemplateStore::create(store.as_ref(), template).await.unwrap();

    let mut variables = Variables::new();
    variables.insert("x".to_string(), json!(-1));
    let reply = engine
        .start_process(StartProcessRequest::new("t3b", "u0").with_variables(variables))
        .await
        .unwrap();

    wait_for_status(&store, reply.process_id, ProcessStatus::Error).await;

    engine.stop().unwrap();
}

#[tokio::test]
async fn timer_delay_fires_and_advances() {
    let (engine, store, _bus) = Engine::in_memory(EngineSettings::default());
    engine.start().unwrap();

    let template = Template::new(
        "t4",
        "Timed",
        vec![
            start_node("wait"),
            NodeDefinition::new(
                "wait",
                "Wait",
                NodeKind::Timer(TimerConfig::Delay {
                    duration: "300ms".to_string(),
                }),
            )
            .with_next(["end"]),
            end_node(),
        ],
    );
    TemplateStore::create(store.as_ref(), template).await.unwrap();

    let reply = engine
        .start_process(StartProcessRequest::new("t4", "u0"))
        .await
        .unwrap();

    // Still waiting shortly after start.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        ProcessStore::get(store.as_ref(), reply.process_id)
            .await
            .unwrap()
            .status,
        ProcessStatus::Active
    );

    wait_for_status(&store, reply.process_id, ProcessStatus::Completed).await;
    engine.stop().unwrap();
}

#[tokio::test]
async fn script_variables_flow_into_routing() {
    let (engine, store, _bus) = Engine::in_memory(EngineSettings::default());
    engine.start().unwrap();

    let script = NodeDefinition::new(
        "calc",
        "Calc",
        NodeKind::Script(ScriptConfig {
            source: "let x = amount * 2;".to_string(),
            inputs: HashMap::from([("amount".to_string(), "amount".to_string())]),
            outputs: vec!["x".to_string()],
            sandbox: None,
        }),
    )
    .with_next(["route"]);

    let mut template = routing_template("t5");
    template.nodes[0] = start_node("calc");
    template.nodes.push(script);
    TemplateStore::create(store.as_ref(), template).await.unwrap();

    // amount 20 → x = 40 → p1.
    let mut variables = Variables::new();
    variables.insert("amount".to_string(), json!(20));
    let reply = engine
        .start_process(StartProcessRequest::new("t5", "u0").with_variables(variables))
        .await
        .unwrap();

    wait_for_status(&store, reply.process_id, ProcessStatus::Completed).await;
    assert_eq!(
        node_status(&store, reply.process_id, "p1").await,
        ExecutionStatus::Completed
    );
    let process = ProcessStore::get(store.as_ref(), reply.process_id)
        .await
        .unwrap();
    assert_eq!(process.variable("x"), Some(&json!(40)));

    engine.stop().unwrap();
}

#[tokio::test]
async fn suspend_cancels_and_resume_replays() {
    let (engine, store, bus) = Engine::in_memory(EngineSettings::default());
    engine.start().unwrap();

    let template = Template::new(
        "t6",
        "Long wait",
        vec![
            start_node("wait"),
            NodeDefinition::new(
                "wait",
                "Wait",
                NodeKind::Timer(TimerConfig::Delay {
                    duration: "400ms".to_string(),
                }),
            )
            .with_next(["end"]),
            end_node(),
        ],
    );
    TemplateStore::create(store.as_ref(), template).await.unwrap();

    let reply = engine
        .start_process(StartProcessRequest::new("t6", "u0"))
        .await
        .unwrap();
    let process_id = reply.process_id;

    // Let the timer arm, then suspend before it fires.
    assert!(
        eventually(|| async {
            NodeStore::get_by_key(store.as_ref(), process_id, "wait")
                .await
                .map(|n| n.status == ExecutionStatus::Active)
                .unwrap_or(false)
        })
        .await
    );
    engine.suspend_process(process_id).await.unwrap();
    wait_for_status(&store, process_id, ProcessStatus::Suspended).await;
    assert_eq!(bus.count_of("process.suspended"), 1);

    // The armed timer was dropped with the suspension.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(
        ProcessStore::get(store.as_ref(), process_id)
            .await
            .unwrap()
            .status,
        ProcessStatus::Suspended
    );

    engine.resume_process(process_id).await.unwrap();
    wait_for_status(&store, process_id, ProcessStatus::Completed).await;
    assert_eq!(bus.count_of("process.resumed"), 1);

    engine.stop().unwrap();
}

#[tokio::test]
async fn failure_rolls_back_completed_nodes() {
    let (engine, store, _bus) = Engine::in_memory(EngineSettings::default());
    engine.start().unwrap();

    let good = NodeDefinition::new(
        "good",
        "Good",
        NodeKind::Script(ScriptConfig {
            source: "let done = true;".to_string(),
            inputs: HashMap::new(),
            outputs: vec!["done".to_string()],
            sandbox: None,
        }),
    )
    .with_next(["bad"]);
    let bad = NodeDefinition::new(
        "bad",
        "Bad",
        NodeKind::Script(ScriptConfig {
            source: "definitely not a script ;;;".to_string(),
            inputs: HashMap::new(),
            outputs: Vec::new(),
            sandbox: None,
        }),
    )
    .with_next(["end"]);

    let template = Template::new(
        "t7",
        "Fails midway",
        vec![start_node("good"), good, bad, end_node()],
    );
    TemplateStore::create(store.as_ref(), template).await.unwrap();

    let reply = engine
        .start_process(StartProcessRequest::new("t7", "u0"))
        .await
        .unwrap();

    wait_for_status(&store, reply.process_id, ProcessStatus::Error).await;

    // Completed upstream work was compensated.
    assert_eq!(
        node_status(&store, reply.process_id, "good").await,
        ExecutionStatus::Rollbacked
    );
    assert_eq!(
        node_status(&store, reply.process_id, "bad").await,
        ExecutionStatus::Failed
    );

    engine.stop().unwrap();
}

#[tokio::test]
async fn unknown_template_and_missing_initiator_are_rejected() {
    let (engine, _store, _bus) = Engine::in_memory(EngineSettings::default());
    engine.start().unwrap();

    let missing_template = engine
        .start_process(StartProcessRequest::new("nope", "u0"))
        .await;
    assert!(missing_template.is_err());

    let missing_initiator = engine
        .start_process(StartProcessRequest::new("nope", ""))
        .await;
    assert!(missing_initiator.is_err());

    engine.stop().unwrap();
}

#[tokio::test]
async fn delegation_preserves_provenance_and_blocks_repeats() {
    let (engine, store, _bus) = Engine::in_memory(EngineSettings::default());
    engine.start().unwrap();

    let template = Template::new(
        "t8",
        "Delegation",
        vec![
            start_node("approve"),
            approval_node("approve", &["u1"], ApprovalStrategy::Any).with_next(["end"]),
            end_node(),
        ],
    );
    TemplateStore::create(store.as_ref(), template).await.unwrap();

    let reply = engine
        .start_process(StartProcessRequest::new("t8", "u0"))
        .await
        .unwrap();
    assert!(
        eventually(|| async {
            TaskStore::list_for_process(store.as_ref(), reply.process_id)
                .await
                .map(|tasks| !tasks.is_empty())
                .unwrap_or(false)
        })
        .await
    );

    let tasks = TaskStore::list_for_process(store.as_ref(), reply.process_id)
        .await
        .unwrap();
    let original = tasks[0].clone();

    let delegated_id = engine.delegate_task(original.id, "u1", "u9").await.unwrap();
    let delegated = TaskStore::get(store.as_ref(), delegated_id).await.unwrap();
    assert_eq!(delegated.delegated_from, Some(original.id));
    assert!(delegated.is_assigned_to("u9"));

    // The delegated task cannot be delegated again.
    let again = engine.delegate_task(delegated_id, "u9", "u10").await;
    assert!(again.is_err());

    // The delegatee can finish the flow.
    engine
        .complete_task(delegated_id, "u9", TaskAction::Approve, None, Variables::new())
        .await
        .unwrap();
    wait_for_status(&store, reply.process_id, ProcessStatus::Completed).await;

    engine.stop().unwrap();
}
