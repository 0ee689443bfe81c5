//! Timer handler: delay, cron, cycle, and fixed-date waits.

use crate::context::EngineContext;
use crate::error::EngineError;
use crate::handler::{HandlerCore, HandlerResult, NodeHandler};
use async_trait::async_trait;
use chrono::Utc;
use escapement_flow::{NodeInstance, NodeKind, ProcessInstance};
use escapement_scheduler::{ScheduledTask, TimerSpec};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Waits for a scheduled instant, then advances the node.
pub struct TimerHandler {
    core: HandlerCore,
}

impl TimerHandler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: HandlerCore::new("timer"),
        }
    }
}

impl Default for TimerHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn fired_count(node: &NodeInstance) -> u32 {
    node.properties
        .get("fired")
        .and_then(serde_json::Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}

#[async_trait]
impl NodeHandler for TimerHandler {
    fn kind(&self) -> &'static str {
        "timer"
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
        let NodeKind::Timer(config) = node.kind() else {
            return Err(EngineError::System {
                message: format!("timer handler given a {} node", node.kind().name()),
            });
        };

        let spec = TimerSpec::parse(config)?;
        let now = Utc::now();
        let fired = fired_count(node);

        let Some(trigger_at) = spec.next_fire(now, fired) else {
            // Exhausted before it began (rollback replay); just advance.
            self.core.record(node.node_key(), true);
            return Ok(HandlerResult::completed());
        };

        // A single-shot trigger already in the past completes in place.
        if trigger_at <= now && spec.remaining(fired + 1) == Some(0) {
            debug!(node_key = node.node_key(), "timer overdue, completing now");
            self.core.record(node.node_key(), true);
            return Ok(HandlerResult::completed());
        }

        let scheduler = ctx.scheduler().ok_or_else(|| EngineError::System {
            message: "scheduler not attached".to_string(),
        })?;
        scheduler.schedule_timer(
            process.id,
            node.node_key(),
            trigger_at,
            json!({ "fired": fired }),
        )?;

        debug!(
            node_key = node.node_key(),
            trigger_at = %trigger_at,
            "timer armed"
        );
        self.core.record(node.node_key(), true);
        Ok(HandlerResult::waiting())
    }

    async fn cancel(
        &self,
        ctx: &Arc<EngineContext>,
        process: &ProcessInstance,
        node: &NodeInstance,
    ) -> Result<(), EngineError> {
        if let Some(scheduler) = ctx.scheduler() {
            scheduler.cancel(
                escapement_scheduler::ScheduledKind::Timer,
                process.id,
                node.node_key(),
            );
        }
        Ok(())
    }
}

/// Handles a timer obligation firing: re-arms cyclic timers, completes
/// the node otherwise. Called from the engine's scheduler sink.
pub async fn handle_timer_fire(
    ctx: &Arc<EngineContext>,
    task: &ScheduledTask,
) -> Result<(), EngineError> {
    let mut node = ctx.nodes.get_by_key(task.process_id, &task.node_key).await?;
    if node.status.is_terminal() {
        return Ok(());
    }

    let NodeKind::Timer(config) = node.kind().clone() else {
        return Err(EngineError::System {
            message: format!("timer fired on a {} node", node.kind().name()),
        });
    };
    let spec = TimerSpec::parse(&config)?;

    let fired = fired_count(&node) + 1;
    node.properties
        .insert("fired".to_string(), json!(fired));
    ctx.nodes.update(node.clone()).await?;

    if let Some(next) = spec.next_fire(Utc::now(), fired) {
        let scheduler = ctx.scheduler().ok_or_else(|| EngineError::System {
            message: "scheduler not attached".to_string(),
        })?;
        scheduler.schedule_timer(
            task.process_id,
            &task.node_key,
            next,
            json!({ "fired": fired }),
        )?;
        debug!(node_key = %task.node_key, fired, "cyclic timer re-armed");
        return Ok(());
    }

    ctx.node_executor()
        .finish_waiting_node(task.process_id, &task.node_key, true)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerOutcome;
    use crate::testutil::{test_context, test_process};
    use escapement_flow::{NodeDefinition, TimerConfig};

    fn timer_node(config: TimerConfig) -> NodeInstance {
        NodeInstance::new(
            escapement_core::ProcessId::new(),
            NodeDefinition::new("wait", "Wait", NodeKind::Timer(config)),
        )
    }

    #[tokio::test]
    async fn overdue_date_completes_synchronously() {
        let ctx = test_context().await;
        let handler = TimerHandler::new();
        let process = test_process();
        let node = timer_node(TimerConfig::Date {
            at: Utc::now() - chrono::Duration::minutes(1),
        });

        let result = handler.execute(&ctx, &process, &node).await.unwrap();
        assert_eq!(result.outcome, HandlerOutcome::Completed);
    }

    #[tokio::test]
    async fn future_delay_requires_scheduler() {
        // Context without a started engine has no scheduler; arming must
        // surface that rather than silently dropping the wait.
        let ctx = test_context().await;
        let handler = TimerHandler::new();
        let process = test_process();
        let node = timer_node(TimerConfig::Delay {
            duration: "5m".to_string(),
        });

        let err = handler.execute(&ctx, &process, &node).await.unwrap_err();
        assert!(matches!(err, EngineError::System { .. }));
    }
}
