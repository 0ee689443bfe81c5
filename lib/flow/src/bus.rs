//! The event-bus seam.
//!
//! The engine publishes [`EngineEvent`]s fire-and-forget; delivery
//! backends live outside the core. Two implementations ship here: one that
//! logs through tracing (the default) and one that records events in
//! memory for tests.

use crate::event::EngineEvent;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Fire-and-forget event publication.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes an event. Implementations must not fail the caller;
    /// delivery problems are theirs to log and absorb.
    async fn publish(&self, event: EngineEvent);
}

/// Event bus that logs every event through tracing.
#[derive(Debug, Default, Clone)]
pub struct TracingEventBus;

#[async_trait]
impl EventBus for TracingEventBus {
    async fn publish(&self, event: EngineEvent) {
        debug!(event = event.name(), payload = %event.payload(), "event published");
    }
}

/// Event bus that records events in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryEventBus {
    events: Arc<Mutex<Vec<EngineEvent>>>,
}

impl MemoryEventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything published so far.
    #[must_use]
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().expect("event bus lock").clone()
    }

    /// Returns the names of everything published so far.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .expect("event bus lock")
            .iter()
            .map(EngineEvent::name)
            .collect()
    }

    /// Returns how many events with the given name were published.
    #[must_use]
    pub fn count_of(&self, name: &str) -> usize {
        self.events
            .lock()
            .expect("event bus lock")
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, event: EngineEvent) {
        self.events.lock().expect("event bus lock").push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use escapement_core::ProcessId;

    #[tokio::test]
    async fn memory_bus_records_in_order() {
        let bus = MemoryEventBus::new();
        let process_id = ProcessId::new();

        bus.publish(EngineEvent::ProcessStarted {
            process_id,
            template_code: "t".to_string(),
            initiator: "u0".to_string(),
            at: Utc::now(),
        })
        .await;
        bus.publish(EngineEvent::ProcessCompleted {
            process_id,
            at: Utc::now(),
        })
        .await;

        assert_eq!(bus.names(), vec!["process.started", "process.completed"]);
        assert_eq!(bus.count_of("process.started"), 1);
        assert_eq!(bus.count_of("node.started"), 0);
    }
}
