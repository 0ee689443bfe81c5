//! Observer hooks around node and task transitions.
//!
//! Callers register observers per stage and get back a token whose
//! `unsubscribe` removes them. Observers run synchronously in transition
//! order and must be fast; anything slow belongs on the event bus.

use escapement_core::{ProcessId, TaskId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Where in a lifecycle the hook fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookStage {
    BeforeNode,
    AfterNode,
    BeforeTask,
    AfterTask,
}

/// What the hook observes.
#[derive(Debug, Clone)]
pub struct HookEvent {
    pub stage: HookStage,
    pub process_id: ProcessId,
    pub node_key: String,
    pub task_id: Option<TaskId>,
}

type HookFn = Arc<dyn Fn(&HookEvent) + Send + Sync>;

/// Token returned by [`HookRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookToken {
    stage: HookStage,
    id: u64,
}

/// Registry of observers per stage.
#[derive(Default)]
pub struct HookRegistry {
    next_id: AtomicU64,
    hooks: Mutex<HashMap<HookStage, Vec<(u64, HookFn)>>>,
}

impl HookRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer for a stage.
    pub fn register(
        &self,
        stage: HookStage,
        hook: impl Fn(&HookEvent) + Send + Sync + 'static,
    ) -> HookToken {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.hooks
            .lock()
            .expect("hook lock")
            .entry(stage)
            .or_default()
            .push((id, Arc::new(hook)));
        HookToken { stage, id }
    }

    /// Removes a previously registered observer.
    ///
    /// Returns true when the token was live.
    pub fn unsubscribe(&self, token: HookToken) -> bool {
        let mut hooks = self.hooks.lock().expect("hook lock");
        let Some(list) = hooks.get_mut(&token.stage) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != token.id);
        before != list.len()
    }

    /// Fires every observer registered for the event's stage.
    pub fn fire(&self, event: &HookEvent) {
        let observers: Vec<HookFn> = {
            let hooks = self.hooks.lock().expect("hook lock");
            hooks
                .get(&event.stage)
                .map(|list| list.iter().map(|(_, f)| f.clone()).collect())
                .unwrap_or_default()
        };
        for observer in observers {
            observer(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn event(stage: HookStage) -> HookEvent {
        HookEvent {
            stage,
            process_id: ProcessId::new(),
            node_key: "n".to_string(),
            task_id: None,
        }
    }

    #[test]
    fn observers_fire_per_stage() {
        let registry = HookRegistry::new();
        let count = Arc::new(AtomicU32::new(0));

        let counting = count.clone();
        registry.register(HookStage::BeforeNode, move |_| {
            counting.fetch_add(1, Ordering::SeqCst);
        });

        registry.fire(&event(HookStage::BeforeNode));
        registry.fire(&event(HookStage::AfterNode));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let registry = HookRegistry::new();
        let count = Arc::new(AtomicU32::new(0));

        let counting = count.clone();
        let token = registry.register(HookStage::AfterTask, move |_| {
            counting.fetch_add(1, Ordering::SeqCst);
        });

        registry.fire(&event(HookStage::AfterTask));
        assert!(registry.unsubscribe(token));
        registry.fire(&event(HookStage::AfterTask));
        assert!(!registry.unsubscribe(token));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
