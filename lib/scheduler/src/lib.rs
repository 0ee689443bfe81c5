//! Timed obligations for the escapement engine.
//!
//! Three independent bounded queues (task timeouts, reminders, node
//! timers) with small worker pools. Keys are deterministic per
//! kind/process/node so rescheduling replaces rather than duplicates;
//! cancellation tombstones the keyed entry and workers drop stale items
//! when they surface. A store-backed polling loop re-enqueues obligations
//! that exist only in persistence, which is how timers survive restarts.

pub mod error;
pub mod scheduler;
pub mod task;
pub mod timer;

pub use error::SchedulerError;
pub use scheduler::{
    CounterSnapshot, NoopTaskSource, Scheduler, SchedulerConfig, TaskSink, TaskSource,
};
pub use task::{ScheduledKind, ScheduledTask};
pub use timer::TimerSpec;
