//! The scheduler: bounded queues, workers, and the catch-up poller.

use crate::error::SchedulerError;
use crate::task::{ScheduledKind, ScheduledTask};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use escapement_core::ProcessId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Scheduler tuning knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Capacity of each kind's queue.
    pub queue_size: usize,
    /// Workers per queue.
    pub workers: usize,
    /// How often the catch-up poller scans the task source.
    pub check_interval: Duration,
    /// Max obligations pulled from the source per scan.
    pub batch_size: usize,
    /// Delay between fire retries.
    pub retry_interval: Duration,
    /// Fire retries before counting a task failed.
    pub max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_size: 256,
            workers: 2,
            check_interval: Duration::from_secs(30),
            batch_size: 50,
            retry_interval: Duration::from_secs(1),
            max_retries: 3,
        }
    }
}

/// Receives fired obligations; the engine implements this.
#[async_trait]
pub trait TaskSink: Send + Sync {
    /// Handles one fired obligation.
    async fn fire(&self, task: &ScheduledTask) -> Result<(), SchedulerError>;
}

/// Supplies obligations known only to persistence (restart catch-up).
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Returns obligations due at or before `now`, up to `batch`.
    async fn due_tasks(
        &self,
        now: DateTime<Utc>,
        batch: usize,
    ) -> Result<Vec<ScheduledTask>, SchedulerError>;
}

/// A source with nothing to say.
#[derive(Debug, Default, Clone)]
pub struct NoopTaskSource;

#[async_trait]
impl TaskSource for NoopTaskSource {
    async fn due_tasks(
        &self,
        _now: DateTime<Utc>,
        _batch: usize,
    ) -> Result<Vec<ScheduledTask>, SchedulerError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Default)]
struct Counters {
    scheduled: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time counter values for one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub scheduled: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingEntry {
    revision: u64,
    process_id: ProcessId,
}

struct Inner {
    config: SchedulerConfig,
    senders: HashMap<ScheduledKind, mpsc::Sender<ScheduledTask>>,
    pending: StdMutex<HashMap<String, PendingEntry>>,
    next_revision: AtomicU64,
    counters: HashMap<ScheduledKind, Counters>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn is_current(&self, task: &ScheduledTask) -> bool {
        self.pending
            .lock()
            .expect("pending lock")
            .get(&task.key)
            .is_some_and(|entry| entry.revision == task.revision)
    }

    fn claim(&self, task: &ScheduledTask) -> bool {
        let mut pending = self.pending.lock().expect("pending lock");
        match pending.get(&task.key) {
            Some(entry) if entry.revision == task.revision => {
                pending.remove(&task.key);
                true
            }
            _ => false,
        }
    }
}

/// Handle to a running scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Builds queues, spawns workers and the catch-up poller, and
    /// returns the handle.
    #[must_use]
    pub fn start(
        config: SchedulerConfig,
        sink: Arc<dyn TaskSink>,
        source: Arc<dyn TaskSource>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        let mut senders = HashMap::new();
        let mut receivers = Vec::new();
        for kind in ScheduledKind::ALL {
            let (tx, rx) = mpsc::channel::<ScheduledTask>(config.queue_size.max(1));
            senders.insert(kind, tx);
            receivers.push((kind, rx));
        }

        let counters = ScheduledKind::ALL
            .into_iter()
            .map(|kind| (kind, Counters::default()))
            .collect();

        let inner = Arc::new(Inner {
            config: config.clone(),
            senders,
            pending: StdMutex::new(HashMap::new()),
            next_revision: AtomicU64::new(0),
            counters,
            running: AtomicBool::new(true),
            shutdown: shutdown_tx,
            handles: StdMutex::new(Vec::new()),
        });

        let scheduler = Self {
            inner: inner.clone(),
        };

        let mut handles = Vec::new();
        for (kind, receiver) in receivers {
            let receiver = Arc::new(Mutex::new(receiver));
            for _ in 0..config.workers.max(1) {
                handles.push(tokio::spawn(worker_loop(
                    kind,
                    inner.clone(),
                    receiver.clone(),
                    sink.clone(),
                )));
            }
        }
        handles.push(tokio::spawn(poll_loop(scheduler.clone(), source)));
        *inner.handles.lock().expect("handle lock") = handles;

        scheduler
    }

    /// Stops workers and the poller. Queued obligations are dropped;
    /// the catch-up poller of the next start recovers persisted ones.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown.send(true);
        for handle in self.inner.handles.lock().expect("handle lock").drain(..) {
            handle.abort();
        }
    }

    /// Returns true while the scheduler accepts work.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Schedules an obligation, replacing any pending one with the same
    /// key.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::QueueFull`] on backpressure and
    /// [`SchedulerError::Stopped`] after [`stop`](Self::stop).
    pub fn schedule(&self, mut task: ScheduledTask) -> Result<(), SchedulerError> {
        if !self.is_running() {
            return Err(SchedulerError::Stopped);
        }

        let revision = self.inner.next_revision.fetch_add(1, Ordering::SeqCst) + 1;
        task.revision = revision;
        self.inner.pending.lock().expect("pending lock").insert(
            task.key.clone(),
            PendingEntry {
                revision,
                process_id: task.process_id,
            },
        );

        let sender = &self.inner.senders[&task.kind];
        let kind = task.kind;
        let key = task.key.clone();
        match sender.try_send(task) {
            Ok(()) => {
                self.inner.counters[&kind]
                    .scheduled
                    .fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let mut pending = self.inner.pending.lock().expect("pending lock");
                if pending.get(&key).is_some_and(|e| e.revision == revision) {
                    pending.remove(&key);
                }
                Err(SchedulerError::QueueFull { kind })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SchedulerError::Stopped),
        }
    }

    /// Schedules a task-deadline obligation.
    pub fn schedule_timeout(
        &self,
        process_id: ProcessId,
        node_key: &str,
        trigger_at: DateTime<Utc>,
        data: serde_json::Value,
    ) -> Result<(), SchedulerError> {
        self.schedule(
            ScheduledTask::new(ScheduledKind::Timeout, process_id, node_key, trigger_at)
                .with_data(data),
        )
    }

    /// Schedules a reminder obligation.
    pub fn schedule_reminder(
        &self,
        process_id: ProcessId,
        node_key: &str,
        trigger_at: DateTime<Utc>,
        data: serde_json::Value,
    ) -> Result<(), SchedulerError> {
        self.schedule(
            ScheduledTask::new(ScheduledKind::Reminder, process_id, node_key, trigger_at)
                .with_data(data),
        )
    }

    /// Schedules a timer-node obligation.
    pub fn schedule_timer(
        &self,
        process_id: ProcessId,
        node_key: &str,
        trigger_at: DateTime<Utc>,
        data: serde_json::Value,
    ) -> Result<(), SchedulerError> {
        self.schedule(
            ScheduledTask::new(ScheduledKind::Timer, process_id, node_key, trigger_at)
                .with_data(data),
        )
    }

    /// Cancels the pending obligation with the given coordinates.
    ///
    /// Returns true if one was pending. The queued item, if any, is
    /// dropped when a worker surfaces it.
    pub fn cancel(&self, kind: ScheduledKind, process_id: ProcessId, node_key: &str) -> bool {
        let key = ScheduledTask::key_for(kind, process_id, node_key);
        self.inner
            .pending
            .lock()
            .expect("pending lock")
            .remove(&key)
            .is_some()
    }

    /// Cancels every pending obligation of a process. Returns how many
    /// were dropped.
    pub fn cancel_for_process(&self, process_id: ProcessId) -> usize {
        let mut pending = self.inner.pending.lock().expect("pending lock");
        let before = pending.len();
        pending.retain(|_, entry| entry.process_id != process_id);
        before - pending.len()
    }

    /// Returns how many obligations are pending.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().expect("pending lock").len()
    }

    /// Returns counters per kind.
    #[must_use]
    pub fn counters(&self) -> HashMap<ScheduledKind, CounterSnapshot> {
        ScheduledKind::ALL
            .into_iter()
            .map(|kind| {
                let counters = &self.inner.counters[&kind];
                (
                    kind,
                    CounterSnapshot {
                        scheduled: counters.scheduled.load(Ordering::Relaxed),
                        completed: counters.completed.load(Ordering::Relaxed),
                        failed: counters.failed.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }
}

async fn worker_loop(
    kind: ScheduledKind,
    inner: Arc<Inner>,
    receiver: Arc<Mutex<mpsc::Receiver<ScheduledTask>>>,
    sink: Arc<dyn TaskSink>,
) {
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        let task = {
            let mut guard = receiver.lock().await;
            tokio::select! {
                task = guard.recv() => task,
                _ = shutdown.changed() => return,
            }
        };
        let Some(mut task) = task else { return };

        // Replaced or cancelled while queued.
        if !inner.is_current(&task) {
            continue;
        }

        let now = Utc::now();
        if task.trigger_at > now {
            let delay = (task.trigger_at - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
        }

        // Re-check after the sleep, then take ownership of the firing.
        if !inner.claim(&task) {
            continue;
        }

        loop {
            match sink.fire(&task).await {
                Ok(()) => {
                    inner.counters[&kind]
                        .completed
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(key = %task.key, "scheduled task fired");
                    break;
                }
                Err(error) if task.retry_count < inner.config.max_retries => {
                    task.retry_count += 1;
                    warn!(
                        key = %task.key,
                        attempt = task.retry_count,
                        error = %error,
                        "scheduled task fire failed, retrying"
                    );
                    tokio::time::sleep(inner.config.retry_interval).await;
                }
                Err(error) => {
                    inner.counters[&kind].failed.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %task.key, error = %error, "scheduled task dropped");
                    break;
                }
            }
        }
    }
}

async fn poll_loop(scheduler: Scheduler, source: Arc<dyn TaskSource>) {
    let mut shutdown = scheduler.inner.shutdown.subscribe();
    let interval = scheduler.inner.config.check_interval;
    let batch = scheduler.inner.config.batch_size;

    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }

        let due = match source.due_tasks(Utc::now(), batch).await {
            Ok(due) => due,
            Err(error) => {
                warn!(error = %error, "task source scan failed");
                continue;
            }
        };

        for task in due {
            let already_pending = scheduler
                .inner
                .pending
                .lock()
                .expect("pending lock")
                .contains_key(&task.key);
            if already_pending {
                continue;
            }
            if let Err(error) = scheduler.schedule(task) {
                warn!(error = %error, "failed to enqueue recovered task");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as PlainMutex;

    #[derive(Default)]
    struct RecordingSink {
        fired: PlainMutex<Vec<ScheduledTask>>,
        fail_times: AtomicU64,
    }

    impl RecordingSink {
        fn fired_keys(&self) -> Vec<String> {
            self.fired
                .lock()
                .unwrap()
                .iter()
                .map(|t| t.key.clone())
                .collect()
        }
    }

    #[async_trait]
    impl TaskSink for RecordingSink {
        async fn fire(&self, task: &ScheduledTask) -> Result<(), SchedulerError> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(SchedulerError::Fire {
                    message: "induced".to_string(),
                });
            }
            self.fired.lock().unwrap().push(task.clone());
            Ok(())
        }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            queue_size: 4,
            workers: 1,
            check_interval: Duration::from_millis(20),
            batch_size: 10,
            retry_interval: Duration::from_millis(5),
            max_retries: 2,
        }
    }

    #[tokio::test]
    async fn fires_due_task() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::start(fast_config(), sink.clone(), Arc::new(NoopTaskSource));

        let process_id = ProcessId::new();
        scheduler
            .schedule_timer(process_id, "wait", Utc::now(), serde_json::Value::Null)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.fired_keys().len(), 1);
        assert_eq!(scheduler.pending_count(), 0);

        let counters = scheduler.counters();
        assert_eq!(counters[&ScheduledKind::Timer].scheduled, 1);
        assert_eq!(counters[&ScheduledKind::Timer].completed, 1);
        scheduler.stop();
    }

    #[tokio::test]
    async fn reschedule_replaces_by_key() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::start(fast_config(), sink.clone(), Arc::new(NoopTaskSource));

        let process_id = ProcessId::new();
        let soon = Utc::now() + chrono::Duration::milliseconds(30);
        scheduler
            .schedule_timeout(process_id, "n", soon, serde_json::json!({"gen": 1}))
            .unwrap();
        scheduler
            .schedule_timeout(process_id, "n", soon, serde_json::json!({"gen": 2}))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let fired = sink.fired.lock().unwrap().clone();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].data["gen"], 2);
        scheduler.stop();
    }

    #[tokio::test]
    async fn cancelled_task_never_fires() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::start(fast_config(), sink.clone(), Arc::new(NoopTaskSource));

        let process_id = ProcessId::new();
        let soon = Utc::now() + chrono::Duration::milliseconds(40);
        scheduler
            .schedule_reminder(process_id, "n", soon, serde_json::Value::Null)
            .unwrap();
        assert!(scheduler.cancel(ScheduledKind::Reminder, process_id, "n"));

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(sink.fired_keys().is_empty());
        scheduler.stop();
    }

    #[tokio::test]
    async fn queue_full_is_backpressure() {
        let sink = Arc::new(RecordingSink::default());
        let mut config = fast_config();
        config.queue_size = 1;
        let scheduler = Scheduler::start(config, sink, Arc::new(NoopTaskSource));

        // Future triggers so the queue stays occupied.
        let later = Utc::now() + chrono::Duration::seconds(60);
        let mut results = Vec::new();
        for i in 0..4 {
            let process_id = ProcessId::new();
            results.push(scheduler.schedule_timer(
                process_id,
                &format!("n{i}"),
                later,
                serde_json::Value::Null,
            ));
        }

        assert!(results.iter().any(Result::is_err));
        assert!(matches!(
            results.iter().find(|r| r.is_err()),
            Some(Err(SchedulerError::QueueFull { .. }))
        ));
        scheduler.stop();
    }

    #[tokio::test]
    async fn fire_retries_then_succeeds() {
        let sink = Arc::new(RecordingSink {
            fired: PlainMutex::new(Vec::new()),
            fail_times: AtomicU64::new(1),
        });
        let scheduler = Scheduler::start(fast_config(), sink.clone(), Arc::new(NoopTaskSource));

        scheduler
            .schedule_timer(ProcessId::new(), "n", Utc::now(), serde_json::Value::Null)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(sink.fired_keys().len(), 1);

        let counters = scheduler.counters();
        assert_eq!(counters[&ScheduledKind::Timer].completed, 1);
        assert_eq!(counters[&ScheduledKind::Timer].failed, 0);
        scheduler.stop();
    }

    #[tokio::test]
    async fn poller_recovers_persisted_tasks() {
        struct OneShotSource {
            task: PlainMutex<Option<ScheduledTask>>,
        }

        #[async_trait]
        impl TaskSource for OneShotSource {
            async fn due_tasks(
                &self,
                _now: DateTime<Utc>,
                _batch: usize,
            ) -> Result<Vec<ScheduledTask>, SchedulerError> {
                Ok(self.task.lock().unwrap().take().into_iter().collect())
            }
        }

        let sink = Arc::new(RecordingSink::default());
        let task = ScheduledTask::new(ScheduledKind::Timeout, ProcessId::new(), "n", Utc::now());
        let source = Arc::new(OneShotSource {
            task: PlainMutex::new(Some(task)),
        });
        let scheduler = Scheduler::start(fast_config(), sink.clone(), source);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(sink.fired_keys().len(), 1);
        scheduler.stop();
    }

    #[tokio::test]
    async fn stopped_scheduler_refuses_work() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::start(fast_config(), sink, Arc::new(NoopTaskSource));
        scheduler.stop();

        let result =
            scheduler.schedule_timer(ProcessId::new(), "n", Utc::now(), serde_json::Value::Null);
        assert!(matches!(result, Err(SchedulerError::Stopped)));
    }
}
