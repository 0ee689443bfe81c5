//! Exponential-backoff retry for fallible async operations.
//!
//! The policy carries the backoff shape; the executor drives an operation
//! under it, consulting [`ErrorCode::is_retryable`] to decide whether a
//! failure is worth another attempt. Jitter spreads concurrent retries so
//! a burst of failures does not reconverge on the collaborator at once.

use crate::error::{Coded, ErrorCode};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Backoff configuration for retryable operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,
    /// Cap applied to every single delay.
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,
    /// Factor applied to the delay after each failure.
    pub multiplier: f64,
    /// Whether to jitter each delay by ±50%.
    pub jitter: bool,
    /// Budget for the whole operation, sleeps included.
    #[serde(with = "duration_millis")]
    pub max_duration: Duration,
    /// Treat `invalid_param` failures as retryable.
    ///
    /// Off by default; some providers signal transient upstream rejections
    /// with this code and opt in per node.
    #[serde(default)]
    pub retry_invalid_param: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            max_duration: Duration::from_secs(120),
            retry_invalid_param: false,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
            max_duration: Duration::MAX,
            retry_invalid_param: false,
        }
    }

    /// Creates a fixed-interval policy with no backoff growth.
    #[must_use]
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            multiplier: 1.0,
            jitter: false,
            max_duration: Duration::MAX,
            retry_invalid_param: false,
        }
    }

    /// Sets the maximum number of attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets the initial retry interval.
    #[must_use]
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Sets the per-delay cap.
    #[must_use]
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the total elapsed-time budget.
    #[must_use]
    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    /// Opts `invalid_param` failures into retrying.
    #[must_use]
    pub fn with_retry_invalid_param(mut self, retry: bool) -> Self {
        self.retry_invalid_param = retry;
        self
    }

    /// Returns whether a failure with the given code should be retried.
    #[must_use]
    pub fn classifies_retryable(&self, code: ErrorCode) -> bool {
        code.is_retryable() || (code == ErrorCode::InvalidParam && self.retry_invalid_param)
    }

    /// Returns the delay before the retry following `attempt` (1-based),
    /// without jitter applied.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let grown = self
            .initial_interval
            .mul_f64(self.multiplier.powi(attempt.saturating_sub(1) as i32));
        grown.min(self.max_interval)
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(0.5..1.5);
        base.mul_f64(factor)
    }
}

/// Observer for retry lifecycle events.
///
/// All methods default to no-ops; implement the ones you need.
pub trait RetryObserver: Send + Sync {
    /// Called before sleeping ahead of the next attempt.
    fn on_retry(&self, _attempt: u32, _code: ErrorCode) {}
    /// Called when an attempt succeeds.
    fn on_success(&self, _attempt: u32) {}
    /// Called when attempts or the time budget ran out on a retryable error.
    fn on_exhausted(&self, _code: ErrorCode) {}
}

struct NoopObserver;

impl RetryObserver for NoopObserver {}

/// Drives fallible async operations under a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    observer: Arc<dyn RetryObserver>,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RetryExecutor {
    /// Creates a retry executor with the given policy.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Attaches an observer for retry lifecycle events.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn RetryObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Returns the policy in force.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `op` until it succeeds, fails terminally, or the policy's
    /// attempt/time budget is spent. The closure receives the 1-based
    /// attempt number.
    ///
    /// # Errors
    ///
    /// Returns the last error produced by `op`.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        E: Coded,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 1;

        loop {
            match op(attempt).await {
                Ok(value) => {
                    self.observer.on_success(attempt);
                    return Ok(value);
                }
                Err(err) => {
                    let code = err.code();
                    if !self.policy.classifies_retryable(code) {
                        return Err(err);
                    }
                    if attempt >= self.policy.max_attempts {
                        self.observer.on_exhausted(code);
                        return Err(err);
                    }

                    let delay = self.policy.jittered_delay(attempt);
                    if started.elapsed() + delay > self.policy.max_duration {
                        self.observer.on_exhausted(code);
                        return Err(err);
                    }

                    debug!(attempt, code = %code, delay_ms = delay.as_millis() as u64, "retrying");
                    self.observer.on_retry(attempt, code);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Serde support for Duration as milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError(ErrorCode);

    impl Coded for TestError {
        fn code(&self) -> ErrorCode {
            self.0
        }
    }

    #[test]
    fn base_delay_grows_and_caps() {
        let policy = RetryPolicy::default()
            .with_initial_interval(Duration::from_secs(1))
            .with_multiplier(2.0)
            .with_max_interval(Duration::from_secs(5))
            .with_jitter(false);

        assert_eq!(policy.base_delay(1), Duration::from_secs(1));
        assert_eq!(policy.base_delay(2), Duration::from_secs(2));
        assert_eq!(policy.base_delay(3), Duration::from_secs(4));
        // Capped.
        assert_eq!(policy.base_delay(4), Duration::from_secs(5));
        assert_eq!(policy.base_delay(10), Duration::from_secs(5));
    }

    #[test]
    fn invalid_param_opt_in() {
        let policy = RetryPolicy::default();
        assert!(!policy.classifies_retryable(ErrorCode::InvalidParam));

        let policy = policy.with_retry_invalid_param(true);
        assert!(policy.classifies_retryable(ErrorCode::InvalidParam));
        assert!(!policy.classifies_retryable(ErrorCode::Validation));
    }

    #[tokio::test]
    async fn succeeds_first_attempt() {
        let executor = RetryExecutor::new(RetryPolicy::default());
        let result: Result<u32, TestError> = executor.run(|_| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_exactly_max_attempts() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(
            RetryPolicy::fixed(Duration::from_millis(1), 4).with_jitter(false),
        );

        let result: Result<u32, TestError> = executor
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError(ErrorCode::Network)) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn terminal_error_short_circuits() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(RetryPolicy::fixed(Duration::from_millis(1), 5));

        let result: Result<u32, TestError> = executor
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError(ErrorCode::Validation)) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(
            RetryPolicy::fixed(Duration::from_millis(1), 5).with_jitter(false),
        );

        let result: Result<&str, TestError> = executor
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(TestError(ErrorCode::Timeout))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn observer_sees_lifecycle() {
        #[derive(Default)]
        struct Counting {
            retries: AtomicU32,
            exhausted: AtomicU32,
        }

        impl RetryObserver for Counting {
            fn on_retry(&self, _attempt: u32, _code: ErrorCode) {
                self.retries.fetch_add(1, Ordering::SeqCst);
            }
            fn on_exhausted(&self, _code: ErrorCode) {
                self.exhausted.fetch_add(1, Ordering::SeqCst);
            }
        }

        let observer = Arc::new(Counting::default());
        let executor = RetryExecutor::new(RetryPolicy::fixed(Duration::from_millis(1), 3))
            .with_observer(observer.clone());

        let result: Result<(), TestError> = executor
            .run(|_| async { Err(TestError(ErrorCode::System)) })
            .await;

        assert!(result.is_err());
        assert_eq!(observer.retries.load(Ordering::SeqCst), 2);
        assert_eq!(observer.exhausted.load(Ordering::SeqCst), 1);
    }
}
