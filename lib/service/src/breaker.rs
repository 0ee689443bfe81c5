//! Per-service circuit breaker.
//!
//! One explicit three-state machine:
//!
//! ```text
//! ┌─────────┐  ratio trip    ┌─────────┐  reset timeout  ┌──────────┐
//! │ Closed  │ ─────────────► │  Open   │ ──────────────► │ HalfOpen │
//! └─────────┘                └─────────┘                 └──────────┘
//!      ▲                          ▲                           │
//!      │ probe success            │ probe failure             │
//!      └──────────────────────────┴───────────────────────────┘
//! ```
//!
//! The closed state trips once enough requests have been observed and the
//! failure ratio crosses the configured threshold. Open denies everything
//! until the reset timeout elapses, then exactly one probe is allowed;
//! the probe's outcome decides between closing and reopening.

use crate::error::ServiceError;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast.
    Open,
    /// Single probe in flight or pending.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Requests that must be observed before the ratio can trip.
    pub min_requests: u32,
    /// Failure ratio at or above which the circuit opens.
    pub failure_ratio: f64,
    /// Time spent open before a probe is allowed.
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            min_requests: 3,
            failure_ratio: 0.6,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl BreakerConfig {
    /// Sets the minimum observed requests.
    #[must_use]
    pub fn with_min_requests(mut self, min_requests: u32) -> Self {
        self.min_requests = min_requests.max(1);
        self
    }

    /// Sets the tripping failure ratio.
    #[must_use]
    pub fn with_failure_ratio(mut self, ratio: f64) -> Self {
        self.failure_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Sets the reset timeout.
    #[must_use]
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    requests: u32,
    failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// A circuit breaker guarding one service.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for the given service.
    #[must_use]
    pub fn new(service: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                requests: 0,
                failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Returns the guarded service name.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock").state
    }

    /// Asks permission to make a call.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::CircuitOpen`] while the circuit denies
    /// calls. A successful return must be paired with exactly one
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn allow(&self) -> Result<(), ServiceError> {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(ServiceError::CircuitOpen {
                        service: self.service.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(ServiceError::CircuitOpen {
                        service: self.service.clone(),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            CircuitState::Closed => {
                inner.requests += 1;
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.requests = 0;
                inner.failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }

    /// Records a failed call, possibly opening the circuit.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            CircuitState::Closed => {
                inner.requests += 1;
                inner.failures += 1;
                let observed_enough = inner.requests >= self.config.min_requests;
                let ratio = f64::from(inner.failures) / f64::from(inner.requests.max(1));
                if observed_enough && ratio >= self.config.failure_ratio {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
            }
            CircuitState::Open => {}
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
