//! The engine configuration surface.
//!
//! Layered loading: built-in defaults, then an optional file, then
//! `ESCAPEMENT_`-prefixed environment overrides
//! (`ESCAPEMENT_ENGINE__MAX_CONCURRENCY=64`).

use crate::error::EngineError;
use escapement_core::retry::RetryPolicy;
use escapement_flow::SandboxConfig;
use escapement_service::BreakerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Engine-wide limits and defaults.
    pub engine: EngineSection,
    /// Executor tuning.
    pub executor: ExecutorSection,
    /// Scheduler tuning.
    pub scheduler: SchedulerSection,
    /// Task background-scan tuning.
    pub tasks: TaskSection,
    /// Default retry policy for nodes without an override.
    pub retry: RetryPolicy,
    /// Default circuit-breaker configuration per service.
    pub breaker: BreakerConfig,
    /// Default script sandbox limits.
    pub sandbox: SandboxConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            engine: EngineSection::default(),
            executor: ExecutorSection::default(),
            scheduler: SchedulerSection::default(),
            tasks: TaskSection::default(),
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

/// Engine-wide limits and defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Concurrent node executions across all processes.
    pub max_concurrency: usize,
    /// Default deadline for driving one node, in milliseconds.
    pub default_timeout_ms: u64,
    /// Interval of the health background loop, in milliseconds.
    pub health_interval_ms: u64,
    /// Interval of the resource background loop, in milliseconds.
    pub resource_interval_ms: u64,
    /// Running processes tolerated before the resource loop complains.
    pub max_processes: usize,
    /// Open tasks tolerated before the resource loop complains.
    pub max_tasks: usize,
    /// Age past which an in-memory tracked process counts as stale, in
    /// milliseconds.
    pub stale_after_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_concurrency: 64,
            default_timeout_ms: 300_000,
            health_interval_ms: 30_000,
            resource_interval_ms: 10_000,
            max_processes: 10_000,
            max_tasks: 100_000,
            stale_after_ms: 600_000,
        }
    }
}

impl EngineSection {
    /// Default node-driving deadline.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Executor tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    /// Workers per handler pool.
    pub workers: usize,
    /// Queue slots per handler pool.
    pub queue_size: usize,
    /// Per-executor operation deadline, in milliseconds.
    pub timeout_ms: u64,
    /// Collect per-handler metrics.
    pub metrics: bool,
    /// Fail operations that would otherwise be silently skipped.
    pub strict: bool,
    /// Run reverse compensation on process failure.
    pub rollback_enabled: bool,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_size: 128,
            timeout_ms: 60_000,
            metrics: true,
            strict: false,
            rollback_enabled: true,
        }
    }
}

/// Scheduler tuning, mirrored into the scheduler crate's config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub check_interval_ms: u64,
    pub batch_size: usize,
    pub workers: usize,
    pub queue_size: usize,
    pub retry_interval_ms: u64,
    pub max_retries: u32,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            batch_size: 50,
            workers: 2,
            queue_size: 256,
            retry_interval_ms: 1_000,
            max_retries: 3,
        }
    }
}

impl SchedulerSection {
    /// Converts into the scheduler crate's configuration.
    #[must_use]
    pub fn to_scheduler_config(&self) -> escapement_scheduler::SchedulerConfig {
        escapement_scheduler::SchedulerConfig {
            queue_size: self.queue_size,
            workers: self.workers,
            check_interval: Duration::from_millis(self.check_interval_ms),
            batch_size: self.batch_size,
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            max_retries: self.max_retries,
        }
    }
}

/// Task background-scan tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSection {
    /// Overdue-task scan interval, in milliseconds.
    pub timeout_scan_interval_ms: u64,
    /// Reminder scan interval, in milliseconds.
    pub reminder_scan_interval_ms: u64,
    /// How far before the deadline reminders begin, in milliseconds.
    pub reminder_lead_ms: u64,
    /// Unassigned-task scan interval, in milliseconds.
    pub auto_assign_interval_ms: u64,
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            timeout_scan_interval_ms: 60_000,
            reminder_scan_interval_ms: 300_000,
            reminder_lead_ms: 3_600_000,
            auto_assign_interval_ms: 30_000,
        }
    }
}

impl EngineSettings {
    /// Loads settings: defaults, then `path` (if given), then environment.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] when the file or environment
    /// contents fail to deserialize.
    pub fn load(path: Option<&str>) -> Result<Self, EngineError> {
        let defaults =
            config::Config::try_from(&Self::default()).map_err(|e| EngineError::Validation {
                reason: format!("default settings: {e}"),
            })?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("ESCAPEMENT")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| EngineError::Validation {
                reason: format!("settings: {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load() {
        let settings = EngineSettings::load(None).expect("load");
        assert_eq!(settings.engine.max_concurrency, 64);
        assert_eq!(settings.scheduler.workers, 2);
        assert_eq!(settings.retry.max_attempts, 3);
    }

    #[test]
    fn scheduler_section_converts() {
        let section = SchedulerSection::default();
        let config = section.to_scheduler_config();
        assert_eq!(config.queue_size, 256);
        assert_eq!(config.check_interval, Duration::from_secs(30));
    }

    #[test]
    fn default_timeout_duration() {
        let section = EngineSection::default();
        assert_eq!(section.default_timeout(), Duration::from_secs(300));
    }
}
