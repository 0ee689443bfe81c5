//! Timer specifications: when a timer node fires, and fires again.

use crate::error::SchedulerError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use escapement_flow::{TimerConfig, parse_duration};
use std::str::FromStr;
use std::time::Duration;

/// A parsed, fireable timer.
#[derive(Debug, Clone)]
pub enum TimerSpec {
    /// Fire once after a delay.
    Delay(Duration),
    /// Fire on a cron schedule, indefinitely.
    Cron(Box<Schedule>),
    /// Fire `count` times, `interval` apart.
    Cycle { count: u32, interval: Duration },
    /// Fire once at an instant.
    Date(DateTime<Utc>),
}

impl TimerSpec {
    /// Parses a node's timer configuration.
    ///
    /// Cron expressions are authored in the standard 5-field form; the
    /// seconds field the parser wants is pinned to zero.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidTimer`] for unparseable
    /// durations or cron expressions.
    pub fn parse(config: &TimerConfig) -> Result<Self, SchedulerError> {
        match config {
            TimerConfig::Delay { duration } => {
                let delay =
                    parse_duration(duration).map_err(|reason| SchedulerError::InvalidTimer {
                        reason,
                    })?;
                Ok(Self::Delay(delay))
            }
            TimerConfig::Cron { expression } => {
                let fields = expression.split_whitespace().count();
                if fields != 5 {
                    return Err(SchedulerError::InvalidTimer {
                        reason: format!("expected 5 cron fields, got {fields}"),
                    });
                }
                let schedule = Schedule::from_str(&format!("0 {expression}")).map_err(|e| {
                    SchedulerError::InvalidTimer {
                        reason: e.to_string(),
                    }
                })?;
                Ok(Self::Cron(Box::new(schedule)))
            }
            TimerConfig::Cycle { count, interval } => {
                if *count == 0 {
                    return Err(SchedulerError::InvalidTimer {
                        reason: "cycle count must be positive".to_string(),
                    });
                }
                let interval =
                    parse_duration(interval).map_err(|reason| SchedulerError::InvalidTimer {
                        reason,
                    })?;
                Ok(Self::Cycle {
                    count: *count,
                    interval,
                })
            }
            TimerConfig::Date { at } => Ok(Self::Date(*at)),
        }
    }

    /// Returns the next fire time after `now`, given how many times the
    /// timer already fired. `None` means the timer is exhausted.
    ///
    /// A returned instant in the past means the fire is overdue and
    /// should happen immediately.
    #[must_use]
    pub fn next_fire(&self, now: DateTime<Utc>, fired: u32) -> Option<DateTime<Utc>> {
        match self {
            Self::Delay(delay) => {
                if fired > 0 {
                    return None;
                }
                Some(now + ChronoDuration::from_std(*delay).unwrap_or(ChronoDuration::zero()))
            }
            Self::Cron(schedule) => schedule.after(&now).next(),
            Self::Cycle { count, interval } => {
                if fired >= *count {
                    return None;
                }
                Some(now + ChronoDuration::from_std(*interval).unwrap_or(ChronoDuration::zero()))
            }
            Self::Date(at) => {
                if fired > 0 {
                    return None;
                }
                Some(*at)
            }
        }
    }

    /// Returns how many fires remain, where that is knowable.
    #[must_use]
    pub fn remaining(&self, fired: u32) -> Option<u32> {
        match self {
            Self::Delay(_) | Self::Date(_) => Some(u32::from(fired == 0)),
            Self::Cycle { count, .. } => Some(count.saturating_sub(fired)),
            Self::Cron(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_fires_once() {
        let spec = TimerSpec::parse(&TimerConfig::Delay {
            duration: "2s".to_string(),
        })
        .unwrap();
        let now = Utc::now();

        let next = spec.next_fire(now, 0).unwrap();
        assert_eq!((next - now).num_seconds(), 2);
        assert!(spec.next_fire(now, 1).is_none());
        assert_eq!(spec.remaining(0), Some(1));
        assert_eq!(spec.remaining(1), Some(0));
    }

    #[test]
    fn cron_normalizes_five_fields() {
        let spec = TimerSpec::parse(&TimerConfig::Cron {
            expression: "0 7 * * *".to_string(),
        })
        .unwrap();
        let now = Utc::now();

        let first = spec.next_fire(now, 0).unwrap();
        assert!(first > now);
        // Cron timers never exhaust.
        assert!(spec.next_fire(now, 100).is_some());
        assert_eq!(spec.remaining(100), None);
    }

    #[test]
    fn cron_wrong_field_count_rejected() {
        let result = TimerSpec::parse(&TimerConfig::Cron {
            expression: "0 0 7 * * *".to_string(),
        });
        assert!(matches!(result, Err(SchedulerError::InvalidTimer { .. })));
    }

    #[test]
    fn cycle_exhausts_after_count() {
        let spec = TimerSpec::parse(&TimerConfig::Cycle {
            count: 3,
            interval: "1m".to_string(),
        })
        .unwrap();
        let now = Utc::now();

        assert!(spec.next_fire(now, 0).is_some());
        assert!(spec.next_fire(now, 2).is_some());
        assert!(spec.next_fire(now, 3).is_none());
        assert_eq!(spec.remaining(1), Some(2));
    }

    #[test]
    fn past_date_is_overdue_not_exhausted() {
        let past = Utc::now() - ChronoDuration::minutes(10);
        let spec = TimerSpec::parse(&TimerConfig::Date { at: past }).unwrap();

        let next = spec.next_fire(Utc::now(), 0).unwrap();
        assert!(next < Utc::now());
        assert!(spec.next_fire(Utc::now(), 1).is_none());
    }
}
