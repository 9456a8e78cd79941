//! Fixed-schedule backoff for failed notification deliveries.
//!
//! Each transient failure consumes one unit of retry budget and waits a
//! schedule-defined delay before the next attempt. The schedule is short and
//! explicit rather than computed, so operators can read the exact delays off
//! the configuration.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Retry policy for notification delivery.
///
/// `schedule[n]` is the delay after the (n+1)-th consumed attempt. Failures
/// past the end of the schedule reuse the last entry, and the budget caps at
/// `max_attempts` regardless of schedule length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts before giving up.
    pub max_attempts: u32,

    /// Backoff delay per attempt, in order.
    pub schedule: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            schedule: vec![
                Duration::from_secs(5 * 60),
                Duration::from_secs(15 * 60),
                Duration::from_secs(30 * 60),
            ],
        }
    }
}

/// Result of a retry decision for one failed send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the delivery at the specified time.
    Retry {
        /// When the next delivery attempt may run.
        next_retry_at: DateTime<Utc>,
    },
    /// Do not retry; the record becomes terminally failed.
    GiveUp {
        /// Why the delivery will not be retried.
        reason: String,
    },
}

impl RetryPolicy {
    /// Decides whether a failed send gets another attempt.
    ///
    /// `attempt_count` is the budget consumed before this failure; the
    /// decision to retry consumes one more. Non-retryable errors give up
    /// immediately without touching the budget.
    pub fn decide(
        &self,
        attempt_count: u32,
        error: &PipelineError,
        failed_at: DateTime<Utc>,
    ) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::GiveUp { reason: format!("non-retryable error: {error}") };
        }

        if attempt_count >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exceeded", self.max_attempts),
            };
        }

        let delay = self.delay_for_attempt(attempt_count + 1);
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp { reason: "retry delay out of range".to_string() };
        };

        RetryDecision::Retry { next_retry_at: failed_at + chrono_delay }
    }

    /// Delay before the given 1-based attempt.
    ///
    /// Attempts past the end of the schedule reuse the final delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.schedule
            .get(index)
            .or_else(|| self.schedule.last())
            .copied()
            .unwrap_or(Duration::from_secs(30 * 60))
    }
}
