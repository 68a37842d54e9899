//! Retry controller: decides what happens to an item after its handler ran.
//!
//! On success the item is removed. On failure the attempt counter is bumped
//! and the item is either rescheduled at `now + backoff` or, once attempts
//! are exhausted (or the error is non-retriable), moved to the dead-letter
//! list. Panics reach this module as ordinary errors.

use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::{NonRetriableError, StoreError};
use crate::lease::Lease;
use crate::queue::handler::RunResult;
use crate::queue::item::QueueItem;
use crate::store::{DeadLetter, QueueStore};

/// Exponential retry delay: `initial * factor^n`, capped at `max`, where `n`
/// is the number of failures before the current one.
///
/// The curve is deterministic so delays never decrease as attempts grow.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(10),
            factor: 2.0,
            max: Duration::from_secs(600),
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial: Duration, factor: f64, max: Duration) -> Self {
        Self {
            initial,
            factor,
            max,
        }
    }

    /// Returns the delay before the attempt following `failures_so_far`
    /// earlier failures (0 for the first failure).
    pub fn delay(&self, failures_so_far: u32) -> Duration {
        let exponent = i32::try_from(failures_so_far).unwrap_or(i32::MAX);
        let millis = self.initial.as_millis() as f64 * self.factor.powi(exponent);
        let max_ms = self.max.as_millis() as f64;
        if !millis.is_finite() || millis >= max_ms {
            return self.max;
        }
        Duration::from_millis(millis.round() as u64)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.initial.is_zero() {
            return Err("initial delay must be greater than 0".to_string());
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(format!("factor must be at least 1.0, got {}", self.factor));
        }
        if self.max < self.initial {
            return Err("max delay cannot be shorter than the initial delay".to_string());
        }
        Ok(())
    }
}

/// What to do with an item after its handler returned.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Remove the item.
    Completed,
    /// Write back the updated item, ready again after `delay`.
    Retry { item: QueueItem, delay: Duration, error: String },
    /// Drop the item into the dead-letter list.
    Dead { item: QueueItem, error: String },
}

impl Resolution {
    pub fn label(&self) -> &'static str {
        match self {
            Resolution::Completed => "completed",
            Resolution::Retry { .. } => "retry",
            Resolution::Dead { .. } => "dead",
        }
    }
}

/// Applies retry accounting to handler outcomes.
#[derive(Debug, Clone)]
pub struct RetryController {
    backoff: BackoffPolicy,
    default_max_attempts: u32,
    dead_letter_max: usize,
}

impl RetryController {
    pub fn new(backoff: BackoffPolicy, default_max_attempts: u32, dead_letter_max: usize) -> Self {
        Self {
            backoff,
            default_max_attempts,
            dead_letter_max,
        }
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Decides the resolution of one handler run at `now_ms`.
    pub fn plan(
        &self,
        item: &QueueItem,
        outcome: &anyhow::Result<RunResult>,
        now_ms: i64,
    ) -> Resolution {
        let err = match outcome {
            Ok(_) => return Resolution::Completed,
            Err(err) => err,
        };

        let message = format!("{err:#}");
        let mut failed = item.clone();
        failed.data.attempt = item.data.attempt.saturating_add(1);

        if NonRetriableError::is_in(err) {
            return Resolution::Dead {
                item: failed,
                error: message,
            };
        }

        if !failed.should_retry(self.default_max_attempts) {
            return Resolution::Dead {
                item: failed,
                error: message,
            };
        }

        let delay = self.backoff.delay(item.data.attempt);
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        failed.at_ms = now_ms.saturating_add(delay_ms);
        failed.score_ms = failed.at_ms;

        Resolution::Retry {
            item: failed,
            delay,
            error: message,
        }
    }

    /// Writes a resolution to the store under the item's lease.
    ///
    /// Returns `false` when the lease was lost before the write, in which
    /// case the store is left untouched and the item will be redelivered.
    pub async fn apply(
        &self,
        store: &dyn QueueStore,
        item_id: &str,
        resolution: &Resolution,
        lease: &Lease,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        match resolution {
            Resolution::Completed => {
                debug!(item_id = %item_id, "Removing completed item");
                store.dequeue(item_id, lease).await
            }
            Resolution::Retry { item, delay, error } => {
                warn!(
                    item_id = %item_id,
                    attempt = item.data.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Item failed, rescheduling"
                );
                store.requeue(item, lease).await
            }
            Resolution::Dead { item, error } => {
                error!(
                    item_id = %item_id,
                    attempt = item.data.attempt,
                    error = %error,
                    "Item failed permanently, moving to dead letters"
                );
                let letter = DeadLetter {
                    item: item.clone(),
                    error: error.clone(),
                    dead_at_ms: now_ms,
                };
                store.dead(&letter, lease, self.dead_letter_max).await
            }
        }
    }
}
