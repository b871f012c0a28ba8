//! # Retry Policy
//!
//! Bounded retry, then dead-letter.
//!
//! Reclaimed receipts go straight back to QUEUED: the bottleneck is agent
//! availability, so there is no backoff delay. Once `attempt_count` exceeds
//! the ceiling the receipt is FAILED with [`MAX_ATTEMPTS_EXCEEDED`] and is no
//! longer pulled or reclaimed.

use serde::{Deserialize, Serialize};

/// Default attempt ceiling.
pub const DEFAULT_MAX_ATTEMPTS: i64 = 5;

/// `last_error` of a dead-lettered receipt.
pub const MAX_ATTEMPTS_EXCEEDED: &str = "maxAttemptsExceeded";

/// `last_error` of an adapter call that never completed (server stopped mid-call).
pub const ADAPTER_INTERRUPTED: &str = "adapterInterrupted";

/// Attempt ceiling applied by the reclaimer and the retry scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: i64,
}

/// Outcome of a reclaim for one receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to QUEUED with the new attempt count.
    Requeue { attempt_count: i64 },
    /// FAILED for good.
    DeadLetter { attempt_count: i64 },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: i64) -> Self {
        RetryPolicy { max_attempts }
    }

    /// True once `attempt_count` is above the ceiling.
    pub fn is_exhausted(&self, attempt_count: i64) -> bool {
        attempt_count > self.max_attempts
    }

    /// Decision for a lease that expired after `attempt_count` prior attempts.
    pub fn after_lease_expiry(&self, attempt_count: i64) -> RetryDecision {
        let next = attempt_count + 1;
        if self.is_exhausted(next) {
            RetryDecision::DeadLetter { attempt_count: next }
        } else {
            RetryDecision::Requeue { attempt_count: next }
        }
    }
}
