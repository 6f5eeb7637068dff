//! Retry budget and backoff policy for failed deliveries.
//!
//! Pure functions and constants; the dispatch engine applies the computed
//! delay when scheduling a redelivery and consults the budget when deciding
//! whether a job is dead-lettered.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default number of delivery attempts before a job is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default base delay for the first retry.
pub const DEFAULT_BASE_DELAY_SECS: u64 = 10;

/// Default upper bound on a single retry delay.
pub const DEFAULT_MAX_DELAY_SECS: u64 = 3600;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Bounded exponential backoff: `base * 2^(attempt - 1)`, capped.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total delivery attempts allowed (first attempt included).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling applied to every computed delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(DEFAULT_BASE_DELAY_SECS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
        }
    }
}

impl RetryPolicy {
    /// Whether a job that has already been attempted `attempt` times
    /// still has retry budget left.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait before redelivering after the given failed attempt
    /// (1-indexed: attempt 1 is the first delivery).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
        delay.min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(3600),
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(10));
        assert_eq!(policy.backoff(2), Duration::from_secs(20));
        assert_eq!(policy.backoff(3), Duration::from_secs(40));
        assert_eq!(policy.backoff(4), Duration::from_secs(80));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(300),
        };
        assert_eq!(policy.backoff(9), Duration::from_secs(300));
    }

    #[test]
    fn backoff_does_not_overflow_on_large_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(u32::MAX), policy.max_delay);
    }

    #[test]
    fn budget_exhausted_at_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
        assert!(!policy.allows_retry(4));
    }
}
