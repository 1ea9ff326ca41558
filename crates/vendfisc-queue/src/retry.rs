//! # Retry Policy
//!
//! Backoff delays for failed queue items.
//!
//! ```text
//!   attempt   transient delay (base 5s, cap 15m)     precondition delay (2s)
//!   ───────   ─────────────────────────────────      ───────────────────────
//!      1      5s   ± jitter                           2s ± jitter
//!      2      10s  ± jitter                           4s ± jitter
//!      3      20s  ± jitter                           8s ± jitter
//!      …
//!      9      15m  ± jitter (capped)                  8m32s ± jitter
//! ```
//!
//! Policies are injected per operation family: receipts and shift
//! operations have separate budgets.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use std::time::Duration;

use vendfisc_core::{FailureClass, OperationKind};

/// Doubling stops mattering long before this many attempts.
const MAX_DOUBLINGS: u32 = 32;

/// Backoff parameters for one family of operations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Budget stamped on new items.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Randomization factor (0.0 disables jitter).
    pub jitter: f64,
    pub precondition_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the next attempt of an item that has already been
    /// retried `retry_count` times.
    ///
    /// Transient failures back off as `base * 2^retry_count`, capped, with
    /// jitter. Precondition failures start from the shorter precondition
    /// delay and double the same way.
    pub fn delay_for(&self, retry_count: u32, class: FailureClass) -> Duration {
        let initial = match class {
            FailureClass::Precondition => self.precondition_delay,
            _ => self.base_delay,
        };
        let cap = self.max_delay.max(initial);
        let steps = retry_count.min(MAX_DOUBLINGS) + 1;

        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(initial)
            .with_multiplier(2.0)
            .with_randomization_factor(self.jitter)
            .with_max_interval(cap)
            .with_max_elapsed_time(None)
            .build();

        let mut delay = initial;
        for _ in 0..steps {
            if let Some(next) = backoff.next_backoff() {
                delay = next;
            }
        }
        delay
    }

    /// Absolute time of the next attempt.
    pub fn next_retry_at(
        &self,
        retry_count: u32,
        class: FailureClass,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let delay = self.delay_for(retry_count, class);
        now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1))
    }
}

/// Retry policy per operation family.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicies {
    pub receipts: RetryPolicy,
    pub shifts: RetryPolicy,
}

impl RetryPolicies {
    /// Receipts use the receipt policy; shift operations and X-reports use
    /// the shift policy.
    pub fn for_operation(&self, kind: OperationKind) -> &RetryPolicy {
        if kind.is_receipt() {
            &self.receipts
        } else {
            &self.shifts
        }
    }
}

impl Default for RetryPolicies {
    fn default() -> Self {
        crate::config::RetryConfig::default().policies()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
            precondition_delay: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_transient_delay_doubles_and_caps() {
        let p = policy();
        let ms = |n| p.delay_for(n, FailureClass::Transient).as_millis();
        assert_eq!(ms(0), 5_000);
        assert_eq!(ms(1), 10_000);
        assert_eq!(ms(2), 20_000);
        assert_eq!(ms(3), 40_000);
        assert_eq!(ms(4), 60_000);
        assert_eq!(ms(50), 60_000);
    }

    #[test]
    fn test_precondition_delay_starts_short() {
        let p = policy();
        let ms = |n| p.delay_for(n, FailureClass::Precondition).as_millis();
        assert_eq!(ms(0), 2_000);
        assert_eq!(ms(1), 4_000);
        assert_eq!(ms(4), 32_000);
        assert_eq!(ms(7), 60_000);
    }

    #[test]
    fn test_jitter_stays_within_factor() {
        let p = RetryPolicy {
            jitter: 0.2,
            ..policy()
        };
        for _ in 0..50 {
            let d = p.delay_for(1, FailureClass::Transient).as_millis();
            assert!((8_000..=12_001).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn test_policy_per_operation() {
        let policies = RetryPolicies::default();
        assert_eq!(policies.for_operation(OperationKind::ReceiptSale).max_retries, 10);
        assert_eq!(policies.for_operation(OperationKind::ShiftClose).max_retries, 20);
        assert_eq!(policies.for_operation(OperationKind::XReport).max_retries, 20);
    }

    #[test]
    fn test_next_retry_at_is_in_the_future() {
        let now = Utc::now();
        let at = policy().next_retry_at(0, FailureClass::Transient, now);
        assert_eq!((at - now).num_seconds(), 5);
    }
}
