//! Step retry backoff policy.
//!
//! The baseline execution path fails a run on the first step error;
//! `BackoffPolicy` is modeled and unit-tested in isolation so it is ready
//! for a forward-compatible per-step retry extension without being wired
//! into that baseline path.

use serde::{Deserialize, Serialize};

/// Retry backoff policy: delay for attempt *n* (1-based) is
/// `min(initial_interval_ms * coefficient^(n-1), maximum_interval_ms)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry, in milliseconds.
    pub initial_interval_ms: u64,
    /// Multiplier applied per retry attempt.
    pub backoff_coefficient: f64,
    /// Upper bound on the computed delay, in milliseconds.
    pub maximum_interval_ms: u64,
    /// Maximum number of attempts, or `None` for unbounded.
    pub maximum_attempts: Option<u32>,
}

impl BackoffPolicy {
    /// A conservative default: 1s initial delay, doubling, capped at 1 minute.
    #[must_use]
    pub fn default_policy() -> Self {
        Self {
            initial_interval_ms: 1_000,
            backoff_coefficient: 2.0,
            maximum_interval_ms: 60_000,
            maximum_attempts: None,
        }
    }

    /// Computes the delay, in milliseconds, before attempt `n` (1-based).
    ///
    /// No jitter is applied; implementations that add jitter must still
    /// respect `maximum_interval_ms` as a hard cap.
    #[must_use]
    pub fn compute_delay(&self, attempt: u32) -> u64 {
        let attempt = attempt.max(1);
        let exponent = f64::from(attempt - 1);
        let scaled = (self.initial_interval_ms as f64) * self.backoff_coefficient.powf(exponent);

        if !scaled.is_finite() || scaled >= self.maximum_interval_ms as f64 {
            return self.maximum_interval_ms;
        }

        (scaled as u64).min(self.maximum_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::BackoffPolicy;

    #[test]
    fn first_attempt_uses_initial_interval() {
        let policy = BackoffPolicy::default_policy();
        assert_eq!(policy.compute_delay(1), policy.initial_interval_ms);
    }

    #[test]
    fn delay_grows_with_coefficient() {
        let policy = BackoffPolicy {
            initial_interval_ms: 100,
            backoff_coefficient: 2.0,
            maximum_interval_ms: 10_000,
            maximum_attempts: None,
        };

        assert_eq!(policy.compute_delay(1), 100);
        assert_eq!(policy.compute_delay(2), 200);
        assert_eq!(policy.compute_delay(3), 400);
    }

    proptest! {
        #[test]
        fn delay_never_exceeds_maximum(
            initial_interval_ms in 1u64..=10_000,
            backoff_coefficient in 1.0f64..=5.0,
            maximum_interval_ms in 1u64..=120_000,
            attempt in 1u32..=50,
        ) {
            let policy = BackoffPolicy {
                initial_interval_ms,
                backoff_coefficient,
                maximum_interval_ms,
                maximum_attempts: None,
            };

            prop_assert!(policy.compute_delay(attempt) <= maximum_interval_ms);
        }
    }
}
