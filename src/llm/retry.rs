use crate::error::LlmError;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter for retryable gateway failures.
///
/// Delays follow `initial · multiplier^attempt`, capped, then jittered into
/// the upper half of the computed window so concurrent retries spread out.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Whether `attempt` (zero-based) may be followed by another try.
    #[must_use]
    pub fn should_retry(&self, attempt: u32, error: &LlmError) -> bool {
        attempt + 1 < self.max_attempts && error.retryable()
    }

    /// Backoff before retry number `attempt + 1`, jittered.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let base_ms = self
            .initial_delay
            .as_millis()
            .saturating_mul(u128::from(self.multiplier).saturating_pow(exponent))
            .min(self.max_delay.as_millis());
        let base_ms = u64::try_from(base_ms).unwrap_or(u64::MAX);

        // Half-jitter: [base/2, base].
        let half = base_ms / 2;
        let jittered = half + rand::rng().random_range(0..=half.max(1));
        Duration::from_millis(jittered.min(self.max_delay.as_millis() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout_err() -> LlmError {
        LlmError::Timeout {
            provider: "openai".into(),
            elapsed_ms: 60_000,
        }
    }

    #[test]
    fn retries_up_to_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0, &timeout_err()));
        assert!(policy.should_retry(1, &timeout_err()));
        assert!(!policy.should_retry(2, &timeout_err()));
    }

    #[test]
    fn auth_never_retries() {
        let policy = RetryPolicy::default();
        let err = LlmError::Auth {
            provider: "openai".into(),
        };
        assert!(!policy.should_retry(0, &err));
    }

    #[test]
    fn delay_grows_and_respects_cap() {
        let policy = RetryPolicy::default();
        for attempt in 0..8 {
            let delay = policy.delay(attempt);
            assert!(delay <= policy.max_delay, "attempt {attempt}: {delay:?}");
        }
        // First retry lands in [0.5s, 1s].
        let first = policy.delay(0);
        assert!(first >= Duration::from_millis(500));
        assert!(first <= Duration::from_secs(1));
    }

    #[test]
    fn delay_is_capped_for_large_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.delay(30) <= Duration::from_secs(30));
    }
}
