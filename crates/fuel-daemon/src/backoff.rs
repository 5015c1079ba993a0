//! Exponential backoff for failing agents.

use fuel_core::FailureType;
use std::time::Duration;

/// Wait after the first retryable failure.
pub const BASE_BACKOFF: Duration = Duration::from_secs(30);

/// Upper bound on any single wait.
pub const MAX_BACKOFF: Duration = Duration::from_secs(15 * 60);

/// Wait before an agent may be scheduled again after its `consecutive_failures`-th
/// failure in a row. Permission failures never back off.
pub fn backoff_for(consecutive_failures: u32, failure: FailureType) -> Duration {
    if !failure.is_retryable() {
        return Duration::ZERO;
    }
    let exponent = consecutive_failures.saturating_sub(1).min(31);
    let seconds = BASE_BACKOFF
        .as_secs()
        .saturating_mul(1u64 << exponent)
        .min(MAX_BACKOFF.as_secs());
    Duration::from_secs(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_from_base() {
        assert_eq!(backoff_for(1, FailureType::Network), Duration::from_secs(30));
        assert_eq!(backoff_for(2, FailureType::Timeout), Duration::from_secs(60));
        assert_eq!(backoff_for(3, FailureType::Crash), Duration::from_secs(120));
        assert_eq!(backoff_for(5, FailureType::Crash), Duration::from_secs(480));
    }

    #[test]
    fn test_capped() {
        assert_eq!(backoff_for(6, FailureType::Network), MAX_BACKOFF);
        assert_eq!(backoff_for(1_000, FailureType::Network), MAX_BACKOFF);
        assert_eq!(backoff_for(u32::MAX, FailureType::Network), MAX_BACKOFF);
    }

    #[test]
    fn test_zero_count_treated_as_first() {
        assert_eq!(backoff_for(0, FailureType::Network), BASE_BACKOFF);
    }

    #[test]
    fn test_permission_never_backs_off() {
        for n in 1..10 {
            assert_eq!(backoff_for(n, FailureType::Permission), Duration::ZERO);
        }
    }
}
