//! Retry delay policy.

use std::time::Duration;

pub(crate) const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
pub(crate) const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(10_000);

/// Exponential backoff without jitter: `delay(n) = min(base * 2^n, cap)`.
///
/// The policy is a pure function of the attempt number. It never sleeps and
/// holds no per-attempt state; the caller owns the retry counter.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound for any single delay
    pub cap: Duration,
}

impl BackoffPolicy {
    #[must_use]
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay to wait before retry number `attempt` (zero-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        2_u32
            .checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

/// [`BackoffPolicy::delay`] with the default base and cap.
#[must_use]
pub fn delay(attempt: u32) -> Duration {
    BackoffPolicy::default().delay(attempt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sequence() {
        let delays: Vec<u128> = (0..5).map(|n| delay(n).as_millis()).collect();

        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10_000]);
    }

    #[test]
    fn stays_at_cap() {
        assert_eq!(delay(5), Duration::from_secs(10));
        assert_eq!(delay(31), Duration::from_secs(10));
        // 2^32 overflows u32
        assert_eq!(delay(32), Duration::from_secs(10));
        assert_eq!(delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn custom_policy() {
        let policy = BackoffPolicy::new(Duration::from_millis(50), Duration::from_millis(300));

        assert_eq!(policy.delay(0), Duration::from_millis(50));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(300));
    }
}
