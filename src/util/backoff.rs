//! Bounded exponential backoff.

use std::time::Duration;

/// Doubling delay starting at `base`, never exceeding `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a backoff schedule.
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `attempt` (1-based). Attempt 0 waits nothing.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let shift = (attempt - 1).min(31);
        self.base
            .checked_mul(1_u32 << shift)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Upper bound of the schedule.
    pub const fn max(&self) -> Duration {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_cap() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(30), Duration::from_secs(600));
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_secs(30));
        assert_eq!(backoff.delay(2), Duration::from_secs(60));
        assert_eq!(backoff.delay(5), Duration::from_secs(480));
        assert_eq!(backoff.delay(6), Duration::from_secs(600));
        assert_eq!(backoff.delay(40), Duration::from_secs(600));
    }
}
