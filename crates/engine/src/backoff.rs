//! Capped exponential backoff.

use std::time::Duration;

/// Exponential backoff schedule with a cap and no attempt limit.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Multiplier applied per attempt.
    pub factor: u32,
    /// Upper bound on the delay.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial: Duration::from_secs(2),
            factor: 2,
            max: Duration::from_secs(120),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based: attempt 0 is the first
    /// retry). Saturates at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut delay = self.initial;
        for _ in 0..attempt {
            delay = delay.saturating_mul(self.factor);
            if delay >= self.max {
                return self.max;
            }
        }
        delay.min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_to_cap() {
        let b = Backoff::default();
        assert_eq!(b.delay(0), Duration::from_secs(2));
        assert_eq!(b.delay(1), Duration::from_secs(4));
        assert_eq!(b.delay(2), Duration::from_secs(8));
        assert_eq!(b.delay(5), Duration::from_secs(64));
        assert_eq!(b.delay(6), Duration::from_secs(120));
        assert_eq!(b.delay(60), Duration::from_secs(120));
    }

    #[test]
    fn test_strictly_increasing_below_cap() {
        let b = Backoff::default();
        let mut last = Duration::ZERO;
        for attempt in 0..6 {
            let d = b.delay(attempt);
            assert!(d > last);
            last = d;
        }
    }
}
