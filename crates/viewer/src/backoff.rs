//! Exponential reconnect backoff.

use std::time::Duration;

/// Default first reconnect delay.
pub const DEFAULT_BASE: Duration = Duration::from_millis(500);

/// Default delay ceiling.
pub const DEFAULT_CAP: Duration = Duration::from_secs(30);

/// Reconnect delay of `min(base * 2^attempts, cap)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_CAP)
    }
}

impl Backoff {
    /// Creates a backoff with no recorded failures.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempts: 0,
        }
    }

    /// Consecutive failures recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay for the current number of attempts.
    pub fn delay(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempts).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Records a failure and returns the delay to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay();
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// A successful connection starts over.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
        assert_eq!(backoff.attempts(), 6);
    }

    #[test]
    fn test_delay_formula_after_k_failures() {
        let base = Duration::from_millis(250);
        let cap = Duration::from_secs(60);
        for k in 0..12u32 {
            let mut backoff = Backoff::new(base, cap);
            for _ in 0..k {
                backoff.next_delay();
            }
            assert_eq!(backoff.delay(), (base * 2u32.pow(k)).min(cap));
        }
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.delay(), DEFAULT_BASE);
    }

    #[test]
    fn test_huge_attempt_count_saturates_at_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..200 {
            backoff.next_delay();
        }
        assert_eq!(backoff.delay(), Duration::from_secs(30));
    }
}
