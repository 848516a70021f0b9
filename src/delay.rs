use rand::prelude::*;
use std::cell::RefCell;
use tokio::time::Duration;

thread_local! {
    static THREAD_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::seed_from_u64(rand::random()));
}

/// Exponential backoff with full jitter, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDelay {
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryDelay {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    /// A uniformly random delay between zero and `base * 2^attempt`, capped at
    /// the maximum.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let ceiling = 1u64
            .checked_shl(attempt)
            .map_or(u64::MAX, |factor| self.base_delay_ms.saturating_mul(factor))
            .min(self.max_delay_ms);
        let jittered = THREAD_RNG.with(|rng| rng.borrow_mut().random_range(0..=ceiling));
        Duration::from_millis(jittered)
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self {
            base_delay_ms: 250,
            max_delay_ms: 30_000,
        }
    }
}

/// Counts consecutive failures of a reconnecting loop.
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    delay: RetryDelay,
    attempt: u32,
}

impl Backoff {
    pub fn new(delay: RetryDelay) -> Self {
        Self { delay, attempt: 0 }
    }

    /// The wait before the next attempt. Each call widens the window until
    /// [`reset`](Self::reset).
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay.calculate_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Called after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn delays_stay_under_the_exponential_ceiling() {
        let retry_delay = RetryDelay::new(100, 1000);
        for _ in 0..100 {
            assert!(retry_delay.calculate_delay(0).as_millis() <= 100);
            assert!(retry_delay.calculate_delay(1).as_millis() <= 200);
            assert!(retry_delay.calculate_delay(3).as_millis() <= 800);
            assert!(retry_delay.calculate_delay(5).as_millis() <= 1000);
        }
    }

    #[test]
    fn large_attempt_counts_do_not_overflow() {
        let retry_delay = RetryDelay::new(100, 500);
        for attempt in [10, 63, 64, 1000, u32::MAX] {
            assert!(retry_delay.calculate_delay(attempt).as_millis() <= 500);
        }
    }

    #[test]
    fn delays_are_jittered() {
        let retry_delay = RetryDelay::new(100, 1000);
        let delays: HashSet<_> = (0..100)
            .map(|_| retry_delay.calculate_delay(2).as_millis())
            .collect();
        assert!(delays.len() > 1, "jitter should produce varying delays");
    }

    #[test]
    fn backoff_widens_until_reset() {
        let mut backoff = Backoff::new(RetryDelay::new(10, 10_000));
        for _ in 0..4 {
            backoff.next_delay();
        }
        assert_eq!(backoff.attempt(), 4);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay().as_millis() <= 10);
    }
}
