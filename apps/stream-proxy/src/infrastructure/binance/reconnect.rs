//! Reconnection Policy
//!
//! Exponential backoff with jitter for upstream WebSocket reconnection.
//! The policy is pure state so the retry behavior is testable without a
//! socket in sight.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Jitter factor as a fraction (0.1 = ±10% randomization).
    pub jitter_factor: f64,
    /// Maximum number of consecutive attempts (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 5,
        }
    }
}

/// Reconnection policy implementing exponential backoff with jitter.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            attempt_count: 0,
        }
    }

    /// Get the next delay, advancing the backoff schedule.
    ///
    /// Returns `None` once the attempt budget is exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.config.max_attempts > 0 && self.attempt_count >= self.config.max_attempts {
            return None;
        }

        self.attempt_count += 1;
        let delay = self.apply_jitter(self.current_delay);

        self.current_delay = self
            .current_delay
            .mul_f64(self.config.multiplier)
            .min(self.config.max_delay);

        Some(delay)
    }

    /// Reset the schedule after a successful connection.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Get the current attempt count.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        let base = duration.as_secs_f64();
        let spread = base * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((base + jitter).max(0.001))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn delays_grow_exponentially() {
        let mut policy = ReconnectPolicy::new(no_jitter(0));

        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(100));
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(200));
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(400));
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(800));
    }

    #[test]
    fn delay_is_capped_at_max() {
        let mut policy = ReconnectPolicy::new(no_jitter(0));

        for _ in 0..10 {
            let _ = policy.next_delay();
        }

        assert_eq!(policy.next_delay().unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn attempts_are_bounded() {
        let mut policy = ReconnectPolicy::new(no_jitter(3));

        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
        assert_eq!(policy.attempt_count(), 3);
    }

    #[test]
    fn reset_restores_initial_schedule() {
        let mut policy = ReconnectPolicy::new(no_jitter(3));
        let _ = policy.next_delay();
        let _ = policy.next_delay();

        policy.reset();

        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                initial_delay: Duration::from_millis(1000),
                max_delay: Duration::from_secs(10),
                multiplier: 2.0,
                jitter_factor: 0.1,
                max_attempts: 0,
            });

            let millis = policy.next_delay().unwrap().as_millis();
            assert!((900..=1100).contains(&millis), "delay {millis}ms out of range");
        }
    }

    #[test]
    fn zero_max_attempts_means_unlimited() {
        let mut policy = ReconnectPolicy::new(no_jitter(0));

        for _ in 0..1000 {
            assert!(policy.next_delay().is_some());
        }
    }
}
