//! Upstream Reconnect Backoff
//!
//! Exponential backoff with jitter for re-establishing the feed connection.
//! Unlike a plain retry loop, every delay is also clipped to a deadline: the
//! connector may only keep retrying while its lease would still be valid.

use std::time::Duration;

use rand::Rng;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Growth factor applied after each failed attempt.
    pub multiplier: f64,
    /// Randomization as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Stateful backoff sequence for one connector.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectPolicy {
    /// Start a fresh sequence.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, clipped to `remaining`.
    ///
    /// Returns `None` once nothing is left of the window.
    pub fn next_delay(&mut self, remaining: Duration) -> Option<Duration> {
        if remaining.is_zero() {
            return None;
        }
        let base = self.base_delay();
        self.attempts = self.attempts.saturating_add(1);
        Some(self.jittered(base).min(remaining))
    }

    /// Forget past failures after a successful connect.
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Failed attempts since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempts
    }

    fn base_delay(&self) -> Duration {
        let exponent = i32::try_from(self.attempts).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let millis = self.config.initial_delay.as_millis() as f64
            * self.config.multiplier.max(1.0).powi(exponent);
        let cap = self.config.max_delay.as_millis();
        if !millis.is_finite() {
            return self.config.max_delay;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = (millis.max(0.0) as u128).min(cap);
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }
        #[allow(clippy::cast_precision_loss)]
        let base = delay.as_millis() as f64;
        let spread = base * self.config.jitter_factor;
        let offset: f64 = rand::rng().random_range(-spread..=spread);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted = (base + offset).max(1.0) as u64;
        Duration::from_millis(adjusted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    const WIDE: Duration = Duration::from_secs(3600);

    #[test]
    fn delays_grow_exponentially_up_to_cap() {
        let mut policy = ReconnectPolicy::new(no_jitter());
        let delays: Vec<_> = (0..6)
            .map(|_| policy.next_delay(WIDE).unwrap().as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(policy.attempt_count(), 6);
    }

    #[test]
    fn delay_clipped_to_remaining_window() {
        let mut policy = ReconnectPolicy::new(no_jitter());
        policy.next_delay(WIDE);
        policy.next_delay(WIDE);
        assert_eq!(
            policy.next_delay(Duration::from_millis(150)),
            Some(Duration::from_millis(150))
        );
    }

    #[test]
    fn exhausted_window_stops_retries() {
        let mut policy = ReconnectPolicy::new(no_jitter());
        assert_eq!(policy.next_delay(Duration::ZERO), None);
        assert_eq!(policy.attempt_count(), 0);
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut policy = ReconnectPolicy::new(no_jitter());
        policy.next_delay(WIDE);
        policy.next_delay(WIDE);
        policy.reset();
        assert_eq!(policy.next_delay(WIDE), Some(Duration::from_millis(100)));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = ReconnectConfig {
            jitter_factor: 0.2,
            ..no_jitter()
        };
        for _ in 0..50 {
            let mut policy = ReconnectPolicy::new(config.clone());
            let millis = policy.next_delay(WIDE).unwrap().as_millis();
            assert!((80..=120).contains(&millis), "delay {millis} out of range");
        }
    }
}
