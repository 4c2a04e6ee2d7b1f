//! Reconnect backoff with jitter.
//!
//! Used by the worker agent while the broker is unreachable:
//! - Exponential backoff (delay doubles each failed attempt)
//! - Capped at a fixed maximum
//! - Optional jitter so a fleet of workers does not reconnect in lockstep

use rand::Rng;
use std::time::Duration;

/// Configuration for reconnect delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Exponential base (typically 2.0 for doubling).
    pub exponential_base: f64,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
}

impl Backoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            exponential_base: 2.0,
            jitter: true,
        }
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate the delay after `attempt` consecutive failures (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = self.exponential_base.powi(attempt.min(32) as i32);
        let delay_secs = self.base_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            // Scale by 0.5..1.5: same mean, never near zero.
            let mut rng = rand::rng();
            let jitter_factor = rng.random_range(0.5..1.5);
            (capped_secs * jitter_factor).min(self.max_delay.as_secs_f64())
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }
}
