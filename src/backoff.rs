//! Exponential backoff between reconnect attempts.
//!
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max_delay)
//! ```
//!
//! The transport owns one `Backoff` per session and resets it on every
//! successful connect acknowledgment. The attempt budget
//! (`max_reconnect_attempts`) belongs to the supervisor, not to the backoff.

use std::time::Duration;

/// Exponential backoff controller.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff. A `multiplier` below 1.0 is treated as
    /// 1.0 (constant delay) and `max` is raised to `initial` if smaller.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max.max(initial),
            multiplier: multiplier.max(1.0),
            attempt: 0,
        }
    }

    /// Back to the initial delay. Called after a successful connect.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    /// Returns the delay to wait before the next attempt and advances.
    pub fn next_sleep(&mut self) -> Duration {
        self.attempt += 1;

        let sleep = self.current_delay;
        let next = Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.multiplier);
        self.current_delay = next.min(self.max_delay);

        sleep
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for Backoff {
    /// 1s initial, 60s cap, doubling.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 2.0)
    }
}
