//! Capped exponential backoff for stream reconnects

use std::time::Duration;

pub const INITIAL_DELAY: Duration = Duration::from_millis(500);
pub const MAX_DELAY: Duration = Duration::from_secs(30);
pub const MAX_ATTEMPTS: u32 = 10;

/// Delay doubles per failed attempt up to `max`; gives up after `max_attempts`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_attempts: u32,
    attempts: u32,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            max_attempts,
            attempts: 0,
            current: initial,
        }
    }

    /// Delay before the next attempt, `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        Some(delay)
    }

    /// Call on every successfully received event
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current = self.initial;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_DELAY, MAX_DELAY, MAX_ATTEMPTS)
    }
}
