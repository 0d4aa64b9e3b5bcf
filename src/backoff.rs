/// Exponential backoff for database reconnect attempts.
///
/// The delay grows by `multiplier` after each attempt and is capped at
/// `max_delay`. The attempt counter lets the caller stop after a bounded
/// number of tries.
use std::time::Duration;

pub struct Backoff {
    max_delay: Duration,
    multiplier: u32,
    current_delay: Duration,
    /// Attempts made so far.
    pub attempt: u32,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: u32) -> Self {
        Self {
            max_delay,
            multiplier: multiplier.max(1),
            current_delay: initial_delay,
            attempt: 0,
        }
    }

    /// Starts at `initial_delay`, doubles, and never waits longer than 16
    /// times the initial delay.
    pub fn for_reconnect(initial_delay: Duration) -> Self {
        Self::new(initial_delay, initial_delay * 16, 2)
    }

    /// Delay to wait before the next attempt; counts the attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let grown = self.current_delay.saturating_mul(self.multiplier);
        std::mem::replace(&mut self.current_delay, grown.min(self.max_delay))
    }

    pub fn exceeded_max_attempts(&self, max: u32) -> bool {
        self.attempt >= max
    }
}
