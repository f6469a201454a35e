//! # Fibonacci Backoff
//!
//! Per-object retry delays for failed reconciles. Grows more slowly than
//! exponential backoff so a relay waiting on a transient API failure recovers
//! quickly, while a persistently broken object settles at the cap.
//!
//! Sequence with the defaults: 5s, 5s, 10s, 15s, 25s, 40s, 65s, ... 300s (max).

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, capped at `max_seconds`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Previous backoff value in seconds
    prev_seconds: u64,
    /// Current backoff value in seconds
    current_seconds: u64,
    /// Maximum backoff value in seconds
    max_seconds: u64,
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        Self::new(5, 300)
    }
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with specified minimum and maximum values in seconds
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current_seconds;

        let next = self.prev_seconds + self.current_seconds;
        self.prev_seconds = self.current_seconds;
        self.current_seconds = std::cmp::min(next, self.max_seconds);

        Duration::from_secs(result)
    }
}
