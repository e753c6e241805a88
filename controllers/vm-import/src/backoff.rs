//! # Fibonacci Backoff
//!
//! Progressive retry delays for transient reconcile errors. Grows more slowly
//! than exponential backoff, so a hypervisor that is briefly unreachable is
//! retried soon while a long outage is not hammered.
//!
//! Sequence for bounds 5s..300s: 5s, 5s, 10s, 15s, 25s, 40s, 65s, 105s, 170s, 275s, 300s (max).

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, capped at `max_seconds`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Minimum backoff value in seconds (for reset)
    min_seconds: u64,
    /// Previous backoff value in seconds
    prev_seconds: u64,
    /// Current backoff value in seconds
    current_seconds: u64,
    /// Maximum backoff value in seconds
    max_seconds: u64,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with specified minimum and maximum values in seconds
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current_seconds;

        let next_seconds = self.prev_seconds + self.current_seconds;
        self.prev_seconds = self.current_seconds;
        self.current_seconds = std::cmp::min(next_seconds, self.max_seconds);

        Duration::from_secs(result)
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_seconds = 0;
        self.current_seconds = self.min_seconds;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fibonacci_backoff_sequence() {
        let mut backoff = FibonacciBackoff::new(5, 300);

        let secs: Vec<u64> = (0..11).map(|_| backoff.next_backoff().as_secs()).collect();
        assert_eq!(secs, vec![5, 5, 10, 15, 25, 40, 65, 105, 170, 275, 300]);
        // Should stay at max
        assert_eq!(backoff.next_backoff().as_secs(), 300);
    }

    #[test]
    fn test_fibonacci_backoff_reset() {
        let mut backoff = FibonacciBackoff::new(5, 300);

        backoff.next_backoff();
        backoff.next_backoff();
        backoff.next_backoff();

        backoff.reset();

        // Should restart from beginning after success
        assert_eq!(backoff.next_backoff().as_secs(), 5);
        assert_eq!(backoff.next_backoff().as_secs(), 5);
        assert_eq!(backoff.next_backoff().as_secs(), 10);
    }
}
