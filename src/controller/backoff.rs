//! # Fibonacci Backoff
//!
//! Requeue backoff for `NodeRefresh` reconciliation errors.
//!
//! Each resource carries its own sequence so one failing policy does not
//! slow down the others. The sequence grows more slowly than exponential
//! backoff: with a 30s step and a 5m cap it runs 30s, 30s, 60s, 90s, 150s,
//! 240s, 300s.
//!
//! ```rust
//! use node_refresh_controller::controller::backoff::FibonacciBackoff;
//! use std::time::Duration;
//!
//! let mut backoff = FibonacciBackoff::new(Duration::from_secs(30), Duration::from_secs(300));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(30));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(30));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(60));
//! ```

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each value is the sum of the previous two, in whole seconds, capped at
/// the maximum.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_secs: u64,
    prev_secs: u64,
    current_secs: u64,
    max_secs: u64,
}

impl FibonacciBackoff {
    /// Create a backoff stepping by `min` and capped at `max`
    ///
    /// Sub-second values are rounded up to one second.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        let min_secs = min.as_secs().max(1);
        Self {
            min_secs,
            prev_secs: 0,
            current_secs: min_secs,
            max_secs: max.as_secs().max(min_secs),
        }
    }

    /// Next backoff in seconds; advances the sequence
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let result = self.current_secs;
        let next = self.prev_secs.saturating_add(self.current_secs);
        self.prev_secs = self.current_secs;
        self.current_secs = next.min(self.max_secs);
        result
    }

    #[must_use]
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_secs(self.next_backoff_seconds())
    }

    /// Restart the sequence after a successful reconciliation
    pub fn reset(&mut self) {
        self.prev_secs = 0;
        self.current_secs = self.min_secs;
    }
}
