//! # Retry Policy
//!
//! Stateless exponential backoff with jitter, shared by every mutating phase
//! of the node refresh state machine.
//!
//! The policy is a plain value: the delay depends only on the attempt number
//! (plus the random jitter draw), and exhaustion depends only on the attempt
//! ceiling. Callers keep the attempt count in the request itself.
//!
//! ## Usage
//!
//! ```rust
//! use node_refresh_controller::controller::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 5);
//! assert_eq!(policy.next_delay(0), Duration::from_secs(1));
//! assert_eq!(policy.next_delay(3), Duration::from_secs(8));
//! assert_eq!(policy.next_delay(10), Duration::from_secs(60)); // capped
//! assert!(policy.is_exhausted(5));
//! ```

use rand::Rng;
use std::time::Duration;

/// Upper bound of the jitter factor
///
/// With a factor of at most one half, the jittered delay of attempt `n + 1`
/// is never shorter than the jittered delay of attempt `n`.
pub const MAX_JITTER: f64 = 0.5;

/// Exponential backoff calculator with a fixed attempt ceiling
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    base: Duration,
    max_delay: Duration,
    max_attempts: u32,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        use crate::constants::*;
        Self::new(
            Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            Duration::from_secs(DEFAULT_RETRY_MAX_SECS),
            DEFAULT_RETRY_MAX_ATTEMPTS,
        )
        .with_jitter(DEFAULT_RETRY_JITTER)
    }
}

impl RetryPolicy {
    /// Create a policy without jitter
    ///
    /// # Arguments
    ///
    /// * `base` - Delay returned for attempt 0
    /// * `max_delay` - Cap applied after doubling
    /// * `max_attempts` - Attempt count at which the policy is exhausted
    #[must_use]
    pub fn new(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay: max_delay.max(base),
            max_attempts,
            jitter: 0.0,
        }
    }

    /// Set the jitter factor, clamped to `[0, MAX_JITTER]`
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, MAX_JITTER)
        } else {
            0.0
        };
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay before retry number `attempt`, jittered with the thread RNG
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.next_delay_with(attempt, &mut rand::thread_rng())
    }

    /// Delay before retry number `attempt`, jittered with the given RNG
    pub fn next_delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = self.ceiling(attempt);
        if self.jitter <= 0.0 {
            return ceiling;
        }
        let draw: f64 = rng.gen_range(0.0..1.0);
        ceiling.mul_f64(1.0 - self.jitter * draw)
    }

    /// Whether `attempt` has reached the attempt ceiling
    #[must_use]
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Un-jittered delay: `min(base * 2^attempt, max_delay)`
    fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 4)
    }

    #[test]
    fn test_exponential_sequence_is_capped() {
        let p = policy();
        let delays: Vec<u64> = (0..7).map(|a| p.next_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        assert_eq!(policy().next_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_exhaustion_at_ceiling() {
        let p = policy();
        assert!(!p.is_exhausted(0));
        assert!(!p.is_exhausted(3));
        assert!(p.is_exhausted(4));
        assert!(p.is_exhausted(9));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let p = policy().with_jitter(0.5);
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..6 {
            let ceiling = policy().next_delay(attempt);
            for _ in 0..50 {
                let d = p.next_delay_with(attempt, &mut rng);
                assert!(d <= ceiling);
                assert!(d >= ceiling / 2);
            }
        }
    }

    #[test]
    fn test_jittered_delays_never_decrease() {
        let p = policy().with_jitter(0.5);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let previous = p.next_delay_with(2, &mut rng);
            let next = p.next_delay_with(3, &mut rng);
            // attempt 2 tops out at 4s, attempt 3 bottoms out at 4s
            assert!(previous <= Duration::from_secs(4));
            assert!(next >= Duration::from_secs(4));
        }
    }

    #[test]
    fn test_jitter_is_clamped() {
        let p = policy().with_jitter(3.0);
        assert_eq!(p, policy().with_jitter(MAX_JITTER));
        let p = policy().with_jitter(f64::NAN);
        assert_eq!(p, policy());
    }

    #[test]
    fn test_max_delay_never_below_base() {
        let p = RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(1), 3);
        assert_eq!(p.next_delay(0), Duration::from_secs(10));
        assert_eq!(p.max_delay(), Duration::from_secs(10));
    }
}
