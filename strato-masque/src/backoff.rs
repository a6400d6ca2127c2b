//! Reconnection pacing
//!
//! Exponential backoff with symmetric jitter, used by the maintenance loop
//! to space out tunnel reconnection attempts.

use std::time::Duration;

/// Exponential backoff policy with jitter.
///
/// Delays grow geometrically from `initial_delay` by `factor` and are
/// capped at `max_delay` before jitter is applied. The policy keeps an
/// internal attempt counter so callers that have lost track of their own
/// attempt number (the lifecycle reports 0 after a forwarding session) keep
/// widening the window across short-lived sessions.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    factor: f64,
    attempt: u32,
}

/// Jitter ratio applied around the computed delay
const JITTER_RATIO: f64 = 0.1;

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, factor: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            factor,
            attempt: 0,
        }
    }

    /// Compute the delay before the next attempt.
    ///
    /// An `attempt` of zero means "one past the internal counter"; any
    /// positive value replaces the internal counter. The returned delay is
    /// uniformly distributed in `[0.9 * d, 1.1 * d]` where `d` is the
    /// clamped geometric delay.
    pub fn next_delay(&mut self, attempt: u32) -> Duration {
        let attempt = if attempt == 0 {
            self.attempt.saturating_add(1)
        } else {
            attempt
        };
        self.attempt = attempt;

        let mut delay = self.initial_delay.as_secs_f64();
        let ceiling = self.max_delay.as_secs_f64() / self.factor;
        for _ in 0..attempt {
            if delay >= ceiling {
                break;
            }
            delay *= self.factor;
        }
        delay = delay.min(self.max_delay.as_secs_f64());

        let jitter = delay * JITTER_RATIO;
        let delay = delay - jitter + 2.0 * jitter * rand::random::<f64>();

        Duration::from_secs_f64(delay.max(0.0))
    }

    /// Zero the internal attempt counter.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Current internal attempt counter.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ExponentialBackoff {
        ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(300), 2.0)
    }

    /// Expected un-jittered delay for attempt k: geometric growth that
    /// stops multiplying once the next step would exceed the cap.
    fn expected(policy: &ExponentialBackoff, k: u32) -> f64 {
        let max = policy.max_delay.as_secs_f64();
        let ceiling = max / policy.factor;
        let mut d = policy.initial_delay.as_secs_f64();
        for _ in 0..k {
            if d >= ceiling {
                break;
            }
            d *= policy.factor;
        }
        d.min(max)
    }

    fn assert_jitter_bounds(delay: Duration, expected: f64) {
        let secs = delay.as_secs_f64();
        assert!(
            secs >= expected * 0.9 - 1e-9 && secs <= expected * 1.1 + 1e-9,
            "delay {secs}s outside [0.9, 1.1] x {expected}s"
        );
    }

    #[test]
    fn delay_follows_geometric_bound() {
        let mut backoff = policy();
        for k in 1..=16 {
            let expected = expected(&backoff, k);
            assert_jitter_bounds(backoff.next_delay(k), expected);
        }
    }

    #[test]
    fn delay_never_exceeds_jittered_max() {
        let mut backoff = policy();
        for _ in 0..64 {
            let delay = backoff.next_delay(40);
            assert!(delay <= Duration::from_secs_f64(300.0 * 1.1 + 1e-6));
        }
    }

    #[test]
    fn zero_attempt_uses_internal_counter() {
        let mut backoff = policy();

        // First call with 0 behaves like attempt 1.
        assert_jitter_bounds(backoff.next_delay(0), expected(&backoff, 1));
        assert_eq!(backoff.attempt(), 1);

        // Repeated zero attempts keep widening the window.
        assert_jitter_bounds(backoff.next_delay(0), expected(&backoff, 2));
        assert_jitter_bounds(backoff.next_delay(0), expected(&backoff, 3));
        assert_eq!(backoff.attempt(), 3);
    }

    #[test]
    fn explicit_attempt_overrides_counter() {
        let mut backoff = policy();
        backoff.next_delay(7);
        assert_eq!(backoff.attempt(), 7);
        assert_jitter_bounds(backoff.next_delay(0), expected(&backoff, 8));
    }

    #[test]
    fn reset_returns_to_initial_delay() {
        let mut backoff = policy();
        for _ in 0..6 {
            backoff.next_delay(0);
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_jitter_bounds(backoff.next_delay(0), expected(&backoff, 1));
    }
}
