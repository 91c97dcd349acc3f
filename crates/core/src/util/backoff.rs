//! Exponential backoff with a configurable growth factor and jitter.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use peer_keepalive::util::backoff::ExponentialBackoff;
//!
//! let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
//! assert_eq!(backoff.delay(0), Duration::from_secs(1));
//! assert_eq!(backoff.delay(1), Duration::from_secs(2));
//! assert_eq!(backoff.delay(2), Duration::from_secs(4));
//! assert_eq!(backoff.delay_for_failures(3), Duration::from_secs(4));
//! ```

use std::time::Duration;

use rand::Rng;

// Beyond this exponent every sane configuration is already at the cap.
const MAX_EXPONENT: i32 = 64;

/// Stateless exponential backoff delay calculator.
///
/// For attempt `n` (0-indexed) the raw delay is `base * factor^n`, capped at
/// `max`. Jitter adds a random extra of up to `jitter * delay` on top of the
/// raw delay, and the result is capped at `max` again.
///
/// Jitter never exceeds `factor - 1`, so the jittered delay for `n` can not
/// overtake the raw delay for `n + 1`. Delays are therefore non-decreasing
/// across consecutive failures whatever the random draws.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    /// Delay for the first attempt (attempt 0)
    base: Duration,
    /// Growth per attempt, at least 1.0
    factor: f64,
    /// Maximum delay (cap)
    max: Duration,
    /// Fraction of the delay added at random, in `[0, factor - 1]`
    jitter: f64,
}

impl ExponentialBackoff {
    /// Doubling backoff without jitter.
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            factor: 2.0,
            max,
            jitter: 0.0,
        }
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = if factor.is_finite() {
            factor.max(1.0)
        } else {
            1.0
        };
        self.jitter = self.jitter.min(self.factor - 1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        let jitter = if jitter.is_finite() { jitter } else { 0.0 };
        self.jitter = jitter.clamp(0.0, self.factor - 1.0);
        self
    }

    /// Raw delay for a given attempt number (0-indexed), without jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(MAX_EXPONENT as u32) as i32;
        let nanos = self.base.as_nanos() as f64 * self.factor.powi(exponent);
        if !nanos.is_finite() || nanos >= self.max.as_nanos() as f64 {
            self.max
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }

    /// Raw delay after `failures` consecutive failures (1-indexed).
    ///
    /// The first failure waits `base`, the second `base * factor`, and so on.
    /// Returns `Duration::ZERO` if `failures == 0`.
    pub fn delay_for_failures(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        self.delay(failures - 1)
    }

    /// Like [`Self::delay_for_failures`] with a random extra drawn from `rng`.
    pub fn jittered_delay_for_failures<R: Rng>(&self, failures: u32, rng: &mut R) -> Duration {
        let delay = self.delay_for_failures(failures);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread: f64 = rng.random_range(0.0..=1.0);
        let extra = (delay.as_nanos() as f64 * self.jitter * spread) as u64;
        (delay + Duration::from_nanos(extra)).min(self.max)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }
}

impl Default for ExponentialBackoff {
    /// Default backoff: 1 second base, doubling, 1 minute max, 10% jitter.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60)).with_jitter(0.1)
    }
}
