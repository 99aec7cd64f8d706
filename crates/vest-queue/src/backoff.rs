//! Retry delay calculation.
//!
//! [`next_delay`] is the pure policy: `fixed` returns the base delay,
//! `exponential` returns `base * 2^(attempts_made - 1)`. [`BackoffPolicy`]
//! adds bounded random jitter on top so that jobs failing together do not
//! retry in lockstep.

use std::time::Duration;

use rand::Rng;
use vest_models::{BackoffKind, BackoffStrategy};

/// Delay before the next attempt, given the number of attempts already made.
pub fn next_delay(attempts_made: u32, base_delay_ms: u64, kind: BackoffKind) -> u64 {
    match kind {
        BackoffKind::Fixed => base_delay_ms,
        BackoffKind::Exponential => {
            let exponent = attempts_made.saturating_sub(1).min(63);
            base_delay_ms.saturating_mul(1u64 << exponent)
        }
    }
}

/// Backoff with optional jitter.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Upper bound of the added jitter, as a fraction of the computed delay
    jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { jitter_ratio: 0.0 }
    }
}

impl BackoffPolicy {
    /// Create a policy adding up to `jitter_ratio * delay` of random delay.
    pub fn with_jitter(jitter_ratio: f64) -> Self {
        let jitter_ratio = if jitter_ratio.is_finite() {
            jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self { jitter_ratio }
    }

    pub fn jitter_ratio(&self) -> f64 {
        self.jitter_ratio
    }

    /// Delay to wait after `attempts_made` failed executions.
    pub fn delay_for(&self, attempts_made: u32, strategy: &BackoffStrategy) -> Duration {
        let base = next_delay(attempts_made, strategy.base_delay_ms, strategy.kind);
        let max_jitter = (base as f64 * self.jitter_ratio) as u64;
        let jitter = if max_jitter > 0 {
            rand::thread_rng().gen_range(0..=max_jitter)
        } else {
            0
        };
        Duration::from_millis(base.saturating_add(jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_doubles_from_base() {
        let delays: Vec<u64> = (1..=4)
            .map(|k| next_delay(k, 5_000, BackoffKind::Exponential))
            .collect();
        assert_eq!(delays, vec![5_000, 10_000, 20_000, 40_000]);
    }

    #[test]
    fn test_fixed_is_constant() {
        for k in 1..=10 {
            assert_eq!(next_delay(k, 750, BackoffKind::Fixed), 750);
        }
    }

    #[test]
    fn test_exponential_saturates_instead_of_overflowing() {
        assert_eq!(next_delay(200, 5_000, BackoffKind::Exponential), u64::MAX);
        // attempts_made of zero is treated as the first retry
        assert_eq!(next_delay(0, 5_000, BackoffKind::Exponential), 5_000);
    }

    #[test]
    fn test_policy_without_jitter_is_exact() {
        let policy = BackoffPolicy::default();
        let delay = policy.delay_for(3, &BackoffStrategy::exponential(100));
        assert_eq!(delay, Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = BackoffPolicy::with_jitter(0.5);
        let strategy = BackoffStrategy::fixed(1_000);
        for _ in 0..200 {
            let delay = policy.delay_for(1, &strategy).as_millis() as u64;
            assert!((1_000..=1_500).contains(&delay), "delay out of bounds: {delay}");
        }
    }

    #[test]
    fn test_jitter_ratio_is_clamped() {
        assert_eq!(BackoffPolicy::with_jitter(3.0).jitter_ratio(), 1.0);
        assert_eq!(BackoffPolicy::with_jitter(-1.0).jitter_ratio(), 0.0);
        assert_eq!(BackoffPolicy::with_jitter(f64::NAN).jitter_ratio(), 0.0);
    }
}
