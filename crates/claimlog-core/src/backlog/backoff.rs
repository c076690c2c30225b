//! Backoff policy: decides how long a loser of a publish race waits.
//!
//! `delay = base * 2^attempt + uniform(0, base * 2^attempt)`, capped at
//! `max_delay`. The jitter spreads retries out so that N workers who lost the
//! same race do not all come back at the same instant.
//!
//! The function is pure. Randomness enters only through `jitter_seed`, and the
//! sleep itself is the caller's business (see `ports::Sleeper`).

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Floor of the first retry (`attempt = 0`).
    pub base: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max_delay: Duration) -> Self {
        Self { base, max_delay }
    }

    /// Deterministic part of the delay: `base * 2^attempt`, capped.
    ///
    /// Non-decreasing in `attempt`.
    pub fn min_delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay(&self, attempt: u32, jitter_seed: u64) -> Duration {
        let floor = self.min_delay(attempt);
        let span = u64::try_from(floor.as_nanos()).unwrap_or(u64::MAX);
        let mut rng = StdRng::seed_from_u64(jitter_seed);
        let jitter = Duration::from_nanos(rng.gen_range(0..=span));
        floor.saturating_add(jitter).min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Where retry loops get their jitter seeds from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Jitter {
    /// Fresh entropy for every retry.
    #[default]
    Entropy,

    /// Reproducible delays (tests, demos).
    Fixed(u64),
}

impl Jitter {
    pub fn seed_for(&self, attempt: u32) -> u64 {
        match self {
            Jitter::Entropy => rand::random(),
            Jitter::Fixed(seed) => seed.wrapping_add(u64::from(attempt)),
        }
    }
}

/// Retry budget shared by every publish loop (claim, heartbeat, completion).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Publish attempts per operation, the first one included.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub jitter: Jitter,
}

impl RetryPolicy {
    /// Wait before retry number `attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt, self.jitter.seed_for(attempt))
    }

    /// Whether another attempt is allowed after `attempt` (0-indexed) failed.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffPolicy::default(),
            jitter: Jitter::Entropy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10))
    }

    #[rstest]
    #[case(0, 100)]
    #[case(1, 200)]
    #[case(2, 400)]
    #[case(5, 3_200)]
    #[case(7, 10_000)]
    #[case(40, 10_000)]
    fn min_delay_doubles_until_capped(#[case] attempt: u32, #[case] millis: u64) {
        assert_eq!(policy().min_delay(attempt), Duration::from_millis(millis));
    }

    #[test]
    fn delay_stays_within_jitter_window() {
        let policy = policy();
        for attempt in 0..6 {
            let floor = policy.min_delay(attempt);
            for seed in 0..50 {
                let d = policy.delay(attempt, seed);
                assert!(d >= floor, "attempt {attempt} seed {seed}: {d:?} < {floor:?}");
                assert!(d <= floor * 2, "attempt {attempt} seed {seed}: {d:?} > 2x");
            }
        }
    }

    #[test]
    fn minimum_delay_is_non_decreasing() {
        let policy = policy();
        let floors: Vec<_> = (0..64).map(|a| policy.min_delay(a)).collect();
        assert!(floors.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn same_seed_same_delay() {
        let policy = policy();
        assert_eq!(policy.delay(3, 42), policy.delay(3, 42));
    }

    #[test]
    fn delay_never_exceeds_cap() {
        let policy = policy();
        for seed in 0..20 {
            assert!(policy.delay(30, seed) <= policy.max_delay);
        }
    }

    #[test]
    fn retry_budget_counts_the_first_attempt() {
        let retry = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        assert!(retry.allows_retry(0));
        assert!(retry.allows_retry(1));
        assert!(!retry.allows_retry(2));
    }

    #[test]
    fn fixed_jitter_is_reproducible() {
        let retry = RetryPolicy {
            jitter: Jitter::Fixed(7),
            ..RetryPolicy::default()
        };
        assert_eq!(retry.delay_after(2), retry.delay_after(2));
        assert!(retry.delay_after(2) >= Duration::from_secs(4));
    }

    #[test]
    fn default_policy_is_one_second_base() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.min_delay(0), Duration::from_secs(1));
        assert_eq!(policy.min_delay(1), Duration::from_secs(2));
    }
}
