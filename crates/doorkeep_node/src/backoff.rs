#![forbid(unsafe_code)]

use doorkeep_contracts::UnixTimeNs;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const BACKOFF_JITTER_RATIO_DEFAULT: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ratio: f64,
}

impl BackoffPolicy {
    pub fn new(base_ms: u64, max_ms: u64, jitter_ratio: f64) -> Self {
        let base_ms = base_ms.max(1);
        Self {
            base_ms,
            max_ms: max_ms.max(base_ms),
            jitter_ratio: jitter_ratio.clamp(0.0, 0.9),
        }
    }

    pub fn sync_default() -> Self {
        Self::new(1_000, 300_000, BACKOFF_JITTER_RATIO_DEFAULT)
    }

    /// Delay before the next attempt after `failures` consecutive failures,
    /// without jitter. Doubles from `base_ms` and saturates at `max_ms`.
    pub fn nominal_delay_ms(&self, failures: u32) -> u64 {
        if failures == 0 {
            return 0;
        }
        let shift = (failures - 1).min(32);
        self.base_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_ms)
    }
}

/// Consecutive-failure tracker for one retried activity.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
    next_attempt_at: Option<UnixTimeNs>,
    rng: StdRng,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            next_attempt_at: None,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(policy: BackoffPolicy, seed: u64) -> Self {
        Self {
            policy,
            failures: 0,
            next_attempt_at: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn is_ready(&self, now: UnixTimeNs) -> bool {
        self.next_attempt_at.map_or(true, |at| now >= at)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    pub fn next_attempt_at(&self) -> Option<UnixTimeNs> {
        self.next_attempt_at
    }

    /// Records a failure at `now` and returns the jittered delay in ms.
    pub fn record_failure(&mut self, now: UnixTimeNs) -> u64 {
        self.failures = self.failures.saturating_add(1);
        let delay_ms = self.next_delay_ms();
        self.next_attempt_at = Some(now.saturating_add_ms(delay_ms));
        delay_ms
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.next_attempt_at = None;
    }

    /// Jittered delay for the current failure count, usable by callers that
    /// sleep directly instead of gating on `is_ready`.
    pub fn next_delay_ms(&mut self) -> u64 {
        let nominal = self.policy.nominal_delay_ms(self.failures.max(1));
        if self.policy.jitter_ratio <= 0.0 {
            return nominal;
        }
        let spread = self.policy.jitter_ratio;
        let factor = self.rng.gen_range((1.0 - spread)..=(1.0 + spread));
        let jittered = (nominal as f64 * factor).round() as u64;
        jittered.clamp(1, self.policy.max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_backoff_01_doubles_and_caps() {
        let policy = BackoffPolicy::new(1_000, 8_000, 0.0);
        assert_eq!(policy.nominal_delay_ms(0), 0);
        assert_eq!(policy.nominal_delay_ms(1), 1_000);
        assert_eq!(policy.nominal_delay_ms(2), 2_000);
        assert_eq!(policy.nominal_delay_ms(4), 8_000);
        assert_eq!(policy.nominal_delay_ms(40), 8_000);
    }

    #[test]
    fn at_backoff_02_gates_until_delay_elapses_and_resets_on_success() {
        let mut backoff = Backoff::new(BackoffPolicy::new(1_000, 60_000, 0.0));
        let now = UnixTimeNs::from_millis(10_000);
        assert!(backoff.is_ready(now));

        assert_eq!(backoff.record_failure(now), 1_000);
        assert!(!backoff.is_ready(UnixTimeNs::from_millis(10_999)));
        assert!(backoff.is_ready(UnixTimeNs::from_millis(11_000)));

        assert_eq!(backoff.record_failure(UnixTimeNs::from_millis(11_000)), 2_000);
        assert_eq!(backoff.consecutive_failures(), 2);

        backoff.record_success();
        assert_eq!(backoff.consecutive_failures(), 0);
        assert!(backoff.is_ready(UnixTimeNs::from_millis(11_001)));
    }

    #[test]
    fn at_backoff_03_jitter_stays_within_bounds() {
        let policy = BackoffPolicy::new(1_000, 4_000, 0.2);
        let mut backoff = Backoff::with_seed(policy, 7);
        for _ in 0..50 {
            let delay = backoff.record_failure(UnixTimeNs(0));
            let nominal = policy.nominal_delay_ms(backoff.consecutive_failures());
            assert!(delay <= 4_000, "delay {delay} above cap");
            assert!(delay as f64 >= nominal as f64 * 0.8 - 1.0);
        }
    }
}
