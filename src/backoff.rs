use std::time::Duration;

/// Exponential backoff with full jitter.
///
/// The ceiling for attempt `n` (1-based) is `base × multiplier^(n−1)`,
/// capped at `max_delay`. The actual delay is drawn uniformly from
/// `[0, ceiling)` so that retries from many tasks do not line up.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
    /// Total attempts including the first one.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            multiplier: 2.0,
            max_delay: Duration::from_millis(30_000),
            jitter: true,
            max_attempts: 4,
        }
    }
}

impl BackoffPolicy {
    /// Whether another attempt is allowed after `attempt` attempts have been made.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Upper bound of the delay that follows failed attempt `attempt`.
    ///
    /// Non-decreasing in `attempt` and never above `max_delay`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis().max(1) as f64;
        let max_ms = self.max_delay.as_millis().max(1) as f64;
        let multiplier = if self.multiplier.is_finite() { self.multiplier.max(1.0) } else { 1.0 };
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;

        let exp = base_ms * multiplier.powi(exponent);
        Duration::from_millis(exp.min(max_ms) as u64)
    }

    /// Delay to wait after failed attempt `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut fastrand::Rng::new())
    }

    /// Same as [`delay`](Self::delay) with a caller-supplied RNG, for reproducible runs.
    pub fn delay_with(&self, attempt: u32, rng: &mut fastrand::Rng) -> Duration {
        let ceiling = self.ceiling(attempt);
        if !self.jitter {
            return ceiling;
        }
        let ceiling_ms = ceiling.as_millis() as u64;
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.u64(0..ceiling_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(1_000),
            jitter: true,
            max_attempts: 5,
        }
    }

    #[test]
    fn ceilings_double_then_cap() {
        let p = policy();
        let ceilings: Vec<u64> = (1..=6).map(|a| p.ceiling(a).as_millis() as u64).collect();
        assert_eq!(ceilings, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn ceilings_are_non_decreasing_for_large_attempts() {
        let p = policy();
        let mut previous = Duration::ZERO;
        for attempt in 1..200 {
            let ceiling = p.ceiling(attempt);
            assert!(ceiling >= previous);
            assert!(ceiling <= p.max_delay);
            previous = ceiling;
        }
    }

    #[test]
    fn jittered_delays_stay_within_ceiling_and_vary() {
        let p = policy();
        let mut rng = fastrand::Rng::with_seed(7);
        let delays: Vec<Duration> = (0..50).map(|_| p.delay_with(4, &mut rng)).collect();

        assert!(delays.iter().all(|d| *d < p.ceiling(4)));
        assert!(delays.iter().any(|d| *d != delays[0]));
    }

    #[test]
    fn without_jitter_delay_equals_ceiling() {
        let p = BackoffPolicy { jitter: false, ..policy() };
        assert_eq!(p.delay(3), Duration::from_millis(400));
    }

    #[test]
    fn retry_allowed_until_max_attempts() {
        let p = policy();
        assert!(p.allows_retry(4));
        assert!(!p.allows_retry(5));
    }
}
