use rand::Rng;
use std::time::Duration;

pub const DEFAULT_RETRY_CEILING: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Retry rule for queued transfers: a fixed delay and a hard attempt ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub ceiling: u32,
    pub delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            ceiling: DEFAULT_RETRY_CEILING,
            delay: DEFAULT_RETRY_DELAY,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(ceiling: u32, delay: Duration) -> Self {
        Self {
            ceiling,
            delay,
            jitter: false,
        }
    }

    /// `retry_count` is the count after the failure that just happened.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count <= self.ceiling
    }

    pub fn delay(&self) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(&mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if !self.jitter {
            return self.delay;
        }
        let max_ms = self.delay.as_millis().min(u128::from(u64::MAX)) as u64;
        Duration::from_millis(rng.gen_range(max_ms / 2..=max_ms))
    }
}

/// Exponential backoff for remote change polling after consecutive errors.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(0..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn retry_policy_allows_ceiling_retries() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn retry_delay_is_fixed_without_jitter() {
        let policy = RetryPolicy::new(3, Duration::from_millis(250));
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(policy.delay_with_rng(&mut rng), Duration::from_millis(250));
        assert_eq!(policy.delay_with_rng(&mut rng), Duration::from_millis(250));
    }

    #[test]
    fn retry_jitter_stays_within_half_window() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::new(3, Duration::from_millis(1000))
        };
        let mut rng = StdRng::seed_from_u64(42);
        let delay = policy.delay_with_rng(&mut rng);
        assert!(delay >= Duration::from_millis(500));
        assert!(delay <= Duration::from_millis(1000));
    }

    #[test]
    fn poll_backoff_doubles_until_cap() {
        let backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(800),
            false,
        );
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<_> = (0..5)
            .map(|attempt| backoff.delay_with_rng(attempt, &mut rng).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 800]);
    }
}
