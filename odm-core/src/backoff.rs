use rand::Rng;
use std::time::Duration;

/// Jittered exponential backoff: `uniform(0, min(max, base * 2^attempt))`.
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

    /// Throttling policy shared by every remote call: 3s doubling, capped at five minutes.
    pub fn remote_default() -> Self {
        Self::new(Duration::from_secs(3), Duration::from_secs(300), true)
    }

    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, false)
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

    pub async fn sleep(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::remote_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn backoff_without_jitter_doubles_from_three_seconds() {
        let backoff = Backoff::new(Duration::from_secs(3), Duration::from_secs(300), false);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(backoff.delay_with_rng(0, &mut rng), Duration::from_secs(3));
        assert_eq!(backoff.delay_with_rng(1, &mut rng), Duration::from_secs(6));
        assert_eq!(backoff.delay_with_rng(4, &mut rng), Duration::from_secs(48));
        assert_eq!(backoff.delay_with_rng(6, &mut rng), Duration::from_secs(192));
        assert_eq!(backoff.delay_with_rng(7, &mut rng), Duration::from_secs(300));
        assert_eq!(backoff.delay_with_rng(40, &mut rng), Duration::from_secs(300));
    }

    #[test]
    fn jittered_delay_never_exceeds_the_cap() {
        let backoff = Backoff::remote_default();
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 0..20 {
            let delay = backoff.delay_with_rng(attempt, &mut rng);
            assert!(delay <= Duration::from_secs(300));
        }
    }

    #[test]
    fn immediate_backoff_is_zero() {
        assert_eq!(Backoff::immediate().delay(5), Duration::ZERO);
    }
}
