use rand::Rng;
use std::time::Duration;

/// Exponential backoff for upload retries. `attempt` is 1-based: the first
/// retry waits roughly the base delay, each further retry doubles it up to
/// `max`, with random jitter of up to half the base delay added on top.
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
        let shift = attempt.saturating_sub(1).min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let jitter_ms = if self.jitter {
            rng.gen_range(0..=base_ms / 2)
        } else {
            0
        };
        Duration::from_millis(exp.saturating_add(jitter_ms))
    }
}
