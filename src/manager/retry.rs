use rand::{rngs::ThreadRng, Rng};
use std::time::Duration;

/// Redispatch and backoff policy for the dispatch loop.
///
/// `max_retries` bounds how often one work order is redispatched after an
/// enclave fault. Backoff applies to both redispatch and pool exhaustion.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(20),
            backoff_cap: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn compute_backoff(&self, attempt: u32, rng: &mut ThreadRng) -> Duration {
        // attempt is 1-based. Backoff starts after a failed attempt.
        let exp = attempt.saturating_sub(1);
        let mut ms = self.backoff_base.as_millis() as u64;
        let shift = exp.min(16);
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        ms = ms.saturating_mul(factor);
        let cap_ms = self.backoff_cap.as_millis() as u64;
        let capped = ms.min(cap_ms);

        // Full jitter: random in [0, capped]
        let jittered = rng.gen_range(0..=capped);
        Duration::from_millis(jittered)
    }

    /// Backoff for `attempt` using the thread-local RNG
    pub fn delay(&self, attempt: u32) -> Duration {
        self.compute_backoff(attempt, &mut rand::thread_rng())
    }

    /// Whether an order that has failed `attempts` times may go again
    pub fn allows(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }
}
