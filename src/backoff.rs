use std::time::Duration;

use rand::Rng;

/// Exponential reconnect backoff: `min(base * 2^attempt, max)` plus up to
/// `jitter` of random delay. Successive delays never decrease and never
/// exceed `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
    attempt: u32,
    last_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), Duration::from_secs(1))
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter,
            attempt: 0,
            last_delay: Duration::ZERO,
        }
    }

    /// Number of failed attempts since the last successful connection
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the given attempt, without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before the next attempt; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let jittered = self
            .backoff(self.attempt)
            .saturating_add(self.random_jitter())
            .min(self.max_delay);
        let delay = jittered.max(self.last_delay);
        self.attempt = self.attempt.saturating_add(1);
        self.last_delay = delay;
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_delay = Duration::ZERO;
    }

    fn random_jitter(&self) -> Duration {
        let max = self.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}
