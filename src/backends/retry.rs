//! Retry/backoff policy applied around backend attempts

use crate::config::RetrySettings;
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exponential backoff: `base * 2^(n-1)` before retry `n`, capped at `max_delay`
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per backend, including the first one
    pub budget: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay to randomize, in [0, 1]
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(budget: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            budget: budget.max(1),
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            budget: settings.budget.max(1),
            base_delay: Duration::from_secs_f64(settings.base_delay_secs.max(0.0)),
            max_delay: Duration::from_secs_f64(settings.max_delay_secs.max(0.0)),
            jitter: settings.jitter.clamp(0.0, 1.0),
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Nominal delay before retry `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor).min(self.max_delay)
    }

    /// Sleep before retry `retry`. Returns `false` if cancelled while waiting.
    pub async fn backoff(&self, retry: u32, cancel: &CancellationToken) -> bool {
        let delay = self.jittered(self.delay_for(retry));
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}
