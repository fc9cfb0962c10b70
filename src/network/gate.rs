//! Shared request gate for the remote service
//!
//! Every request to the remote service, from every worker, passes through one
//! gate so the fair-use spacing holds for the whole process.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Minimum-spacing gate backed by a single-cell [`governor`] quota
pub struct RequestGate {
    limiter: Option<DefaultDirectRateLimiter>,
    spacing: Duration,
}

impl RequestGate {
    /// Allow at most one request per `spacing`. A zero spacing disables the gate.
    pub fn new(spacing: Duration) -> Self {
        Self {
            limiter: Quota::with_period(spacing).map(RateLimiter::direct),
            spacing,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Wait for a request slot. Returns `false` if cancelled while waiting.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        let Some(limiter) = &self.limiter else {
            return true;
        };

        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = limiter.until_ready() => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_gate_spaces_requests() {
        let gate = RequestGate::new(Duration::from_millis(50));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        for _ in 0..3 {
            assert!(gate.acquire(&cancel).await);
        }

        assert!(start.elapsed() >= Duration::from_millis(95));
    }

    #[tokio::test]
    async fn test_unlimited_gate() {
        let gate = RequestGate::unlimited();
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..10 {
            assert!(gate.acquire(&cancel).await);
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_cancelled_gate() {
        let gate = RequestGate::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        assert!(gate.acquire(&cancel).await);

        cancel.cancel();
        assert!(!gate.acquire(&cancel).await);
    }
}
