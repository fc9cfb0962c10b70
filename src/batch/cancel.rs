//! Batch cancellation flag

use std::sync::atomic::{AtomicU8, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Lifecycle of a batch's cancellation flag. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum CancelState {
    Active = 0,
    CancelRequested = 1,
    /// The batch has delivered every outcome
    Terminated = 2,
}

impl CancelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::CancelRequested,
            _ => Self::Terminated,
        }
    }
}

/// Monotonic flag plus the token threaded through every suspension point
#[derive(Debug, Default)]
pub struct BatchCancellation {
    state: AtomicU8,
    token: CancellationToken,
}

impl BatchCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CancelState {
        CancelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Request cancellation. Returns `true` for the call that moved the flag.
    pub fn request(&self) -> bool {
        let previous = self
            .state
            .fetch_max(CancelState::CancelRequested as u8, Ordering::SeqCst);
        self.token.cancel();
        let moved = previous == CancelState::Active as u8;
        if moved {
            info!("Batch cancellation requested");
        }
        moved
    }

    pub(crate) fn terminate(&self) {
        self.state
            .fetch_max(CancelState::Terminated as u8, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
