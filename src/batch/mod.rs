//! Batch orchestration
//!
//! A [`BatchRunner`] plans a batch with the scheduler, then drives a bounded
//! worker pool over the plan. Every query gets exactly one [`QueryOutcome`],
//! including after cancellation.

mod cancel;
mod executor;
mod models;
mod sink;

pub use cancel::{BatchCancellation, CancelState};
pub use executor::{BatchHandle, BatchRunner};
pub use models::{BatchEvent, BatchJob, BatchSummary, OutcomeSource, OutcomeStatus, QueryOutcome};
