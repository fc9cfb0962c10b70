//! Hybrid-BLAST: batch sequence similarity searches across a local BLAST+
//! installation and the NCBI remote service.
//!
//! Queries are planned by an adaptive scheduler, deduplicated through a
//! fingerprint cache, and executed by a bounded worker pool with retry,
//! fallback and cooperative cancellation.

pub mod backends;
pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod input;
pub mod metrics;
pub mod network;
pub mod query;
pub mod results;
pub mod scheduler;

pub use backends::{Backend, BackendKind, BackendRegistry, RawResult};
pub use batch::{BatchHandle, BatchJob, BatchRunner, BatchSummary, OutcomeStatus, QueryOutcome};
pub use cache::{CacheStore, Fingerprint};
pub use config::Settings;
pub use query::{SearchParameters, SearchProgram, SequenceQuery};
pub use scheduler::SmartScheduler;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
