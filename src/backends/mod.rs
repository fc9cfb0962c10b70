//! Execution backends
//!
//! Defines the [`Backend`] trait shared by the local BLAST+ adapter and the
//! remote NCBI adapter, plus a registry and loader to build them from settings.

mod loader;
mod local;
mod registry;
mod remote;
mod retry;
mod traits;

pub use loader::BackendLoader;
pub use local::LocalBackend;
pub use registry::BackendRegistry;
pub use remote::{JobStatus, RemoteBackend};
pub use retry::RetryPolicy;
pub use traits::*;

pub use crate::error::BackendError;
