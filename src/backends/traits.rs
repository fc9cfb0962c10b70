//! Backend traits and types

use crate::error::BackendError;
use crate::query::{SearchParameters, SequenceQuery};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

/// Where a search runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// BLAST+ subprocess against a local database
    Local,
    /// NCBI BLAST URL API
    Remote,
}

impl BackendKind {
    pub const ALL: [BackendKind; 2] = [BackendKind::Local, BackendKind::Remote];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }

    /// The other backend, used for hybrid fallback
    pub fn alternate(&self) -> Self {
        match self {
            Self::Local => Self::Remote,
            Self::Remote => Self::Local,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

/// Raw search output as produced by a backend (BLAST XML)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawResult {
    /// Backend that produced the payload
    pub backend: BackendKind,
    /// Remote request id, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Report body
    pub body: String,
}

impl RawResult {
    pub fn new(backend: BackendKind, body: impl Into<String>) -> Self {
        Self {
            backend,
            job_id: None,
            body: body.into(),
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// Which backends can currently take work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Availability {
    pub local: bool,
    pub remote: bool,
}

impl Availability {
    pub fn new(local: bool, remote: bool) -> Self {
        Self { local, remote }
    }

    pub fn is_available(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::Local => self.local,
            BackendKind::Remote => self.remote,
        }
    }

    pub fn any(&self) -> bool {
        self.local || self.remote
    }
}

/// Execution capability shared by the local and remote adapters
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend kind
    fn kind(&self) -> BackendKind;

    /// Human-readable name for logs
    fn name(&self) -> &str;

    /// Whether the backend is configured and reachable
    async fn is_available(&self) -> bool;

    /// Run one search with the given effective parameters.
    ///
    /// Implementations must return promptly with [`BackendError::Cancelled`]
    /// once `cancel` fires.
    async fn execute(
        &self,
        query: &SequenceQuery,
        params: &SearchParameters,
        cancel: &CancellationToken,
    ) -> Result<RawResult, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        assert_eq!("Local".parse::<BackendKind>(), Ok(BackendKind::Local));
        assert_eq!(BackendKind::Remote.to_string(), "remote");
        assert_eq!(BackendKind::Local.alternate(), BackendKind::Remote);
        assert!("gpu".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_availability() {
        let availability = Availability::new(false, true);
        assert!(!availability.is_available(BackendKind::Local));
        assert!(availability.is_available(BackendKind::Remote));
        assert!(availability.any());
        assert!(!Availability::default().any());
    }
}
