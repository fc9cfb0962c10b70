//! Error taxonomy for batch execution.
//!
//! Per-query errors never abort a batch: the orchestrator turns every one of
//! them into a terminal [`QueryOutcome`](crate::batch::QueryOutcome). Cache
//! errors are internal only and surface as misses.

use crate::backends::BackendKind;

/// Problems with the submitted sequence itself. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("sequence '{0}' is empty")]
    EmptySequence(String),

    #[error("sequence '{id}' contains invalid residue '{residue}' at position {position}")]
    InvalidResidue {
        id: String,
        residue: char,
        position: usize,
    },

    #[error("failed to read '{path}': {reason}")]
    Unreadable { path: String, reason: String },
}

/// Failure reported by a backend adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Worth retrying: network errors, 5xx/429 responses, timeouts.
    #[error("{backend} transient failure: {message}")]
    Transient {
        backend: BackendKind,
        message: String,
    },

    /// Not worth retrying: malformed query, authentication, engine crash.
    #[error("{backend} failed: {message}{}", format_exit(.exit_code))]
    Permanent {
        backend: BackendKind,
        message: String,
        exit_code: Option<i32>,
        diagnostics: Option<String>,
    },

    /// The cancellation token fired while the backend was working.
    #[error("{0} execution cancelled")]
    Cancelled(BackendKind),
}

fn format_exit(code: &Option<i32>) -> String {
    code.map(|c| format!(" (exit code {c})")).unwrap_or_default()
}

impl BackendError {
    pub fn transient(backend: BackendKind, message: impl Into<String>) -> Self {
        Self::Transient {
            backend,
            message: message.into(),
        }
    }

    pub fn permanent(backend: BackendKind, message: impl Into<String>) -> Self {
        Self::Permanent {
            backend,
            message: message.into(),
            exit_code: None,
            diagnostics: None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn backend(&self) -> BackendKind {
        match self {
            Self::Transient { backend, .. } | Self::Permanent { backend, .. } => *backend,
            Self::Cancelled(backend) => *backend,
        }
    }

    /// One-line diagnostic including captured engine output, if any.
    pub fn diagnostic(&self) -> String {
        match self {
            Self::Permanent {
                diagnostics: Some(extra),
                ..
            } if !extra.trim().is_empty() => format!("{self}: {}", extra.trim()),
            _ => self.to_string(),
        }
    }
}

/// No backend can serve a query.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulingError {
    #[error("no backend available for query '{0}'")]
    NoBackendAvailable(String),

    #[error("forced backend {backend} is unavailable for query '{query}'")]
    ForcedBackendUnavailable { backend: BackendKind, query: String },
}

/// Cache-layer problems. Logged and treated as a miss, never returned to callers
/// of [`CacheStore::lookup`](crate::cache::CacheStore::lookup).
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt cache entry: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("cache entry fingerprint mismatch: expected {expected}, found {found}")]
    FingerprintMismatch { expected: String, found: String },
}

/// Raised by a [`ResultParser`](crate::results::ResultParser).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed XML: {0}")]
    Xml(String),

    #[error("not a BLAST report: {0}")]
    NotBlastOutput(String),

    #[error("invalid value for <{tag}>: {value}")]
    InvalidValue { tag: String, value: String },
}

/// Invalid settings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("config error: {0}")]
pub struct ConfigError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_permanent_with_exit_code() {
        let err = BackendError::Permanent {
            backend: BackendKind::Local,
            message: "blastn exited abnormally".into(),
            exit_code: Some(2),
            diagnostics: Some("BLAST Database error: No alias or index file found".into()),
        };
        assert_eq!(
            err.to_string(),
            "local failed: blastn exited abnormally (exit code 2)"
        );
        assert!(err.diagnostic().ends_with("No alias or index file found"));
        assert!(!err.is_transient());
    }

    #[test]
    fn display_transient() {
        let err = BackendError::transient(BackendKind::Remote, "HTTP 503");
        assert_eq!(err.to_string(), "remote transient failure: HTTP 503");
        assert!(err.is_transient());
        assert_eq!(err.backend(), BackendKind::Remote);
    }

    #[test]
    fn display_input_errors() {
        let err = InputError::EmptySequence("sample1".into());
        assert_eq!(err.to_string(), "sequence 'sample1' is empty");

        let err = InputError::InvalidResidue {
            id: "s".into(),
            residue: '!',
            position: 4,
        };
        assert_eq!(
            err.to_string(),
            "sequence 's' contains invalid residue '!' at position 4"
        );
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BackendError>();
        assert_send_sync::<CacheError>();
        assert_send_sync::<InputError>();
    }
}
