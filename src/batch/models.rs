//! Batch job, outcome and event models

use super::cancel::BatchCancellation;
use crate::backends::{BackendKind, RawResult};
use crate::cache::Fingerprint;
use crate::query::SequenceQuery;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A set of queries run under one concurrency and cancellation scope
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub id: Uuid,
    pub queries: Vec<SequenceQuery>,
    /// Maximum concurrent execution slots
    pub concurrency: usize,
    cancellation: Arc<BatchCancellation>,
}

impl BatchJob {
    pub fn new(queries: Vec<SequenceQuery>, concurrency: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            queries,
            concurrency: concurrency.max(1),
            cancellation: Arc::new(BatchCancellation::new()),
        }
    }

    /// Shared cancellation flag, usable before and during the run
    pub fn cancellation(&self) -> Arc<BatchCancellation> {
        Arc::clone(&self.cancellation)
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

/// Terminal status of one query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum OutcomeStatus {
    CacheHit,
    Success,
    Failed(String),
    Cancelled,
}

impl OutcomeStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::CacheHit | Self::Success)
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CacheHit => f.write_str("cache hit"),
            Self::Success => f.write_str("success"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Where a successful payload came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeSource {
    Cache,
    Backend(BackendKind),
    /// Result shared from a concurrent identical query
    SharedFlight,
}

impl fmt::Display for OutcomeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cache => f.write_str("cache"),
            Self::Backend(kind) => write!(f, "{kind}"),
            Self::SharedFlight => f.write_str("shared"),
        }
    }
}

/// Exactly one per query in a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOutcome {
    /// Position of the query in the batch
    pub index: usize,
    pub query_id: String,
    pub fingerprint: Fingerprint,
    pub status: OutcomeStatus,
    pub source: Option<OutcomeSource>,
    pub elapsed: Duration,
    pub result: Option<RawResult>,
    /// One entry per failed attempt, in order
    pub diagnostics: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

impl QueryOutcome {
    pub(crate) fn new(
        index: usize,
        query: &SequenceQuery,
        fingerprint: Fingerprint,
        status: OutcomeStatus,
        elapsed: Duration,
    ) -> Self {
        Self {
            index,
            query_id: query.id.clone(),
            fingerprint,
            status,
            source: None,
            elapsed,
            result: None,
            diagnostics: Vec::new(),
            finished_at: Utc::now(),
        }
    }

    pub(crate) fn with_result(mut self, source: OutcomeSource, result: RawResult) -> Self {
        self.source = Some(source);
        self.result = Some(result);
        self
    }

    pub(crate) fn with_source(mut self, source: OutcomeSource) -> Self {
        self.source = Some(source);
        self
    }

    pub(crate) fn with_diagnostics(mut self, diagnostics: Vec<String>) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}

/// Progress notification emitted while a batch runs
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    /// A query was handed to a backend
    Dispatched {
        index: usize,
        query_id: String,
        backend: BackendKind,
    },
    /// A query reached its terminal outcome
    Completed {
        outcome: QueryOutcome,
        completed: usize,
        total: usize,
    },
}

/// Counts for a finished batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub total: usize,
    pub success: usize,
    pub cache_hit: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Successful executions per backend
    pub by_backend: BTreeMap<BackendKind, usize>,
    /// Successes served by a concurrent identical query
    pub shared: usize,
    pub elapsed: Duration,
}

impl BatchSummary {
    pub(crate) fn count(&mut self, outcome: &QueryOutcome) {
        match &outcome.status {
            OutcomeStatus::CacheHit => self.cache_hit += 1,
            OutcomeStatus::Success => self.success += 1,
            OutcomeStatus::Failed(_) => self.failed += 1,
            OutcomeStatus::Cancelled => self.cancelled += 1,
        }
        if outcome.status.is_success() {
            match outcome.source {
                Some(OutcomeSource::Backend(kind)) => {
                    *self.by_backend.entry(kind).or_insert(0) += 1;
                }
                Some(OutcomeSource::SharedFlight) => self.shared += 1,
                _ => {}
            }
        }
    }

    pub fn completed(&self) -> usize {
        self.success + self.cache_hit + self.failed + self.cancelled
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} queries: {} success, {} cache hit, {} failed, {} cancelled ({:.1}s)",
            self.total,
            self.success,
            self.cache_hit,
            self.failed,
            self.cancelled,
            self.elapsed.as_secs_f64()
        )
    }
}
