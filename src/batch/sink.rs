//! Exactly-once outcome delivery

use super::models::{BatchEvent, BatchSummary, QueryOutcome};
use crate::backends::BackendKind;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
struct SinkState {
    delivered: HashSet<usize>,
    summary: BatchSummary,
}

/// Collects terminal outcomes and forwards batch events.
///
/// A second outcome for the same query index is dropped.
pub(crate) struct OutcomeSink {
    total: usize,
    state: Mutex<SinkState>,
    events: Mutex<Option<mpsc::UnboundedSender<BatchEvent>>>,
}

impl OutcomeSink {
    pub(crate) fn new(
        batch_id: Uuid,
        total: usize,
    ) -> (Self, mpsc::UnboundedReceiver<BatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = SinkState {
            delivered: HashSet::with_capacity(total),
            summary: BatchSummary {
                batch_id,
                total,
                ..Default::default()
            },
        };
        (
            Self {
                total,
                state: Mutex::new(state),
                events: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn send(&self, event: BatchEvent) {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = events.as_ref() {
            // A dropped receiver only means nobody is listening.
            let _ = tx.send(event);
        }
    }

    pub(crate) fn dispatched(&self, index: usize, query_id: &str, backend: BackendKind) {
        self.send(BatchEvent::Dispatched {
            index,
            query_id: query_id.to_string(),
            backend,
        });
    }

    /// Record a terminal outcome. Returns `false` if the query already had one.
    pub(crate) fn deliver(&self, outcome: QueryOutcome) -> bool {
        let completed = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.delivered.insert(outcome.index) {
                warn!(index = outcome.index, query = %outcome.query_id, "dropping duplicate outcome");
                return false;
            }
            state.summary.count(&outcome);
            state.delivered.len()
        };

        debug!(
            index = outcome.index,
            query = %outcome.query_id,
            status = %outcome.status,
            completed,
            total = self.total,
            "query finished"
        );
        self.send(BatchEvent::Completed {
            outcome,
            completed,
            total: self.total,
        });
        true
    }

    #[cfg(test)]
    pub(crate) fn is_delivered(&self, index: usize) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.delivered.contains(&index)
    }

    /// Query indices still without an outcome
    pub(crate) fn undelivered(&self) -> Vec<usize> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        (0..self.total)
            .filter(|i| !state.delivered.contains(i))
            .collect()
    }

    pub(crate) fn summary(&self, elapsed: Duration) -> BatchSummary {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        BatchSummary {
            elapsed,
            ..state.summary.clone()
        }
    }

    /// End the event stream
    pub(crate) fn close(&self) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.take();
    }
}
