//! Single-flight reservations
//!
//! The first caller to reserve a fingerprint becomes the leader and runs the
//! backend; everybody else gets a follower handle that awaits the leader's
//! published result.

use super::Fingerprint;
use crate::backends::RawResult;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::debug;

/// Shared result of one flight. Failures are carried as diagnostics.
pub type FlightResult = Result<RawResult, String>;

#[derive(Debug, Clone)]
enum FlightState {
    Pending,
    Done(FlightResult),
}

/// In-progress flights keyed by fingerprint
#[derive(Debug, Default)]
pub(crate) struct FlightTable {
    inflight: Mutex<HashMap<Fingerprint, watch::Receiver<FlightState>>>,
}

impl FlightTable {
    pub(crate) fn reserve(self: &Arc<Self>, fingerprint: &Fingerprint) -> Reservation {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(receiver) = inflight.get(fingerprint) {
            debug!(fingerprint = %fingerprint, "joining in-flight execution");
            return Reservation::Follower(FlightFollower {
                fingerprint: fingerprint.clone(),
                receiver: receiver.clone(),
            });
        }

        let (sender, receiver) = watch::channel(FlightState::Pending);
        inflight.insert(fingerprint.clone(), receiver);

        Reservation::Leader(FlightLeader {
            fingerprint: fingerprint.clone(),
            sender: Some(sender),
            table: Arc::clone(self),
        })
    }

    fn release(&self, fingerprint: &Fingerprint) {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(fingerprint);
    }

    pub(crate) fn len(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Outcome of [`CacheStore::reserve`](super::CacheStore::reserve)
#[derive(Debug)]
pub enum Reservation {
    /// This caller must execute and then [`complete`](FlightLeader::complete).
    Leader(FlightLeader),
    /// Another caller is already executing; await its result.
    Follower(FlightFollower),
}

impl Reservation {
    /// `true` for exactly one of any set of concurrent reservers.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader(_))
    }
}

/// Exclusive right to execute a fingerprint.
///
/// Dropping the leader without calling [`complete`](Self::complete) abandons
/// the flight: followers wake up empty-handed and retry.
#[derive(Debug)]
pub struct FlightLeader {
    fingerprint: Fingerprint,
    sender: Option<watch::Sender<FlightState>>,
    table: Arc<FlightTable>,
}

impl FlightLeader {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Publish the result to all followers and end the flight.
    pub fn complete(mut self, result: FlightResult) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(FlightState::Done(result));
        }
        self.table.release(&self.fingerprint);
    }
}

impl Drop for FlightLeader {
    fn drop(&mut self) {
        if self.sender.is_some() {
            debug!(fingerprint = %self.fingerprint, "flight abandoned");
            self.table.release(&self.fingerprint);
        }
    }
}

/// Handle on someone else's flight
#[derive(Debug)]
pub struct FlightFollower {
    fingerprint: Fingerprint,
    receiver: watch::Receiver<FlightState>,
}

impl FlightFollower {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Wait for the leader. `None` means the flight was abandoned.
    pub async fn wait(mut self) -> Option<FlightResult> {
        let state = self
            .receiver
            .wait_for(|state| matches!(state, FlightState::Done(_)))
            .await
            .ok()?;

        match &*state {
            FlightState::Done(result) => Some(result.clone()),
            FlightState::Pending => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BackendKind;

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::from_hex(s)
    }

    fn payload(body: &str) -> RawResult {
        RawResult::new(BackendKind::Remote, body)
    }

    #[tokio::test]
    async fn test_only_first_reserver_leads() {
        let table = Arc::new(FlightTable::default());
        let first = table.reserve(&fp("aa"));
        let second = table.reserve(&fp("aa"));
        let other = table.reserve(&fp("bb"));

        assert!(first.is_leader());
        assert!(!second.is_leader());
        assert!(other.is_leader());
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_followers_receive_leader_result() {
        let table = Arc::new(FlightTable::default());
        let Reservation::Leader(leader) = table.reserve(&fp("aa")) else {
            panic!("expected leader");
        };
        let Reservation::Follower(follower) = table.reserve(&fp("aa")) else {
            panic!("expected follower");
        };

        let waiter = tokio::spawn(follower.wait());
        leader.complete(Ok(payload("<BlastOutput/>")));

        let result = waiter.await.unwrap();
        assert_eq!(result, Some(Ok(payload("<BlastOutput/>"))));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_flight_releases_followers() {
        let table = Arc::new(FlightTable::default());
        let leader = table.reserve(&fp("aa"));
        let Reservation::Follower(follower) = table.reserve(&fp("aa")) else {
            panic!("expected follower");
        };

        drop(leader);
        assert_eq!(follower.wait().await, None);
        assert!(table.reserve(&fp("aa")).is_leader());
    }
}
