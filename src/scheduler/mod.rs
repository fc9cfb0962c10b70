//! Smart scheduler
//!
//! Assigns each query a backend, its effective search parameters and a
//! priority rank. Decisions depend only on the query, a metrics snapshot and
//! backend availability, so the same inputs always produce the same plan.

use crate::backends::{Availability, BackendKind};
use crate::config::Settings;
use crate::error::SchedulingError;
use crate::metrics::MetricsSnapshot;
use crate::query::{ParameterPreset, SearchParameters, SequenceQuery};
use std::collections::VecDeque;
use tracing::debug;

/// Where and how one query runs
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleDecision {
    /// Position of the query in the batch
    pub query_index: usize,
    pub backend: BackendKind,
    /// Dispatch rank, 0 first
    pub priority: usize,
    /// Attempts allowed per backend
    pub retry_budget: u32,
    /// Parameters actually sent to the backend
    pub parameters: SearchParameters,
    /// Remote was unhealthy when this decision was made
    pub demoted: bool,
}

/// Scheduler thresholds and presets
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerPolicy {
    pub short_sequence_threshold: usize,
    pub failure_rate_threshold: f64,
    pub min_samples: usize,
    pub force_backend: Option<BackendKind>,
    /// Remote queries placed after each local query when interleaving
    pub remote_concurrency: usize,
    pub retry_budget: u32,
    pub short_sequence: ParameterPreset,
    pub cross_species: ParameterPreset,
}

impl SchedulerPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            short_sequence_threshold: settings.scheduler.short_sequence_threshold,
            failure_rate_threshold: settings.scheduler.failure_rate_threshold,
            min_samples: settings.scheduler.min_samples,
            force_backend: settings.scheduler.force_backend,
            remote_concurrency: settings.batch.remote_concurrency.max(1),
            retry_budget: settings.retry.budget.max(1),
            short_sequence: settings.presets.short_sequence.clone(),
            cross_species: settings.presets.cross_species.clone(),
        }
    }
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Decisions for a whole batch, in dispatch order
#[derive(Debug, Clone, Default)]
pub struct SchedulePlan {
    pub decisions: Vec<ScheduleDecision>,
    /// Queries no backend can serve
    pub rejected: Vec<(usize, SchedulingError)>,
}

/// Backend selection and prioritization
#[derive(Debug, Clone, Default)]
pub struct SmartScheduler {
    policy: SchedulerPolicy,
}

impl SmartScheduler {
    pub fn new(policy: SchedulerPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SchedulerPolicy {
        &self.policy
    }

    fn is_short(&self, query: &SequenceQuery) -> bool {
        query.len() <= self.policy.short_sequence_threshold
    }

    fn remote_unhealthy(&self, snapshot: &MetricsSnapshot) -> bool {
        snapshot.remote_samples >= self.policy.min_samples
            && snapshot.remote_failure_rate > self.policy.failure_rate_threshold
    }

    /// Effective parameters: short and cross-species queries are relaxed
    pub fn effective_parameters(&self, query: &SequenceQuery) -> SearchParameters {
        let mut params = query.parameters.clone();
        if self.is_short(query) {
            params = params.relaxed(&self.policy.short_sequence);
        }
        if query.cross_species {
            params = params.relaxed(&self.policy.cross_species);
        }
        params
    }

    /// Decide backend and parameters for one query. The priority is assigned by [`plan`](Self::plan).
    pub fn decide(
        &self,
        query_index: usize,
        query: &SequenceQuery,
        snapshot: &MetricsSnapshot,
        availability: &Availability,
    ) -> Result<ScheduleDecision, SchedulingError> {
        let relax = self.is_short(query) || query.cross_species;
        let unhealthy = self.remote_unhealthy(snapshot);
        let mut demoted = false;

        let backend = match self.policy.force_backend {
            Some(forced) => {
                if !availability.is_available(forced) {
                    return Err(SchedulingError::ForcedBackendUnavailable {
                        backend: forced,
                        query: query.id.clone(),
                    });
                }
                demoted = forced == BackendKind::Remote && unhealthy;
                forced
            }
            None => {
                let preferred = if relax {
                    if availability.remote {
                        BackendKind::Remote
                    } else if availability.local {
                        BackendKind::Local
                    } else {
                        return Err(SchedulingError::NoBackendAvailable(query.id.clone()));
                    }
                } else if availability.local {
                    BackendKind::Local
                } else if availability.remote {
                    BackendKind::Remote
                } else {
                    return Err(SchedulingError::NoBackendAvailable(query.id.clone()));
                };

                if preferred == BackendKind::Remote && unhealthy {
                    demoted = true;
                    if availability.local {
                        BackendKind::Local
                    } else {
                        BackendKind::Remote
                    }
                } else {
                    preferred
                }
            }
        };

        debug!(
            query = %query.id,
            backend = %backend,
            relaxed = relax,
            demoted,
            "scheduled query"
        );

        Ok(ScheduleDecision {
            query_index,
            backend,
            priority: 0,
            retry_budget: self.policy.retry_budget,
            parameters: self.effective_parameters(query),
            demoted,
        })
    }

    /// Decide every query and order the decisions for dispatch.
    ///
    /// Within a backend shorter sequences go first. Local and remote queues
    /// are interleaved one local per `remote_concurrency` remote decisions.
    /// Demoted decisions follow all others.
    pub fn plan(
        &self,
        queries: &[SequenceQuery],
        snapshot: &MetricsSnapshot,
        availability: &Availability,
    ) -> SchedulePlan {
        let mut regular = Vec::new();
        let mut demoted = Vec::new();
        let mut rejected = Vec::new();

        for (index, query) in queries.iter().enumerate() {
            match self.decide(index, query, snapshot, availability) {
                Ok(decision) if decision.demoted => demoted.push(decision),
                Ok(decision) => regular.push(decision),
                Err(e) => rejected.push((index, e)),
            }
        }

        let mut decisions = self.interleave(regular, queries);
        decisions.extend(self.interleave(demoted, queries));
        for (rank, decision) in decisions.iter_mut().enumerate() {
            decision.priority = rank;
        }

        SchedulePlan {
            decisions,
            rejected,
        }
    }

    fn interleave(
        &self,
        decisions: Vec<ScheduleDecision>,
        queries: &[SequenceQuery],
    ) -> Vec<ScheduleDecision> {
        let length = |d: &ScheduleDecision| queries.get(d.query_index).map_or(0, |q| q.len());

        let (mut local, mut remote): (Vec<_>, Vec<_>) = decisions
            .into_iter()
            .partition(|d| d.backend == BackendKind::Local);
        local.sort_by_key(|d| (length(d), d.query_index));
        remote.sort_by_key(|d| (length(d), d.query_index));

        let mut local = VecDeque::from(local);
        let mut remote = VecDeque::from(remote);
        let mut ordered = Vec::with_capacity(local.len() + remote.len());

        while !local.is_empty() || !remote.is_empty() {
            if let Some(decision) = local.pop_front() {
                ordered.push(decision);
            }
            for _ in 0..self.policy.remote_concurrency {
                match remote.pop_front() {
                    Some(decision) => ordered.push(decision),
                    None => break,
                }
            }
        }
        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SearchProgram;

    fn query(id: &str, len: usize) -> SequenceQuery {
        SequenceQuery::new(
            id,
            &"ACGT".repeat(len / 4 + 1)[..len],
            SearchProgram::Blastn,
            "nt",
            SearchParameters::default(),
        )
    }

    fn both() -> Availability {
        Availability::new(true, true)
    }

    #[test]
    fn test_long_sequence_prefers_local() {
        let scheduler = SmartScheduler::default();
        let decision = scheduler
            .decide(0, &query("long", 500), &MetricsSnapshot::default(), &both())
            .unwrap();
        assert_eq!(decision.backend, BackendKind::Local);
        assert_eq!(decision.parameters, SearchParameters::default());
        assert!(!decision.demoted);
    }

    #[test]
    fn test_short_sequence_goes_remote_relaxed() {
        let scheduler = SmartScheduler::default();
        let decision = scheduler
            .decide(0, &query("short", 40), &MetricsSnapshot::default(), &both())
            .unwrap();
        assert_eq!(decision.backend, BackendKind::Remote);
        assert_eq!(decision.parameters.evalue, 1000.0);
        assert_eq!(decision.parameters.word_size, Some(7));
        assert!(!decision.parameters.megablast);
    }

    #[test]
    fn test_cross_species_goes_remote() {
        let scheduler = SmartScheduler::default();
        let q = query("xs", 500).with_cross_species(true);
        let decision = scheduler
            .decide(0, &q, &MetricsSnapshot::default(), &both())
            .unwrap();
        assert_eq!(decision.backend, BackendKind::Remote);
        assert!(decision.parameters.evalue > SearchParameters::default().evalue);
    }

    #[test]
    fn test_short_sequence_uses_local_without_remote() {
        let scheduler = SmartScheduler::default();
        let decision = scheduler
            .decide(
                0,
                &query("short", 40),
                &MetricsSnapshot::default(),
                &Availability::new(true, false),
            )
            .unwrap();
        assert_eq!(decision.backend, BackendKind::Local);
    }

    #[test]
    fn test_no_backend_available() {
        let scheduler = SmartScheduler::default();
        let err = scheduler
            .decide(
                0,
                &query("q", 500),
                &MetricsSnapshot::default(),
                &Availability::default(),
            )
            .unwrap_err();
        assert_eq!(err, SchedulingError::NoBackendAvailable("q".into()));
    }

    #[test]
    fn test_forced_backend() {
        let scheduler = SmartScheduler::new(SchedulerPolicy {
            force_backend: Some(BackendKind::Local),
            ..Default::default()
        });
        let decision = scheduler
            .decide(0, &query("short", 40), &MetricsSnapshot::default(), &both())
            .unwrap();
        assert_eq!(decision.backend, BackendKind::Local);

        let err = scheduler
            .decide(
                0,
                &query("short", 40),
                &MetricsSnapshot::default(),
                &Availability::new(false, true),
            )
            .unwrap_err();
        assert!(matches!(err, SchedulingError::ForcedBackendUnavailable { .. }));
    }

    #[test]
    fn test_unhealthy_remote_redirects_to_local() {
        let scheduler = SmartScheduler::default();
        let snapshot = MetricsSnapshot::with_failure_rate(10, 0.8);

        let decision = scheduler
            .decide(0, &query("short", 40), &snapshot, &both())
            .unwrap();
        assert_eq!(decision.backend, BackendKind::Local);
        assert!(decision.demoted);

        let decision = scheduler
            .decide(0, &query("short", 40), &snapshot, &Availability::new(false, true))
            .unwrap();
        assert_eq!(decision.backend, BackendKind::Remote);
        assert!(decision.demoted);
    }

    #[test]
    fn test_few_samples_do_not_demote() {
        let scheduler = SmartScheduler::default();
        let snapshot = MetricsSnapshot::with_failure_rate(2, 1.0);
        let decision = scheduler
            .decide(0, &query("short", 40), &snapshot, &both())
            .unwrap();
        assert_eq!(decision.backend, BackendKind::Remote);
        assert!(!decision.demoted);
    }

    #[test]
    fn test_plan_interleaves_and_sorts() {
        let scheduler = SmartScheduler::default();
        let queries = vec![
            query("L500", 500),
            query("R50", 50),
            query("R20", 20),
            query("L300", 300),
            query("R80", 80),
            query("R10", 10),
        ];

        let plan = scheduler.plan(&queries, &MetricsSnapshot::default(), &both());
        let order: Vec<&str> = plan
            .decisions
            .iter()
            .map(|d| queries[d.query_index].id.as_str())
            .collect();
        assert_eq!(order, vec!["L300", "R10", "R20", "L500", "R50", "R80"]);
        assert!(plan
            .decisions
            .iter()
            .enumerate()
            .all(|(rank, d)| d.priority == rank));
        assert!(plan.rejected.is_empty());
    }

    #[test]
    fn test_plan_puts_demoted_last() {
        let scheduler = SmartScheduler::new(SchedulerPolicy {
            force_backend: Some(BackendKind::Remote),
            ..Default::default()
        });
        let snapshot = MetricsSnapshot::with_failure_rate(10, 0.9);
        let queries = vec![query("a", 30), query("b", 10)];

        let plan = scheduler.plan(&queries, &snapshot, &Availability::new(false, true));
        assert_eq!(plan.decisions.len(), 2);
        assert!(plan.decisions.iter().all(|d| d.demoted));
        assert_eq!(plan.decisions[0].query_index, 1);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let scheduler = SmartScheduler::default();
        let queries: Vec<_> = (0..12).map(|i| query(&format!("q{i}"), 20 + i * 37)).collect();
        let snapshot = MetricsSnapshot::with_failure_rate(5, 0.2);

        let first = scheduler.plan(&queries, &snapshot, &both());
        let second = scheduler.plan(&queries, &snapshot, &both());
        assert_eq!(first.decisions, second.decisions);
    }

    #[test]
    fn test_plan_reports_rejections() {
        let scheduler = SmartScheduler::default();
        let queries = vec![query("a", 30)];
        let plan = scheduler.plan(&queries, &MetricsSnapshot::default(), &Availability::default());
        assert!(plan.decisions.is_empty());
        assert_eq!(plan.rejected.len(), 1);
    }
}
