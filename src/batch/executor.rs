//! Batch execution and orchestration

use super::cancel::{BatchCancellation, CancelState};
use super::models::{BatchEvent, BatchJob, BatchSummary, OutcomeSource, OutcomeStatus, QueryOutcome};
use super::sink::OutcomeSink;
use crate::backends::{
    Availability, BackendError, BackendKind, BackendLoader, BackendRegistry, RawResult,
    RetryPolicy,
};
use crate::cache::{CacheStore, Fingerprint, Reservation};
use crate::config::Settings;
use crate::metrics::BackendMetrics;
use crate::query::SequenceQuery;
use crate::scheduler::{ScheduleDecision, SchedulerPolicy, SmartScheduler};
use anyhow::Result;
use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore, SemaphorePermit};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Runs batches against a set of backends with a shared cache and metrics
pub struct BatchRunner {
    registry: Arc<BackendRegistry>,
    cache: Arc<CacheStore>,
    metrics: Arc<BackendMetrics>,
    scheduler: SmartScheduler,
    retry: RetryPolicy,
    concurrency: usize,
    remote_concurrency: usize,
    fallback: bool,
    cancel_grace: Duration,
}

impl BatchRunner {
    /// Create a runner with default scheduling, retry and pool settings
    pub fn new(registry: BackendRegistry, cache: Arc<CacheStore>) -> Self {
        let settings = Settings::default();
        Self {
            registry: Arc::new(registry),
            cache,
            metrics: Arc::new(BackendMetrics::new(settings.scheduler.metrics_window)),
            scheduler: SmartScheduler::new(SchedulerPolicy::from_settings(&settings)),
            retry: RetryPolicy::from_settings(&settings.retry),
            concurrency: settings.batch.concurrency,
            remote_concurrency: settings.batch.remote_concurrency,
            fallback: settings.batch.fallback,
            cancel_grace: settings.batch.cancel_grace(),
        }
    }

    /// Build backends, cache and policies from settings
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let registry = BackendLoader::load(settings)?;
        Ok(Self {
            registry: Arc::new(registry),
            cache: Arc::new(CacheStore::new(&settings.cache)),
            metrics: Arc::new(BackendMetrics::new(settings.scheduler.metrics_window)),
            scheduler: SmartScheduler::new(SchedulerPolicy::from_settings(settings)),
            retry: RetryPolicy::from_settings(&settings.retry),
            concurrency: settings.batch.concurrency.max(1),
            remote_concurrency: settings.batch.remote_concurrency.max(1),
            fallback: settings.batch.fallback,
            cancel_grace: settings.batch.cancel_grace(),
        })
    }

    /// Replace the scheduler. Its retry budget and interleave ratio are
    /// overridden by the runner's retry policy and remote concurrency.
    pub fn with_scheduler(mut self, scheduler: SmartScheduler) -> Self {
        self.scheduler = scheduler;
        self.sync_scheduler()
    }

    pub fn with_metrics(mut self, metrics: Arc<BackendMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Backoff delays and the per-backend attempt budget
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self.sync_scheduler()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_remote_concurrency(mut self, remote_concurrency: usize) -> Self {
        self.remote_concurrency = remote_concurrency.max(1);
        self.sync_scheduler()
    }

    fn sync_scheduler(mut self) -> Self {
        let policy = SchedulerPolicy {
            retry_budget: self.retry.budget.max(1),
            remote_concurrency: self.remote_concurrency,
            ..self.scheduler.policy().clone()
        };
        self.scheduler = SmartScheduler::new(policy);
        self
    }

    pub fn with_fallback(mut self, fallback: bool) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<BackendMetrics> {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// New job using the runner's configured concurrency
    pub fn job(&self, queries: Vec<SequenceQuery>) -> BatchJob {
        BatchJob::new(queries, self.concurrency)
    }

    /// Start a batch. Must be called from within a tokio runtime.
    pub fn run(&self, job: BatchJob) -> BatchHandle {
        let cancellation = job.cancellation();
        let id = job.id;
        let total = job.queries.len();
        let (sink, events) = OutcomeSink::new(id, total);
        let sink = Arc::new(sink);

        let supervisor = Supervisor {
            id,
            queries: Arc::new(job.queries),
            concurrency: job.concurrency,
            registry: Arc::clone(&self.registry),
            cache: Arc::clone(&self.cache),
            metrics: Arc::clone(&self.metrics),
            scheduler: self.scheduler.clone(),
            retry: self.retry.clone(),
            remote_concurrency: self.remote_concurrency,
            fallback: self.fallback,
            cancel_grace: self.cancel_grace,
            sink: Arc::clone(&sink),
            cancellation: Arc::clone(&cancellation),
        };

        BatchHandle {
            id,
            total,
            events,
            cancellation,
            sink,
            supervisor: tokio::spawn(supervisor.run()),
        }
    }
}

/// Live view of a running batch
pub struct BatchHandle {
    id: Uuid,
    total: usize,
    events: mpsc::UnboundedReceiver<BatchEvent>,
    cancellation: Arc<BatchCancellation>,
    sink: Arc<OutcomeSink>,
    supervisor: JoinHandle<BatchSummary>,
}

impl BatchHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Request cancellation; see [`BatchCancellation::request`]
    pub fn cancel(&self) -> bool {
        self.cancellation.request()
    }

    pub fn state(&self) -> CancelState {
        self.cancellation.state()
    }

    pub fn cancellation(&self) -> Arc<BatchCancellation> {
        Arc::clone(&self.cancellation)
    }

    /// Next progress event; `None` once the batch has finished
    pub async fn next_event(&mut self) -> Option<BatchEvent> {
        self.events.recv().await
    }

    /// Next terminal outcome, in completion order
    pub async fn next_outcome(&mut self) -> Option<QueryOutcome> {
        while let Some(event) = self.next_event().await {
            if let BatchEvent::Completed { outcome, .. } = event {
                return Some(outcome);
            }
        }
        None
    }

    /// Outcomes as a stream, in completion order
    pub fn into_outcomes(self) -> impl Stream<Item = QueryOutcome> + Send {
        stream::unfold(self, |mut handle| async move {
            handle.next_outcome().await.map(|outcome| (outcome, handle))
        })
    }

    /// Wait for the batch to finish
    pub async fn wait(self) -> BatchSummary {
        match self.supervisor.await {
            Ok(summary) => summary,
            Err(e) => {
                error!(batch = %self.id, "batch supervisor failed: {}", e);
                self.sink.summary(Duration::ZERO)
            }
        }
    }

    /// Drain every outcome, then wait for the summary
    pub async fn collect(mut self) -> (Vec<QueryOutcome>, BatchSummary) {
        let mut outcomes = Vec::with_capacity(self.total);
        while let Some(outcome) = self.next_outcome().await {
            outcomes.push(outcome);
        }
        let summary = self.wait().await;
        (outcomes, summary)
    }
}

/// Owns one batch from planning until the last outcome is delivered
struct Supervisor {
    id: Uuid,
    queries: Arc<Vec<SequenceQuery>>,
    concurrency: usize,
    registry: Arc<BackendRegistry>,
    cache: Arc<CacheStore>,
    metrics: Arc<BackendMetrics>,
    scheduler: SmartScheduler,
    retry: RetryPolicy,
    remote_concurrency: usize,
    fallback: bool,
    cancel_grace: Duration,
    sink: Arc<OutcomeSink>,
    cancellation: Arc<BatchCancellation>,
}

impl Supervisor {
    async fn run(self) -> BatchSummary {
        let started = Instant::now();
        info!(
            batch = %self.id,
            queries = self.queries.len(),
            concurrency = self.concurrency,
            "starting batch"
        );

        let token = self.cancellation.token().clone();
        let availability = tokio::select! {
            _ = token.cancelled() => None,
            availability = self.registry.availability() => Some(availability),
        };

        if let Some(availability) = availability {
            info!(
                batch = %self.id,
                local = availability.local,
                remote = availability.remote,
                "backend availability"
            );
            self.dispatch(availability).await;
        }

        self.finish();
        let summary = self.sink.summary(started.elapsed());
        self.sink.close();
        info!(batch = %self.id, "batch finished: {}", summary);
        summary
    }

    async fn dispatch(&self, availability: Availability) {
        let snapshot = self.metrics.snapshot();
        let plan = self
            .scheduler
            .plan(&self.queries, &snapshot, &availability);

        for (index, err) in plan.rejected {
            let Some(query) = self.queries.get(index) else {
                continue;
            };
            let fingerprint = Fingerprint::of(query, &self.scheduler.effective_parameters(query));
            let outcome = match self.cache.lookup(&fingerprint).await {
                Some(entry) => QueryOutcome::new(
                    index,
                    query,
                    fingerprint,
                    OutcomeStatus::CacheHit,
                    Duration::ZERO,
                )
                .with_result(OutcomeSource::Cache, entry.payload),
                None => {
                    warn!(query = %query.id, "{}", err);
                    QueryOutcome::new(
                        index,
                        query,
                        fingerprint,
                        OutcomeStatus::Failed(err.to_string()),
                        Duration::ZERO,
                    )
                }
            };
            self.sink.deliver(outcome);
        }

        let workers = self.concurrency.min(plan.decisions.len());
        if workers == 0 {
            return;
        }

        let context = Arc::new(WorkerContext {
            queries: Arc::clone(&self.queries),
            queue: Mutex::new(VecDeque::from(plan.decisions)),
            registry: Arc::clone(&self.registry),
            cache: Arc::clone(&self.cache),
            metrics: Arc::clone(&self.metrics),
            retry: self.retry.clone(),
            fallback: self.fallback,
            availability,
            local_slots: Semaphore::new(1),
            remote_slots: Semaphore::new(self.remote_concurrency.max(1)),
            sink: Arc::clone(&self.sink),
            cancellation: Arc::clone(&self.cancellation),
        });

        let mut pool = JoinSet::new();
        for worker in 0..workers {
            let context = Arc::clone(&context);
            pool.spawn(async move { context.run(worker).await });
        }

        let token = self.cancellation.token().clone();
        let mut deadline: Option<tokio::time::Instant> = None;
        let mut aborted = false;
        loop {
            tokio::select! {
                joined = pool.join_next() => match joined {
                    None => break,
                    Some(Err(e)) if e.is_panic() => {
                        error!(batch = %self.id, "worker panicked: {}", e);
                    }
                    Some(_) => {}
                },
                _ = token.cancelled(), if deadline.is_none() => {
                    info!(batch = %self.id, grace = ?self.cancel_grace, "waiting for in-flight work to stop");
                    deadline = Some(tokio::time::Instant::now() + self.cancel_grace);
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)),
                    if deadline.is_some() && !aborted =>
                {
                    warn!(batch = %self.id, "grace period elapsed, aborting in-flight work");
                    pool.abort_all();
                    aborted = true;
                }
            }
        }
    }

    /// Give every query still without an outcome its terminal status
    fn finish(&self) {
        let cancelled = self.cancellation.is_requested();
        for index in self.sink.undelivered() {
            let Some(query) = self.queries.get(index) else {
                continue;
            };
            let fingerprint = Fingerprint::of(query, &self.scheduler.effective_parameters(query));
            let status = if cancelled {
                OutcomeStatus::Cancelled
            } else {
                OutcomeStatus::Failed("worker stopped before reporting an outcome".to_string())
            };
            self.sink.deliver(QueryOutcome::new(
                index,
                query,
                fingerprint,
                status,
                Duration::ZERO,
            ));
        }
        self.cancellation.terminate();
    }
}

/// State shared by the workers of one batch
struct WorkerContext {
    queries: Arc<Vec<SequenceQuery>>,
    queue: Mutex<VecDeque<ScheduleDecision>>,
    registry: Arc<BackendRegistry>,
    cache: Arc<CacheStore>,
    metrics: Arc<BackendMetrics>,
    retry: RetryPolicy,
    fallback: bool,
    availability: Availability,
    local_slots: Semaphore,
    remote_slots: Semaphore,
    sink: Arc<OutcomeSink>,
    cancellation: Arc<BatchCancellation>,
}

impl WorkerContext {
    async fn run(&self, worker: usize) {
        debug!(worker, "worker started");
        loop {
            if self.cancellation.is_requested() {
                break;
            }
            let Some(decision) = self.next_decision() else {
                break;
            };
            let Some(query) = self.queries.get(decision.query_index) else {
                continue;
            };
            let outcome = self.process(&decision, query).await;
            self.sink.deliver(outcome);
        }
        debug!(worker, "worker stopped");
    }

    fn next_decision(&self) -> Option<ScheduleDecision> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.pop_front()
    }

    async fn process(&self, decision: &ScheduleDecision, query: &SequenceQuery) -> QueryOutcome {
        let started = Instant::now();
        let index = decision.query_index;
        let fingerprint = Fingerprint::of(query, &decision.parameters);
        let outcome = |status, fingerprint: &Fingerprint| {
            QueryOutcome::new(index, query, fingerprint.clone(), status, started.elapsed())
        };

        if self.cancellation.is_requested() {
            return outcome(OutcomeStatus::Cancelled, &fingerprint);
        }
        if let Err(e) = query.validate() {
            warn!(query = %query.id, "rejecting query: {}", e);
            return outcome(OutcomeStatus::Failed(e.to_string()), &fingerprint);
        }

        let mut diagnostics = Vec::new();
        loop {
            if self.cancellation.is_requested() {
                return outcome(OutcomeStatus::Cancelled, &fingerprint).with_diagnostics(diagnostics);
            }

            if let Some(entry) = self.cache.lookup(&fingerprint).await {
                debug!(query = %query.id, fingerprint = %fingerprint.short(), "cache hit");
                return outcome(OutcomeStatus::CacheHit, &fingerprint)
                    .with_result(OutcomeSource::Cache, entry.payload);
            }

            match self.cache.reserve(&fingerprint) {
                Reservation::Leader(leader) => {
                    // An identical flight may have finished between the lookup and the reservation.
                    if let Some(entry) = self.cache.lookup(&fingerprint).await {
                        debug!(query = %query.id, fingerprint = %fingerprint.short(), "cache hit after reservation");
                        leader.complete(Ok(entry.payload.clone()));
                        return outcome(OutcomeStatus::CacheHit, &fingerprint)
                            .with_result(OutcomeSource::Cache, entry.payload);
                    }
                    return match self.execute(decision, query, &mut diagnostics).await {
                        Ok((backend, raw)) => {
                            self.cache.store(&fingerprint, raw.clone()).await;
                            leader.complete(Ok(raw.clone()));
                            outcome(OutcomeStatus::Success, &fingerprint)
                                .with_result(OutcomeSource::Backend(backend), raw)
                                .with_diagnostics(diagnostics)
                        }
                        Err(e) if e.is_cancelled() => {
                            drop(leader);
                            outcome(OutcomeStatus::Cancelled, &fingerprint)
                                .with_diagnostics(diagnostics)
                        }
                        Err(e) => {
                            let reason = failure_reason(&e, &diagnostics);
                            leader.complete(Err(reason.clone()));
                            outcome(OutcomeStatus::Failed(reason), &fingerprint)
                                .with_source(OutcomeSource::Backend(e.backend()))
                                .with_diagnostics(diagnostics)
                        }
                    };
                }
                Reservation::Follower(follower) => {
                    debug!(query = %query.id, fingerprint = %fingerprint.short(), "awaiting identical in-flight query");
                    let shared = tokio::select! {
                        _ = self.cancellation.token().cancelled() => {
                            return outcome(OutcomeStatus::Cancelled, &fingerprint);
                        }
                        shared = follower.wait() => shared,
                    };
                    match shared {
                        Some(Ok(raw)) => {
                            return outcome(OutcomeStatus::Success, &fingerprint)
                                .with_result(OutcomeSource::SharedFlight, raw);
                        }
                        Some(Err(reason)) => {
                            return outcome(OutcomeStatus::Failed(reason.clone()), &fingerprint)
                                .with_source(OutcomeSource::SharedFlight)
                                .with_diagnostics(vec![reason]);
                        }
                        None => {
                            debug!(query = %query.id, "in-flight query abandoned, retrying");
                        }
                    }
                }
            }
        }
    }

    /// Run on the assigned backend, then once on the alternate if allowed
    async fn execute(
        &self,
        decision: &ScheduleDecision,
        query: &SequenceQuery,
        diagnostics: &mut Vec<String>,
    ) -> Result<(BackendKind, RawResult), BackendError> {
        let primary = decision.backend;
        let err = match self.execute_with_retry(primary, decision, query, diagnostics).await {
            Ok(raw) => return Ok((primary, raw)),
            Err(e) => e,
        };
        if err.is_cancelled() {
            return Err(err);
        }

        let alternate = primary.alternate();
        if !self.fallback
            || !self.availability.is_available(alternate)
            || self.cancellation.is_requested()
        {
            return Err(err);
        }

        info!(query = %query.id, from = %primary, to = %alternate, "falling back to alternate backend");
        self.execute_with_retry(alternate, decision, query, diagnostics)
            .await
            .map(|raw| (alternate, raw))
    }

    async fn execute_with_retry(
        &self,
        kind: BackendKind,
        decision: &ScheduleDecision,
        query: &SequenceQuery,
        diagnostics: &mut Vec<String>,
    ) -> Result<RawResult, BackendError> {
        let Some(backend) = self.registry.get(kind).cloned() else {
            return Err(BackendError::permanent(kind, "backend not configured"));
        };
        let token = self.cancellation.token();
        let budget = decision.retry_budget.max(1);
        let mut last_error = None;

        for attempt in 1..=budget {
            if attempt > 1 && !self.retry.backoff(attempt - 1, token).await {
                return Err(BackendError::Cancelled(kind));
            }
            let Some(_slot) = self.acquire_slot(kind).await else {
                return Err(BackendError::Cancelled(kind));
            };
            if token.is_cancelled() {
                return Err(BackendError::Cancelled(kind));
            }
            if attempt == 1 {
                self.sink.dispatched(decision.query_index, &query.id, kind);
            }

            debug!(query = %query.id, backend = %kind, attempt, budget, "executing search");
            let started = Instant::now();
            let result = backend.execute(query, &decision.parameters, token).await;
            let latency = started.elapsed();

            match result {
                Ok(raw) => {
                    self.metrics.record(kind, true, latency);
                    return Ok(raw);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    self.metrics.record(kind, false, latency);
                    warn!(query = %query.id, backend = %kind, attempt, budget, "attempt failed: {}", e);
                    diagnostics.push(format!("{kind} attempt {attempt}/{budget}: {}", e.diagnostic()));
                    if !e.is_transient() {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BackendError::permanent(kind, "retry budget exhausted")))
    }

    /// Wait for an execution slot on `kind`. `None` if cancelled while waiting.
    async fn acquire_slot(&self, kind: BackendKind) -> Option<SemaphorePermit<'_>> {
        let slots = match kind {
            BackendKind::Local => &self.local_slots,
            BackendKind::Remote => &self.remote_slots,
        };
        tokio::select! {
            _ = self.cancellation.token().cancelled() => None,
            permit = slots.acquire() => permit.ok(),
        }
    }
}

fn failure_reason(err: &BackendError, diagnostics: &[String]) -> String {
    if diagnostics.is_empty() {
        err.diagnostic()
    } else {
        diagnostics.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::Backend;
    use crate::query::{SearchParameters, SearchProgram};
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct Flaky {
        kind: BackendKind,
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Backend for Flaky {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn name(&self) -> &str {
            "flaky"
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn execute(
            &self,
            query: &SequenceQuery,
            _params: &SearchParameters,
            _cancel: &CancellationToken,
        ) -> Result<RawResult, BackendError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(BackendError::transient(self.kind, "HTTP 503"))
            } else {
                Ok(RawResult::new(self.kind, format!("<BlastOutput>{}</BlastOutput>", query.id)))
            }
        }
    }

    fn query(id: &str, sequence: &str) -> SequenceQuery {
        SequenceQuery::new(id, sequence, SearchProgram::Blastn, "nt", SearchParameters::default())
    }

    fn runner(backend: Arc<dyn Backend>) -> BatchRunner {
        BatchRunner::new(
            BackendRegistry::new().with(backend),
            Arc::new(CacheStore::in_memory(None)),
        )
        .with_retry_policy(RetryPolicy::new(3, Duration::ZERO, Duration::ZERO))
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let runner = runner(Arc::new(Flaky {
            kind: BackendKind::Remote,
            failures: 0,
            calls: AtomicUsize::new(0),
        }));
        let handle = runner.run(runner.job(Vec::new()));
        let cancellation = handle.cancellation();
        let (outcomes, summary) = handle.collect().await;
        assert!(outcomes.is_empty());
        assert_eq!(summary.total, 0);
        assert_eq!(cancellation.state(), CancelState::Terminated);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let backend = Arc::new(Flaky {
            kind: BackendKind::Remote,
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let runner = runner(backend.clone());
        let handle = runner.run(runner.job(vec![query("q1", "ACGTACGT")]));

        let outcomes: Vec<_> = handle.into_outcomes().collect().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, OutcomeStatus::Success);
        assert_eq!(outcomes[0].diagnostics.len(), 2);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(runner.metrics().failures(BackendKind::Remote), 2);
    }

    #[tokio::test]
    async fn test_invalid_query_fails_without_backend_call() {
        let backend = Arc::new(Flaky {
            kind: BackendKind::Remote,
            failures: 0,
            calls: AtomicUsize::new(0),
        });
        let runner = runner(backend.clone());
        let handle = runner.run(runner.job(vec![query("bad", "ACGT!!"), query("empty", "")]));

        let (outcomes, summary) = handle.collect().await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o.status, OutcomeStatus::Failed(_))));
        assert_eq!(summary.failed, 2);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cached_result_is_reused() {
        let backend = Arc::new(Flaky {
            kind: BackendKind::Remote,
            failures: 0,
            calls: AtomicUsize::new(0),
        });
        let runner = runner(backend.clone());

        let first = runner.run(runner.job(vec![query("q", "ACGTACGT")])).wait().await;
        assert_eq!(first.success, 1);

        let (outcomes, summary) = runner
            .run(runner.job(vec![query("q-again", "acgt acgt")]))
            .collect()
            .await;
        assert_eq!(summary.cache_hit, 1);
        assert_eq!(outcomes[0].source, Some(OutcomeSource::Cache));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_backend_available() {
        let runner = BatchRunner::new(BackendRegistry::new(), Arc::new(CacheStore::disabled()));
        let (outcomes, summary) = runner
            .run(runner.job(vec![query("q", "ACGT")]))
            .collect()
            .await;
        assert_eq!(summary.failed, 1);
        match &outcomes[0].status {
            OutcomeStatus::Failed(reason) => assert!(reason.contains("no backend available")),
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[test]
    fn test_builders_reach_scheduler_policy() {
        let runner = runner(Arc::new(Flaky {
            kind: BackendKind::Remote,
            failures: 0,
            calls: AtomicUsize::new(0),
        }))
        .with_retry_policy(RetryPolicy::new(1, Duration::ZERO, Duration::ZERO))
        .with_remote_concurrency(4);
        assert_eq!(runner.scheduler.policy().retry_budget, 1);
        assert_eq!(runner.scheduler.policy().remote_concurrency, 4);

        let runner = runner.with_scheduler(SmartScheduler::default());
        assert_eq!(runner.scheduler.policy().retry_budget, 1);
        assert_eq!(runner.scheduler.policy().remote_concurrency, 4);
    }

    #[tokio::test]
    async fn test_retry_budget_follows_policy() {
        let backend = Arc::new(Flaky {
            kind: BackendKind::Remote,
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let runner = runner(backend.clone())
            .with_retry_policy(RetryPolicy::new(1, Duration::ZERO, Duration::ZERO));

        let (outcomes, summary) = runner
            .run(runner.job(vec![query("q", "ACGTACGT")]))
            .collect()
            .await;
        assert_eq!(summary.failed, 1);
        assert_eq!(outcomes[0].diagnostics.len(), 1);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let backend = Arc::new(Flaky {
            kind: BackendKind::Remote,
            failures: 0,
            calls: AtomicUsize::new(0),
        });
        let runner = runner(backend.clone());
        let job = runner.job(vec![query("a", "ACGT"), query("b", "GGCC")]);
        job.cancellation().request();

        let (outcomes, summary) = runner.run(job).collect().await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(summary.cancelled, 2);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }
}
