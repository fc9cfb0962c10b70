//! Remote backend for the NCBI BLAST URL API
//!
//! A search is a submit (`CMD=Put`), a series of status polls
//! (`CMD=Get&FORMAT_OBJECT=SearchInfo`) and a final fetch
//! (`CMD=Get&FORMAT_TYPE=XML`). Every request passes through the shared
//! [`RequestGate`].

use super::traits::{Backend, BackendKind, RawResult};
use crate::config::RemoteSettings;
use crate::error::BackendError;
use crate::network::{HttpClient, RequestGate, ServiceRequest, ServiceResponse};
use crate::query::{SearchParameters, SearchProgram, SequenceQuery};
use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DELETE_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_GROWTH: f64 = 1.5;

/// Status reported by a `SearchInfo` poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Waiting,
    Ready { hits: bool },
    Failed,
    Unknown,
}

/// Extracts request ids and job status from URL API responses
#[derive(Debug, Clone)]
struct InfoParser {
    rid: Regex,
    rtoe: Regex,
    status: Regex,
    hits: Regex,
    message: Regex,
}

impl InfoParser {
    fn new() -> Result<Self> {
        Ok(Self {
            rid: Regex::new(r"(?m)^\s*RID\s*=\s*(\S+)")?,
            rtoe: Regex::new(r"(?m)^\s*RTOE\s*=\s*(\d+)")?,
            status: Regex::new(r"Status=(\w+)")?,
            hits: Regex::new(r"ThereAreHits=(\w+)")?,
            message: Regex::new(r#"(?s)<p class="error">(.*?)</p>|Message ID#\d+ Error: ([^\n<]+)"#)?,
        })
    }

    fn info_block<'a>(&self, text: &'a str) -> &'a str {
        match (text.find("QBlastInfoBegin"), text.find("QBlastInfoEnd")) {
            (Some(start), Some(end)) if end > start => &text[start..end],
            _ => text,
        }
    }

    fn submission(&self, text: &str) -> Option<(String, Option<Duration>)> {
        let block = self.info_block(text);
        let rid = self.rid.captures(block)?.get(1)?.as_str().to_string();
        let rtoe = self
            .rtoe
            .captures(block)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .map(Duration::from_secs);
        Some((rid, rtoe))
    }

    fn status(&self, text: &str) -> JobStatus {
        let block = self.info_block(text);
        let status = self
            .status
            .captures(block)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_uppercase());
        match status.as_deref() {
            Some("WAITING") => JobStatus::Waiting,
            Some("READY") => {
                let hits = self
                    .hits
                    .captures(block)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().eq_ignore_ascii_case("yes"))
                    .unwrap_or(false);
                JobStatus::Ready { hits }
            }
            Some("FAILED") => JobStatus::Failed,
            _ => JobStatus::Unknown,
        }
    }

    fn error_message(&self, text: &str) -> Option<String> {
        let captures = self.message.captures(text)?;
        captures
            .get(1)
            .or_else(|| captures.get(2))
            .map(|m| m.as_str().trim().to_string())
            .filter(|m| !m.is_empty())
    }
}

/// NCBI URL API adapter
pub struct RemoteBackend {
    client: HttpClient,
    gate: Arc<RequestGate>,
    parser: InfoParser,
    base_url: String,
    tool: String,
    email: Option<String>,
    api_key: Option<String>,
    min_poll: Duration,
    max_poll: Duration,
    job_timeout: Duration,
    enabled: bool,
}

impl RemoteBackend {
    /// Build from settings, sharing `gate` with every other remote caller
    pub fn from_settings(settings: &RemoteSettings, gate: Arc<RequestGate>) -> Result<Self> {
        Ok(Self {
            client: HttpClient::with_settings(settings)?,
            gate,
            parser: InfoParser::new()?,
            base_url: settings.base_url.clone(),
            tool: settings.tool.clone(),
            email: settings.email.clone(),
            api_key: settings.api_key.clone(),
            min_poll: settings.min_poll_interval(),
            max_poll: settings.max_poll_interval(),
            job_timeout: settings.job_timeout(),
            enabled: settings.enabled,
        })
    }

    /// Backend against `base_url` with default settings and no request spacing
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let settings = RemoteSettings {
            base_url: base_url.into(),
            ..RemoteSettings::default()
        };
        Self::from_settings(&settings, Arc::new(RequestGate::unlimited()))
    }

    pub fn with_poll_interval(mut self, min: Duration, max: Duration) -> Self {
        self.min_poll = min;
        self.max_poll = max.max(min);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_gate(mut self, gate: Arc<RequestGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Form fields for a `CMD=Put` submission
    pub fn submission_fields(
        &self,
        query: &SequenceQuery,
        params: &SearchParameters,
    ) -> Vec<(String, String)> {
        let mut fields = vec![
            ("CMD".to_string(), "Put".to_string()),
            ("PROGRAM".to_string(), query.program.as_str().to_string()),
            ("DATABASE".to_string(), query.database.clone()),
            ("QUERY".to_string(), query.to_fasta()),
            ("EXPECT".to_string(), params.evalue.to_string()),
            ("HITLIST_SIZE".to_string(), params.hitlist_size.to_string()),
        ];
        if query.program == SearchProgram::Blastn && params.megablast {
            fields.push(("MEGABLAST".to_string(), "on".to_string()));
        }
        if let Some(word_size) = params.word_size {
            fields.push(("WORD_SIZE".to_string(), word_size.to_string()));
        }
        if let Some(reward) = params.reward {
            fields.push(("NUCL_REWARD".to_string(), reward.to_string()));
        }
        if let Some(penalty) = params.penalty {
            fields.push(("NUCL_PENALTY".to_string(), penalty.to_string()));
        }
        if let Some(filter) = &params.filter {
            fields.push(("FILTER".to_string(), filter.clone()));
        }
        if let Some(matrix) = &params.matrix {
            fields.push(("MATRIX_NAME".to_string(), matrix.clone()));
        }
        fields.extend(self.identification());
        fields
    }

    fn identification(&self) -> Vec<(String, String)> {
        let mut fields = vec![("tool".to_string(), self.tool.clone())];
        if let Some(email) = &self.email {
            fields.push(("email".to_string(), email.clone()));
        }
        if let Some(api_key) = &self.api_key {
            fields.push(("api_key".to_string(), api_key.clone()));
        }
        fields
    }

    fn get(&self, rid: &str) -> ServiceRequest {
        let mut request = ServiceRequest::get(&self.base_url)
            .param("CMD", "Get")
            .param("RID", rid);
        for (key, value) in self.identification() {
            request = request.param(key, value);
        }
        request
    }

    /// Send one gated request. Network trouble is transient.
    async fn send(
        &self,
        request: ServiceRequest,
        stage: &str,
        cancel: &CancellationToken,
    ) -> Result<ServiceResponse, BackendError> {
        if !self.gate.acquire(cancel).await {
            return Err(BackendError::Cancelled(BackendKind::Remote));
        }
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::Cancelled(BackendKind::Remote)),
            response = self.client.execute(request) => response,
        };
        let response = response.map_err(|e| {
            BackendError::transient(BackendKind::Remote, format!("{stage} request failed: {e}"))
        })?;
        Self::check_status(&response, stage)?;
        Ok(response)
    }

    fn check_status(response: &ServiceResponse, stage: &str) -> Result<(), BackendError> {
        if response.is_success() {
            return Ok(());
        }
        let message = format!("HTTP {} during {stage}", response.status);
        if response.is_retryable() {
            Err(BackendError::transient(BackendKind::Remote, message))
        } else if response.is_auth_failure() {
            Err(BackendError::permanent(
                BackendKind::Remote,
                format!("{message} (authentication rejected)"),
            ))
        } else {
            Err(BackendError::Permanent {
                backend: BackendKind::Remote,
                message,
                exit_code: None,
                diagnostics: Some(response.text.chars().take(500).collect()),
            })
        }
    }

    async fn submit(
        &self,
        query: &SequenceQuery,
        params: &SearchParameters,
        cancel: &CancellationToken,
    ) -> Result<(String, Option<Duration>), BackendError> {
        let mut request = ServiceRequest::post(&self.base_url);
        for (key, value) in self.submission_fields(query, params) {
            request = request.field(key, value);
        }

        let response = self.send(request, "submit", cancel).await?;
        match self.parser.submission(&response.text) {
            Some(submission) => Ok(submission),
            None => {
                let reason = self
                    .parser
                    .error_message(&response.text)
                    .unwrap_or_else(|| "no request id in submission response".to_string());
                Err(BackendError::permanent(
                    BackendKind::Remote,
                    format!("submission rejected: {reason}"),
                ))
            }
        }
    }

    fn next_wait(&self, current: Duration) -> Duration {
        current.mul_f64(POLL_GROWTH).clamp(self.min_poll, self.max_poll)
    }

    /// Poll until the job is ready, then fetch the XML report
    async fn await_job(
        &self,
        rid: &str,
        rtoe: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<String, BackendError> {
        let started = Instant::now();
        let mut wait = rtoe
            .unwrap_or(self.min_poll)
            .clamp(self.min_poll, self.max_poll);
        let mut polls = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Cancelled(BackendKind::Remote)),
                _ = tokio::time::sleep(wait) => {}
            }
            if started.elapsed() > self.job_timeout {
                return Err(BackendError::transient(
                    BackendKind::Remote,
                    format!("job {rid} not ready after {}s", self.job_timeout.as_secs_f64()),
                ));
            }

            polls += 1;
            let response = self
                .send(self.get(rid).param("FORMAT_OBJECT", "SearchInfo"), "poll", cancel)
                .await?;
            match self.parser.status(&response.text) {
                JobStatus::Waiting => {
                    debug!(rid, polls, "job still waiting");
                    wait = self.next_wait(wait);
                }
                JobStatus::Ready { hits } => {
                    debug!(rid, polls, hits, "job ready");
                    break;
                }
                JobStatus::Failed => {
                    return Err(BackendError::transient(
                        BackendKind::Remote,
                        format!("job {rid} failed on the server"),
                    ));
                }
                JobStatus::Unknown => {
                    return Err(BackendError::transient(
                        BackendKind::Remote,
                        format!("job {rid} unknown or expired"),
                    ));
                }
            }
        }

        let response = self
            .send(self.get(rid).param("FORMAT_TYPE", "XML"), "fetch", cancel)
            .await?;
        if !response.text.contains("<BlastOutput") {
            return Err(BackendError::transient(
                BackendKind::Remote,
                format!("job {rid} returned no BLAST XML report"),
            ));
        }
        Ok(response.text)
    }

    /// Ask the service to drop a job. Best effort, bypasses the gate.
    async fn delete(&self, rid: &str) {
        let mut request = ServiceRequest::get(&self.base_url)
            .param("CMD", "Delete")
            .param("RID", rid);
        for (key, value) in self.identification() {
            request = request.param(key, value);
        }
        match tokio::time::timeout(DELETE_TIMEOUT, self.client.execute(request)).await {
            Ok(Ok(_)) => debug!(rid, "remote job deleted"),
            Ok(Err(e)) => debug!(rid, "failed to delete remote job: {}", e),
            Err(_) => debug!(rid, "timed out deleting remote job"),
        }
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn name(&self) -> &str {
        "ncbi"
    }

    async fn is_available(&self) -> bool {
        self.enabled && !self.base_url.is_empty()
    }

    async fn execute(
        &self,
        query: &SequenceQuery,
        params: &SearchParameters,
        cancel: &CancellationToken,
    ) -> Result<RawResult, BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled(BackendKind::Remote));
        }

        let (rid, rtoe) = self.submit(query, params, cancel).await?;
        info!(query = %query.id, rid = %rid, rtoe = ?rtoe, "remote job submitted");

        match self.await_job(&rid, rtoe, cancel).await {
            Ok(body) => Ok(RawResult::new(BackendKind::Remote, body).with_job_id(rid)),
            Err(e) => {
                if e.is_cancelled() || e.is_transient() {
                    self.delete(&rid).await;
                }
                if !e.is_cancelled() {
                    warn!(query = %query.id, rid = %rid, "remote job failed: {}", e);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    const REPORT: &str = "<?xml version=\"1.0\"?>\n<BlastOutput><BlastOutput_program>blastn</BlastOutput_program></BlastOutput>";

    fn put_response(rid: &str) -> String {
        format!(
            "<html><!--QBlastInfoBegin\n    RID = {rid}\n    RTOE = 0\nQBlastInfoEnd\n--></html>"
        )
    }

    fn search_info(status: &str) -> String {
        format!("<!--QBlastInfoBegin\n\tStatus={status}\n\tThereAreHits=yes\nQBlastInfoEnd\n-->")
    }

    /// Reports WAITING on the first poll of a job and READY afterwards
    struct ReadyOnSecondPoll {
        polls: Mutex<HashMap<String, u32>>,
    }

    impl Respond for ReadyOnSecondPoll {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let rid = request
                .url
                .query_pairs()
                .find(|(k, _)| k == "RID")
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default();
            let mut polls = self.polls.lock().unwrap();
            let count = polls.entry(rid).or_insert(0);
            *count += 1;
            let status = if *count >= 2 { "READY" } else { "WAITING" };
            ResponseTemplate::new(200).set_body_string(search_info(status))
        }
    }

    fn query() -> SequenceQuery {
        SequenceQuery::new(
            "sample",
            "ACGTACGTACGT",
            SearchProgram::Blastn,
            "nt",
            SearchParameters::default(),
        )
    }

    fn backend(server: &MockServer) -> RemoteBackend {
        RemoteBackend::new(format!("{}/blast", server.uri()))
            .unwrap()
            .with_poll_interval(Duration::from_millis(20), Duration::from_millis(100))
    }

    #[test]
    fn test_info_parsing() {
        let parser = InfoParser::new().unwrap();
        let (rid, rtoe) = parser.submission(&put_response("ABC123")).unwrap();
        assert_eq!(rid, "ABC123");
        assert_eq!(rtoe, Some(Duration::ZERO));

        assert_eq!(parser.status(&search_info("WAITING")), JobStatus::Waiting);
        assert_eq!(
            parser.status(&search_info("READY")),
            JobStatus::Ready { hits: true }
        );
        assert_eq!(parser.status(&search_info("FAILED")), JobStatus::Failed);
        assert_eq!(parser.status("garbage"), JobStatus::Unknown);
        assert!(parser.submission("<html>nothing</html>").is_none());
    }

    #[test]
    fn test_poll_spacing_grows_within_bounds() {
        let backend = RemoteBackend::new("http://localhost/blast")
            .unwrap()
            .with_poll_interval(Duration::from_secs(10), Duration::from_secs(20));
        assert_eq!(
            backend.next_wait(Duration::from_secs(10)),
            Duration::from_secs(15)
        );
        assert_eq!(
            backend.next_wait(Duration::from_secs(15)),
            Duration::from_secs(20)
        );
        assert_eq!(
            backend.next_wait(Duration::from_secs(1)),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_submission_fields() {
        let backend = RemoteBackend::new("http://localhost/blast").unwrap();
        let fields: HashMap<_, _> = backend
            .submission_fields(&query(), &SearchParameters::default())
            .into_iter()
            .collect();
        assert_eq!(fields["CMD"], "Put");
        assert_eq!(fields["PROGRAM"], "blastn");
        assert_eq!(fields["MEGABLAST"], "on");
        assert_eq!(fields["WORD_SIZE"], "28");
        assert_eq!(fields["tool"], "hybrid-blast");
    }

    #[tokio::test]
    async fn test_submit_poll_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/blast"))
            .and(body_string_contains("CMD=Put"))
            .respond_with(ResponseTemplate::new(200).set_body_string(put_response("R1")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("FORMAT_OBJECT", "SearchInfo"))
            .respond_with(ReadyOnSecondPoll {
                polls: Mutex::new(HashMap::new()),
            })
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("FORMAT_TYPE", "XML"))
            .respond_with(ResponseTemplate::new(200).set_body_string(REPORT))
            .expect(1)
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let result = tokio_test::assert_ok!(
            backend(&server)
                .execute(&query(), &SearchParameters::default(), &cancel)
                .await
        );
        assert_eq!(result.backend, BackendKind::Remote);
        assert_eq!(result.job_id.as_deref(), Some("R1"));
        assert_eq!(result.body, REPORT);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let err = backend(&server)
            .execute(&query(), &SearchParameters::default(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "remote transient failure: HTTP 503 during submit");
    }

    #[tokio::test]
    async fn test_bad_request_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad query"))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let err = backend(&server)
            .execute(&query(), &SearchParameters::default(), &cancel)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(!err.is_cancelled());
    }

    #[tokio::test]
    async fn test_missing_rid_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<p class=\"error\">Message ID#24 Error: Failed to read the Blast query</p>",
            ))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let err = backend(&server)
            .execute(&query(), &SearchParameters::default(), &cancel)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("Failed to read the Blast query"));
    }

    #[tokio::test]
    async fn test_failed_job_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(put_response("R2")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("FORMAT_OBJECT", "SearchInfo"))
            .respond_with(ResponseTemplate::new(200).set_body_string(search_info("FAILED")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("CMD", "Delete"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let err = backend(&server)
            .execute(&query(), &SearchParameters::default(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_job_timeout_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(put_response("R3")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("FORMAT_OBJECT", "SearchInfo"))
            .respond_with(ResponseTemplate::new(200).set_body_string(search_info("WAITING")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("CMD", "Delete"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let backend = backend(&server).with_job_timeout(Duration::from_millis(150));
        let err = backend
            .execute(&query(), &SearchParameters::default(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("not ready"));
    }

    #[tokio::test]
    async fn test_cancellation_deletes_job() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(put_response("R4")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("FORMAT_OBJECT", "SearchInfo"))
            .respond_with(ResponseTemplate::new(200).set_body_string(search_info("WAITING")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("CMD", "Delete"))
            .and(query_param("RID", "R4"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = backend(&server)
            .execute(&query(), &SearchParameters::default(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
