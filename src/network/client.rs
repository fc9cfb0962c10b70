//! HTTP client for the remote BLAST service

use crate::config::RemoteSettings;
use anyhow::Result;
use reqwest::{Client, RequestBuilder};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// One call to the service: query string parameters plus an optional form body
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub url: String,
    pub method: HttpMethod,
    pub params: Vec<(String, String)>,
    /// Sent url-encoded, POST only
    pub form: Vec<(String, String)>,
}

impl ServiceRequest {
    fn with_method(url: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            url: url.into(),
            method,
            params: Vec::new(),
            form: Vec::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::with_method(url, HttpMethod::Get)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::with_method(url, HttpMethod::Post)
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.form.push((key.into(), value.into()));
        self
    }
}

/// Status and body of a service reply
#[derive(Debug)]
pub struct ServiceResponse {
    pub status: u16,
    pub text: String,
}

impl ServiceResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Throttling or server-side trouble
    pub fn is_retryable(&self) -> bool {
        self.status == 429 || (500..600).contains(&self.status)
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self.status, 401 | 403)
    }
}

/// reqwest client configured from [`RemoteSettings`]
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    timeout: Duration,
}

impl HttpClient {
    pub fn new() -> Result<Self> {
        Self::with_settings(&RemoteSettings::default())
    }

    pub fn with_settings(settings: &RemoteSettings) -> Result<Self> {
        let timeout = Duration::from_secs_f64(settings.request_timeout_secs);
        let mut builder = Client::builder()
            .timeout(timeout)
            .user_agent(format!("{}/{}", settings.tool, crate::VERSION))
            .gzip(true)
            .brotli(true);

        if !settings.verify_ssl {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(proxy) = &settings.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        Ok(Self {
            client: builder.build()?,
            timeout,
        })
    }

    fn build(&self, request: &ServiceRequest) -> RequestBuilder {
        let builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url).form(&request.form),
        };
        builder.timeout(self.timeout).query(&request.params)
    }

    /// Send `request` and read the whole body. Non-2xx statuses are not errors here.
    pub async fn execute(&self, request: ServiceRequest) -> Result<ServiceResponse, reqwest::Error> {
        let response = self.build(&request).send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        Ok(ServiceResponse { status, text })
    }
}
