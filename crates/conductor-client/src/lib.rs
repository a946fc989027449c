#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

mod sse;
mod types;

use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub use reqwest::StatusCode;
pub use sse::{DEFAULT_EVENT_NAME, SseEvent, SseParser, sse_events};
pub use types::{
    ActivityEntry, Budget, DEFAULT_LOG_EVENT, LogLevel, LogRecord, Run, RunStatus,
    StartRunRequest, Stats, Template,
};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8745/v1";
pub const DEFAULT_TIMEOUT_MS: u64 = 1_500;
pub const DEFAULT_REQUEST_ATTEMPTS: usize = 2;
pub const SESSION_TOKEN_HEADER: &str = "x-local-token";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub type RunLogEvents = BoxStream<'static, Result<SseEvent, ConductorClientError>>;

#[derive(Debug, Clone)]
pub struct ConductorClientConfig {
    pub base_url: String,
    pub session_token: Option<String>,
    pub timeout_ms: u64,
    pub request_attempts: usize,
}

impl ConductorClientConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            session_token: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_session_token(mut self, token: Option<String>) -> Self {
        self.session_token = token.and_then(non_empty_string);
        self
    }
}

impl Default for ConductorClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

#[derive(Debug, Clone)]
pub struct ConductorClient {
    base_url: String,
    session_token: Option<String>,
    timeout: Duration,
    request_attempts: usize,
    http: reqwest::Client,
}

#[derive(Debug, Error)]
pub enum ConductorClientError {
    #[error("conductor_client_base_url_missing")]
    BaseUrlMissing,
    #[error("conductor_client_invalid_path")]
    InvalidPath,
    #[error("conductor_request_failed:{message}")]
    Request { message: String },
    #[error("conductor_read_failed:{message}")]
    Read { message: String },
    #[error("conductor_http_{status}:{body}")]
    Http { status: StatusCode, body: String },
    #[error("conductor_json_decode_failed:{message}")]
    Decode { message: String },
}

impl ConductorClientError {
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Human-readable reason without the wire prefix, for surfacing to users.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::BaseUrlMissing => "base url is not configured".to_string(),
            Self::InvalidPath => "invalid request path".to_string(),
            Self::Request { message } | Self::Read { message } | Self::Decode { message } => {
                message.clone()
            }
            Self::Http { status, body } => format!("{status}: {body}"),
        }
    }
}

impl ConductorClient {
    pub fn new(config: ConductorClientConfig) -> Result<Self, ConductorClientError> {
        let base_url = normalize_base_url(&config.base_url)?;
        Ok(Self {
            base_url,
            session_token: config.session_token,
            timeout: Duration::from_millis(config.timeout_ms.max(250)),
            request_attempts: config.request_attempts.max(1),
            http: reqwest::Client::new(),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}", self.base_url, trimmed))
        } else {
            Some(format!("{}/{}", self.base_url, trimmed))
        }
    }

    #[must_use]
    pub fn runs_path() -> &'static str {
        "/runs"
    }

    #[must_use]
    pub fn run_path(run_id: &str) -> String {
        format!("/runs/{}", run_id.trim())
    }

    #[must_use]
    pub fn run_stop_path(run_id: &str) -> String {
        format!("/runs/{}/stop", run_id.trim())
    }

    #[must_use]
    pub fn run_logs_path(run_id: &str) -> String {
        format!("/runs/{}/logs", run_id.trim())
    }

    #[must_use]
    pub fn templates_path() -> &'static str {
        "/templates"
    }

    #[must_use]
    pub fn template_path(template_id: &str) -> String {
        format!("/templates/{}", template_id.trim())
    }

    #[must_use]
    pub fn stats_path() -> &'static str {
        "/stats"
    }

    #[must_use]
    pub fn health_path() -> &'static str {
        "/healthz"
    }

    pub async fn list_runs(&self) -> Result<Vec<Run>, ConductorClientError> {
        self.get_json(Self::runs_path()).await
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<Run>, ConductorClientError> {
        self.get_optional_json(Self::run_path(run_id).as_str())
            .await
    }

    /// Sent once: run creation is not idempotent.
    pub async fn create_run(
        &self,
        request: &StartRunRequest,
    ) -> Result<Run, ConductorClientError> {
        self.post_json_with_attempts(Self::runs_path(), request, 1)
            .await
    }

    /// The acknowledgment body is returned as-is; an empty body is `Null`.
    pub async fn stop_run(&self, run_id: &str) -> Result<serde_json::Value, ConductorClientError> {
        self.post_json(Self::run_stop_path(run_id).as_str(), &serde_json::json!({}))
            .await
    }

    pub async fn stats(&self) -> Result<Stats, ConductorClientError> {
        self.get_json(Self::stats_path()).await
    }

    pub async fn health(&self) -> Result<serde_json::Value, ConductorClientError> {
        self.get_json(Self::health_path()).await
    }

    pub async fn list_templates(&self) -> Result<Vec<Template>, ConductorClientError> {
        self.get_json(Self::templates_path()).await
    }

    pub async fn get_template(
        &self,
        template_id: &str,
    ) -> Result<Option<Template>, ConductorClientError> {
        self.get_optional_json(Self::template_path(template_id).as_str())
            .await
    }

    /// Open the run's server-sent log stream.
    ///
    /// Resolves once the server has acknowledged the stream with a success
    /// status; frames are then yielded in arrival order. The stream has no
    /// request timeout.
    pub async fn open_run_logs(&self, run_id: &str) -> Result<RunLogEvents, ConductorClientError> {
        let url = self
            .endpoint(Self::run_logs_path(run_id).as_str())
            .ok_or(ConductorClientError::InvalidPath)?;
        let request = self
            .authorize(self.http.get(url.as_str()))
            .header(reqwest::header::ACCEPT, "text/event-stream");

        let response = request
            .send()
            .await
            .map_err(|error| ConductorClientError::Request {
                message: error.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .bytes()
                .await
                .map_err(|error| ConductorClientError::Read {
                    message: error.to_string(),
                })?;
            return Err(format_http_error(status, &body));
        }

        tracing::debug!(run_id = %run_id.trim(), "run log stream acknowledged");
        Ok(sse_events(Box::pin(response.bytes_stream())).boxed())
    }

    pub async fn get_json<T>(&self, path: &str) -> Result<T, ConductorClientError>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let response = self.send_get(path).await?;
        decode_json_response(response).await
    }

    pub async fn get_optional_json<T>(&self, path: &str) -> Result<Option<T>, ConductorClientError>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let response = self.send_get(path).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode_json_response(response).await.map(Some)
    }

    pub async fn post_json<Req, Res>(
        &self,
        path: &str,
        payload: &Req,
    ) -> Result<Res, ConductorClientError>
    where
        Req: Serialize + ?Sized,
        Res: for<'de> serde::Deserialize<'de>,
    {
        self.post_json_with_attempts(path, payload, self.request_attempts)
            .await
    }

    async fn post_json_with_attempts<Req, Res>(
        &self,
        path: &str,
        payload: &Req,
        attempts: usize,
    ) -> Result<Res, ConductorClientError>
    where
        Req: Serialize + ?Sized,
        Res: for<'de> serde::Deserialize<'de>,
    {
        let url = self.endpoint(path).ok_or(ConductorClientError::InvalidPath)?;
        let attempts = attempts.max(1);
        let mut last_error: Option<String> = None;

        for attempt in 0..attempts {
            let request = self
                .authorize(self.http.post(url.as_str()))
                .timeout(self.timeout)
                .json(payload);

            match request.send().await {
                Ok(response) => return decode_json_response(response).await,
                Err(error) => {
                    tracing::debug!(path, attempt, error = %error, "conductor POST failed");
                    last_error = Some(error.to_string());
                    if attempt + 1 >= attempts {
                        break;
                    }
                }
            }
        }

        Err(ConductorClientError::Request {
            message: last_error.unwrap_or_else(|| "unknown".to_string()),
        })
    }

    async fn send_get(&self, path: &str) -> Result<reqwest::Response, ConductorClientError> {
        let url = self.endpoint(path).ok_or(ConductorClientError::InvalidPath)?;
        let mut last_error: Option<String> = None;

        for attempt in 0..self.request_attempts {
            let request = self
                .authorize(self.http.get(url.as_str()))
                .timeout(self.timeout);

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    tracing::debug!(path, attempt, error = %error, "conductor GET failed");
                    last_error = Some(error.to_string());
                    if attempt + 1 >= self.request_attempts {
                        break;
                    }
                }
            }
        }

        Err(ConductorClientError::Request {
            message: last_error.unwrap_or_else(|| "unknown".to_string()),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request =
            request.header(REQUEST_ID_HEADER, format!("req_{}", Uuid::new_v4().simple()));
        match self.session_token.as_deref() {
            Some(token) => request.header(SESSION_TOKEN_HEADER, token),
            None => request,
        }
    }
}

pub fn format_http_error(status: StatusCode, body: &[u8]) -> ConductorClientError {
    let body = non_empty_string(String::from_utf8_lossy(body).to_string())
        .unwrap_or_else(|| "<empty>".to_string());
    ConductorClientError::Http { status, body }
}

fn normalize_base_url(base_url: &str) -> Result<String, ConductorClientError> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(ConductorClientError::BaseUrlMissing);
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

async fn decode_json_response<T>(response: reqwest::Response) -> Result<T, ConductorClientError>
where
    T: for<'de> serde::Deserialize<'de>,
{
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|error| ConductorClientError::Read {
            message: error.to_string(),
        })?;

    if !status.is_success() {
        return Err(format_http_error(status, &bytes));
    }

    // An empty success body (e.g. 204) reads as JSON `null`.
    let payload: &[u8] = if bytes.iter().all(u8::is_ascii_whitespace) {
        b"null"
    } else {
        &bytes
    };
    serde_json::from_slice::<T>(payload).map_err(|error| ConductorClientError::Decode {
        message: error.to_string(),
    })
}

fn non_empty_string(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
