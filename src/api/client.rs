//! HTTP transport for the assessment backend.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::error::ApiError;
use crate::config::ApiConfig;

/// Minimal JSON transport consumed by the orchestrator and heartbeat.
///
/// Paths are relative to the backend base URL. Responses are JSON values;
/// a text body comes back as a JSON string and an empty body as `null`.
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn get(&self, path: &str) -> Result<Value, ApiError>;

    async fn post(&self, path: &str, body: &Value) -> Result<Value, ApiError>;
}

/// reqwest-backed client with exponential backoff on idempotent GETs
pub struct HttpApiClient {
    client: reqwest::Client,
    base_url: String,
    max_retries: usize,
    base_delay: Duration,
    max_delay: Duration,
}

impl HttpApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        Self::from_config(&ApiConfig {
            base_url: base_url.into(),
            ..ApiConfig::default()
        })
    }

    pub fn from_config(config: &ApiConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ApiError::network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn retry_strategy(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries)
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    async fn get_once(&self, url: &str) -> Result<Value, ApiError> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ApiError::network(e.to_string()))?;
        read_response(response).await
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    #[instrument(skip(self))]
    async fn get(&self, path: &str) -> Result<Value, ApiError> {
        let url = self.url(path);
        let op = || async { self.get_once(&url).await };
        op.retry(self.retry_strategy())
            .when(ApiError::is_retryable)
            .notify(|err, dur| {
                warn!(url = %url, error = %err, "Retrying GET after {:?}", dur);
            })
            .await
    }

    #[instrument(skip(self, body))]
    async fn post(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
        let url = self.url(path);
        let response = self
            .client
            .post(&url)
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::network(e.to_string()))?;
        read_response(response).await
    }
}

async fn read_response(response: reqwest::Response) -> Result<Value, ApiError> {
    let status = response.status();
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("json"));
    let body = response
        .text()
        .await
        .map_err(|e| ApiError::network(e.to_string()))?;

    debug!(status = status.as_u16(), bytes = body.len(), "Backend response");
    classify_response(status, is_json, &body)
}

/// Turn a status and body into the payload value or an error
fn classify_response(status: StatusCode, is_json: bool, body: &str) -> Result<Value, ApiError> {
    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::SessionExpired);
    }

    if !status.is_success() {
        let parsed: Option<Value> = serde_json::from_str(body).ok();
        let code = parsed
            .as_ref()
            .and_then(|v| v.get("code"))
            .map(|c| match c {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        let message = parsed
            .as_ref()
            .and_then(|v| v.get("msg").or_else(|| v.get("message")))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| status.canonical_reason().map(str::to_string))
            .unwrap_or_else(|| "request failed".to_string());
        return Err(ApiError::http(status.as_u16(), code, message));
    }

    if body.trim().is_empty() {
        return Ok(Value::Null);
    }

    if is_json {
        Ok(serde_json::from_str(body)?)
    } else {
        Ok(Value::String(body.to_string()))
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base_url.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}
