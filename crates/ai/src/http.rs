//! JSON-over-HTTP generation backend.
//!
//! Wire contract (provider-neutral):
//!
//! ```text
//! POST {endpoint}
//! Authorization: Bearer {api_key}
//! { "prompt": "...", "existing_files": { "index.html": "..." }, "model": "..." }
//!
//! 200 OK
//! { "files": { "index.html": "...", "about.html": "..." } }
//! ```
//!
//! HTTP failures are classified here, once, into [`BackendError`] variants.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use sitegen_core::FileBundle;

use crate::backend::GenerationBackend;
use crate::error::BackendError;

const MAX_ERROR_BODY: usize = 512;

/// Connection settings for [`HttpGenerationBackend`].
#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    /// Transport-level timeout for a single call.
    pub request_timeout: Duration,
}

impl HttpBackendConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            model: None,
            request_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    existing_files: Option<&'a FileBundle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    files: FileBundle,
}

/// Generation backend reached over HTTP.
pub struct HttpGenerationBackend {
    config: HttpBackendConfig,
    http: reqwest::Client,
}

impl HttpGenerationBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BackendError::InvalidRequest(format!("failed to build http client: {e}")))?;
        Ok(Self { config, http })
    }

    fn map_transport_error(&self, err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout(self.config.request_timeout)
        } else if err.is_decode() {
            BackendError::Malformed(err.to_string())
        } else if err.is_builder() {
            BackendError::InvalidRequest(err.to_string())
        } else {
            BackendError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn generate(
        &self,
        prompt: &str,
        existing_files: Option<&FileBundle>,
    ) -> Result<FileBundle, BackendError> {
        let body = GenerateBody {
            prompt,
            existing_files,
            model: self.config.model.as_deref(),
        };

        let mut request = self.http.post(&self.config.endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let text = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "generation backend returned an error status");
            return Err(classify_status(status.as_u16(), retry_after, &text));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if parsed.files.is_empty() {
            return Err(BackendError::EmptyResult);
        }
        Ok(parsed.files)
    }
}

/// Map a non-success HTTP status to a classified backend error.
pub fn classify_status(status: u16, retry_after: Option<Duration>, body: &str) -> BackendError {
    let message = format!("HTTP {status}: {}", truncate(body, MAX_ERROR_BODY));
    match status {
        429 => BackendError::RateLimited {
            message,
            retry_after,
        },
        408 | 500..=599 => BackendError::Unavailable(message),
        401 | 403 => BackendError::Unauthorized(message),
        _ => BackendError::InvalidRequest(message),
    }
}

/// `Retry-After` in its delay-seconds form. HTTP-date values are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
