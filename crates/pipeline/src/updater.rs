//! Downstream field writes.
//!
//! [`HttpRecordUpdater`] issues one `PUT {base}/records/{record_id}/fields/{field_id}`
//! per write with a bearer token, and classifies the response into an
//! [`UpdateError`] the pipeline can act on.

use std::time::Duration;

use async_trait::async_trait;
use bulkedit_core::fields::FieldValue;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{StatusCode, Url};

use crate::error::UpdateError;

/// A single typed write to one field of a downstream record.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldWrite {
    pub field_id: String,
    pub value: FieldValue,
}

/// Applies field writes to downstream records.
///
/// Implementations must be safe to call concurrently; the pipeline
/// serialises calls per job but several jobs may share one updater.
#[async_trait]
pub trait RecordUpdater: Send + Sync {
    async fn update_field(&self, record_id: &str, write: &FieldWrite) -> Result<(), UpdateError>;
}

#[derive(Debug, thiserror::Error)]
pub enum UpdaterBuildError {
    #[error("Invalid downstream base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// REST client for the downstream record service.
pub struct HttpRecordUpdater {
    client: reqwest::Client,
    base_url: Url,
    token: String,
}

impl std::fmt::Debug for HttpRecordUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRecordUpdater")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl HttpRecordUpdater {
    /// Create an updater for `base_url`, authenticating with `token`.
    ///
    /// `timeout` bounds each request; a timed-out request is a transient
    /// failure.
    pub fn new(base_url: &str, token: String, timeout: Duration) -> Result<Self, UpdaterBuildError> {
        let parsed = Url::parse(base_url).map_err(|e| UpdaterBuildError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        if parsed.cannot_be_a_base() {
            return Err(UpdaterBuildError::InvalidBaseUrl {
                url: base_url.to_string(),
                reason: "URL cannot be a base".to_string(),
            });
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: parsed,
            token,
        })
    }

    /// Build the write URL; ids are percent-encoded as path segments.
    fn field_url(&self, record_id: &str, field_id: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["records", record_id, "fields", field_id]);
        }
        url
    }
}

#[async_trait]
impl RecordUpdater for HttpRecordUpdater {
    async fn update_field(&self, record_id: &str, write: &FieldWrite) -> Result<(), UpdateError> {
        let body = serde_json::json!({ "value": write.value });

        let response = self
            .client
            .put(self.field_url(record_id, &write.field_id))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| UpdateError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let retry_after = parse_retry_after(response.headers());
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        Err(classify_status(status, retry_after, body))
    }
}

/// Map a non-2xx response to the failure class the pipeline acts on.
pub fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: String,
) -> UpdateError {
    let detail = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", body.trim())
    };

    match status {
        StatusCode::TOO_MANY_REQUESTS => UpdateError::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => UpdateError::Unauthorized(detail),
        StatusCode::NOT_FOUND => UpdateError::NotFound(detail),
        StatusCode::REQUEST_TIMEOUT => UpdateError::Transient(detail),
        s if s.is_server_error() => UpdateError::Transient(detail),
        _ => UpdateError::Rejected(detail),
    }
}

/// `Retry-After` in delta-seconds form.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
