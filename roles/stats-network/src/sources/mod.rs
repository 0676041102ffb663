//! Upstream hashrate sources.
//!
//! Each source fetches one raw indicator from one upstream API and absorbs that
//! API's response shape. Ordinary upstream failures come back as [`FetchError`]
//! and never abort a cycle.

pub mod cache;
pub mod network;
pub mod pools;
pub mod retry;

use std::time::Duration;

use hashrate_stats::{RawReading, SourceId};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub use cache::CachedSource;
pub use network::NetworkSource;
pub use pools::{ApoolSource, MinerlabSource, SolutionsSource};
pub use retry::{RetryPolicy, RetryingSource};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchErrorKind {
    /// Connection failure, timeout or 5xx. Worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{source_id} fetch failed: {kind}")]
pub struct FetchError {
    pub source_id: SourceId,
    pub kind: FetchErrorKind,
}

impl FetchError {
    pub fn new(source_id: SourceId, kind: FetchErrorKind) -> Self {
        Self { source_id, kind }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind, FetchErrorKind::Transient(_))
    }
}

/// One upstream provider of a hashrate indicator.
#[async_trait::async_trait]
pub trait HashrateSource: Send + Sync {
    fn source_id(&self) -> SourceId;

    async fn fetch(&self) -> Result<RawReading, FetchError>;
}

/// Shared HTTP client for JSON endpoints.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("stats-network/", env!("CARGO_PKG_VERSION"))),
        );

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// GET `url` and parse the body as JSON.
    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, &str)],
        headers: HeaderMap,
    ) -> Result<Value, FetchErrorKind> {
        debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .query(query)
            .headers(headers)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchErrorKind::Transient(format!("HTTP {}: {}", status.as_u16(), body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchErrorKind::Status {
                status: status.as_u16(),
                body,
            });
        }

        response.json::<Value>().await.map_err(classify_request_error)
    }
}

fn classify_request_error(err: reqwest::Error) -> FetchErrorKind {
    if err.is_decode() {
        FetchErrorKind::Malformed(err.to_string())
    } else {
        FetchErrorKind::Transient(err.to_string())
    }
}

/// Read a numeric field that upstream may send as a number or a numeric string.
pub(crate) fn number_at(value: &Value, path: &[&str]) -> Option<f64> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    match current {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Join a base URL and an endpoint path without doubling slashes.
pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}
