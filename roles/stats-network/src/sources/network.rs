//! Network API source: estimated network hashrate and total accepted solutions.

use std::sync::Arc;

use hashrate_stats::{RawReading, SourceId};
use serde_json::Value;

use super::{endpoint, number_at, FetchError, FetchErrorKind, HashrateSource, HttpFetcher};
use crate::credentials::CredentialProvider;

pub struct NetworkSource {
    http: HttpFetcher,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl NetworkSource {
    pub fn new(
        http: HttpFetcher,
        base_url: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            credentials,
        }
    }

    fn parse(body: &Value) -> Result<RawReading, FetchErrorKind> {
        if !body.is_object() {
            return Err(FetchErrorKind::Malformed("score response is not an object".into()));
        }

        // Network-wide accepted solutions are the sum of every identity's admin score
        let total_units = body.get("scores").and_then(Value::as_array).map(|scores| {
            scores
                .iter()
                .filter_map(|score| number_at(score, &["adminScore"]))
                .sum::<f64>()
        });

        Ok(RawReading {
            source_id: SourceId::Network,
            raw_value: number_at(body, &["estimatedIts"]),
            accepted_units: None,
            total_units,
            share_units: None,
        })
    }
}

#[async_trait::async_trait]
impl HashrateSource for NetworkSource {
    fn source_id(&self) -> SourceId {
        SourceId::Network
    }

    async fn fetch(&self) -> Result<RawReading, FetchError> {
        let headers = self.credentials.auth_headers().await.map_err(|e| {
            FetchError::new(SourceId::Network, FetchErrorKind::Unauthorized(e.to_string()))
        })?;

        let url = endpoint(&self.base_url, "Score/Get");
        let body = self
            .http
            .get_json(&url, &[], headers)
            .await
            .map_err(|kind| FetchError::new(SourceId::Network, kind))?;

        Self::parse(&body).map_err(|kind| FetchError::new(SourceId::Network, kind))
    }
}
