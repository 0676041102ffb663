//! Pool API sources. Each pool reports its own hashrate and the solutions it had accepted.

use hashrate_stats::{RawReading, SourceId};
use reqwest::header::HeaderMap;
use serde_json::Value;

use super::{endpoint, number_at, FetchError, FetchErrorKind, HashrateSource, HttpFetcher};

pub struct ApoolSource {
    http: HttpFetcher,
    base_url: String,
}

impl ApoolSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn parse(body: &Value) -> Result<RawReading, FetchErrorKind> {
        let result = body
            .get("result")
            .filter(|r| r.is_object())
            .ok_or_else(|| FetchErrorKind::Malformed("missing result object".into()))?;

        Ok(RawReading {
            source_id: SourceId::Apool,
            raw_value: number_at(result, &["pool_hash"]),
            accepted_units: number_at(result, &["accepted_solution"]),
            total_units: None,
            share_units: number_at(result, &["total_share"]),
        })
    }
}

#[async_trait::async_trait]
impl HashrateSource for ApoolSource {
    fn source_id(&self) -> SourceId {
        SourceId::Apool
    }

    async fn fetch(&self) -> Result<RawReading, FetchError> {
        let url = endpoint(&self.base_url, "index/pool/info");
        let body = self
            .http
            .get_json(&url, &[("currency", "qubic")], HeaderMap::new())
            .await
            .map_err(|kind| FetchError::new(SourceId::Apool, kind))?;

        Self::parse(&body).map_err(|kind| FetchError::new(SourceId::Apool, kind))
    }
}

pub struct SolutionsSource {
    http: HttpFetcher,
    base_url: String,
}

impl SolutionsSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn parse(body: &Value) -> Result<RawReading, FetchErrorKind> {
        if !body.is_object() {
            return Err(FetchErrorKind::Malformed("info response is not an object".into()));
        }

        // Solo and PPLNS miners share the pool hashrate, so their solutions add up
        let solo = number_at(body, &["solo", "solutions"]);
        let pplns = number_at(body, &["pplns", "solutions"]);
        let accepted_units = match (solo, pplns) {
            (None, None) => None,
            (solo, pplns) => Some(solo.unwrap_or(0.0) + pplns.unwrap_or(0.0)),
        };

        Ok(RawReading {
            source_id: SourceId::Solutions,
            raw_value: number_at(body, &["iterrate"]),
            accepted_units,
            total_units: None,
            share_units: number_at(body, &["pplns", "shares"]),
        })
    }
}

#[async_trait::async_trait]
impl HashrateSource for SolutionsSource {
    fn source_id(&self) -> SourceId {
        SourceId::Solutions
    }

    async fn fetch(&self) -> Result<RawReading, FetchError> {
        let url = endpoint(&self.base_url, "info");
        let body = self
            .http
            .get_json(&url, &[], HeaderMap::new())
            .await
            .map_err(|kind| FetchError::new(SourceId::Solutions, kind))?;

        Self::parse(&body).map_err(|kind| FetchError::new(SourceId::Solutions, kind))
    }
}

pub struct MinerlabSource {
    http: HttpFetcher,
    base_url: String,
}

impl MinerlabSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn parse(body: &Value) -> Result<RawReading, FetchErrorKind> {
        let stats = body
            .as_array()
            .and_then(|rows| rows.first())
            .ok_or_else(|| FetchErrorKind::Malformed("expected a non-empty array".into()))?;

        Ok(RawReading {
            source_id: SourceId::Minerlab,
            raw_value: number_at(stats, &["currentIts"]),
            accepted_units: number_at(stats, &["currentEpochSolutions"]),
            total_units: None,
            share_units: None,
        })
    }
}

#[async_trait::async_trait]
impl HashrateSource for MinerlabSource {
    fn source_id(&self) -> SourceId {
        SourceId::Minerlab
    }

    async fn fetch(&self) -> Result<RawReading, FetchError> {
        let url = endpoint(&self.base_url, "pool_stats");
        let body = self
            .http
            .get_json(&url, &[("select", "*")], HeaderMap::new())
            .await
            .map_err(|kind| FetchError::new(SourceId::Minerlab, kind))?;

        Self::parse(&body).map_err(|kind| FetchError::new(SourceId::Minerlab, kind))
    }
}
