use std::sync::Arc;
use std::time::Duration;

use hashrate_stats::{RawReading, SourceId};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{FetchError, HashrateSource};

/// Serves the last successful reading of the wrapped source for `ttl`.
///
/// Failures are never cached. A zero `ttl` disables caching.
pub struct CachedSource {
    inner: Arc<dyn HashrateSource>,
    ttl: Duration,
    last: Mutex<Option<(Instant, RawReading)>>,
}

impl CachedSource {
    pub fn new(inner: Arc<dyn HashrateSource>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            last: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl HashrateSource for CachedSource {
    fn source_id(&self) -> SourceId {
        self.inner.source_id()
    }

    async fn fetch(&self) -> Result<RawReading, FetchError> {
        if self.ttl.is_zero() {
            return self.inner.fetch().await;
        }

        let mut last = self.last.lock().await;
        if let Some((fetched_at, reading)) = last.as_ref() {
            if fetched_at.elapsed() < self.ttl {
                debug!("Serving cached {} reading", self.inner.source_id());
                return Ok(reading.clone());
            }
        }

        let reading = self.inner.fetch().await?;
        *last = Some((Instant::now(), reading.clone()));
        Ok(reading)
    }
}
