use std::sync::Arc;
use std::time::Duration;

use hashrate_stats::{RawReading, SourceId};
use tracing::warn;

use super::{FetchError, HashrateSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_secs(2),
        }
    }
}

/// Retries transient failures of the wrapped source with a fixed delay.
pub struct RetryingSource {
    inner: Arc<dyn HashrateSource>,
    policy: RetryPolicy,
}

impl RetryingSource {
    pub fn new(inner: Arc<dyn HashrateSource>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait::async_trait]
impl HashrateSource for RetryingSource {
    fn source_id(&self) -> SourceId {
        self.inner.source_id()
    }

    async fn fetch(&self) -> Result<RawReading, FetchError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.inner.fetch().await {
                Ok(reading) => return Ok(reading),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!(
                        "Attempt {}/{} failed: {}, retrying in {:?}",
                        attempt, max_attempts, e, self.policy.backoff_delay
                    );
                    tokio::time::sleep(self.policy.backoff_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
