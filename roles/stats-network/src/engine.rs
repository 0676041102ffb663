//! The collection cycle.
//!
//! One cycle fetches every source, corrects pool readings, validates each sample
//! against the source's accepted history in the current period, persists one
//! [`StatRecord`] and returns the refreshed current/average figures.
//!
//! Per-source faults never escalate, a panicking fetch task included. Only storage
//! failures fail the cycle as a whole.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hashrate_stats::{
    correct_hashrate, sanitize_hashrate, summarize, CorrectedSample, EventType, LogEntry,
    NetworkStats, PeriodManager, PeriodTransition, RawReading, SampleValidator, SourceDetail,
    SourceId, StatRecord, StatsRepository, StorageError, Verdict, DEFAULT_THRESHOLD,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::sources::{FetchError, FetchErrorKind, HashrateSource};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("storage failure: {0}")]
    Persistence(#[from] StorageError),
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Upper bound for one source fetch, retries included
    pub fetch_timeout: Duration,
    pub validation_threshold: f64,
    /// A cycle is skipped when the latest record is younger than this
    pub min_record_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            validation_threshold: DEFAULT_THRESHOLD,
            min_record_interval: Duration::from_secs(240),
        }
    }
}

/// What happened to one source during a cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    Accepted(f64),
    Rejected { value: f64, average: f64 },
    Idle,
    FetchFailed(String),
    /// The sample could not be validated because its history was unreadable.
    Dropped(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Recorded(StatRecord),
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleResult {
    pub timestamp: DateTime<Utc>,
    pub period_start: DateTime<Utc>,
    pub outcome: CycleOutcome,
    pub samples: BTreeMap<SourceId, SampleStatus>,
    /// Raw inputs and corrected hashrate per source; empty when skipped
    pub readings: BTreeMap<SourceId, SourceDetail>,
    pub stats: NetworkStats,
}

pub struct AggregationEngine {
    sources: Vec<Arc<dyn HashrateSource>>,
    repository: Arc<dyn StatsRepository>,
    periods: PeriodManager,
    validator: SampleValidator,
    settings: EngineSettings,
    cycle_lock: Mutex<()>,
}

impl AggregationEngine {
    pub fn new(
        sources: Vec<Arc<dyn HashrateSource>>,
        repository: Arc<dyn StatsRepository>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            sources,
            repository,
            periods: PeriodManager::new(),
            validator: SampleValidator::new(settings.validation_threshold),
            settings,
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn repository(&self) -> &Arc<dyn StatsRepository> {
        &self.repository
    }

    pub async fn run_cycle(&self) -> Result<CycleResult, CycleError> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one cycle as if the wall clock read `now`.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleResult, CycleError> {
        let _cycle = self.cycle_lock.lock().await;
        let period = self.periods.current_period(now);

        if let Some(reason) = self.skip_reason(now, period.start).await? {
            info!("Skipping cycle: {}", reason);
            self.log(now, period.start, EventType::Skip, &reason, None).await;
            return Ok(CycleResult {
                timestamp: now,
                period_start: period.start,
                outcome: CycleOutcome::Skipped { reason },
                samples: BTreeMap::new(),
                readings: BTreeMap::new(),
                stats: self.stats_for(period.start).await?,
            });
        }

        // FETCHING
        let readings = self.fetch_all().await;

        // CORRECTING
        let mut samples = BTreeMap::new();
        let mut statuses = BTreeMap::new();
        let mut details = BTreeMap::new();
        let network_total = readings
            .get(&SourceId::Network)
            .and_then(|r| r.as_ref().ok())
            .and_then(|r| r.total_units);

        for (source_id, reading) in &readings {
            let reading = match reading {
                Ok(reading) => reading,
                Err(e) => {
                    warn!("{}", e);
                    self.log(
                        now,
                        period.start,
                        EventType::Error,
                        &format!("Failed to fetch {} data", source_id),
                        Some(json!({ "source": source_id, "error": e.kind.to_string() })),
                    )
                    .await;
                    statuses.insert(*source_id, SampleStatus::FetchFailed(e.kind.to_string()));
                    samples.insert(*source_id, CorrectedSample::idle(*source_id));
                    details.insert(
                        *source_id,
                        SourceDetail::new(RawReading::missing(*source_id), None),
                    );
                    continue;
                }
            };

            let correction = if source_id.is_pool() {
                correct_hashrate(reading.raw_value, reading.accepted_units, network_total)
            } else {
                sanitize_hashrate(reading.raw_value)
            };
            if let Some(anomaly) = correction.anomaly {
                self.log(
                    now,
                    period.start,
                    EventType::Warning,
                    &format!("{} hashrate anomaly: {}", source_id, anomaly),
                    Some(json!({ "source": source_id, "reading": reading })),
                )
                .await;
            }
            samples.insert(*source_id, CorrectedSample::new(*source_id, correction.value));
            details.insert(
                *source_id,
                SourceDetail::new(reading.clone(), Some(correction.value)),
            );
        }

        // VALIDATING, against history read before this cycle's record exists
        let history = match self.repository.query(period.start, None).await {
            Ok(records) => Ok(records),
            Err(e) => {
                warn!("Failed to read history for validation: {}", e);
                Err(e.to_string())
            }
        };

        let mut values = BTreeMap::new();
        for (source_id, sample) in &samples {
            if statuses.contains_key(source_id) {
                values.insert(*source_id, None);
                continue;
            }

            let records = match &history {
                Ok(records) => records,
                Err(reason) if !sample.was_idle => {
                    statuses.insert(
                        *source_id,
                        SampleStatus::Dropped(format!("history unavailable: {}", reason)),
                    );
                    values.insert(*source_id, None);
                    continue;
                }
                Err(_) => {
                    statuses.insert(*source_id, SampleStatus::Idle);
                    values.insert(*source_id, None);
                    continue;
                }
            };

            let previous: Vec<f64> = records.iter().filter_map(|r| r.value(*source_id)).collect();
            match self.validator.validate(sample, &previous) {
                Verdict::Accepted(value) => {
                    statuses.insert(*source_id, SampleStatus::Accepted(value));
                    values.insert(*source_id, Some(value));
                }
                Verdict::Rejected { value, average } => {
                    self.log(
                        now,
                        period.start,
                        EventType::Validation,
                        &format!("Rejected {} value {:.2}", source_id, value),
                        Some(json!({
                            "source": source_id,
                            "value": value,
                            "average": average,
                            "threshold": self.validator.threshold(),
                            "reading": readings.get(source_id).and_then(|r| r.as_ref().ok()),
                            "network_total_units": network_total,
                        })),
                    )
                    .await;
                    statuses.insert(*source_id, SampleStatus::Rejected { value, average });
                    values.insert(*source_id, None);
                }
                Verdict::Idle => {
                    debug!("{} is idle", source_id);
                    statuses.insert(*source_id, SampleStatus::Idle);
                    values.insert(*source_id, None);
                }
            }
        }

        // PERSISTING
        let transition = self.periods.roll_over(self.repository.as_ref(), now).await?;
        if let PeriodTransition::Crossed { previous, current } = transition {
            self.log(
                now,
                current.start,
                EventType::Info,
                "New period started",
                Some(json!({ "previous_period_start": previous.start })),
            )
            .await;
        }

        let record = StatRecord {
            timestamp: now,
            period_start: period.start,
            was_idle: samples.values().all(|s| s.was_idle),
            values,
        };
        self.repository.append(&record).await?;

        // AGGREGATING
        let stats = self.stats_for(period.start).await?;

        info!(
            "Cycle complete: {} accepted, {} records in period",
            statuses
                .values()
                .filter(|s| matches!(s, SampleStatus::Accepted(_)))
                .count(),
            stats.average.record_count
        );
        self.log(
            now,
            period.start,
            EventType::Success,
            "Stats recorded",
            Some(json!({ "values": record.values, "was_idle": record.was_idle })),
        )
        .await;

        Ok(CycleResult {
            timestamp: now,
            period_start: period.start,
            outcome: CycleOutcome::Recorded(record),
            samples: statuses,
            readings: details,
            stats,
        })
    }

    pub async fn get_current_and_average(&self) -> Result<NetworkStats, StorageError> {
        self.get_current_and_average_at(Utc::now()).await
    }

    /// Read-only; never fetches.
    pub async fn get_current_and_average_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<NetworkStats, StorageError> {
        self.stats_for(self.periods.current_period(now).start).await
    }

    /// Most recent first.
    pub async fn get_recent_logs(&self, limit: usize) -> Result<Vec<LogEntry>, StorageError> {
        self.repository.recent_logs(limit).await
    }

    async fn stats_for(&self, period_start: DateTime<Utc>) -> Result<NetworkStats, StorageError> {
        let records = self.repository.query(period_start, None).await?;
        Ok(summarize(period_start, &records))
    }

    async fn skip_reason(
        &self,
        now: DateTime<Utc>,
        period_start: DateTime<Utc>,
    ) -> Result<Option<String>, StorageError> {
        if self.settings.min_record_interval.is_zero() {
            return Ok(None);
        }
        let Some(latest) = self.repository.latest_record().await? else {
            return Ok(None);
        };
        // A record from an earlier period never blocks the first record of a new one
        if latest.period_start != period_start {
            return Ok(None);
        }

        let age = (now - latest.timestamp).to_std().unwrap_or(Duration::ZERO);
        if age < self.settings.min_record_interval {
            Ok(Some(format!(
                "last record is {}s old, minimum interval is {}s",
                age.as_secs(),
                self.settings.min_record_interval.as_secs()
            )))
        } else {
            Ok(None)
        }
    }

    async fn fetch_all(&self) -> BTreeMap<SourceId, Result<RawReading, FetchError>> {
        let mut tasks = JoinSet::new();
        for source in &self.sources {
            let source = Arc::clone(source);
            let timeout = self.settings.fetch_timeout;
            tasks.spawn(async move {
                let source_id = source.source_id();
                let result = match tokio::time::timeout(timeout, source.fetch()).await {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::new(
                        source_id,
                        FetchErrorKind::Transient(format!("timed out after {:?}", timeout)),
                    )),
                };
                (source_id, result)
            });
        }

        let mut readings = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((source_id, result)) => {
                    readings.insert(source_id, result);
                }
                Err(e) => error!("Fetch task failed: {}", e),
            }
        }

        // A task that panicked never reported back; its source counts as a failed fetch
        for source in &self.sources {
            let source_id = source.source_id();
            readings.entry(source_id).or_insert_with(|| {
                Err(FetchError::new(
                    source_id,
                    FetchErrorKind::Transient("fetch task panicked".to_string()),
                ))
            });
        }
        readings
    }

    async fn log(
        &self,
        now: DateTime<Utc>,
        period_start: DateTime<Utc>,
        event_type: EventType,
        message: &str,
        data: Option<serde_json::Value>,
    ) {
        let entry = LogEntry {
            timestamp: now,
            period_start,
            event_type,
            message: message.to_string(),
            data,
        };
        if let Err(e) = self.repository.append_log(&entry).await {
            warn!("Failed to write {} log entry: {}", event_type.as_str(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hashrate_stats::SqliteStorage;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// Returns the next queued response on every fetch.
    struct ScriptedSource {
        source_id: SourceId,
        responses: StdMutex<Vec<Result<RawReading, FetchError>>>,
    }

    impl ScriptedSource {
        fn new(
            source_id: SourceId,
            mut responses: Vec<Result<RawReading, FetchError>>,
        ) -> Arc<dyn HashrateSource> {
            responses.reverse();
            Arc::new(Self {
                source_id,
                responses: StdMutex::new(responses),
            })
        }
    }

    #[async_trait::async_trait]
    impl HashrateSource for ScriptedSource {
        fn source_id(&self) -> SourceId {
            self.source_id
        }

        async fn fetch(&self) -> Result<RawReading, FetchError> {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(RawReading::missing(self.source_id)))
        }
    }

    struct SlowSource;

    #[async_trait::async_trait]
    impl HashrateSource for SlowSource {
        fn source_id(&self) -> SourceId {
            SourceId::Minerlab
        }

        async fn fetch(&self) -> Result<RawReading, FetchError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(RawReading::missing(SourceId::Minerlab))
        }
    }

    struct PanickingSource;

    #[async_trait::async_trait]
    impl HashrateSource for PanickingSource {
        fn source_id(&self) -> SourceId {
            SourceId::Minerlab
        }

        async fn fetch(&self) -> Result<RawReading, FetchError> {
            let rows: Vec<RawReading> = Vec::new();
            Ok(rows[3].clone())
        }
    }

    fn network(raw: f64) -> Result<RawReading, FetchError> {
        Ok(RawReading {
            source_id: SourceId::Network,
            raw_value: Some(raw),
            accepted_units: None,
            total_units: Some(1000.0),
            share_units: None,
        })
    }

    fn at(minute: u32) -> DateTime<Utc> {
        // Thursday inside the period starting 2024-01-10 12:00
        Utc.with_ymd_and_hms(2024, 1, 11, 8, minute, 0).unwrap()
    }

    async fn engine(
        temp_dir: &TempDir,
        sources: Vec<Arc<dyn HashrateSource>>,
        settings: EngineSettings,
    ) -> AggregationEngine {
        let storage = SqliteStorage::new(temp_dir.path().join("engine.db")).await.unwrap();
        AggregationEngine::new(sources, Arc::new(storage), settings)
    }

    fn no_interval() -> EngineSettings {
        EngineSettings {
            min_record_interval: Duration::ZERO,
            ..EngineSettings::default()
        }
    }

    #[tokio::test]
    async fn test_rejected_sample_is_stored_as_null() {
        let temp_dir = TempDir::new().unwrap();
        let source = ScriptedSource::new(
            SourceId::Network,
            vec![network(100.0), network(100.0), network(151.0), network(150.0)],
        );
        let engine = engine(&temp_dir, vec![source], no_interval()).await;

        for minute in [0, 5] {
            engine.run_cycle_at(at(minute)).await.unwrap();
        }

        let rejected = engine.run_cycle_at(at(10)).await.unwrap();
        assert_eq!(
            rejected.samples[&SourceId::Network],
            SampleStatus::Rejected {
                value: 151.0,
                average: 100.0
            }
        );
        match &rejected.outcome {
            CycleOutcome::Recorded(record) => assert_eq!(record.value(SourceId::Network), None),
            other => panic!("expected a record, got {:?}", other),
        }

        let accepted = engine.run_cycle_at(at(15)).await.unwrap();
        assert_eq!(accepted.samples[&SourceId::Network], SampleStatus::Accepted(150.0));

        let logs = engine.get_recent_logs(20).await.unwrap();
        let rejection = logs
            .iter()
            .find(|l| l.event_type == EventType::Validation)
            .unwrap();
        let data = rejection.data.as_ref().unwrap();
        assert_eq!(data["value"], 151.0);
        assert_eq!(data["reading"]["raw_value"], 151.0);
        assert_eq!(data["reading"]["total_units"], 1000.0);
        assert_eq!(data["network_total_units"], 1000.0);
    }

    #[tokio::test]
    async fn test_cycle_skipped_within_min_interval() {
        let temp_dir = TempDir::new().unwrap();
        let source = ScriptedSource::new(SourceId::Network, vec![network(100.0), network(100.0)]);
        let engine = engine(&temp_dir, vec![source], EngineSettings::default()).await;

        let first = engine.run_cycle_at(at(0)).await.unwrap();
        assert!(matches!(first.outcome, CycleOutcome::Recorded(_)));

        let second = engine.run_cycle_at(at(2)).await.unwrap();
        assert!(matches!(second.outcome, CycleOutcome::Skipped { .. }));
        assert!(second.samples.is_empty());
        assert_eq!(second.stats.average.record_count, 1);

        let third = engine.run_cycle_at(at(4)).await.unwrap();
        assert!(matches!(third.outcome, CycleOutcome::Recorded(_)));

        let logs = engine.get_recent_logs(10).await.unwrap();
        assert!(logs.iter().any(|l| l.event_type == EventType::Skip));
    }

    #[tokio::test]
    async fn test_pool_corrected_with_network_total() {
        let temp_dir = TempDir::new().unwrap();
        let network = ScriptedSource::new(SourceId::Network, vec![network(500.0)]);
        let apool = ScriptedSource::new(
            SourceId::Apool,
            vec![Ok(RawReading {
                source_id: SourceId::Apool,
                raw_value: Some(20.0),
                accepted_units: Some(10.0),
                total_units: None,
                share_units: None,
            })],
        );
        let engine = engine(&temp_dir, vec![network, apool], no_interval()).await;

        let result = engine.run_cycle_at(at(0)).await.unwrap();
        assert_eq!(result.samples[&SourceId::Apool], SampleStatus::Accepted(2000.0));
        assert_eq!(result.stats.current[&SourceId::Apool], 2000.0);
        assert_eq!(result.stats.current[&SourceId::Network], 500.0);

        let detail = &result.readings[&SourceId::Apool];
        assert_eq!(detail.reading.raw_value, Some(20.0));
        assert_eq!(detail.reading.accepted_units, Some(10.0));
        assert_eq!(detail.corrected_hashrate, Some(2000.0));
        assert_eq!(
            result.readings[&SourceId::Network].reading.total_units,
            Some(1000.0)
        );
    }

    #[tokio::test]
    async fn test_slow_source_times_out() {
        let temp_dir = TempDir::new().unwrap();
        let network = ScriptedSource::new(SourceId::Network, vec![network(500.0)]);
        let settings = EngineSettings {
            fetch_timeout: Duration::from_millis(50),
            ..no_interval()
        };
        let slow: Arc<dyn HashrateSource> = Arc::new(SlowSource);
        let engine = engine(&temp_dir, vec![network, slow], settings).await;

        let result = engine.run_cycle_at(at(0)).await.unwrap();
        assert!(matches!(
            result.samples[&SourceId::Minerlab],
            SampleStatus::FetchFailed(_)
        ));
        assert_eq!(result.samples[&SourceId::Network], SampleStatus::Accepted(500.0));
    }

    #[tokio::test]
    async fn test_panicking_source_does_not_block_others() {
        let temp_dir = TempDir::new().unwrap();
        let network = ScriptedSource::new(SourceId::Network, vec![network(500.0)]);
        let broken: Arc<dyn HashrateSource> = Arc::new(PanickingSource);
        let engine = engine(&temp_dir, vec![network, broken], no_interval()).await;

        let result = engine.run_cycle_at(at(0)).await.unwrap();
        assert!(matches!(
            &result.samples[&SourceId::Minerlab],
            SampleStatus::FetchFailed(reason) if reason.contains("panicked")
        ));
        assert_eq!(result.samples[&SourceId::Network], SampleStatus::Accepted(500.0));
        assert_eq!(result.readings[&SourceId::Minerlab].corrected_hashrate, None);
        match &result.outcome {
            CycleOutcome::Recorded(record) => {
                assert_eq!(record.value(SourceId::Network), Some(500.0));
                assert_eq!(record.value(SourceId::Minerlab), None);
            }
            other => panic!("expected a record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_all_idle_cycle_is_flagged() {
        let temp_dir = TempDir::new().unwrap();
        let network = ScriptedSource::new(SourceId::Network, vec![network(0.0)]);
        let engine = engine(&temp_dir, vec![network], no_interval()).await;

        let result = engine.run_cycle_at(at(0)).await.unwrap();
        assert_eq!(result.samples[&SourceId::Network], SampleStatus::Idle);
        match result.outcome {
            CycleOutcome::Recorded(record) => {
                assert!(record.was_idle);
                assert!(!record.has_any_value());
            }
            other => panic!("expected a record, got {:?}", other),
        }
        assert_eq!(result.stats.average.record_count, 0);
    }
}
