//! Data model shared by the collection engine and its storage.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Length of one aggregation period.
pub const PERIOD_LENGTH_DAYS: i64 = 7;

/// An upstream provider of a hashrate indicator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    /// The central network API (estimated network-wide iterations per second).
    Network,
    Apool,
    Solutions,
    Minerlab,
}

impl SourceId {
    /// Every known source, in reporting order.
    pub const ALL: [SourceId; 4] = [
        SourceId::Network,
        SourceId::Apool,
        SourceId::Solutions,
        SourceId::Minerlab,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Network => "network",
            SourceId::Apool => "apool",
            SourceId::Solutions => "solutions",
            SourceId::Minerlab => "minerlab",
        }
    }

    /// Pool sources report partial-network solution counts and need correction.
    pub fn is_pool(&self) -> bool {
        !matches!(self, SourceId::Network)
    }

    /// Key used for this source in the `average` block of [`NetworkStats`].
    pub fn average_key(&self) -> String {
        format!("average_{}", self.as_str())
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSource(pub String);

impl fmt::Display for UnknownSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown source: {}", self.0)
    }
}

impl std::error::Error for UnknownSource {}

impl FromStr for SourceId {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| UnknownSource(s.to_string()))
    }
}

/// One raw indicator fetched from one source during a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    pub source_id: SourceId,

    /// Value as reported upstream; `None` when the source had nothing to report
    pub raw_value: Option<f64>,

    /// Solutions accepted by a pool in the current interval
    pub accepted_units: Option<f64>,

    /// Solutions accepted network-wide in the same interval (network source only)
    pub total_units: Option<f64>,

    /// Shares submitted to a pool in the current interval, when the pool reports them
    #[serde(default)]
    pub share_units: Option<f64>,
}

impl RawReading {
    /// A reading with no value at all, used when a fetch failed.
    pub fn missing(source_id: SourceId) -> Self {
        Self {
            source_id,
            raw_value: None,
            accepted_units: None,
            total_units: None,
            share_units: None,
        }
    }

    /// Average shares a pool needed per accepted solution.
    pub fn shares_per_solution(&self) -> Option<f64> {
        match (self.share_units, self.accepted_units) {
            (Some(shares), Some(accepted)) if accepted > 0.0 => Some((shares / accepted).floor()),
            _ => None,
        }
    }
}

/// What one source reported during a cycle and the hashrate derived from it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceDetail {
    #[serde(flatten)]
    pub reading: RawReading,
    pub shares_per_solution: Option<f64>,
    /// Comparable hashrate before validation; `None` when the fetch failed
    pub corrected_hashrate: Option<f64>,
}

impl SourceDetail {
    pub fn new(reading: RawReading, corrected_hashrate: Option<f64>) -> Self {
        Self {
            shares_per_solution: reading.shares_per_solution(),
            reading,
            corrected_hashrate,
        }
    }
}

/// A comparable hashrate for one source, before validation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrectedSample {
    pub source_id: SourceId,
    pub value: f64,
    /// True when the source reported no activity (zero or missing value).
    pub was_idle: bool,
}

impl CorrectedSample {
    pub fn new(source_id: SourceId, value: f64) -> Self {
        Self {
            source_id,
            value,
            was_idle: value <= 0.0,
        }
    }

    pub fn idle(source_id: SourceId) -> Self {
        Self {
            source_id,
            value: 0.0,
            was_idle: true,
        }
    }
}

/// The persisted outcome of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatRecord {
    pub timestamp: DateTime<Utc>,
    pub period_start: DateTime<Utc>,
    /// Accepted value per source; `None` when rejected or idle
    pub values: BTreeMap<SourceId, Option<f64>>,
    /// Whether every source was idle during the cycle
    pub was_idle: bool,
}

impl StatRecord {
    pub fn value(&self, source_id: SourceId) -> Option<f64> {
        self.values.get(&source_id).copied().flatten()
    }

    /// True if at least one source has a stored value.
    pub fn has_any_value(&self) -> bool {
        self.values.values().any(Option::is_some)
    }

    pub fn is_within_period(&self) -> bool {
        self.timestamp >= self.period_start
            && self.timestamp < self.period_start + Duration::days(PERIOD_LENGTH_DAYS)
    }
}

/// Averages over the current period, serialized as `average_<source>` keys next to `record_count`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AverageStats {
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
    pub record_count: u64,
}

impl AverageStats {
    pub fn get(&self, source_id: SourceId) -> Option<f64> {
        self.values.get(&source_id.average_key()).copied()
    }
}

/// Current and average hashrate per source for one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub period_start: DateTime<Utc>,
    pub current: BTreeMap<SourceId, f64>,
    pub average: AverageStats,
}

/// Final aggregate of a period that is no longer current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodSnapshot {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub stats: NetworkStats,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Info,
    Skip,
    Warning,
    Validation,
    Error,
    Success,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Info => "info",
            EventType::Skip => "skip",
            EventType::Warning => "warning",
            EventType::Validation => "validation",
            EventType::Error => "error",
            EventType::Success => "success",
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(EventType::Info),
            "skip" => Ok(EventType::Skip),
            "warning" => Ok(EventType::Warning),
            "validation" => Ok(EventType::Validation),
            "error" => Ok(EventType::Error),
            "success" => Ok(EventType::Success),
            other => Err(format!("unknown event type: {}", other)),
        }
    }
}

/// A durable, queryable collection event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub period_start: DateTime<Utc>,
    pub event_type: EventType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}
