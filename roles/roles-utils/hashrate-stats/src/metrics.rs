//! Metrics calculation utilities.

use crate::types::{AverageStats, NetworkStats, SourceId, StatRecord};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// A non-fatal problem found while correcting a hashrate. The value is clamped to zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CorrectionAnomaly {
    /// An input (or the result) was negative.
    Negative { input: &'static str, value: f64 },
    /// An input (or the result) was NaN or infinite.
    NonFinite { input: &'static str },
}

impl fmt::Display for CorrectionAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrectionAnomaly::Negative { input, value } => {
                write!(f, "negative {} ({}) clamped to 0", input, value)
            }
            CorrectionAnomaly::NonFinite { input } => {
                write!(f, "non-finite {} clamped to 0", input)
            }
        }
    }
}

/// Result of a correction: the usable value plus whatever had to be clamped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    pub value: f64,
    pub anomaly: Option<CorrectionAnomaly>,
}

impl Correction {
    fn clean(value: f64) -> Self {
        Self {
            value,
            anomaly: None,
        }
    }

    fn clamped(anomaly: CorrectionAnomaly) -> Self {
        tracing::warn!("Hashrate correction anomaly: {}", anomaly);
        Self {
            value: 0.0,
            anomaly: Some(anomaly),
        }
    }
}

fn check_input(input: &'static str, value: f64) -> Result<f64, CorrectionAnomaly> {
    if !value.is_finite() {
        Err(CorrectionAnomaly::NonFinite { input })
    } else if value < 0.0 {
        Err(CorrectionAnomaly::Negative { input, value })
    } else {
        Ok(value)
    }
}

/// Clamp a pass-through hashrate (the network source) to a finite, non-negative value.
pub fn sanitize_hashrate(value: Option<f64>) -> Correction {
    match value {
        None => Correction::clean(0.0),
        Some(v) => match check_input("hashrate", v) {
            Ok(v) => Correction::clean(v),
            Err(anomaly) => Correction::clamped(anomaly),
        },
    }
}

/// Rescale a pool's raw hashrate by its share of network-wide accepted solutions.
///
/// # Formula
///
/// corrected = pool_raw / pool_accepted * network_total
///
/// A pool with no accepted solutions (or any missing input) is idle and corrects to `0`.
/// Negative or non-finite inputs are clamped to `0` and reported as an anomaly.
pub fn correct_hashrate(
    pool_raw: Option<f64>,
    pool_accepted: Option<f64>,
    network_total: Option<f64>,
) -> Correction {
    let (Some(raw), Some(accepted), Some(total)) = (pool_raw, pool_accepted, network_total) else {
        return Correction::clean(0.0);
    };

    let checked = check_input("pool hashrate", raw)
        .and_then(|raw| Ok((raw, check_input("accepted solutions", accepted)?)))
        .and_then(|(raw, accepted)| Ok((raw, accepted, check_input("network solutions", total)?)));

    let (raw, accepted, total) = match checked {
        Ok(inputs) => inputs,
        Err(anomaly) => return Correction::clamped(anomaly),
    };

    if accepted == 0.0 {
        return Correction::clean(0.0);
    }

    let corrected = raw / accepted * total;
    match check_input("corrected hashrate", corrected) {
        Ok(v) => Correction::clean(v),
        Err(anomaly) => Correction::clamped(anomaly),
    }
}

/// Compute current and average hashrate per source over the records of one period.
///
/// `current` is the latest non-null value per source (`0` if never seen). Averages only
/// include non-null values; `record_count` counts records that contributed to any average.
pub fn summarize(period_start: DateTime<Utc>, records: &[StatRecord]) -> NetworkStats {
    let mut current = BTreeMap::new();
    let mut sums: BTreeMap<SourceId, (f64, u64)> = BTreeMap::new();
    let mut record_count = 0u64;

    for record in records {
        if record.has_any_value() {
            record_count += 1;
        }
        for (source_id, value) in &record.values {
            if let Some(v) = value {
                current.insert(*source_id, *v);
                let entry = sums.entry(*source_id).or_insert((0.0, 0));
                entry.0 += v;
                entry.1 += 1;
            }
        }
    }

    let mut values = BTreeMap::new();
    for source_id in SourceId::ALL {
        current.entry(source_id).or_insert(0.0);
        let average = match sums.get(&source_id) {
            Some((sum, count)) if *count > 0 => sum / *count as f64,
            _ => 0.0,
        };
        values.insert(source_id.average_key(), average);
    }

    NetworkStats {
        period_start,
        current,
        average: AverageStats {
            values,
            record_count,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_correct_hashrate_basic() {
        // 1000 / 100 * 500000 = 5,000,000
        let corrected = correct_hashrate(Some(1000.0), Some(100.0), Some(500_000.0));
        assert_eq!(corrected.value, 5_000_000.0);
        assert!(corrected.anomaly.is_none());
    }

    #[test]
    fn test_correct_hashrate_no_accepted_solutions() {
        let corrected = correct_hashrate(Some(1000.0), Some(0.0), Some(500_000.0));
        assert_eq!(corrected.value, 0.0);
        assert!(corrected.anomaly.is_none());
    }

    #[test]
    fn test_correct_hashrate_missing_input() {
        assert_eq!(correct_hashrate(None, Some(10.0), Some(100.0)).value, 0.0);
        assert_eq!(correct_hashrate(Some(10.0), None, Some(100.0)).value, 0.0);
        assert_eq!(correct_hashrate(Some(10.0), Some(10.0), None).value, 0.0);
    }

    #[test]
    fn test_correct_hashrate_negative_clamped() {
        let corrected = correct_hashrate(Some(-1000.0), Some(100.0), Some(500_000.0));
        assert_eq!(corrected.value, 0.0);
        assert!(matches!(
            corrected.anomaly,
            Some(CorrectionAnomaly::Negative { value, .. }) if value == -1000.0
        ));

        let corrected = correct_hashrate(Some(1000.0), Some(-1.0), Some(500_000.0));
        assert_eq!(corrected.value, 0.0);
        assert!(corrected.anomaly.is_some());
    }

    #[test]
    fn test_correct_hashrate_non_finite_clamped() {
        let corrected = correct_hashrate(Some(f64::NAN), Some(100.0), Some(500_000.0));
        assert_eq!(corrected.value, 0.0);
        assert!(matches!(
            corrected.anomaly,
            Some(CorrectionAnomaly::NonFinite { .. })
        ));

        let corrected = correct_hashrate(Some(f64::MAX), Some(f64::MIN_POSITIVE), Some(2.0));
        assert_eq!(corrected.value, 0.0);
        assert!(corrected.anomaly.is_some());
    }

    #[test]
    fn test_sanitize_hashrate() {
        assert_eq!(sanitize_hashrate(Some(42.0)).value, 42.0);
        assert_eq!(sanitize_hashrate(None).value, 0.0);
        let clamped = sanitize_hashrate(Some(-3.0));
        assert_eq!(clamped.value, 0.0);
        assert!(clamped.anomaly.is_some());
    }

    fn record(minutes: i64, values: &[(SourceId, Option<f64>)]) -> StatRecord {
        let period_start = Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap();
        StatRecord {
            timestamp: period_start + Duration::minutes(minutes),
            period_start,
            values: values.iter().copied().collect(),
            was_idle: false,
        }
    }

    #[test]
    fn test_summarize_current_and_average() {
        let period_start = Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap();
        let records = vec![
            record(0, &[(SourceId::Network, Some(100.0)), (SourceId::Apool, Some(10.0))]),
            record(5, &[(SourceId::Network, Some(200.0)), (SourceId::Apool, None)]),
            record(10, &[(SourceId::Network, None), (SourceId::Apool, None)]),
        ];

        let stats = summarize(period_start, &records);

        assert_eq!(stats.current[&SourceId::Network], 200.0);
        assert_eq!(stats.current[&SourceId::Apool], 10.0);
        assert_eq!(stats.current[&SourceId::Minerlab], 0.0);
        assert_eq!(stats.average.get(SourceId::Network), Some(150.0));
        assert_eq!(stats.average.get(SourceId::Apool), Some(10.0));
        assert_eq!(stats.average.get(SourceId::Solutions), Some(0.0));
        // The all-null record contributes to no average
        assert_eq!(stats.average.record_count, 2);
    }

    #[test]
    fn test_summarize_empty() {
        let period_start = Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap();
        let stats = summarize(period_start, &[]);
        assert_eq!(stats.average.record_count, 0);
        for source_id in SourceId::ALL {
            assert_eq!(stats.current[&source_id], 0.0);
        }
    }
}
