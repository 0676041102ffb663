//! Hashrate statistics for the network stats service.
//!
//! This crate provides the shared data model, the pool hashrate correction,
//! outlier validation, the weekly period rules, and the storage abstraction
//! used by the collection engine.

pub mod metrics;
pub mod storage;
pub mod types;
pub mod validation;
pub mod windowing;

pub use metrics::{correct_hashrate, sanitize_hashrate, summarize, Correction, CorrectionAnomaly};
pub use storage::{SqliteStorage, StatsRepository, StorageError};
pub use types::{
    AverageStats, CorrectedSample, EventType, LogEntry, NetworkStats, PeriodSnapshot, RawReading,
    SourceDetail, SourceId, StatRecord,
};
pub use validation::{is_valid_hashrate, SampleValidator, Verdict, DEFAULT_THRESHOLD};
pub use windowing::{period_start_for, Period, PeriodManager, PeriodTransition};

#[cfg(test)]
mod tests {
    use crate::{correct_hashrate, is_valid_hashrate, DEFAULT_THRESHOLD};

    #[test]
    fn test_corrected_pool_passes_validation_against_itself() {
        // A pool holding a steady share of network solutions corrects to the same value
        let first = correct_hashrate(Some(1000.0), Some(100.0), Some(500_000.0)).value;
        let second = correct_hashrate(Some(1100.0), Some(110.0), Some(500_000.0)).value;
        assert_eq!(first, second);
        assert!(is_valid_hashrate(second, &[first], DEFAULT_THRESHOLD));
    }
}
