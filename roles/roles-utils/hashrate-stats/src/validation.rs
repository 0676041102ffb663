//! Outlier rejection for newly computed hashrate samples.

use crate::types::CorrectedSample;

/// Maximum allowed deviation from the rolling mean, as a fraction of that mean.
pub const DEFAULT_THRESHOLD: f64 = 0.5;

/// Check whether `current_value` is plausible given previously accepted values.
///
/// With no history every value is valid. Otherwise the value must lie within
/// `mean(previous_values) * threshold` of the mean.
pub fn is_valid_hashrate(current_value: f64, previous_values: &[f64], threshold: f64) -> bool {
    if previous_values.is_empty() {
        return true;
    }

    let avg = mean(previous_values);
    (current_value - avg).abs() <= avg * threshold
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Accepted(f64),
    Rejected { value: f64, average: f64 },
    /// The source reported no activity; nothing to validate or store.
    Idle,
}

/// Validates samples against the accepted history of the same source.
#[derive(Debug, Clone, Copy)]
pub struct SampleValidator {
    threshold: f64,
}

impl Default for SampleValidator {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl SampleValidator {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// `history` must not contain `sample` itself.
    pub fn validate(&self, sample: &CorrectedSample, history: &[f64]) -> Verdict {
        if sample.was_idle {
            return Verdict::Idle;
        }

        if is_valid_hashrate(sample.value, history, self.threshold) {
            Verdict::Accepted(sample.value)
        } else {
            let average = mean(history);
            tracing::warn!(
                "Rejected {} sample {:.2}: average of {} accepted values is {:.2} (threshold {})",
                sample.source_id,
                sample.value,
                history.len(),
                average,
                self.threshold
            );
            Verdict::Rejected {
                value: sample.value,
                average,
            }
        }
    }
}
