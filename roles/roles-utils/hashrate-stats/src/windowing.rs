//! Weekly aggregation periods.
//!
//! A period starts every Wednesday at 12:00 UTC and lasts seven days. The current
//! period is always recomputed from wall-clock time, never cached, so a restart
//! mid-period lands on the same boundary.

use crate::metrics::summarize;
use crate::storage::{Result, StatsRepository};
use crate::types::{PeriodSnapshot, PERIOD_LENGTH_DAYS};
use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};

const PERIOD_ANCHOR_WEEKDAY: Weekday = Weekday::Wed;
const PERIOD_ANCHOR_HOUR: u32 = 12;

/// Latest Wednesday 12:00 UTC at or before `now`.
pub fn period_start_for(now: DateTime<Utc>) -> DateTime<Utc> {
    let days_since_anchor = (now.weekday().num_days_from_monday() + 7
        - PERIOD_ANCHOR_WEEKDAY.num_days_from_monday())
        % 7;
    let anchor_time = NaiveTime::from_hms_opt(PERIOD_ANCHOR_HOUR, 0, 0).unwrap_or(NaiveTime::MIN);
    let candidate = (now.date_naive() - Duration::days(days_since_anchor as i64))
        .and_time(anchor_time)
        .and_utc();

    if candidate > now {
        candidate - Duration::days(PERIOD_LENGTH_DAYS)
    } else {
        candidate
    }
}

/// A half-open weekly window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    pub fn containing(now: DateTime<Utc>) -> Self {
        Self::starting_at(period_start_for(now))
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            start,
            end: start + Duration::days(PERIOD_LENGTH_DAYS),
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodTransition {
    /// Nothing has been persisted yet.
    Started(Period),
    Unchanged(Period),
    /// `now` crossed at least one boundary since the last persisted record.
    Crossed { previous: Period, current: Period },
}

impl PeriodTransition {
    pub fn current(&self) -> Period {
        match self {
            PeriodTransition::Started(p) | PeriodTransition::Unchanged(p) => *p,
            PeriodTransition::Crossed { current, .. } => *current,
        }
    }
}

/// Decides the current period and drives retention when it changes.
///
/// Never mutates records itself; it instructs the repository to snapshot and purge.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeriodManager;

impl PeriodManager {
    pub fn new() -> Self {
        Self
    }

    pub fn current_period(&self, now: DateTime<Utc>) -> Period {
        Period::containing(now)
    }

    /// Compare `now` against the period of the most recently persisted record.
    pub fn check(
        &self,
        last_record_period: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> PeriodTransition {
        let current = self.current_period(now);
        match last_record_period {
            None => PeriodTransition::Started(current),
            Some(last) if last != current.start => PeriodTransition::Crossed {
                previous: Period::starting_at(last),
                current,
            },
            Some(_) => PeriodTransition::Unchanged(current),
        }
    }

    /// Detect a boundary crossing and, if one happened, retire the previous period.
    ///
    /// The snapshot of the ending period is best effort. Purging is not: a failed
    /// purge is a storage failure and is returned to the caller.
    pub async fn roll_over(
        &self,
        repository: &dyn StatsRepository,
        now: DateTime<Utc>,
    ) -> Result<PeriodTransition> {
        let last = repository.latest_record().await?;
        let transition = self.check(last.map(|r| r.period_start), now);

        if let PeriodTransition::Crossed { previous, current } = transition {
            tracing::info!(
                "New period started at {} (previous period {})",
                current.start,
                previous.start
            );

            match repository.query(previous.start, None).await {
                Ok(records) => {
                    let snapshot = PeriodSnapshot {
                        period_start: previous.start,
                        period_end: previous.end,
                        stats: summarize(previous.start, &records),
                        taken_at: now,
                    };
                    if let Err(e) = repository.store_period_snapshot(&snapshot).await {
                        tracing::warn!("Failed to snapshot period {}: {}", previous.start, e);
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to read period {} for snapshot: {}", previous.start, e)
                }
            }

            let deleted = repository.purge(current.start).await?;
            tracing::info!("New period started, deleted {} old records", deleted);

            // Logs of the period that just ended stay around for one more period
            repository.purge_logs(previous.start).await?;
        }

        Ok(transition)
    }
}
