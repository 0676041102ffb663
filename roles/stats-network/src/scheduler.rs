use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::engine::{AggregationEngine, CycleOutcome};

/// Runs one collection cycle per `cycle_interval` until `shutdown` flips to true.
///
/// The first cycle starts immediately. A cycle that is already running when shutdown
/// is requested finishes before the loop exits.
pub async fn start_cycle_scheduler(
    engine: Arc<AggregationEngine>,
    cycle_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(cycle_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        match engine.run_cycle().await {
            Ok(result) => match result.outcome {
                CycleOutcome::Recorded(_) => debug!(
                    "Scheduled cycle recorded, {} records in period",
                    result.stats.average.record_count
                ),
                CycleOutcome::Skipped { reason } => debug!("Scheduled cycle skipped: {}", reason),
            },
            // Keep polling even if a cycle fails
            Err(e) => error!("Scheduled cycle failed: {}", e),
        }

        if *shutdown.borrow() {
            break;
        }
    }

    info!("Cycle scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineSettings;
    use hashrate_stats::{SqliteStorage, StatsRepository};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_runs_immediately_and_stops_on_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(SqliteStorage::new(temp_dir.path().join("s.db")).await.unwrap());
        let engine = Arc::new(AggregationEngine::new(
            Vec::new(),
            storage.clone(),
            EngineSettings::default(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(start_cycle_scheduler(
            engine,
            Duration::from_secs(3600),
            shutdown_rx,
        ));

        // The first tick fires right away
        let mut recorded = false;
        for _ in 0..100 {
            if storage.latest_record().await.unwrap().is_some() {
                recorded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(recorded);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
