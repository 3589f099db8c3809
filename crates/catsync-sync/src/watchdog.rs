//! Periodic check for runs stuck in `running`. It only reports; resets stay manual.

use anyhow::{Context, Result};
use catsync_core::SyncRunState;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::tracker::RunTracker;
use crate::{SyncConfig, SyncError};

/// Logs a warning for every run older than `max_duration` and returns them.
pub async fn log_stuck_runs(
    tracker: &RunTracker,
    max_duration: chrono::Duration,
) -> Result<Vec<SyncRunState>, SyncError> {
    let stuck = tracker.stuck_runs(max_duration).await?;
    for state in &stuck {
        warn!(
            provider = %state.provider_id,
            run_id = ?state.run_id,
            started_at = ?state.last_run_at,
            "sync run exceeded its maximum duration; reset it manually if it is dead"
        );
    }
    Ok(stuck)
}

pub async fn maybe_build_watchdog(config: &SyncConfig, tracker: RunTracker) -> Result<Option<JobScheduler>> {
    if !config.watchdog_enabled {
        return Ok(None);
    }

    let max_duration = config.max_run_duration();
    let sched = JobScheduler::new().await.context("creating watchdog scheduler")?;
    let cron = config.watchdog_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let tracker = tracker.clone();
        Box::pin(async move {
            if let Err(err) = log_stuck_runs(&tracker, max_duration).await {
                warn!(error = %err, "watchdog could not read run states");
            }
        })
    })
    .with_context(|| format!("creating watchdog job for cron {cron}"))?;
    sched.add(job).await.context("adding watchdog job")?;
    info!(%cron, "stuck-run watchdog scheduled");
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use catsync_core::RunStatus;
    use catsync_storage::MemoryStore;
    use chrono::Utc;
    use std::sync::Arc;

    #[tokio::test]
    async fn disabled_watchdog_is_not_built() {
        let mut config = SyncConfig::from_env();
        config.watchdog_enabled = false;
        let tracker = RunTracker::new(Arc::new(MemoryStore::new()));
        assert!(maybe_build_watchdog(&config, tracker).await.expect("build").is_none());
    }

    #[tokio::test]
    async fn stuck_runs_are_reported_but_left_running() {
        let store = MemoryStore::new();
        let mut state = SyncRunState::idle("P1");
        state.status = RunStatus::Running;
        state.last_run_at = Some(Utc::now() - chrono::Duration::hours(5));
        store.put_run_state(state).await;

        let tracker = RunTracker::new(Arc::new(store.clone()));
        let stuck = log_stuck_runs(&tracker, chrono::Duration::minutes(60))
            .await
            .expect("scan");
        assert_eq!(stuck.len(), 1);

        let after = tracker.current_state("P1").await.expect("state").expect("row");
        assert_eq!(after.status, RunStatus::Running);
    }
}
