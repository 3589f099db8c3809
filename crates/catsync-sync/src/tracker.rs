//! Per-provider run state: one active run at a time, with a manual reset escape hatch.

use std::sync::Arc;

use catsync_core::{RunStats, RunStatus, SyncMode, SyncRunState};
use catsync_storage::{BeginOutcome, ResetOutcome, RunCompletion, RunStateStore};
use chrono::{DateTime, SubsecRound, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::SyncError;

pub const RESET_REASON: &str = "run was reset manually";

/// Handle for a run that won the begin race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRun {
    pub run_id: Uuid,
    pub provider_id: String,
    pub mode: SyncMode,
    pub started_at: DateTime<Utc>,
    /// Fingerprint of the feed the previous successful run applied.
    pub previous_feed_hash: Option<String>,
}

#[derive(Clone)]
pub struct RunTracker {
    store: Arc<dyn RunStateStore>,
}

impl RunTracker {
    pub fn new(store: Arc<dyn RunStateStore>) -> Self {
        Self { store }
    }

    pub async fn register(&self, provider_id: &str) -> Result<(), SyncError> {
        self.store.ensure_run_state(provider_id).await?;
        Ok(())
    }

    /// Atomically moves the provider to `running`.
    pub async fn begin(&self, provider_id: &str, mode: SyncMode) -> Result<ActiveRun, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now().trunc_subsecs(6);
        match self
            .store
            .try_begin_run(provider_id, mode, run_id, started_at)
            .await?
        {
            BeginOutcome::Started(state) => {
                info!(provider = %provider_id, %run_id, %mode, "sync run started");
                Ok(ActiveRun {
                    run_id,
                    provider_id: provider_id.to_string(),
                    mode,
                    started_at,
                    previous_feed_hash: state.last_feed_hash,
                })
            }
            BeginOutcome::AlreadyRunning(state) => {
                warn!(provider = %provider_id, running_since = ?state.last_run_at, "sync already in progress");
                Err(SyncError::AlreadyRunning {
                    provider_id: provider_id.to_string(),
                    since: state.last_run_at,
                })
            }
            BeginOutcome::UnknownProvider => Err(SyncError::UnknownProvider(provider_id.to_string())),
        }
    }

    /// Returns `None` when the run was reset while it was in flight.
    pub async fn complete(
        &self,
        run: &ActiveRun,
        stats: RunStats,
        feed_hash: Option<String>,
        finished_at: DateTime<Utc>,
    ) -> Result<Option<SyncRunState>, SyncError> {
        let completion = RunCompletion {
            run_id: run.run_id,
            status: RunStatus::Success,
            stats,
            finished_at,
            error: None,
            feed_hash,
        };
        self.finish(run, &completion).await
    }

    pub async fn fail(
        &self,
        run: &ActiveRun,
        stats: RunStats,
        error: &str,
        finished_at: DateTime<Utc>,
    ) -> Result<Option<SyncRunState>, SyncError> {
        let completion = RunCompletion {
            run_id: run.run_id,
            status: RunStatus::Error,
            stats,
            finished_at,
            error: Some(error.to_string()),
            feed_hash: None,
        };
        self.finish(run, &completion).await
    }

    async fn finish(
        &self,
        run: &ActiveRun,
        completion: &RunCompletion,
    ) -> Result<Option<SyncRunState>, SyncError> {
        let state = self.store.finish_run(&run.provider_id, completion).await?;
        match &state {
            Some(state) => info!(
                provider = %run.provider_id,
                run_id = %run.run_id,
                status = %state.status,
                "sync run finished"
            ),
            None => warn!(
                provider = %run.provider_id,
                run_id = %run.run_id,
                "run state no longer belongs to this run; outcome not recorded"
            ),
        }
        Ok(state)
    }

    pub async fn current_state(&self, provider_id: &str) -> Result<Option<SyncRunState>, SyncError> {
        Ok(self.store.get_run_state(provider_id).await?)
    }

    pub async fn list_states(&self) -> Result<Vec<SyncRunState>, SyncError> {
        Ok(self.store.list_run_states().await?)
    }

    /// Forces a stuck `running` state to `error`. Non-running states are returned unchanged.
    pub async fn reset(&self, provider_id: &str) -> Result<ResetOutcome, SyncError> {
        let outcome = self
            .store
            .reset_run(provider_id, RESET_REASON, Utc::now())
            .await?;
        match &outcome {
            ResetOutcome::Reset(_) => warn!(provider = %provider_id, "running sync reset manually"),
            ResetOutcome::NotRunning(state) => {
                info!(provider = %provider_id, status = %state.status, "reset requested but no run is active")
            }
            ResetOutcome::UnknownProvider => {
                return Err(SyncError::UnknownProvider(provider_id.to_string()))
            }
        }
        Ok(outcome)
    }

    pub async fn stuck_runs(&self, max_duration: chrono::Duration) -> Result<Vec<SyncRunState>, SyncError> {
        let now = Utc::now();
        Ok(self
            .list_states()
            .await?
            .into_iter()
            .filter(|s| s.is_stuck(now, max_duration))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catsync_core::ProviderConfig;
    use catsync_storage::MemoryStore;

    async fn tracker() -> (MemoryStore, RunTracker) {
        let store = MemoryStore::with_providers(&[ProviderConfig {
            provider_id: "P1".into(),
            display_name: "Primary".into(),
            priority: 1,
            enabled: true,
        }])
        .await
        .expect("store");
        let tracker = RunTracker::new(Arc::new(store.clone()));
        (store, tracker)
    }

    #[tokio::test]
    async fn second_begin_is_rejected_until_the_first_finishes() {
        let (_, tracker) = tracker().await;
        let run = tracker.begin("P1", SyncMode::Full).await.expect("begin");
        let err = tracker.begin("P1", SyncMode::Incremental).await.unwrap_err();
        assert!(matches!(err, SyncError::AlreadyRunning { .. }));

        let stats = RunStats {
            processed: 2,
            added: 2,
            ..RunStats::default()
        };
        let state = tracker
            .complete(&run, stats, Some("abc".into()), Utc::now())
            .await
            .expect("complete")
            .expect("still owned");
        assert_eq!(state.status, RunStatus::Success);
        assert_eq!(state.records_added, 2);
        assert_eq!(state.last_feed_hash.as_deref(), Some("abc"));
        assert_eq!(state.last_success_stats, Some(stats));

        let next = tracker.begin("P1", SyncMode::Full).await.expect("begin again");
        assert_eq!(next.previous_feed_hash.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn unknown_provider_cannot_begin_or_reset() {
        let (_, tracker) = tracker().await;
        assert!(matches!(
            tracker.begin("nobody", SyncMode::Full).await,
            Err(SyncError::UnknownProvider(_))
        ));
        assert!(matches!(
            tracker.reset("nobody").await,
            Err(SyncError::UnknownProvider(_))
        ));
    }

    #[tokio::test]
    async fn reset_frees_a_stuck_run_and_orphans_its_completion() {
        let (_, tracker) = tracker().await;
        let stale = tracker.begin("P1", SyncMode::Full).await.expect("begin");

        let outcome = tracker.reset("P1").await.expect("reset");
        let ResetOutcome::Reset(state) = outcome else {
            panic!("expected a reset, got {outcome:?}");
        };
        assert_eq!(state.status, RunStatus::Error);
        assert_eq!(state.last_error.as_deref(), Some(RESET_REASON));

        let fresh = tracker.begin("P1", SyncMode::Full).await.expect("begin after reset");
        let orphaned = tracker
            .complete(&stale, RunStats::default(), None, Utc::now())
            .await
            .expect("complete");
        assert!(orphaned.is_none());

        let state = tracker.current_state("P1").await.expect("state").expect("row");
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.run_id, Some(fresh.run_id));
    }

    #[tokio::test]
    async fn reset_of_an_idle_provider_is_a_no_op() {
        let (_, tracker) = tracker().await;
        let outcome = tracker.reset("P1").await.expect("reset");
        assert!(matches!(outcome, ResetOutcome::NotRunning(ref s) if s.status == RunStatus::Idle));
    }

    #[tokio::test]
    async fn stuck_runs_lists_only_overdue_running_states() {
        let (store, tracker) = tracker().await;
        let mut stuck = SyncRunState::idle("P9");
        stuck.status = RunStatus::Running;
        stuck.last_run_at = Some(Utc::now() - chrono::Duration::hours(3));
        store.put_run_state(stuck).await;
        tracker.begin("P1", SyncMode::Full).await.expect("begin");

        let found = tracker
            .stuck_runs(chrono::Duration::minutes(60))
            .await
            .expect("stuck");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].provider_id, "P9");
    }
}
