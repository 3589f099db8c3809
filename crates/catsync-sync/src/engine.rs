use std::sync::Arc;

use catsync_core::{
    CatalogScope, MergeOptions, ProviderConfig, ProviderItem, RunResult, RunStats, RunStatus,
    SyncMode,
};
use catsync_storage::{CatalogStore, PriorityStore, RunStateStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};

use crate::change::FeedFingerprint;
use crate::merge::{BulkMergeExecutor, MergeContext};
use crate::priority::PriorityResolver;
use crate::tracker::{ActiveRun, RunTracker};
use crate::{SyncConfig, SyncError};

/// One provider feed to apply to one catalog scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub provider_id: String,
    pub scope: CatalogScope,
    #[serde(default)]
    pub mode: SyncMode,
    pub items: Vec<ProviderItem>,
    #[serde(default)]
    pub options: MergeOptions,
    /// Original feed bytes, hashed instead of the items when present.
    #[serde(skip)]
    pub raw_feed: Option<Vec<u8>>,
}

impl SyncRequest {
    pub fn new(
        provider_id: impl Into<String>,
        scope: CatalogScope,
        mode: SyncMode,
        items: Vec<ProviderItem>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            scope,
            mode,
            items,
            options: MergeOptions::default(),
            raw_feed: None,
        }
    }

    pub fn with_options(mut self, options: MergeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_raw_feed(mut self, raw: Vec<u8>) -> Self {
        self.raw_feed = Some(raw);
        self
    }
}

/// Orchestrates one sync run: begin, fingerprint check, bulk merge, completion.
#[derive(Clone)]
pub struct SyncEngine {
    executor: BulkMergeExecutor,
    tracker: RunTracker,
    priorities: Arc<PriorityResolver>,
    registry: Arc<dyn PriorityStore>,
}

impl SyncEngine {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        runs: Arc<dyn RunStateStore>,
        registry: Arc<dyn PriorityStore>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            executor: BulkMergeExecutor::new(catalog, config.max_batch_size),
            tracker: RunTracker::new(runs),
            priorities: Arc::new(PriorityResolver::new(registry.clone(), config.priority_ttl())),
            registry,
        }
    }

    /// Builds an engine whose three stores are the same backend.
    pub fn with_store<S>(store: Arc<S>, config: &SyncConfig) -> Self
    where
        S: CatalogStore + RunStateStore + PriorityStore + 'static,
    {
        Self::new(store.clone(), store.clone(), store, config)
    }

    pub fn tracker(&self) -> &RunTracker {
        &self.tracker
    }

    pub fn priorities(&self) -> &PriorityResolver {
        &self.priorities
    }

    /// Upserts registry entries, creates their run state rows and drops cached priorities.
    pub async fn register_providers(&self, providers: &[ProviderConfig]) -> Result<(), SyncError> {
        self.registry.upsert_providers(providers).await?;
        for provider in providers {
            self.tracker.register(&provider.provider_id).await?;
        }
        self.priorities.invalidate().await;
        info!(count = providers.len(), "providers registered");
        Ok(())
    }

    pub async fn run_sync(&self, request: SyncRequest) -> Result<RunResult, SyncError> {
        let span = info_span!(
            "sync_run",
            provider = %request.provider_id,
            scope = %request.scope,
            mode = %request.mode,
            items = request.items.len(),
        );
        self.run_sync_inner(request).instrument(span).await
    }

    async fn run_sync_inner(&self, request: SyncRequest) -> Result<RunResult, SyncError> {
        let SyncRequest {
            provider_id,
            scope,
            mode,
            items,
            options,
            raw_feed,
        } = request;

        let priorities = self.priorities.table().await;
        if priorities
            .provider(&provider_id)
            .is_some_and(|p| !p.enabled)
        {
            return Err(SyncError::ProviderDisabled(provider_id));
        }

        let run = self.tracker.begin(&provider_id, mode).await?;
        let fingerprint = FeedFingerprint::compute(&scope, raw_feed.as_deref(), &items);
        let mut result = RunResult {
            run_id: run.run_id,
            provider_id: provider_id.clone(),
            mode,
            status: RunStatus::Success,
            stats: RunStats::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
            fingerprint: Some(fingerprint.as_str().to_string()),
            short_circuited: false,
            started_at: run.started_at,
            finished_at: run.started_at,
        };

        // Locking writes provenance even when the feed is unchanged.
        let bypass = options.force || options.manual_override || options.source_locked;
        if !bypass && fingerprint.matches(run.previous_feed_hash.as_deref()) {
            info!(fingerprint = %fingerprint.as_str(), "feed unchanged since last success; skipping merge");
            result.stats = RunStats::all_skipped(items.len() as u64);
            result.short_circuited = true;
            result.finished_at = Utc::now();
            self.record_success(&run, &mut result, Some(fingerprint.into_string()))
                .await?;
            return Ok(result);
        }

        let ctx = MergeContext {
            provider_id: &provider_id,
            scope: &scope,
            mode,
            options,
            priorities: &priorities,
        };

        match self.executor.merge(&ctx, &items).await {
            Ok(outcome) => {
                let feed_hash = if outcome.fully_applied() {
                    Some(fingerprint.into_string())
                } else {
                    info!(
                        failed = outcome.stats.failed,
                        lost_writes = outcome.lost_writes,
                        "feed not fully applied; it will be merged again if resent"
                    );
                    None
                };
                result.stats = outcome.stats;
                result.errors = outcome.errors;
                result.warnings = outcome.warnings;
                result.finished_at = Utc::now();
                self.record_success(&run, &mut result, feed_hash).await?;
                Ok(result)
            }
            Err(failure) => {
                let message = failure.source.to_string();
                result.status = RunStatus::Error;
                result.stats = failure.outcome.stats;
                result.errors = failure.outcome.errors;
                result.errors.push(message.clone());
                result.warnings = failure.outcome.warnings;
                result.finished_at = Utc::now();
                match self
                    .tracker
                    .fail(&run, result.stats, &message, result.finished_at)
                    .await
                {
                    Ok(recorded) => note_unrecorded(&mut result, recorded.is_some()),
                    Err(err) => {
                        warn!(error = %err, "could not record failed run");
                        result.warnings.push(format!("run state not recorded: {err}"));
                    }
                }
                Err(SyncError::Write {
                    result: Box::new(result),
                    source: failure.source,
                })
            }
        }
    }

    /// Marks the run successful. If that write fails, the run is marked failed instead
    /// so the provider is not left `running`.
    async fn record_success(
        &self,
        run: &ActiveRun,
        result: &mut RunResult,
        feed_hash: Option<String>,
    ) -> Result<(), SyncError> {
        match self
            .tracker
            .complete(run, result.stats, feed_hash, result.finished_at)
            .await
        {
            Ok(recorded) => {
                note_unrecorded(result, recorded.is_some());
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "could not record successful run; marking it failed");
                let message = format!("recording run completion failed: {err}");
                if let Err(fail_err) = self
                    .tracker
                    .fail(run, result.stats, &message, Utc::now())
                    .await
                {
                    warn!(error = %fail_err, "could not record failed run");
                }
                Err(err)
            }
        }
    }
}

fn note_unrecorded(result: &mut RunResult, recorded: bool) {
    if !recorded {
        result
            .warnings
            .push("run state was reset while this run was in progress; outcome not recorded".to_string());
    }
}
