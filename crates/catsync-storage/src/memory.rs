use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use catsync_core::{
    CatalogScope, MasterRecord, ProviderConfig, RunStatus, SyncMode, SyncRunState, VendorMapping,
};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    BeginOutcome, CatalogStore, PriorityStore, ResetOutcome, RunCompletion, RunStateStore,
    StoreResult,
};

/// Number of store calls made so far, by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallCounts {
    pub loads: usize,
    pub inserts: usize,
    pub updates: usize,
    pub mapping_upserts: usize,
}

impl CallCounts {
    pub fn writes(&self) -> usize {
        self.inserts + self.updates + self.mapping_upserts
    }
}

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<(String, String, String), MasterRecord>,
    mappings: BTreeMap<(Uuid, String), VendorMapping>,
    providers: BTreeMap<String, ProviderConfig>,
    runs: BTreeMap<String, SyncRunState>,
    calls: CallCounts,
    /// Catalog writes allowed before every further write fails.
    #[cfg(any(test, feature = "test-util"))]
    writes_before_failure: Option<usize>,
}

impl Inner {
    #[cfg(any(test, feature = "test-util"))]
    fn check_write(&mut self, op: &str) -> StoreResult<()> {
        match self.writes_before_failure.as_mut() {
            Some(0) => Err(crate::StoreError::Injected(format!("{op} rejected"))),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    #[cfg(not(any(test, feature = "test-util")))]
    fn check_write(&mut self, _op: &str) -> StoreResult<()> {
        Ok(())
    }
}

fn record_key(record: &MasterRecord) -> (String, String, String) {
    (
        record.tenant_id.clone(),
        record.vertical.clone(),
        record.natural_key.clone(),
    )
}

/// In-process implementation of every store contract.
///
/// Used by tests and local dry runs. All state lives behind one mutex, so the
/// run-state compare-and-set is atomic just like the Postgres `UPDATE .. RETURNING`.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_providers(providers: &[ProviderConfig]) -> StoreResult<Self> {
        let store = Self::new();
        store.upsert_providers(providers).await?;
        for provider in providers {
            store.ensure_run_state(&provider.provider_id).await?;
        }
        Ok(store)
    }

    /// Makes every catalog write after the next `writes` succeed fail.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn fail_after_writes(&self, writes: usize) {
        self.inner.lock().await.writes_before_failure = Some(writes);
    }

    pub async fn call_counts(&self) -> CallCounts {
        self.inner.lock().await.calls
    }

    pub async fn put_record(&self, record: MasterRecord) {
        let mut inner = self.inner.lock().await;
        inner.records.insert(record_key(&record), record);
    }

    pub async fn put_run_state(&self, state: SyncRunState) {
        let mut inner = self.inner.lock().await;
        inner.runs.insert(state.provider_id.clone(), state);
    }

    pub async fn record(&self, scope: &CatalogScope, natural_key: &str) -> Option<MasterRecord> {
        let inner = self.inner.lock().await;
        inner
            .records
            .get(&(
                scope.tenant_id.clone(),
                scope.vertical.clone(),
                natural_key.to_string(),
            ))
            .cloned()
    }

    pub async fn records(&self, scope: &CatalogScope) -> Vec<MasterRecord> {
        let inner = self.inner.lock().await;
        inner
            .records
            .values()
            .filter(|r| r.tenant_id == scope.tenant_id && r.vertical == scope.vertical)
            .cloned()
            .collect()
    }

    pub async fn mappings(&self) -> Vec<VendorMapping> {
        self.inner.lock().await.mappings.values().cloned().collect()
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn load_records(
        &self,
        scope: &CatalogScope,
        natural_keys: Option<&[String]>,
    ) -> StoreResult<Vec<MasterRecord>> {
        let mut inner = self.inner.lock().await;
        inner.calls.loads += 1;
        let wanted: Option<HashSet<&str>> =
            natural_keys.map(|keys| keys.iter().map(String::as_str).collect());
        Ok(inner
            .records
            .values()
            .filter(|r| r.tenant_id == scope.tenant_id && r.vertical == scope.vertical)
            .filter(|r| {
                wanted
                    .as_ref()
                    .map(|keys| keys.contains(r.natural_key.as_str()))
                    .unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn insert_records(&self, records: &[MasterRecord]) -> StoreResult<Vec<Uuid>> {
        let mut inner = self.inner.lock().await;
        inner.calls.inserts += 1;
        inner.check_write("insert")?;
        let mut inserted = Vec::with_capacity(records.len());
        for record in records {
            let key = record_key(record);
            if inner.records.contains_key(&key) {
                continue;
            }
            let mut stored = record.clone();
            stored.version = 1;
            inner.records.insert(key, stored);
            inserted.push(record.id);
        }
        Ok(inserted)
    }

    async fn update_records(&self, records: &[MasterRecord]) -> StoreResult<Vec<Uuid>> {
        let mut inner = self.inner.lock().await;
        inner.calls.updates += 1;
        inner.check_write("update")?;
        let mut updated = Vec::with_capacity(records.len());
        for record in records {
            let Some(current) = inner.records.get_mut(&record_key(record)) else {
                continue;
            };
            if current.id != record.id || current.version != record.version {
                continue;
            }
            current.fields = record.fields.clone();
            current.source_provider = record.source_provider.clone();
            current.source_locked = record.source_locked;
            current.updated_at = record.updated_at;
            current.version += 1;
            updated.push(record.id);
        }
        Ok(updated)
    }

    async fn upsert_vendor_mappings(&self, mappings: &[VendorMapping]) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        inner.calls.mapping_upserts += 1;
        inner.check_write("vendor mapping upsert")?;
        for mapping in mappings {
            inner.mappings.insert(
                (mapping.master_record_id, mapping.provider_id.clone()),
                mapping.clone(),
            );
        }
        Ok(mappings.len() as u64)
    }
}

#[async_trait]
impl PriorityStore for MemoryStore {
    async fn load_providers(&self) -> StoreResult<Vec<ProviderConfig>> {
        Ok(self.inner.lock().await.providers.values().cloned().collect())
    }

    async fn upsert_providers(&self, providers: &[ProviderConfig]) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        for provider in providers {
            inner
                .providers
                .insert(provider.provider_id.clone(), provider.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl RunStateStore for MemoryStore {
    async fn ensure_run_state(&self, provider_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .runs
            .entry(provider_id.to_string())
            .or_insert_with(|| SyncRunState::idle(provider_id));
        Ok(())
    }

    async fn try_begin_run(
        &self,
        provider_id: &str,
        mode: SyncMode,
        run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> StoreResult<BeginOutcome> {
        let mut inner = self.inner.lock().await;
        let Some(state) = inner.runs.get_mut(provider_id) else {
            return Ok(BeginOutcome::UnknownProvider);
        };
        if state.status == RunStatus::Running {
            return Ok(BeginOutcome::AlreadyRunning(state.clone()));
        }
        state.status = RunStatus::Running;
        state.mode = mode;
        state.run_id = Some(run_id);
        state.last_run_at = Some(started_at);
        state.finished_at = None;
        state.last_error = None;
        Ok(BeginOutcome::Started(state.clone()))
    }

    async fn finish_run(
        &self,
        provider_id: &str,
        completion: &RunCompletion,
    ) -> StoreResult<Option<SyncRunState>> {
        let mut inner = self.inner.lock().await;
        let Some(state) = inner.runs.get_mut(provider_id) else {
            return Ok(None);
        };
        if state.status != RunStatus::Running || state.run_id != Some(completion.run_id) {
            return Ok(None);
        }
        state.status = completion.status;
        state.finished_at = Some(completion.finished_at);
        state.set_stats(completion.stats);
        state.last_error = completion.error.clone();
        if completion.status == RunStatus::Success {
            state.last_success_at = Some(completion.finished_at);
            state.last_success_stats = Some(completion.stats);
            state.last_feed_hash = completion.feed_hash.clone();
        }
        Ok(Some(state.clone()))
    }

    async fn get_run_state(&self, provider_id: &str) -> StoreResult<Option<SyncRunState>> {
        Ok(self.inner.lock().await.runs.get(provider_id).cloned())
    }

    async fn list_run_states(&self) -> StoreResult<Vec<SyncRunState>> {
        Ok(self.inner.lock().await.runs.values().cloned().collect())
    }

    async fn reset_run(
        &self,
        provider_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<ResetOutcome> {
        let mut inner = self.inner.lock().await;
        let Some(state) = inner.runs.get_mut(provider_id) else {
            return Ok(ResetOutcome::UnknownProvider);
        };
        if state.status != RunStatus::Running {
            return Ok(ResetOutcome::NotRunning(state.clone()));
        }
        state.status = RunStatus::Error;
        state.last_error = Some(reason.to_string());
        state.finished_at = Some(at);
        Ok(ResetOutcome::Reset(state.clone()))
    }
}
