//! Persistence contracts for the master catalog, provider registry and run state.

use async_trait::async_trait;
use catsync_core::{
    CatalogScope, MasterRecord, ProviderConfig, RunStats, RunStatus, SyncMode, SyncRunState,
    VendorMapping,
};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::{CallCounts, MemoryStore};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "catsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error during {op}: {source}")]
    Database {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("applying migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt {table} row: {detail}")]
    Decode { table: &'static str, detail: String },
    #[cfg(any(test, feature = "test-util"))]
    #[error("injected write failure: {0}")]
    Injected(String),
}

impl StoreError {
    pub(crate) fn database(op: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
        move |source| StoreError::Database { op, source }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Master catalog access used by the bulk merge executor.
///
/// Every method is one round-trip regardless of how many records it carries; callers
/// chunk large batches themselves.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Loads the records of `scope`, restricted to `natural_keys` when given.
    async fn load_records(
        &self,
        scope: &CatalogScope,
        natural_keys: Option<&[String]>,
    ) -> StoreResult<Vec<MasterRecord>>;

    /// Inserts new records, silently skipping keys that already exist.
    /// Returns the ids that were actually inserted.
    async fn insert_records(&self, records: &[MasterRecord]) -> StoreResult<Vec<Uuid>>;

    /// Writes new field values for records whose stored `version` still equals the
    /// `version` carried by the record, bumping it by one.
    /// Returns the ids that were actually updated.
    async fn update_records(&self, records: &[MasterRecord]) -> StoreResult<Vec<Uuid>>;

    async fn upsert_vendor_mappings(&self, mappings: &[VendorMapping]) -> StoreResult<u64>;
}

/// Provider registry backing the priority resolver.
#[async_trait]
pub trait PriorityStore: Send + Sync {
    async fn load_providers(&self) -> StoreResult<Vec<ProviderConfig>>;

    async fn upsert_providers(&self, providers: &[ProviderConfig]) -> StoreResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    Started(SyncRunState),
    AlreadyRunning(SyncRunState),
    UnknownProvider,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetOutcome {
    Reset(SyncRunState),
    NotRunning(SyncRunState),
    UnknownProvider,
}

/// Terminal update written when a run ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCompletion {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub stats: RunStats,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
    /// Replaces `last_feed_hash` when `status` is success. `None` clears it, so the
    /// next run with the same feed is merged again.
    pub feed_hash: Option<String>,
}

/// Per-provider run state. `try_begin_run` must be an atomic compare-and-set on status.
#[async_trait]
pub trait RunStateStore: Send + Sync {
    /// Creates an idle state row for the provider if none exists yet.
    async fn ensure_run_state(&self, provider_id: &str) -> StoreResult<()>;

    async fn try_begin_run(
        &self,
        provider_id: &str,
        mode: SyncMode,
        run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> StoreResult<BeginOutcome>;

    /// Applies `completion` if the provider is still running `completion.run_id`.
    /// Returns `None` when the run was reset or superseded in the meantime.
    async fn finish_run(
        &self,
        provider_id: &str,
        completion: &RunCompletion,
    ) -> StoreResult<Option<SyncRunState>>;

    async fn get_run_state(&self, provider_id: &str) -> StoreResult<Option<SyncRunState>>;

    async fn list_run_states(&self) -> StoreResult<Vec<SyncRunState>>;

    /// Forces a `running` state to `error` with `reason`; other states are untouched.
    async fn reset_run(
        &self,
        provider_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<ResetOutcome>;
}
