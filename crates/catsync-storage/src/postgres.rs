use std::collections::BTreeMap;

use async_trait::async_trait;
use catsync_core::{
    CatalogScope, DescriptiveFields, MasterRecord, ProviderConfig, RunStats, RunStatus, SyncMode,
    SyncRunState, VendorMapping,
};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{
    BeginOutcome, CatalogStore, PriorityStore, ResetOutcome, RunCompletion, RunStateStore,
    StoreError, StoreResult,
};

const RUN_STATE_COLUMNS: &str = "provider_id, mode, status, run_id, last_run_at, finished_at, \
     last_success_at, records_processed, records_added, records_updated, records_skipped, \
     records_failed, last_error, last_feed_hash, last_success_stats";

/// Postgres-backed store. Bulk writes bind one array per column and expand them with
/// `UNNEST`, so a batch of any size is a single statement.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(StoreError::database("connect"))?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn select_run_state(&self, provider_id: &str) -> StoreResult<Option<SyncRunState>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_STATE_COLUMNS} FROM sync_run_states WHERE provider_id = $1"
        ))
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database("select run state"))?;
        row.as_ref().map(run_state_from_row).transpose()
    }
}

fn specs_to_json(specs: &BTreeMap<String, String>) -> JsonValue {
    JsonValue::Object(
        specs
            .iter()
            .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
            .collect(),
    )
}

fn specs_from_json(value: JsonValue) -> StoreResult<BTreeMap<String, String>> {
    serde_json::from_value(value).map_err(|e| StoreError::Decode {
        table: "master_records",
        detail: format!("specs: {e}"),
    })
}

fn try_record(row: &PgRow) -> Result<MasterRecord, sqlx::Error> {
    Ok(MasterRecord {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        vertical: row.try_get("vertical")?,
        natural_key: row.try_get("natural_key")?,
        fields: DescriptiveFields {
            name: row.try_get("name")?,
            brand: row.try_get("brand")?,
            model: row.try_get("model")?,
            category: row.try_get("category")?,
            specs: BTreeMap::new(),
        },
        source_provider: row.try_get("source_provider")?,
        source_locked: row.try_get("source_locked")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn record_from_row(row: &PgRow) -> StoreResult<MasterRecord> {
    let mut record = try_record(row).map_err(StoreError::database("decode master record"))?;
    let specs: JsonValue = row
        .try_get("specs")
        .map_err(StoreError::database("decode master record"))?;
    record.fields.specs = specs_from_json(specs)?;
    Ok(record)
}

fn count(row: &PgRow, column: &str) -> Result<u64, sqlx::Error> {
    let value: i64 = row.try_get(column)?;
    Ok(u64::try_from(value).unwrap_or_default())
}

fn try_run_state(row: &PgRow, mode: SyncMode, status: RunStatus) -> Result<SyncRunState, sqlx::Error> {
    Ok(SyncRunState {
        provider_id: row.try_get("provider_id")?,
        mode,
        status,
        run_id: row.try_get("run_id")?,
        last_run_at: row.try_get("last_run_at")?,
        finished_at: row.try_get("finished_at")?,
        last_success_at: row.try_get("last_success_at")?,
        records_processed: count(row, "records_processed")?,
        records_added: count(row, "records_added")?,
        records_updated: count(row, "records_updated")?,
        records_skipped: count(row, "records_skipped")?,
        records_failed: count(row, "records_failed")?,
        last_error: row.try_get("last_error")?,
        last_feed_hash: row.try_get("last_feed_hash")?,
        last_success_stats: row
            .try_get::<Option<Json<RunStats>>, _>("last_success_stats")?
            .map(|stats| stats.0),
    })
}

fn run_state_from_row(row: &PgRow) -> StoreResult<SyncRunState> {
    let mode: String = row
        .try_get("mode")
        .map_err(StoreError::database("decode run state"))?;
    let status: String = row
        .try_get("status")
        .map_err(StoreError::database("decode run state"))?;
    let mode: SyncMode = mode.parse().map_err(|e| StoreError::Decode {
        table: "sync_run_states",
        detail: format!("{e}"),
    })?;
    let status: RunStatus = status.parse().map_err(|e| StoreError::Decode {
        table: "sync_run_states",
        detail: format!("{e}"),
    })?;
    try_run_state(row, mode, status).map_err(StoreError::database("decode run state"))
}

/// Column-wise arrays for an UNNEST batch of master records.
#[derive(Default)]
struct RecordColumns {
    ids: Vec<Uuid>,
    tenant_ids: Vec<String>,
    verticals: Vec<String>,
    natural_keys: Vec<String>,
    names: Vec<Option<String>>,
    brands: Vec<Option<String>>,
    models: Vec<Option<String>>,
    categories: Vec<Option<String>>,
    specs: Vec<JsonValue>,
    source_providers: Vec<Option<String>>,
    source_locked: Vec<bool>,
    versions: Vec<i64>,
    created_at: Vec<DateTime<Utc>>,
    updated_at: Vec<DateTime<Utc>>,
}

impl RecordColumns {
    fn from_records(records: &[MasterRecord]) -> Self {
        let mut cols = Self::default();
        for r in records {
            cols.ids.push(r.id);
            cols.tenant_ids.push(r.tenant_id.clone());
            cols.verticals.push(r.vertical.clone());
            cols.natural_keys.push(r.natural_key.clone());
            cols.names.push(r.fields.name.clone());
            cols.brands.push(r.fields.brand.clone());
            cols.models.push(r.fields.model.clone());
            cols.categories.push(r.fields.category.clone());
            cols.specs.push(specs_to_json(&r.fields.specs));
            cols.source_providers.push(r.source_provider.clone());
            cols.source_locked.push(r.source_locked);
            cols.versions.push(r.version);
            cols.created_at.push(r.created_at);
            cols.updated_at.push(r.updated_at);
        }
        cols
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    #[instrument(level = "debug", skip_all, fields(scope = %scope))]
    async fn load_records(
        &self,
        scope: &CatalogScope,
        natural_keys: Option<&[String]>,
    ) -> StoreResult<Vec<MasterRecord>> {
        let base = "SELECT id, tenant_id, vertical, natural_key, name, brand, model, category, \
                    specs, source_provider, source_locked, version, created_at, updated_at \
                    FROM master_records WHERE tenant_id = $1 AND vertical = $2";
        let filtered = format!("{base} AND natural_key = ANY($3)");
        let rows = match natural_keys {
            Some(keys) => sqlx::query(&filtered)
                .bind(&scope.tenant_id)
                .bind(&scope.vertical)
                .bind(keys)
                .fetch_all(&self.pool)
                .await,
            None => sqlx::query(base)
                .bind(&scope.tenant_id)
                .bind(&scope.vertical)
                .fetch_all(&self.pool)
                .await,
        }
        .map_err(StoreError::database("load master records"))?;

        debug!(rows = rows.len(), "loaded master records");
        rows.iter().map(record_from_row).collect()
    }

    #[instrument(level = "debug", skip_all, fields(batch = records.len()))]
    async fn insert_records(&self, records: &[MasterRecord]) -> StoreResult<Vec<Uuid>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let cols = RecordColumns::from_records(records);
        let rows = sqlx::query(
            r#"
            INSERT INTO master_records
                (id, tenant_id, vertical, natural_key, name, brand, model, category, specs,
                 source_provider, source_locked, version, created_at, updated_at)
            SELECT id, tenant_id, vertical, natural_key, name, brand, model, category, specs,
                   source_provider, source_locked, 1, created_at, updated_at
              FROM UNNEST(
                $1::uuid[], $2::text[], $3::text[], $4::text[], $5::text[], $6::text[],
                $7::text[], $8::text[], $9::jsonb[], $10::text[], $11::bool[],
                $12::timestamptz[], $13::timestamptz[]
              ) AS t(id, tenant_id, vertical, natural_key, name, brand, model, category, specs,
                     source_provider, source_locked, created_at, updated_at)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&cols.ids)
        .bind(&cols.tenant_ids)
        .bind(&cols.verticals)
        .bind(&cols.natural_keys)
        .bind(&cols.names)
        .bind(&cols.brands)
        .bind(&cols.models)
        .bind(&cols.categories)
        .bind(&cols.specs)
        .bind(&cols.source_providers)
        .bind(&cols.source_locked)
        .bind(&cols.created_at)
        .bind(&cols.updated_at)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::database("bulk insert master records"))?;

        rows.iter()
            .map(|row| row.try_get::<Uuid, _>("id"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::database("decode inserted ids"))
    }

    #[instrument(level = "debug", skip_all, fields(batch = records.len()))]
    async fn update_records(&self, records: &[MasterRecord]) -> StoreResult<Vec<Uuid>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let cols = RecordColumns::from_records(records);
        let rows = sqlx::query(
            r#"
            UPDATE master_records AS m
               SET name = t.name,
                   brand = t.brand,
                   model = t.model,
                   category = t.category,
                   specs = t.specs,
                   source_provider = t.source_provider,
                   source_locked = t.source_locked,
                   version = m.version + 1,
                   updated_at = t.updated_at
              FROM UNNEST(
                $1::uuid[], $2::bigint[], $3::text[], $4::text[], $5::text[], $6::text[],
                $7::jsonb[], $8::text[], $9::bool[], $10::timestamptz[]
              ) AS t(id, version, name, brand, model, category, specs, source_provider,
                     source_locked, updated_at)
             WHERE m.id = t.id
               AND m.version = t.version
            RETURNING m.id
            "#,
        )
        .bind(&cols.ids)
        .bind(&cols.versions)
        .bind(&cols.names)
        .bind(&cols.brands)
        .bind(&cols.models)
        .bind(&cols.categories)
        .bind(&cols.specs)
        .bind(&cols.source_providers)
        .bind(&cols.source_locked)
        .bind(&cols.updated_at)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::database("bulk update master records"))?;

        rows.iter()
            .map(|row| row.try_get::<Uuid, _>("id"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::database("decode updated ids"))
    }

    #[instrument(level = "debug", skip_all, fields(batch = mappings.len()))]
    async fn upsert_vendor_mappings(&self, mappings: &[VendorMapping]) -> StoreResult<u64> {
        if mappings.is_empty() {
            return Ok(0);
        }
        let record_ids: Vec<Uuid> = mappings.iter().map(|m| m.master_record_id).collect();
        let provider_ids: Vec<String> = mappings.iter().map(|m| m.provider_id.clone()).collect();
        let skus: Vec<Option<String>> = mappings.iter().map(|m| m.vendor_sku.clone()).collect();
        let prices: Vec<Option<i64>> = mappings.iter().map(|m| m.price_minor).collect();
        let quantities: Vec<Option<i32>> = mappings.iter().map(|m| m.quantity).collect();
        let updated_at: Vec<DateTime<Utc>> = mappings.iter().map(|m| m.updated_at).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO provider_vendor_mappings
                (master_record_id, provider_id, vendor_sku, price_minor, quantity, updated_at)
            SELECT * FROM UNNEST(
                $1::uuid[], $2::text[], $3::text[], $4::bigint[], $5::int[], $6::timestamptz[]
            )
            ON CONFLICT (master_record_id, provider_id) DO UPDATE
               SET vendor_sku = EXCLUDED.vendor_sku,
                   price_minor = EXCLUDED.price_minor,
                   quantity = EXCLUDED.quantity,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record_ids)
        .bind(&provider_ids)
        .bind(&skus)
        .bind(&prices)
        .bind(&quantities)
        .bind(&updated_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database("bulk upsert vendor mappings"))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PriorityStore for PgStore {
    async fn load_providers(&self) -> StoreResult<Vec<ProviderConfig>> {
        let rows = sqlx::query(
            "SELECT provider_id, display_name, priority, enabled FROM providers ORDER BY provider_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::database("load providers"))?;

        rows.iter()
            .map(|row| {
                Ok(ProviderConfig {
                    provider_id: row.try_get("provider_id")?,
                    display_name: row.try_get("display_name")?,
                    priority: row.try_get("priority")?,
                    enabled: row.try_get("enabled")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::database("decode providers"))
    }

    async fn upsert_providers(&self, providers: &[ProviderConfig]) -> StoreResult<()> {
        if providers.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = providers.iter().map(|p| p.provider_id.clone()).collect();
        let names: Vec<String> = providers.iter().map(|p| p.display_name.clone()).collect();
        let priorities: Vec<i32> = providers.iter().map(|p| p.priority).collect();
        let enabled: Vec<bool> = providers.iter().map(|p| p.enabled).collect();

        sqlx::query(
            r#"
            INSERT INTO providers (provider_id, display_name, priority, enabled, updated_at)
            SELECT provider_id, display_name, priority, enabled, NOW()
              FROM UNNEST($1::text[], $2::text[], $3::int[], $4::bool[])
                   AS t(provider_id, display_name, priority, enabled)
            ON CONFLICT (provider_id) DO UPDATE
               SET display_name = EXCLUDED.display_name,
                   priority = EXCLUDED.priority,
                   enabled = EXCLUDED.enabled,
                   updated_at = NOW()
            "#,
        )
        .bind(&ids)
        .bind(&names)
        .bind(&priorities)
        .bind(&enabled)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database("upsert providers"))?;
        Ok(())
    }
}

#[async_trait]
impl RunStateStore for PgStore {
    async fn ensure_run_state(&self, provider_id: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO sync_run_states (provider_id) VALUES ($1) ON CONFLICT (provider_id) DO NOTHING",
        )
        .bind(provider_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database("ensure run state"))?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn try_begin_run(
        &self,
        provider_id: &str,
        mode: SyncMode,
        run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> StoreResult<BeginOutcome> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE sync_run_states
               SET status = 'running',
                   mode = $2,
                   run_id = $3,
                   last_run_at = $4,
                   finished_at = NULL,
                   last_error = NULL
             WHERE provider_id = $1
               AND status <> 'running'
            RETURNING {RUN_STATE_COLUMNS}
            "#
        ))
        .bind(provider_id)
        .bind(mode.as_str())
        .bind(run_id)
        .bind(started_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database("begin run"))?;

        if let Some(row) = row {
            return Ok(BeginOutcome::Started(run_state_from_row(&row)?));
        }
        Ok(match self.select_run_state(provider_id).await? {
            Some(state) => BeginOutcome::AlreadyRunning(state),
            None => BeginOutcome::UnknownProvider,
        })
    }

    #[instrument(level = "debug", skip(self, completion), fields(run_id = %completion.run_id))]
    async fn finish_run(
        &self,
        provider_id: &str,
        completion: &RunCompletion,
    ) -> StoreResult<Option<SyncRunState>> {
        let stats = completion.stats;
        let row = sqlx::query(&format!(
            r#"
            UPDATE sync_run_states
               SET status = $3,
                   finished_at = $4,
                   records_processed = $5,
                   records_added = $6,
                   records_updated = $7,
                   records_skipped = $8,
                   records_failed = $9,
                   last_error = $10,
                   last_success_at = CASE WHEN $3 = 'success' THEN $4 ELSE last_success_at END,
                   last_feed_hash = CASE WHEN $3 = 'success' THEN $11 ELSE last_feed_hash END,
                   last_success_stats = CASE WHEN $3 = 'success' THEN $12 ELSE last_success_stats END
             WHERE provider_id = $1
               AND run_id = $2
               AND status = 'running'
            RETURNING {RUN_STATE_COLUMNS}
            "#
        ))
        .bind(provider_id)
        .bind(completion.run_id)
        .bind(completion.status.as_str())
        .bind(completion.finished_at)
        .bind(stats.processed as i64)
        .bind(stats.added as i64)
        .bind(stats.updated as i64)
        .bind(stats.skipped as i64)
        .bind(stats.failed as i64)
        .bind(completion.error.as_deref())
        .bind(completion.feed_hash.as_deref())
        .bind(Json(stats))
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database("finish run"))?;

        row.as_ref().map(run_state_from_row).transpose()
    }

    async fn get_run_state(&self, provider_id: &str) -> StoreResult<Option<SyncRunState>> {
        self.select_run_state(provider_id).await
    }

    async fn list_run_states(&self) -> StoreResult<Vec<SyncRunState>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_STATE_COLUMNS} FROM sync_run_states ORDER BY provider_id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::database("list run states"))?;
        rows.iter().map(run_state_from_row).collect()
    }

    async fn reset_run(
        &self,
        provider_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<ResetOutcome> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE sync_run_states
               SET status = 'error',
                   last_error = $2,
                   finished_at = $3
             WHERE provider_id = $1
               AND status = 'running'
            RETURNING {RUN_STATE_COLUMNS}
            "#
        ))
        .bind(provider_id)
        .bind(reason)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database("reset run"))?;

        if let Some(row) = row {
            return Ok(ResetOutcome::Reset(run_state_from_row(&row)?));
        }
        Ok(match self.select_run_state(provider_id).await? {
            Some(state) => ResetOutcome::NotRunning(state),
            None => ResetOutcome::UnknownProvider,
        })
    }
}
