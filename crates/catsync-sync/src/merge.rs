//! Set-based merge of one provider feed into the master catalog.
//!
//! A merge is planned entirely in memory against one bulk load of the existing records,
//! then written with a bounded number of chunked round-trips: inserts, updates, and
//! finally vendor mappings.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use catsync_core::{
    CatalogScope, MasterRecord, MergeOptions, ProviderItem, RunStats, SyncMode, VendorMapping,
};
use catsync_storage::{CatalogStore, StoreError};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::change::propose_update;
use crate::policy::{decide, Decision};
use crate::priority::PriorityTable;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;

/// Inputs shared by every item of one merge.
#[derive(Debug, Clone, Copy)]
pub struct MergeContext<'a> {
    pub provider_id: &'a str,
    pub scope: &'a CatalogScope,
    pub mode: SyncMode,
    pub options: MergeOptions,
    pub priorities: &'a PriorityTable,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub stats: RunStats,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Planned inserts or updates that a concurrent writer beat us to.
    pub lost_writes: u64,
}

impl MergeOutcome {
    /// True when every item was valid and every planned write landed.
    pub fn fully_applied(&self) -> bool {
        self.lost_writes == 0 && self.stats.failed == 0
    }

    fn settle(&mut self) {
        let s = &mut self.stats;
        s.skipped = s
            .processed
            .saturating_sub(s.failed + s.added + s.updated);
    }
}

/// A store failure part way through a merge. `outcome` only counts writes that committed.
#[derive(Debug)]
pub struct MergeFailure {
    pub outcome: MergeOutcome,
    pub source: StoreError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Insert,
    Update,
}

#[derive(Debug, Clone)]
struct Staged {
    kind: WriteKind,
    record: MasterRecord,
}

/// In-memory result of planning a merge; nothing here has touched the store.
#[derive(Debug, Default)]
pub struct MergePlan {
    pub inserts: Vec<MasterRecord>,
    pub updates: Vec<MasterRecord>,
    pub mappings: Vec<VendorMapping>,
    pub outcome: MergeOutcome,
}

/// Validates the feed and returns the valid items plus the outcome so far.
fn validate_items(provider_id: &str, items: &[ProviderItem]) -> (Vec<ProviderItem>, MergeOutcome) {
    let mut outcome = MergeOutcome::default();
    let mut valid = Vec::with_capacity(items.len());
    for item in items {
        outcome.stats.processed += 1;
        match item.validate(provider_id) {
            Ok(item) => valid.push(item),
            Err(err) => {
                let key = item.natural_key.trim();
                warn!(natural_key = %key, error = %err, "rejecting feed item");
                outcome.stats.failed += 1;
                outcome.errors.push(format!("item '{key}': {err}"));
            }
        }
    }
    (valid, outcome)
}

/// Plans writes for already validated `items` against the `existing` records of the scope.
pub fn plan_merge(
    ctx: &MergeContext<'_>,
    items: Vec<ProviderItem>,
    existing: &HashMap<String, MasterRecord>,
    now: DateTime<Utc>,
) -> MergePlan {
    let mut order: Vec<String> = Vec::new();
    let mut staged: HashMap<String, Staged> = HashMap::new();
    let mut mappings: HashMap<String, VendorMapping> = HashMap::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut warnings = Vec::new();

    for item in items {
        let key = item.natural_key.clone();
        if !seen.insert(key.clone()) {
            warn!(natural_key = %key, "duplicate natural key in feed; merging into earlier occurrence");
            warnings.push(format!(
                "duplicate natural key '{key}'; merged into the earlier occurrence"
            ));
        }

        let current = staged
            .get(&key)
            .map(|s| &s.record)
            .or_else(|| existing.get(&key));

        if item.carries_vendor_data() {
            let master_record_id = current
                .map(|r| r.id)
                .unwrap_or_else(|| ctx.scope.record_id(&key));
            mappings.insert(
                key.clone(),
                VendorMapping {
                    master_record_id,
                    provider_id: ctx.provider_id.to_string(),
                    vendor_sku: item.vendor_sku.clone(),
                    price_minor: item.price_minor,
                    quantity: item.quantity,
                    updated_at: now,
                },
            );
        }

        match decide(
            current.map(MasterRecord::provenance).as_ref(),
            ctx.provider_id,
            &ctx.options,
            ctx.priorities,
        ) {
            Decision::Insert => {
                let record = MasterRecord {
                    id: ctx.scope.record_id(&key),
                    tenant_id: ctx.scope.tenant_id.clone(),
                    vertical: ctx.scope.vertical.clone(),
                    natural_key: key.clone(),
                    fields: item.fields,
                    source_provider: Some(ctx.provider_id.to_string()),
                    source_locked: ctx.options.source_locked,
                    version: 1,
                    created_at: now,
                    updated_at: now,
                };
                order.push(key.clone());
                staged.insert(
                    key,
                    Staged {
                        kind: WriteKind::Insert,
                        record,
                    },
                );
            }
            Decision::Replace => {
                let Some(current) = current else { continue };
                let Some((record, changed)) =
                    propose_update(current, &item, ctx.provider_id, ctx.options.source_locked, now)
                else {
                    debug!(natural_key = %key, "no tracked field changed");
                    continue;
                };
                debug!(natural_key = %key, changed = ?changed, "staging update");
                let kind = staged
                    .get(&key)
                    .map(|s| s.kind)
                    .unwrap_or(WriteKind::Update);
                if !staged.contains_key(&key) {
                    order.push(key.clone());
                }
                staged.insert(key, Staged { kind, record });
            }
            Decision::Keep(reason) => {
                debug!(natural_key = %key, reason = ?reason, "keeping incumbent record");
            }
        }
    }

    let mut plan = MergePlan::default();
    for key in order {
        if let Some(s) = staged.remove(&key) {
            match s.kind {
                WriteKind::Insert => plan.inserts.push(s.record),
                WriteKind::Update => plan.updates.push(s.record),
            }
        }
    }
    let mut mappings: Vec<VendorMapping> = mappings.into_values().collect();
    mappings.sort_by_key(|m| m.master_record_id);
    plan.mappings = mappings;
    plan.outcome.warnings = warnings;
    plan
}

/// Applies provider feeds to a [`CatalogStore`] in bulk.
#[derive(Clone)]
pub struct BulkMergeExecutor {
    store: Arc<dyn CatalogStore>,
    max_batch_size: usize,
}

impl BulkMergeExecutor {
    pub fn new(store: Arc<dyn CatalogStore>, max_batch_size: usize) -> Self {
        Self {
            store,
            max_batch_size: max_batch_size.max(1),
        }
    }

    #[instrument(
        name = "bulk_merge",
        skip_all,
        fields(provider = %ctx.provider_id, scope = %ctx.scope, mode = %ctx.mode, items = items.len())
    )]
    pub async fn merge(
        &self,
        ctx: &MergeContext<'_>,
        items: &[ProviderItem],
    ) -> Result<MergeOutcome, MergeFailure> {
        let (valid, mut outcome) = validate_items(ctx.provider_id, items);

        let existing = match self.load_existing(ctx, &valid).await {
            Ok(existing) => existing,
            Err(source) => {
                outcome.settle();
                return Err(MergeFailure { outcome, source });
            }
        };

        let plan = plan_merge(ctx, valid, &existing, Utc::now());
        outcome.warnings.extend(plan.outcome.warnings);
        debug!(
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            mappings = plan.mappings.len(),
            "merge planned"
        );

        let mut lost: HashSet<Uuid> = HashSet::new();

        for chunk in plan.inserts.chunks(self.max_batch_size) {
            let inserted = match self.store.insert_records(chunk).await {
                Ok(ids) => ids,
                Err(source) => return Err(fail(outcome, source)),
            };
            outcome.stats.added += inserted.len() as u64;
            if inserted.len() < chunk.len() {
                let inserted: HashSet<Uuid> = inserted.into_iter().collect();
                for record in chunk.iter().filter(|r| !inserted.contains(&r.id)) {
                    warn!(natural_key = %record.natural_key, "record appeared concurrently; insert skipped");
                    outcome.warnings.push(format!(
                        "'{}' was inserted by a concurrent writer; skipped",
                        record.natural_key
                    ));
                    lost.insert(record.id);
                    outcome.lost_writes += 1;
                }
            }
        }

        for chunk in plan.updates.chunks(self.max_batch_size) {
            let updated = match self.store.update_records(chunk).await {
                Ok(ids) => ids,
                Err(source) => return Err(fail(outcome, source)),
            };
            outcome.stats.updated += updated.len() as u64;
            if updated.len() < chunk.len() {
                let updated: HashSet<Uuid> = updated.into_iter().collect();
                for record in chunk.iter().filter(|r| !updated.contains(&r.id)) {
                    warn!(natural_key = %record.natural_key, "record changed concurrently; update skipped");
                    outcome.warnings.push(format!(
                        "'{}' was modified by a concurrent writer; skipped",
                        record.natural_key
                    ));
                    outcome.lost_writes += 1;
                }
            }
        }

        let mappings: Vec<VendorMapping> = plan
            .mappings
            .into_iter()
            .filter(|m| !lost.contains(&m.master_record_id))
            .collect();
        for chunk in mappings.chunks(self.max_batch_size) {
            if let Err(source) = self.store.upsert_vendor_mappings(chunk).await {
                return Err(fail(outcome, source));
            }
        }

        outcome.settle();
        info!(
            processed = outcome.stats.processed,
            added = outcome.stats.added,
            updated = outcome.stats.updated,
            skipped = outcome.stats.skipped,
            failed = outcome.stats.failed,
            "merge applied"
        );
        Ok(outcome)
    }

    async fn load_existing(
        &self,
        ctx: &MergeContext<'_>,
        valid: &[ProviderItem],
    ) -> Result<HashMap<String, MasterRecord>, StoreError> {
        let records = match ctx.mode {
            SyncMode::Full => self.store.load_records(ctx.scope, None).await?,
            SyncMode::Incremental => {
                let mut keys: Vec<String> = valid.iter().map(|i| i.natural_key.clone()).collect();
                keys.sort_unstable();
                keys.dedup();
                if keys.is_empty() {
                    return Ok(HashMap::new());
                }
                self.store.load_records(ctx.scope, Some(&keys)).await?
            }
        };
        Ok(records
            .into_iter()
            .map(|r| (r.natural_key.clone(), r))
            .collect())
    }
}

fn fail(mut outcome: MergeOutcome, source: StoreError) -> MergeFailure {
    warn!(error = %source, "merge aborted by store failure");
    outcome.settle();
    MergeFailure { outcome, source }
}
