//! Feed fingerprints and record-level change detection.

use catsync_core::{CatalogScope, DescriptiveFields, MasterRecord, ProviderItem};
use catsync_storage::sha256_hex;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Content hash of one provider feed for one catalog scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FeedFingerprint(String);

impl FeedFingerprint {
    /// Hashes the raw feed bytes when the caller kept them, otherwise a canonical
    /// serialization of the items that ignores their order.
    pub fn compute(scope: &CatalogScope, raw: Option<&[u8]>, items: &[ProviderItem]) -> Self {
        let body = match raw {
            Some(bytes) => sha256_hex(bytes),
            None => items_digest(items),
        };
        let mut hasher = Sha256::new();
        hasher.update(scope.tenant_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(scope.vertical.as_bytes());
        hasher.update([0u8]);
        hasher.update(body.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn matches(&self, stored: Option<&str>) -> bool {
        stored == Some(self.0.as_str())
    }
}

fn items_digest(items: &[ProviderItem]) -> String {
    let mut item_hashes: Vec<String> = items
        .iter()
        .map(|item| sha256_hex(&serde_json::to_vec(item).unwrap_or_default()))
        .collect();
    item_hashes.sort_unstable();
    let mut hasher = Sha256::new();
    for hash in &item_hashes {
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Fields compared when deciding whether a replacement actually changes a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedField {
    Name,
    Brand,
    Model,
    Category,
    Specs,
    SourceProvider,
    SourceLocked,
}

/// Overlays candidate values on `existing`. Absent candidate values keep what is stored;
/// a non-empty spec map replaces the stored one wholesale.
pub fn merge_fields(existing: &DescriptiveFields, candidate: &DescriptiveFields) -> DescriptiveFields {
    fn pick(current: &Option<String>, incoming: &Option<String>) -> Option<String> {
        incoming.clone().or_else(|| current.clone())
    }

    DescriptiveFields {
        name: pick(&existing.name, &candidate.name),
        brand: pick(&existing.brand, &candidate.brand),
        model: pick(&existing.model, &candidate.model),
        category: pick(&existing.category, &candidate.category),
        specs: if candidate.specs.is_empty() {
            existing.specs.clone()
        } else {
            candidate.specs.clone()
        },
    }
}

pub fn diff_fields(before: &MasterRecord, after: &MasterRecord) -> Vec<TrackedField> {
    let mut changed = Vec::new();
    if before.fields.name != after.fields.name {
        changed.push(TrackedField::Name);
    }
    if before.fields.brand != after.fields.brand {
        changed.push(TrackedField::Brand);
    }
    if before.fields.model != after.fields.model {
        changed.push(TrackedField::Model);
    }
    if before.fields.category != after.fields.category {
        changed.push(TrackedField::Category);
    }
    if before.fields.specs != after.fields.specs {
        changed.push(TrackedField::Specs);
    }
    if before.source_provider != after.source_provider {
        changed.push(TrackedField::SourceProvider);
    }
    if before.source_locked != after.source_locked {
        changed.push(TrackedField::SourceLocked);
    }
    changed
}

/// Builds the record `provider` would write over `existing`, or `None` when nothing
/// tracked would change. The returned record keeps `existing.version` for the
/// optimistic write.
pub fn propose_update(
    existing: &MasterRecord,
    item: &ProviderItem,
    provider: &str,
    lock: bool,
    now: DateTime<Utc>,
) -> Option<(MasterRecord, Vec<TrackedField>)> {
    let proposed = MasterRecord {
        fields: merge_fields(&existing.fields, &item.fields),
        source_provider: Some(provider.to_string()),
        source_locked: existing.source_locked || lock,
        updated_at: now,
        ..existing.clone()
    };
    let changed = diff_fields(existing, &proposed);
    if changed.is_empty() {
        None
    } else {
        Some((proposed, changed))
    }
}
