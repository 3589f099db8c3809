//! Core catalog model and provenance types for catsync.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "catsync-core";

/// Priority assigned to providers that are unknown or have no configured priority.
pub const LOWEST_PRIORITY: i32 = 999;

pub const MAX_NATURAL_KEY_LEN: usize = 128;

/// The catalog a sync run writes into: one master catalog per tenant vertical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CatalogScope {
    pub tenant_id: String,
    pub vertical: String,
}

impl CatalogScope {
    pub fn new(tenant_id: impl Into<String>, vertical: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            vertical: vertical.into(),
        }
    }

    /// Deterministic master record id for a natural key inside this scope.
    pub fn record_id(&self, natural_key: &str) -> Uuid {
        let name = format!("{}:{}:{}", self.tenant_id, self.vertical, natural_key);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }
}

impl fmt::Display for CatalogScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.vertical)
    }
}

/// Descriptive values owned by whichever provider currently wins a record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptiveFields {
    pub name: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub category: Option<String>,
    pub specs: BTreeMap<String, String>,
}

/// Who populated a record's descriptive fields, and whether an administrator pinned it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Provenance {
    pub provider: Option<String>,
    pub source_locked: bool,
}

impl Provenance {
    pub fn owned_by(provider: impl Into<String>) -> Self {
        Self {
            provider: Some(provider.into()),
            source_locked: false,
        }
    }

    pub fn locked(mut self) -> Self {
        self.source_locked = true;
        self
    }
}

/// Consolidated catalog entry, one per natural key per catalog scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub vertical: String,
    pub natural_key: String,
    pub fields: DescriptiveFields,
    pub source_provider: Option<String>,
    pub source_locked: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MasterRecord {
    pub fn provenance(&self) -> Provenance {
        Provenance {
            provider: self.source_provider.clone(),
            source_locked: self.source_locked,
        }
    }
}

/// One normalized record of an incoming provider feed. Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderItem {
    pub natural_key: String,
    #[serde(default)]
    pub provider_id: String,
    #[serde(flatten)]
    pub fields: DescriptiveFields,
    #[serde(default)]
    pub vendor_sku: Option<String>,
    #[serde(default)]
    pub price_minor: Option<i64>,
    #[serde(default)]
    pub quantity: Option<i32>,
}

impl ProviderItem {
    pub fn new(natural_key: impl Into<String>, provider_id: impl Into<String>) -> Self {
        Self {
            natural_key: natural_key.into(),
            provider_id: provider_id.into(),
            fields: DescriptiveFields::default(),
            vendor_sku: None,
            price_minor: None,
            quantity: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.fields.name = Some(name.into());
        self
    }

    pub fn with_spec(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.specs.insert(key.into(), value.into());
        self
    }

    /// Checks the item against the run it arrived in and returns a normalized copy:
    /// the natural key is trimmed and a missing provider id is filled with the run's.
    pub fn validate(&self, run_provider: &str) -> Result<ProviderItem, ItemError> {
        let natural_key = self.natural_key.trim();
        if natural_key.is_empty() {
            return Err(ItemError::BlankNaturalKey);
        }
        if natural_key.chars().count() > MAX_NATURAL_KEY_LEN {
            return Err(ItemError::NaturalKeyTooLong {
                len: natural_key.chars().count(),
            });
        }

        let provider_id = self.provider_id.trim();
        if !provider_id.is_empty() && provider_id != run_provider {
            return Err(ItemError::ProviderMismatch {
                expected: run_provider.to_string(),
                found: provider_id.to_string(),
            });
        }

        if self
            .fields
            .name
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .is_empty()
        {
            return Err(ItemError::MissingName);
        }
        if let Some(price) = self.price_minor.filter(|p| *p < 0) {
            return Err(ItemError::NegativePrice(price));
        }
        if let Some(quantity) = self.quantity.filter(|q| *q < 0) {
            return Err(ItemError::NegativeQuantity(quantity));
        }

        let mut item = self.clone();
        item.natural_key = natural_key.to_string();
        item.provider_id = run_provider.to_string();
        Ok(item)
    }

    pub fn carries_vendor_data(&self) -> bool {
        self.vendor_sku.is_some() || self.price_minor.is_some() || self.quantity.is_some()
    }
}

/// Per-item transformation failure. Counted and logged, never fatal to a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemError {
    #[error("natural key is blank")]
    BlankNaturalKey,
    #[error("natural key is {len} characters, limit is {}", MAX_NATURAL_KEY_LEN)]
    NaturalKeyTooLong { len: usize },
    #[error("item belongs to provider {found}, run is for {expected}")]
    ProviderMismatch { expected: String, found: String },
    #[error("item has no name")]
    MissingName,
    #[error("negative price {0}")]
    NegativePrice(i64),
    #[error("negative quantity {0}")]
    NegativeQuantity(i32),
}

/// Provider-specific SKU/price/quantity for a master record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorMapping {
    pub master_record_id: Uuid,
    pub provider_id: String,
    pub vendor_sku: Option<String>,
    pub price_minor: Option<i64>,
    pub quantity: Option<i32>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    Full,
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(SyncMode::Full),
            "incremental" => Ok(SyncMode::Incremental),
            other => Err(ParseEnumError {
                kind: "sync mode",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" => Ok(RunStatus::Idle),
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            other => Err(ParseEnumError {
                kind: "run status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Per-run counters. `processed == added + updated + skipped + failed` once a merge finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub processed: u64,
    pub added: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl RunStats {
    pub fn all_skipped(count: u64) -> Self {
        Self {
            processed: count,
            skipped: count,
            ..Self::default()
        }
    }
}

/// Persistent per-provider run bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunState {
    pub provider_id: String,
    pub mode: SyncMode,
    pub status: RunStatus,
    /// Identifies the run that last moved this provider to `running`.
    pub run_id: Option<Uuid>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub records_processed: u64,
    pub records_added: u64,
    pub records_updated: u64,
    pub records_skipped: u64,
    pub records_failed: u64,
    pub last_error: Option<String>,
    pub last_feed_hash: Option<String>,
    /// Counters of the last successful run; failed runs leave them alone.
    #[serde(default)]
    pub last_success_stats: Option<RunStats>,
}

impl SyncRunState {
    pub fn idle(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            mode: SyncMode::Full,
            status: RunStatus::Idle,
            run_id: None,
            last_run_at: None,
            finished_at: None,
            last_success_at: None,
            records_processed: 0,
            records_added: 0,
            records_updated: 0,
            records_skipped: 0,
            records_failed: 0,
            last_error: None,
            last_feed_hash: None,
            last_success_stats: None,
        }
    }

    pub fn stats(&self) -> RunStats {
        RunStats {
            processed: self.records_processed,
            added: self.records_added,
            updated: self.records_updated,
            skipped: self.records_skipped,
            failed: self.records_failed,
        }
    }

    pub fn set_stats(&mut self, stats: RunStats) {
        self.records_processed = stats.processed;
        self.records_added = stats.added;
        self.records_updated = stats.updated;
        self.records_skipped = stats.skipped;
        self.records_failed = stats.failed;
    }

    /// A run counts as stuck once it has been `running` for longer than `max_duration`.
    pub fn is_stuck(&self, now: DateTime<Utc>, max_duration: Duration) -> bool {
        self.status == RunStatus::Running
            && self
                .last_run_at
                .map(|started| now - started > max_duration)
                .unwrap_or(true)
    }
}

/// Flags an administrator or caller attaches to a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeOptions {
    /// Bypass priority and lock rules for every record in this run.
    pub manual_override: bool,
    /// Pin every record written by this run to the run's provider.
    pub source_locked: bool,
    /// Run the merge even if the feed fingerprint matches the last success.
    pub force: bool,
}

/// Outcome of one `run_sync` call, returned to the caller and mirrored into run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub provider_id: String,
    pub mode: SyncMode,
    pub status: RunStatus,
    #[serde(flatten)]
    pub stats: RunStats,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub fingerprint: Option<String>,
    pub short_circuited: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Registry entry supplied by the provider configuration collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub display_name: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_priority() -> i32 {
    LOWEST_PRIORITY
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_ids_are_deterministic_per_scope() {
        let scope = CatalogScope::new("acme", "hardware");
        assert_eq!(scope.record_id("000381201669"), scope.record_id("000381201669"));
        assert_ne!(
            scope.record_id("000381201669"),
            CatalogScope::new("acme", "grocery").record_id("000381201669")
        );
    }

    #[test]
    fn validate_trims_key_and_fills_provider() {
        let item = ProviderItem::new("  000381201669 ", "").with_name("Widget");
        let valid = item.validate("P1").expect("valid");
        assert_eq!(valid.natural_key, "000381201669");
        assert_eq!(valid.provider_id, "P1");
    }

    #[test]
    fn validate_rejects_malformed_items() {
        assert_eq!(
            ProviderItem::new("   ", "P1").with_name("x").validate("P1"),
            Err(ItemError::BlankNaturalKey)
        );
        assert_eq!(
            ProviderItem::new("k", "P1").validate("P1"),
            Err(ItemError::MissingName)
        );
        assert!(matches!(
            ProviderItem::new("k", "P2").with_name("x").validate("P1"),
            Err(ItemError::ProviderMismatch { .. })
        ));
        let mut negative = ProviderItem::new("k", "P1").with_name("x");
        negative.price_minor = Some(-5);
        assert_eq!(negative.validate("P1"), Err(ItemError::NegativePrice(-5)));
        let long = ProviderItem::new("k".repeat(MAX_NATURAL_KEY_LEN + 1), "P1").with_name("x");
        assert!(matches!(long.validate("P1"), Err(ItemError::NaturalKeyTooLong { .. })));
    }

    #[test]
    fn provider_item_reads_flat_json() {
        let item: ProviderItem = serde_json::from_str(
            r#"{"natural_key":"000381201669","name":"Widget","brand":"Acme","specs":{"color":"red"},"price_minor":1299}"#,
        )
        .expect("parse");
        assert_eq!(item.fields.name.as_deref(), Some("Widget"));
        assert_eq!(item.fields.specs.get("color").map(String::as_str), Some("red"));
        assert_eq!(item.price_minor, Some(1299));
        assert!(item.provider_id.is_empty());
    }

    #[test]
    fn stuck_detection_only_applies_to_running_states() {
        let now = Utc::now();
        let mut state = SyncRunState::idle("P1");
        state.last_run_at = Some(now - Duration::hours(3));
        assert!(!state.is_stuck(now, Duration::hours(1)));
        state.status = RunStatus::Running;
        assert!(state.is_stuck(now, Duration::hours(1)));
        assert!(!state.is_stuck(now, Duration::hours(4)));
    }

    #[test]
    fn enums_round_trip_through_strings() {
        assert_eq!("Incremental".parse::<SyncMode>(), Ok(SyncMode::Incremental));
        assert_eq!("running".parse::<RunStatus>(), Ok(RunStatus::Running));
        assert!("paused".parse::<RunStatus>().is_err());
    }
}
