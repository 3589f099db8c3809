use std::path::{Path, PathBuf};
use std::sync::Arc;

use catsync_core::{CatalogScope, SyncMode};
use catsync_storage::MemoryStore;
use catsync_sync::{load_feed_file, ProviderRegistry, SyncConfig, SyncEngine, SyncRequest};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap()
}

async fn engine_from_registry() -> (MemoryStore, SyncEngine) {
    let root = workspace_root();
    let registry = ProviderRegistry::load(&root.join("providers.yaml")).await.unwrap();
    let store = MemoryStore::new();
    let mut config = SyncConfig::from_env();
    config.max_batch_size = 50;
    let engine = SyncEngine::with_store(Arc::new(store.clone()), &config);
    engine.register_providers(&registry.providers).await.unwrap();
    (store, engine)
}

async fn feed_request(provider: &str, scope: &CatalogScope) -> SyncRequest {
    let path = workspace_root().join("fixtures/feeds").join(format!("{provider}.json"));
    let feed = load_feed_file(&path).await.unwrap();
    SyncRequest::new(provider, scope.clone(), SyncMode::Full, feed.items).with_raw_feed(feed.raw)
}

#[tokio::test]
async fn distributor_feed_wins_over_marketplace_feed() {
    let (store, engine) = engine_from_registry().await;
    let scope = CatalogScope::new("acme", "hardware");

    let market = engine
        .run_sync(feed_request("marketplace", &scope).await)
        .await
        .unwrap();
    assert_eq!(market.stats.added, 2);

    let distributor = engine
        .run_sync(feed_request("distributor-main", &scope).await)
        .await
        .unwrap();
    assert_eq!(distributor.stats.updated, 1);

    let hammer = store.record(&scope, "000381201669").await.unwrap();
    assert_eq!(hammer.source_provider.as_deref(), Some("distributor-main"));
    assert_eq!(hammer.fields.model.as_deref(), Some("51-163"));
    assert_eq!(hammer.fields.specs.get("handle").map(String::as_str), Some("fiberglass"));

    let tack = store.record(&scope, "000381201670").await.unwrap();
    assert_eq!(tack.source_provider.as_deref(), Some("marketplace"));

    let hammer_offers = store
        .mappings()
        .await
        .into_iter()
        .filter(|m| m.master_record_id == hammer.id)
        .count();
    assert_eq!(hammer_offers, 2);

    let replay = engine
        .run_sync(feed_request("marketplace", &scope).await)
        .await
        .unwrap();
    assert!(replay.short_circuited);
    assert_eq!(replay.stats.skipped, 2);
}

#[tokio::test]
async fn disabled_registry_entries_cannot_sync() {
    let (_, engine) = engine_from_registry().await;
    let scope = CatalogScope::new("acme", "hardware");
    let legacy = SyncRequest::new("legacy-import", scope, SyncMode::Full, Vec::new());
    assert!(matches!(
        engine.run_sync(legacy).await,
        Err(catsync_sync::SyncError::ProviderDisabled(_))
    ));
}
