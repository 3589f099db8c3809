//! Provider priority lookup with a TTL cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use catsync_core::{ProviderConfig, LOWEST_PRIORITY};
use catsync_storage::PriorityStore;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Immutable snapshot of the provider registry. Lower priority values win.
#[derive(Debug, Clone, Default)]
pub struct PriorityTable {
    providers: HashMap<String, ProviderConfig>,
}

impl PriorityTable {
    pub fn from_providers(providers: impl IntoIterator<Item = ProviderConfig>) -> Self {
        Self {
            providers: providers
                .into_iter()
                .map(|p| (p.provider_id.clone(), p))
                .collect(),
        }
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, i32)>) -> Self {
        Self::from_providers(pairs.into_iter().map(|(id, priority)| ProviderConfig {
            provider_id: id.to_string(),
            display_name: id.to_string(),
            priority,
            enabled: true,
        }))
    }

    /// Unknown, empty or blank ids resolve to [`LOWEST_PRIORITY`].
    pub fn priority(&self, provider_id: &str) -> i32 {
        let id = provider_id.trim();
        if id.is_empty() {
            return LOWEST_PRIORITY;
        }
        self.providers
            .get(id)
            .map(|p| p.priority)
            .unwrap_or(LOWEST_PRIORITY)
    }

    pub fn provider(&self, provider_id: &str) -> Option<&ProviderConfig> {
        self.providers.get(provider_id)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[derive(Debug)]
struct CachedTable {
    table: Arc<PriorityTable>,
    loaded_at: Instant,
}

/// Resolves provider priorities from a [`PriorityStore`], caching the whole table for `ttl`.
///
/// Lookups never fail: when the store cannot be read the previous snapshot keeps being
/// served, or an empty table if nothing was ever loaded.
pub struct PriorityResolver {
    store: Arc<dyn PriorityStore>,
    ttl: Duration,
    cache: RwLock<Option<CachedTable>>,
}

impl PriorityResolver {
    pub fn new(store: Arc<dyn PriorityStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cache: RwLock::new(None),
        }
    }

    pub async fn table(&self) -> Arc<PriorityTable> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.loaded_at.elapsed() < self.ttl {
                    return cached.table.clone();
                }
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(cached) = cache.as_ref() {
            if cached.loaded_at.elapsed() < self.ttl {
                return cached.table.clone();
            }
        }

        match self.store.load_providers().await {
            Ok(providers) => {
                let table = Arc::new(PriorityTable::from_providers(providers));
                debug!(providers = table.len(), "loaded provider priority table");
                *cache = Some(CachedTable {
                    table: table.clone(),
                    loaded_at: Instant::now(),
                });
                table
            }
            Err(err) => {
                warn!(error = %err, "failed to load provider priorities; serving previous table");
                cache
                    .as_ref()
                    .map(|cached| cached.table.clone())
                    .unwrap_or_default()
            }
        }
    }

    pub async fn priority(&self, provider_id: &str) -> i32 {
        self.table().await.priority(provider_id)
    }

    /// Drops the cached table so the next lookup reloads it.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catsync_storage::MemoryStore;

    fn provider(id: &str, priority: i32) -> ProviderConfig {
        ProviderConfig {
            provider_id: id.to_string(),
            display_name: id.to_string(),
            priority,
            enabled: true,
        }
    }

    #[test]
    fn unknown_and_blank_ids_get_lowest_priority() {
        let table = PriorityTable::from_pairs([("P1", 1)]);
        assert_eq!(table.priority("P1"), 1);
        assert_eq!(table.priority("nobody"), LOWEST_PRIORITY);
        assert_eq!(table.priority(""), LOWEST_PRIORITY);
        assert_eq!(table.priority("   "), LOWEST_PRIORITY);
    }

    #[tokio::test]
    async fn cached_table_is_served_until_invalidated() {
        let store = MemoryStore::with_providers(&[provider("P1", 1)])
            .await
            .expect("store");
        let resolver = PriorityResolver::new(Arc::new(store.clone()), Duration::from_secs(300));
        assert_eq!(resolver.priority("P1").await, 1);

        store
            .upsert_providers(&[provider("P1", 7)])
            .await
            .expect("upsert");
        assert_eq!(resolver.priority("P1").await, 1);

        resolver.invalidate().await;
        assert_eq!(resolver.priority("P1").await, 7);
    }

    #[tokio::test]
    async fn zero_ttl_reloads_every_lookup() {
        let store = MemoryStore::with_providers(&[provider("P1", 1)])
            .await
            .expect("store");
        let resolver = PriorityResolver::new(Arc::new(store.clone()), Duration::ZERO);
        assert_eq!(resolver.priority("P1").await, 1);
        store
            .upsert_providers(&[provider("P1", 2)])
            .await
            .expect("upsert");
        assert_eq!(resolver.priority("P1").await, 2);
    }
}
