//! Builder API for creating query caches.

use std::sync::Arc;

use crate::activity::{ActivityProbe, AlwaysActive};
use crate::cache::QueryCache;
use crate::config::QueryConfig;
use crate::registry::CacheRegistry;

/// Builder for [`QueryCache`] instances.
///
/// # Example
///
/// ```ignore
/// use swr_query::{ActivityFlag, CacheRegistry, QueryCache, QueryConfig};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let focus = Arc::new(ActivityFlag::new(true));
/// let registry = CacheRegistry::new();
///
/// let cache: QueryCache<String> = QueryCache::builder()
///     .defaults(QueryConfig::new().stale_time(Duration::from_secs(30)).retry(1))
///     .activity_probe(focus.clone())
///     .registry(&registry)
///     .build();
/// ```
pub struct QueryCacheBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    defaults: QueryConfig<V>,
    probe: Arc<dyn ActivityProbe>,
    registry: Option<CacheRegistry>,
}

impl<V> QueryCacheBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        QueryCacheBuilder {
            defaults: QueryConfig::default(),
            probe: Arc::new(AlwaysActive),
            registry: None,
        }
    }

    /// Config applied to every query, below the per-query config.
    pub fn defaults(mut self, defaults: QueryConfig<V>) -> Self {
        self.defaults = defaults;
        self
    }

    /// Probe gating retries and interval refetches.
    pub fn activity_probe(mut self, probe: Arc<dyn ActivityProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Track the built cache in `registry` until the cache is dropped.
    pub fn registry(mut self, registry: &CacheRegistry) -> Self {
        self.registry = Some(registry.clone());
        self
    }

    pub fn build(self) -> QueryCache<V> {
        let cache = QueryCache::with_parts(self.defaults, self.probe);
        if let Some(registry) = self.registry {
            registry.register(&cache);
        }
        cache
    }
}

impl<V> Default for QueryCacheBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
