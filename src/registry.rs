//! Lifecycle bookkeeping for the query caches of a process.
//!
//! A [`CacheRegistry`] is an explicit value rather than a global, so each
//! application (or test) decides which caches it tracks. The registry only holds
//! weak references: dropping the last handle to a cache unregisters it.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use crate::cache::{CacheShared, QueryCache};

/// Type-erased view of a cache, independent of its value type.
pub trait ManagedCache: Send + Sync {
    /// Remove every query.
    fn clear(&self);

    /// Number of queries currently fetching.
    fn is_fetching(&self) -> usize;

    /// Number of cached queries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> ManagedCache for QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn clear(&self) {
        QueryCache::clear(self);
    }

    fn is_fetching(&self) -> usize {
        QueryCache::is_fetching(self)
    }

    fn len(&self) -> usize {
        QueryCache::len(self)
    }
}

trait WeakCache: Send + Sync {
    fn upgrade(&self) -> Option<Box<dyn ManagedCache>>;
}

impl<V> WeakCache for Weak<CacheShared<V>>
where
    V: Clone + Send + Sync + 'static,
{
    fn upgrade(&self) -> Option<Box<dyn ManagedCache>> {
        Weak::upgrade(self).map(|shared| Box::new(QueryCache::from_shared(shared)) as Box<dyn ManagedCache>)
    }
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    caches: Vec<(u64, Box<dyn WeakCache>)>,
}

/// Tracks live query caches. Cloning yields a handle to the same registry.
#[derive(Clone, Default)]
pub struct CacheRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `cache`. Returns an id for [`CacheRegistry::unregister`].
    pub fn register<V>(&self, cache: &QueryCache<V>) -> u64
    where
        V: Clone + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.caches.push((id, Box::new(cache.downgrade())));
        tracing::debug!("Registered query cache {}", id);
        id
    }

    pub fn unregister(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.caches.len();
        inner.caches.retain(|(cache_id, _)| *cache_id != id);
        inner.caches.len() < before
    }

    /// Live caches, pruning the ones that were dropped.
    fn live(&self) -> Vec<Box<dyn ManagedCache>> {
        let mut inner = self.inner.lock();
        let mut live = Vec::with_capacity(inner.caches.len());
        inner.caches.retain(|(_, cache)| match cache.upgrade() {
            Some(cache) => {
                live.push(cache);
                true
            }
            None => false,
        });
        live
    }

    /// Number of live registered caches.
    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetching queries across every registered cache.
    pub fn total_fetching(&self) -> usize {
        self.live().iter().map(|cache| cache.is_fetching()).sum()
    }

    /// Clear every registered cache.
    pub fn clear_all(&self) {
        for cache in self.live() {
            cache.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryConfig;
    use crate::error::BoxError;
    use crate::key::QueryKey;

    #[tokio::test]
    async fn test_register_and_unregister() {
        let registry = CacheRegistry::new();
        let users: QueryCache<String> = QueryCache::new();
        let counts: QueryCache<u64> = QueryCache::new();

        let users_id = registry.register(&users);
        registry.register(&counts);
        assert_eq!(registry.len(), 2);

        assert!(registry.unregister(users_id));
        assert!(!registry.unregister(users_id));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_caches_are_pruned() {
        let registry = CacheRegistry::new();
        {
            let cache: QueryCache<u32> = QueryCache::new();
            registry.register(&cache);
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all_and_total_fetching() {
        let registry = CacheRegistry::new();
        let users: QueryCache<String> = QueryCache::builder().registry(&registry).build();
        let counts: QueryCache<u64> = QueryCache::builder().registry(&registry).build();

        users.set_query_data("alice", "Alice".to_string());
        counts.set_query_data("visits", 3u64);
        let pending = counts
            .build_query(
                "slow",
                |_key: QueryKey| async {
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    Ok::<u64, BoxError>(1)
                },
                QueryConfig::new(),
            )
            .start_fetch();
        assert_eq!(registry.total_fetching(), 1);

        pending.await.unwrap();
        assert_eq!(registry.total_fetching(), 0);

        registry.clear_all();
        assert!(users.is_empty());
        assert!(counts.is_empty());
    }
}
