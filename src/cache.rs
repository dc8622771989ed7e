//! The query cache: a directory of queries addressed by their key hash.

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::activity::ActivityProbe;
use crate::builder::QueryCacheBuilder;
use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::query::{Query, Updater};
use crate::query_fn::{PendingForever, QueryFn};
use crate::utils::spawn_detached;

/// Observes every state change of every query in a cache.
pub type CacheListener<V> = Arc<dyn Fn(&QueryCache<V>, &Arc<Query<V>>) + Send + Sync>;

pub(crate) struct CacheShared<V>
where
    V: Clone + Send + Sync + 'static,
{
    queries: Mutex<HashMap<String, Arc<Query<V>>>>,
    listeners: Mutex<Vec<(u64, CacheListener<V>)>>,
    next_listener_id: AtomicU64,
    pub(crate) fetching: AtomicUsize,
    defaults: QueryConfig<V>,
    probe: Arc<dyn ActivityProbe>,
}

/// Selects queries in bulk operations.
pub enum QueryPredicate<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Every query.
    All,
    /// No query.
    Nothing,
    /// Queries whose key matches, exactly or by deep inclusion.
    Key(QueryKey),
    Filter(Arc<dyn Fn(&Query<V>) -> bool + Send + Sync>),
}

impl<V> QueryPredicate<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn filter(f: impl Fn(&Query<V>) -> bool + Send + Sync + 'static) -> Self {
        QueryPredicate::Filter(Arc::new(f))
    }

    fn selects(&self, query: &Query<V>, exact: bool) -> bool {
        match self {
            QueryPredicate::All => true,
            QueryPredicate::Nothing => false,
            QueryPredicate::Key(key) => query.key().matches(key, exact),
            QueryPredicate::Filter(f) => f(query),
        }
    }
}

impl<V> Clone for QueryPredicate<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        match self {
            QueryPredicate::All => QueryPredicate::All,
            QueryPredicate::Nothing => QueryPredicate::Nothing,
            QueryPredicate::Key(key) => QueryPredicate::Key(key.clone()),
            QueryPredicate::Filter(f) => QueryPredicate::Filter(Arc::clone(f)),
        }
    }
}

impl<V> fmt::Debug for QueryPredicate<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryPredicate::All => f.write_str("All"),
            QueryPredicate::Nothing => f.write_str("Nothing"),
            QueryPredicate::Key(key) => write!(f, "Key({key})"),
            QueryPredicate::Filter(_) => f.write_str("Filter(..)"),
        }
    }
}

impl<V> From<bool> for QueryPredicate<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn from(all: bool) -> Self {
        if all {
            QueryPredicate::All
        } else {
            QueryPredicate::Nothing
        }
    }
}

impl<V> From<QueryKey> for QueryPredicate<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn from(key: QueryKey) -> Self {
        QueryPredicate::Key(key)
    }
}

impl<V> From<&QueryKey> for QueryPredicate<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn from(key: &QueryKey) -> Self {
        QueryPredicate::Key(key.clone())
    }
}

impl<V> From<&str> for QueryPredicate<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn from(key: &str) -> Self {
        QueryPredicate::Key(QueryKey::from(key))
    }
}

impl<V> From<Value> for QueryPredicate<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn from(key: Value) -> Self {
        QueryPredicate::Key(QueryKey::from(key))
    }
}

/// Options for [`QueryCache::set_query_data_with`].
pub struct SetDataOptions<V> {
    /// Look the target query up by exact key. Defaults to `true`.
    pub exact: bool,
    /// Config for the placeholder query created when nothing matches.
    pub config: QueryConfig<V>,
}

impl<V> Default for SetDataOptions<V> {
    fn default() -> Self {
        SetDataOptions {
            exact: true,
            config: QueryConfig::default(),
        }
    }
}

/// Options for [`QueryCache::prefetch_query`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefetchOptions {
    /// Fetch even if the cached data is still fresh.
    pub force: bool,
    /// Return fetch errors instead of logging them.
    pub throw_on_error: bool,
}

/// Options for [`QueryCache::invalidate_queries`].
#[derive(Debug, Clone, Copy)]
pub struct InvalidateOptions {
    /// Refetch matching queries that have subscribers. Defaults to `true`.
    pub refetch_active: bool,
    pub exact: bool,
    /// Swallow refetch errors instead of returning the first one.
    pub suppress_errors: bool,
}

impl Default for InvalidateOptions {
    fn default() -> Self {
        InvalidateOptions {
            refetch_active: true,
            exact: false,
            suppress_errors: false,
        }
    }
}

/// A directory of queries sharing defaults and an activity probe.
///
/// Cloning is cheap and yields a handle to the same directory.
///
/// # Example
///
/// ```ignore
/// use swr_query::{QueryCache, QueryConfig, QueryKey, BoxError};
/// use std::time::Duration;
///
/// let cache: QueryCache<Vec<u32>> = QueryCache::new();
/// let query = cache.build_query(
///     "todos",
///     |_key: QueryKey| async { Ok::<_, BoxError>(vec![1, 2, 3]) },
///     QueryConfig::new().stale_time(Duration::from_secs(30)),
/// );
///
/// let sub = query.subscribe(|state| println!("{:?}", state.status), Default::default());
/// sub.run().await;
/// ```
pub struct QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    shared: Arc<CacheShared<V>>,
}

impl<V> Clone for QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        QueryCache {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V> Default for QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> QueryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache with built-in defaults that is always active.
    pub fn new() -> Self {
        QueryCacheBuilder::new().build()
    }

    pub fn builder() -> QueryCacheBuilder<V> {
        QueryCacheBuilder::new()
    }

    pub(crate) fn with_parts(defaults: QueryConfig<V>, probe: Arc<dyn ActivityProbe>) -> Self {
        QueryCache {
            shared: Arc::new(CacheShared {
                queries: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
                fetching: AtomicUsize::new(0),
                defaults,
                probe,
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<CacheShared<V>>) -> Self {
        QueryCache { shared }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<CacheShared<V>> {
        Arc::downgrade(&self.shared)
    }

    /// Get the query for `key`, creating it if needed.
    ///
    /// An existing query keeps its state and has its fetch operation and config
    /// replaced. `config` is merged over the cache defaults.
    pub fn build_query(
        &self,
        key: impl Into<QueryKey>,
        query_fn: impl QueryFn<V> + 'static,
        config: QueryConfig<V>,
    ) -> Arc<Query<V>> {
        let key = key.into();
        let config = config.merge(&self.shared.defaults);
        let hash = config.hash_key(&key);
        let query_fn: Arc<dyn QueryFn<V>> = Arc::new(query_fn);

        let (query, created) = {
            let mut queries = self.shared.queries.lock();
            match queries.get(&hash) {
                Some(existing) => {
                    existing.update(query_fn, config.resolve());
                    (Arc::clone(existing), false)
                }
                None => {
                    let query = Query::new(
                        key,
                        hash.clone(),
                        query_fn,
                        config.resolve(),
                        Arc::downgrade(&self.shared),
                        Arc::clone(&self.shared.probe),
                    );
                    queries.insert(hash, Arc::clone(&query));
                    query.attach();
                    (query, true)
                }
            }
        };

        if created {
            tracing::debug!("Created query {}", query.hash());
            if query.data().is_some() {
                query.schedule_stale_timeout();
                query.heal();
                query.schedule_gc();
            }
        }
        query.schedule_refetch_interval();

        if created {
            // Listeners must not observe the query while it is still being set up.
            let shared = Arc::downgrade(&self.shared);
            let created = Arc::clone(&query);
            let deferred = spawn_detached("cache notification", async move {
                if let Some(shared) = shared.upgrade() {
                    QueryCache::from_shared(shared).notify(&created);
                }
            });
            if deferred.is_none() {
                self.notify(&query);
            }
        }

        query
    }

    /// Queries selected by `predicate`, in no particular order.
    pub fn get_queries(
        &self,
        predicate: impl Into<QueryPredicate<V>>,
        exact: bool,
    ) -> Vec<Arc<Query<V>>> {
        let predicate = predicate.into();
        // Filters run user code, so they never see the directory locked.
        let queries: Vec<_> = self.shared.queries.lock().values().cloned().collect();
        queries
            .into_iter()
            .filter(|query| predicate.selects(query, exact))
            .collect()
    }

    /// The query whose key equals `key`.
    pub fn get_query(&self, key: impl Into<QueryKey>) -> Option<Arc<Query<V>>> {
        let key: QueryKey = key.into();
        self.get_queries(key, true).into_iter().next()
    }

    pub fn get_query_data(&self, key: impl Into<QueryKey>) -> Option<V> {
        self.get_query(key).and_then(|query| query.data())
    }

    /// Set the data of the query for `key`, creating a placeholder query if none exists.
    pub fn set_query_data(&self, key: impl Into<QueryKey>, updater: impl Into<Updater<V>>) {
        self.set_query_data_with(key, updater, SetDataOptions::default());
    }

    /// Like [`QueryCache::set_query_data`], with lookup and placeholder options.
    ///
    /// The placeholder's fetch operation never resolves, so it only ever holds
    /// data set through this cache.
    pub fn set_query_data_with(
        &self,
        key: impl Into<QueryKey>,
        updater: impl Into<Updater<V>>,
        options: SetDataOptions<V>,
    ) {
        let key = key.into();
        let query = match self.get_queries(&key, options.exact).into_iter().next() {
            Some(query) => query,
            None => self.build_query(key, PendingForever, options.config),
        };
        query.set_data(updater);
    }

    /// Build the query and fetch it if it is stale or `force` is set.
    ///
    /// Returns the query data afterwards. Fetch errors are logged and swallowed
    /// unless `throw_on_error` is set. A prefetched query without subscribers is
    /// scheduled for garbage collection.
    pub async fn prefetch_query(
        &self,
        key: impl Into<QueryKey>,
        query_fn: impl QueryFn<V> + 'static,
        config: QueryConfig<V>,
        options: PrefetchOptions,
    ) -> Result<Option<V>, QueryError> {
        let query = self.build_query(key, query_fn, config);

        if options.force || query.state().is_stale {
            match query.fetch().await {
                Ok(_) => {}
                Err(err) if err.is_cancelled() => {}
                Err(err) if options.throw_on_error => return Err(err),
                Err(err) => {
                    tracing::warn!("Prefetch of query {} failed: {}", query.hash(), err);
                }
            }
        }

        if query.subscriber_count() == 0 {
            query.schedule_gc();
        }

        Ok(query.data())
    }

    /// Refetch matching queries that have subscribers and mark the rest stale.
    ///
    /// Refetches run concurrently. The first non-cancellation error is returned
    /// unless `suppress_errors` is set.
    pub async fn invalidate_queries(
        &self,
        predicate: impl Into<QueryPredicate<V>>,
        options: InvalidateOptions,
    ) -> Result<(), QueryError> {
        let queries = self.get_queries(predicate, options.exact);
        let mut refetches = Vec::new();

        for query in queries {
            if options.refetch_active && query.subscriber_count() > 0 {
                refetches.push(async move { query.fetch().await });
            } else {
                query.invalidate();
            }
        }

        tracing::debug!("Refetching {} invalidated queries", refetches.len());
        let results = join_all(refetches).await;
        if options.suppress_errors {
            return Ok(());
        }

        match results
            .into_iter()
            .filter_map(Result::err)
            .find(|err| !err.is_cancelled())
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Cancel the in-flight fetch of every matching query.
    pub fn cancel_queries(&self, predicate: impl Into<QueryPredicate<V>>, exact: bool) {
        for query in self.get_queries(predicate, exact) {
            query.cancel();
        }
    }

    /// Remove matching queries from the cache and stop their timers.
    pub fn remove_queries(&self, predicate: impl Into<QueryPredicate<V>>, exact: bool) {
        for query in self.get_queries(predicate, exact) {
            self.remove_if_current(&query);
        }
    }

    /// Remove every query.
    pub fn clear(&self) {
        let removed: Vec<_> = self.shared.queries.lock().drain().map(|(_, q)| q).collect();
        tracing::debug!("Clearing {} queries", removed.len());
        for query in removed {
            self.detach(&query);
        }
    }

    /// Wake every retry loop paused while the environment was inactive.
    pub fn resume_paused_queries(&self) {
        for query in self.get_queries(QueryPredicate::All, false) {
            if query.is_paused() {
                query.resume();
            }
        }
    }

    /// Number of listed queries currently fetching.
    pub fn is_fetching(&self) -> usize {
        self.shared.fetching.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.shared.queries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a cache-wide listener. Returns an id for [`QueryCache::unsubscribe`].
    pub fn subscribe(
        &self,
        listener: impl Fn(&QueryCache<V>, &Arc<Query<V>>) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut listeners = self.shared.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() < before
    }

    pub(crate) fn contains(&self, query: &Arc<Query<V>>) -> bool {
        self.shared
            .queries
            .lock()
            .get(query.hash())
            .is_some_and(|current| Arc::ptr_eq(current, query))
    }

    /// Remove `query` unless its hash now belongs to another query.
    pub(crate) fn remove_if_current(&self, query: &Arc<Query<V>>) -> bool {
        let removed = {
            let mut queries = self.shared.queries.lock();
            match queries.get(query.hash()) {
                Some(current) if Arc::ptr_eq(current, query) => queries.remove(query.hash()),
                _ => None,
            }
        };

        match removed {
            Some(query) => {
                self.detach(&query);
                true
            }
            None => false,
        }
    }

    fn detach(&self, query: &Arc<Query<V>>) {
        query.clear();
        self.notify(query);
    }

    /// Call the cache-wide listeners.
    pub(crate) fn notify(&self, query: &Arc<Query<V>>) {
        let listeners: Vec<_> = self
            .shared
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(self, query);
        }
    }
}
