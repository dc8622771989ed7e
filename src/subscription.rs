use std::sync::Arc;

use crate::config::Callbacks;
use crate::error::QueryError;
use crate::query::Query;
use crate::state::QueryState;
use crate::timers::heal;

/// Receives every state change of a query.
pub type Listener<V> = Arc<dyn Fn(&QueryState<V>) + Send + Sync>;

pub(crate) struct Subscriber<V> {
    id: u64,
    pub(crate) listener: Listener<V>,
    pub(crate) callbacks: Callbacks<V>,
}

/// A live consumer of a query.
///
/// Dropping the subscription unsubscribes. When the last subscriber leaves, the
/// in-flight fetch is cancelled and the query is scheduled for garbage collection.
pub struct Subscription<V>
where
    V: Clone + Send + Sync + 'static,
{
    query: Arc<Query<V>>,
    id: u64,
}

impl<V> Query<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Register a consumer. Any pending garbage collection is cancelled first.
    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(&QueryState<V>) + Send + Sync + 'static,
        callbacks: Callbacks<V>,
    ) -> Subscription<V> {
        let mut inner = self.inner.lock();
        heal(&mut inner);

        inner.next_subscriber_id += 1;
        let id = inner.next_subscriber_id;
        inner.subscribers.push(Subscriber {
            id,
            listener: Arc::new(listener),
            callbacks,
        });

        Subscription {
            query: Arc::clone(self),
            id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    fn unsubscribe(self: &Arc<Self>, id: u64) {
        let now_unused = {
            let mut inner = self.inner.lock();
            let before = inner.subscribers.len();
            inner.subscribers.retain(|s| s.id != id);
            inner.subscribers.len() < before && inner.subscribers.is_empty()
        };

        if now_unused {
            self.cancel();
            self.schedule_gc();
        }
    }
}

impl<V> Subscription<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn query(&self) -> &Arc<Query<V>> {
        &self.query
    }

    pub fn state(&self) -> QueryState<V> {
        self.query.state()
    }

    /// Mount/update hook.
    ///
    /// Resumes a retry loop paused by inactivity, then refetches when the query
    /// is enabled and stale, and either remount refetching is on or this is the
    /// only subscriber. A refetch right after a suspending read is skipped.
    /// Failures are only logged, since nobody else observes this fetch.
    pub async fn run(&self) {
        self.query.resume();

        let should_fetch = {
            let inner = self.query.inner.lock();
            inner.config.enabled
                && !inner.was_suspended
                && inner.state.is_stale
                && (inner.config.refetch_on_mount || inner.subscribers.len() == 1)
        };

        if should_fetch
            && let Err(err) = self.query.fetch().await
            && !err.is_cancelled()
        {
            tracing::warn!(
                "Refetch on mount failed for query {}: {}",
                self.query.hash(),
                err
            );
        }

        self.query.inner.lock().was_suspended = false;
    }

    /// Fetch now, sharing any fetch already in flight.
    pub async fn refetch(&self) -> Result<V, QueryError> {
        self.query.fetch().await
    }

    /// Stop receiving updates. Same as dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl<V> Drop for Subscription<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.query.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::QueryCache;
    use crate::config::QueryConfig;
    use crate::error::BoxError;
    use crate::key::QueryKey;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting(
        calls: Arc<AtomicUsize>,
    ) -> impl Fn(QueryKey) -> futures::future::BoxFuture<'static, Result<u32, BoxError>>
    + Send
    + Sync
    + 'static {
        use futures::FutureExt;
        move |_key| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, BoxError>(1)
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_fetches_stale_query_once_per_mount() {
        let cache: QueryCache<u32> = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = cache.build_query(
            "todos",
            counting(calls.clone()),
            QueryConfig::new().stale_time(Duration::from_secs(60)),
        );

        let sub = query.subscribe(|_| {}, Default::default());
        sub.run().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sub.state().is_success());

        // Fresh data: no refetch on the next mount.
        sub.run().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_without_remount_refetch_only_for_first_subscriber() {
        let cache: QueryCache<u32> = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = cache.build_query(
            "todos",
            counting(calls.clone()),
            QueryConfig::new().refetch_on_mount(false),
        );

        let first = query.subscribe(|_| {}, Default::default());
        first.run().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // stale_time is zero, so the data is stale again on the next tick.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(query.state().is_stale);

        let second = query.subscribe(|_| {}, Default::default());
        second.run().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(second);
        first.run().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_skips_disabled_query() {
        let cache: QueryCache<u32> = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = cache.build_query(
            "todos",
            counting(calls.clone()),
            QueryConfig::new().enabled(false),
        );

        let sub = query.subscribe(|_| {}, Default::default());
        sub.run().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(sub.state().is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_skips_refetch_after_suspended_read() {
        let cache: QueryCache<u32> = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = cache.build_query("todos", counting(calls.clone()), QueryConfig::new());

        query.fetch_suspended().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(query.state().is_stale);

        let sub = query.subscribe(|_| {}, Default::default());
        sub.run().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        sub.run().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_unsubscribe_cancels_fetch() {
        let cache: QueryCache<u32> = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = cache.build_query("todos", counting(calls), QueryConfig::new());

        let sub = query.subscribe(|_| {}, Default::default());
        let pending = query.start_fetch();
        tokio::time::sleep(Duration::from_millis(1)).await;

        sub.unsubscribe();
        assert!(pending.await.unwrap_err().is_cancelled());
        assert!(!query.state().is_fetching);
        assert!(query.state().marked_for_garbage_collection);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_may_unsubscribe_during_notification() {
        let cache: QueryCache<u32> = QueryCache::new();
        let query = cache.build_query(
            "todos",
            counting(Arc::new(AtomicUsize::new(0))),
            QueryConfig::new().initial_data(0),
        );

        let slot: Arc<Mutex<Option<Subscription<u32>>>> = Arc::new(Mutex::new(None));
        let seen = Arc::new(AtomicUsize::new(0));
        let sub = {
            let slot = slot.clone();
            let seen = seen.clone();
            query.subscribe(
                move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    slot.lock().take();
                },
                Default::default(),
            )
        };
        *slot.lock() = Some(sub);

        query.invalidate();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(query.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_heals_gc() {
        let cache: QueryCache<u32> = QueryCache::new();
        let query = cache.build_query(
            "todos",
            counting(Arc::new(AtomicUsize::new(0))),
            QueryConfig::new().cache_time(Duration::ZERO),
        );

        drop(query.subscribe(|_| {}, Default::default()));
        assert!(query.state().marked_for_garbage_collection);

        let _sub = query.subscribe(|_| {}, Default::default());
        assert!(!query.state().marked_for_garbage_collection);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.get_query("todos").is_some());
    }
}
