//! Stale, garbage-collection and refetch-interval timers.
//!
//! Each query owns at most one timer of each kind. Timers are Tokio tasks that
//! only hold a weak reference to their query; replacing or clearing a timer
//! aborts the previous task.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::Ttl;
use crate::query::{Query, QueryInner};
use crate::state::Action;
use crate::utils::spawn_detached;

#[derive(Default)]
pub(crate) struct Timers {
    stale: Option<JoinHandle<()>>,
    gc: Option<JoinHandle<()>>,
    interval: Option<JoinHandle<()>>,
}

fn replace(slot: &mut Option<JoinHandle<()>>, handle: Option<JoinHandle<()>>) {
    if let Some(previous) = std::mem::replace(slot, handle) {
        previous.abort();
    }
}

impl Timers {
    pub(crate) fn clear_stale(&mut self) {
        replace(&mut self.stale, None);
    }

    pub(crate) fn clear_gc(&mut self) {
        replace(&mut self.gc, None);
    }

    pub(crate) fn clear_interval(&mut self) {
        replace(&mut self.interval, None);
    }

    pub(crate) fn clear_all(&mut self) {
        self.clear_stale();
        self.clear_gc();
        self.clear_interval();
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.clear_all();
    }
}

/// Cancel a pending garbage collection. Not broadcast to listeners.
pub(crate) fn heal<V>(inner: &mut QueryInner<V>) {
    inner.timers.clear_gc();
    inner.state.marked_for_garbage_collection = false;
}

impl<V> Query<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Restart the stale timer. Firing marks the query stale if it is still cached.
    pub(crate) fn schedule_stale_timeout(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        inner.timers.clear_stale();

        let Ttl::After(stale_time) = inner.config.stale_time else {
            return;
        };

        let query = Arc::downgrade(self);
        let handle = spawn_detached("stale timeout", async move {
            tokio::time::sleep(stale_time).await;
            let Some(query) = query.upgrade() else {
                return;
            };
            if query.cache().is_some_and(|cache| cache.contains(&query)) {
                query.dispatch(Action::MarkStale);
            }
        });
        replace(&mut inner.timers.stale, handle);
    }

    pub(crate) fn heal(&self) {
        heal(&mut self.inner.lock());
    }

    /// Mark the query for garbage collection and start the GC timer.
    ///
    /// A query without data that is not in an error state is collected on the
    /// next tick, any other after `cache_time`.
    pub(crate) fn schedule_gc(self: &Arc<Self>) {
        let delay = {
            let inner = self.inner.lock();
            let Ttl::After(cache_time) = inner.config.cache_time else {
                return;
            };
            if inner.state.data.is_none() && !inner.state.is_error() {
                Duration::ZERO
            } else {
                cache_time
            }
        };

        self.dispatch(Action::MarkGc);

        let query = Arc::downgrade(self);
        let handle = spawn_detached("garbage collection", async move {
            tokio::time::sleep(delay).await;
            if let Some(query) = query.upgrade() {
                query.collect_garbage();
            }
        });
        replace(&mut self.inner.lock().timers.gc, handle);
    }

    fn collect_garbage(self: &Arc<Self>) {
        {
            let inner = self.inner.lock();
            if !inner.state.marked_for_garbage_collection || !inner.subscribers.is_empty() {
                return;
            }
        }

        if let Some(cache) = self.cache()
            && cache.remove_if_current(self)
        {
            tracing::debug!("Garbage collected query {}", self.hash());
        }
    }

    /// Restart the refetch interval, if one is configured.
    pub(crate) fn schedule_refetch_interval(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        inner.timers.clear_interval();

        let Some(period) = inner.config.refetch_interval else {
            return;
        };
        let in_background = inner.config.refetch_interval_in_background;

        let query = Arc::downgrade(self);
        let handle = spawn_detached("refetch interval", async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(query) = query.upgrade() else {
                    break;
                };
                if in_background || query.probe.is_active() {
                    tracing::trace!("Refetch interval elapsed for query {}", query.hash());
                    drop(query.start_fetch());
                }
            }
        });
        replace(&mut inner.timers.interval, handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityFlag;
    use crate::cache::QueryCache;
    use crate::config::QueryConfig;
    use crate::error::BoxError;
    use crate::key::QueryKey;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_fn(
        calls: Arc<AtomicUsize>,
    ) -> impl Fn(QueryKey) -> futures::future::BoxFuture<'static, Result<usize, BoxError>>
    + Send
    + Sync
    + 'static {
        use futures::FutureExt;
        move |_key| {
            let calls = calls.clone();
            async move { Ok::<_, BoxError>(calls.fetch_add(1, Ordering::SeqCst) + 1) }.boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_marks_stale_without_touching_data() {
        let cache: QueryCache<usize> = QueryCache::new();
        let query = cache.build_query(
            "count",
            counter_fn(Arc::new(AtomicUsize::new(0))),
            QueryConfig::new().stale_time(Duration::from_millis(50)),
        );

        query.fetch().await.unwrap();
        assert!(!query.state().is_stale);

        tokio::time::sleep(Duration::from_millis(49)).await;
        assert!(!query.state().is_stale);

        tokio::time::sleep(Duration::from_millis(2)).await;
        let state = query.state();
        assert!(state.is_stale);
        assert_eq!(state.data, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_infinite_stale_time_never_marks_stale() {
        let cache: QueryCache<usize> = QueryCache::new();
        let query = cache.build_query(
            "count",
            counter_fn(Arc::new(AtomicUsize::new(0))),
            QueryConfig::new().stale_time(Ttl::Infinite),
        );

        query.fetch().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!query.state().is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_waits_for_cache_time_when_data_exists() {
        let cache: QueryCache<usize> = QueryCache::new();
        let query = cache.build_query(
            "count",
            counter_fn(Arc::new(AtomicUsize::new(0))),
            QueryConfig::new().cache_time(Duration::from_millis(100)),
        );
        query.fetch().await.unwrap();

        let sub = query.subscribe(|_| {}, Default::default());
        drop(sub);
        assert!(query.state().marked_for_garbage_collection);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.get_query("count").is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get_query("count").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_infinite_cache_time_keeps_query() {
        let cache: QueryCache<usize> = QueryCache::new();
        let query = cache.build_query(
            "count",
            counter_fn(Arc::new(AtomicUsize::new(0))),
            QueryConfig::new().cache_time(Ttl::Infinite),
        );

        drop(query.subscribe(|_| {}, Default::default()));
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(cache.get_query("count").is_some());
        assert!(!query.state().marked_for_garbage_collection);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_interval_ticks() {
        let cache: QueryCache<usize> = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = cache.build_query(
            "poll",
            counter_fn(calls.clone()),
            QueryConfig::new().refetch_interval(Duration::from_millis(100)),
        );

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(query.data(), Some(3));

        query.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_interval_respects_activity() {
        let probe = Arc::new(ActivityFlag::new(false));
        let cache: QueryCache<usize> = QueryCache::builder().activity_probe(probe.clone()).build();
        let calls = Arc::new(AtomicUsize::new(0));
        let _query = cache.build_query(
            "poll",
            counter_fn(calls.clone()),
            QueryConfig::new().refetch_interval(Duration::from_millis(100)),
        );

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        probe.set_active(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let background = cache.build_query(
            "background",
            counter_fn(Arc::new(AtomicUsize::new(0))),
            QueryConfig::new()
                .refetch_interval(Duration::from_millis(100))
                .refetch_interval_in_background(true),
        );
        probe.set_active(false);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(background.data(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebuild_replaces_interval() {
        let cache: QueryCache<usize> = QueryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let config = || QueryConfig::new().refetch_interval(Duration::from_millis(100));

        cache.build_query("poll", counter_fn(calls.clone()), config());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.build_query("poll", counter_fn(calls.clone()), config());

        // Only the replacement interval is running, 100ms after the rebuild.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
