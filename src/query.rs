use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

use crate::activity::ActivityProbe;
use crate::cache::{CacheShared, QueryCache};
use crate::config::ResolvedConfig;
use crate::fetch::InFlight;
use crate::key::QueryKey;
use crate::query_fn::QueryFn;
use crate::state::{Action, DataUpdater, QueryState, StateUpdater};
use crate::subscription::Subscriber;
use crate::timers::Timers;

/// New data for a query: either a value or a function of the previous value.
pub enum Updater<V> {
    Value(V),
    With(DataUpdater<V>),
}

impl<V> Updater<V> {
    /// Build an updater from a function of the previous data.
    pub fn with(f: impl FnOnce(Option<&V>) -> V + Send + 'static) -> Self {
        Updater::With(Box::new(f))
    }

    fn apply(self, prev: Option<&V>) -> V {
        match self {
            Updater::Value(value) => value,
            Updater::With(f) => f(prev),
        }
    }
}

impl<V> From<V> for Updater<V> {
    fn from(value: V) -> Self {
        Updater::Value(value)
    }
}

/// A cached record for one canonical key.
///
/// Queries are mutable singletons owned by a [`QueryCache`]: rebuilding a query
/// for the same key updates its fetch operation and config in place.
pub struct Query<V>
where
    V: Clone + Send + Sync + 'static,
{
    key: QueryKey,
    hash: String,
    cache: Weak<CacheShared<V>>,
    pub(crate) probe: Arc<dyn ActivityProbe>,
    /// Wakes a retry loop that is paused while the environment is inactive.
    pub(crate) resume: Notify,
    pub(crate) inner: Mutex<QueryInner<V>>,
}

pub(crate) struct QueryInner<V> {
    pub(crate) state: QueryState<V>,
    pub(crate) config: Arc<ResolvedConfig<V>>,
    pub(crate) query_fn: Arc<dyn QueryFn<V>>,
    pub(crate) in_flight: Option<InFlight<V>>,
    pub(crate) subscribers: Vec<Subscriber<V>>,
    pub(crate) timers: Timers,
    pub(crate) was_suspended: bool,
    pub(crate) paused: bool,
    /// Listed in the cache directory.
    pub(crate) listed: bool,
    /// Counted by the cache-wide fetching counter.
    pub(crate) counted_fetching: bool,
    pub(crate) next_attempt_id: u64,
    pub(crate) next_subscriber_id: u64,
}

impl<V> Query<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        key: QueryKey,
        hash: String,
        query_fn: Arc<dyn QueryFn<V>>,
        config: ResolvedConfig<V>,
        cache: Weak<CacheShared<V>>,
        probe: Arc<dyn ActivityProbe>,
    ) -> Arc<Self> {
        let initial_data = config.initial_data.clone();
        let is_stale =
            !config.enabled || config.initial_stale.unwrap_or(initial_data.is_none());
        let state = QueryState::initial(config.enabled, initial_data, is_stale);

        Arc::new(Query {
            key,
            hash,
            cache,
            probe,
            resume: Notify::new(),
            inner: Mutex::new(QueryInner {
                state,
                config: Arc::new(config),
                query_fn,
                in_flight: None,
                subscribers: Vec::new(),
                timers: Timers::default(),
                was_suspended: false,
                paused: false,
                listed: false,
                counted_fetching: false,
                next_attempt_id: 0,
                next_subscriber_id: 0,
            }),
        })
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> QueryState<V> {
        self.inner.lock().state.clone()
    }

    pub fn data(&self) -> Option<V> {
        self.inner.lock().state.data.clone()
    }

    /// Whether the retry loop is waiting for activity to resume.
    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// The resolved config the query currently runs with.
    pub fn config(&self) -> Arc<ResolvedConfig<V>> {
        Arc::clone(&self.inner.lock().config)
    }

    pub(crate) fn cache(&self) -> Option<QueryCache<V>> {
        self.cache.upgrade().map(QueryCache::from_shared)
    }

    /// Replace the fetch operation and config of an existing query.
    pub(crate) fn update(&self, query_fn: Arc<dyn QueryFn<V>>, config: ResolvedConfig<V>) {
        let mut inner = self.inner.lock();
        inner.query_fn = query_fn;
        inner.config = Arc::new(config);
    }

    /// Apply an action and notify subscribers, then the cache-wide listeners.
    pub(crate) fn dispatch(self: &Arc<Self>, action: Action<V>) {
        self.dispatch_if(action, |_| true);
    }

    /// Like [`Query::dispatch`], but only when `guard` accepts the locked entry.
    ///
    /// The guard runs in the same critical section as the transition, so
    /// bookkeeping it does is never observed apart from the new state.
    pub(crate) fn dispatch_if(
        self: &Arc<Self>,
        action: Action<V>,
        guard: impl FnOnce(&mut QueryInner<V>) -> bool,
    ) -> bool {
        tracing::trace!("Dispatching {:?} to query {}", action, self.hash);

        let (state, listeners) = {
            let mut inner = self.inner.lock();
            if !guard(&mut *inner) {
                return false;
            }
            let next = inner.state.reduce(action);
            inner.state = next;
            self.track_fetching(&mut inner);
            // Listeners may unsubscribe while being notified.
            let listeners: Vec<_> = inner
                .subscribers
                .iter()
                .map(|s| Arc::clone(&s.listener))
                .collect();
            (inner.state.clone(), listeners)
        };

        for listener in listeners {
            listener(&state);
        }

        if let Some(cache) = self.cache() {
            cache.notify(self);
        }
        true
    }

    /// Keep the cache-wide fetching counter in step with this entry.
    fn track_fetching(&self, inner: &mut QueryInner<V>) {
        let fetching = inner.listed && inner.state.is_fetching;
        if fetching == inner.counted_fetching {
            return;
        }
        inner.counted_fetching = fetching;
        if let Some(shared) = self.cache.upgrade() {
            if fetching {
                shared.fetching.fetch_add(1, Ordering::SeqCst);
            } else {
                shared.fetching.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Record that the query was inserted into its cache directory.
    pub(crate) fn attach(&self) {
        let mut inner = self.inner.lock();
        inner.listed = true;
        self.track_fetching(&mut inner);
    }

    /// Commit new data, as if a fetch had succeeded.
    ///
    /// The stale timer restarts. When `is_data_equal` reports the new value equal
    /// to the current one, the current value is kept.
    pub fn set_data(self: &Arc<Self>, updater: impl Into<Updater<V>>) {
        let data = self.resolve_data(updater.into());
        self.dispatch_if(Action::Success(Box::new(move |_| data)), |inner| {
            inner.timers.clear_stale();
            true
        });
        self.schedule_stale_timeout();
    }

    /// Apply `updater` to the current data, keeping the current value when
    /// `is_data_equal` reports the result equal to it.
    pub(crate) fn resolve_data(&self, updater: Updater<V>) -> V {
        let (prev, is_data_equal) = {
            let inner = self.inner.lock();
            (inner.state.data.clone(), inner.config.is_data_equal.clone())
        };

        let data = updater.apply(prev.as_ref());
        match (prev, is_data_equal) {
            (Some(prev), Some(is_equal)) if is_equal(&prev, &data) => prev,
            _ => data,
        }
    }

    /// Replace the whole state, bypassing fetch bookkeeping.
    pub fn set_state(
        self: &Arc<Self>,
        updater: impl FnOnce(&QueryState<V>) -> QueryState<V> + Send + 'static,
    ) {
        let updater: StateUpdater<V> = Box::new(updater);
        self.dispatch(Action::SetState(updater));
    }

    /// Mark the query stale without refetching.
    pub fn invalidate(self: &Arc<Self>) {
        self.dispatch(Action::MarkStale);
    }

    /// Wake a retry loop paused while the environment was inactive.
    pub fn resume(&self) {
        self.resume.notify_waiters();
    }

    /// Stop every timer. Called when the query leaves its cache.
    pub(crate) fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.timers.clear_all();
        inner.listed = false;
        self.track_fetching(&mut inner);
    }
}
