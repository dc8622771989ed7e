//! Deduplicated fetching with retries and cooperative cancellation.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::Callbacks;
use crate::error::QueryError;
use crate::query::{Query, QueryInner, Updater};
use crate::state::Action;
use crate::utils::spawn_detached;

pub(crate) type SharedResult<V> = Shared<BoxFuture<'static, Result<V, QueryError>>>;

/// Handle to the single running fetch of a query.
pub(crate) struct InFlight<V> {
    id: u64,
    token: CancellationToken,
    result: SharedResult<V>,
    /// A suspending read started or joined this fetch.
    suspended: Arc<AtomicBool>,
}

impl<V> Query<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Fetch the query, or join the fetch that is already running.
    ///
    /// Concurrent callers share one invocation of the fetch operation. Returns
    /// [`QueryError::Cancelled`] when the fetch is cancelled before it commits.
    ///
    /// Must be called within a Tokio runtime.
    pub async fn fetch(self: &Arc<Self>) -> Result<V, QueryError> {
        self.start_fetch().await
    }

    /// Suspending read: fetch on behalf of a caller blocked on the result.
    ///
    /// The query's own callbacks fire for this fetch, and the next mount-time
    /// refetch of a subscriber is skipped.
    pub async fn fetch_suspended(self: &Arc<Self>) -> Result<V, QueryError> {
        self.begin_fetch(true).await
    }

    /// Whether a fetch is currently in flight.
    pub fn is_fetching(&self) -> bool {
        self.inner.lock().in_flight.is_some()
    }

    pub(crate) fn start_fetch(self: &Arc<Self>) -> SharedResult<V> {
        self.begin_fetch(false)
    }

    fn begin_fetch(self: &Arc<Self>, suspended: bool) -> SharedResult<V> {
        let token = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let hash = self.hash().to_string();
        let result = rx
            .map(move |res| res.unwrap_or(Err(QueryError::Cancelled(hash))))
            .boxed()
            .shared();
        let flag = Arc::new(AtomicBool::new(suspended));

        let mut joined = None;
        let mut id = 0;
        let mut consumers = Vec::new();
        // Registering the attempt and entering the fetching state happen together.
        self.dispatch_if(Action::Fetch, |inner: &mut QueryInner<V>| {
            if suspended {
                inner.was_suspended = true;
            }
            if let Some(in_flight) = &inner.in_flight {
                if suspended {
                    in_flight.suspended.store(true, Ordering::SeqCst);
                }
                joined = Some(in_flight.result.clone());
                return false;
            }

            inner.next_attempt_id += 1;
            id = inner.next_attempt_id;
            inner.in_flight = Some(InFlight {
                id,
                token: token.clone(),
                result: result.clone(),
                suspended: Arc::clone(&flag),
            });
            consumers = subscriber_callbacks(inner);
            true
        });
        if let Some(joined) = joined {
            return joined;
        }

        tracing::debug!("Fetching query {}", self.hash());
        let query = Arc::clone(self);
        let task = async move {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => Err(QueryError::Cancelled(query.hash().to_string())),
                outcome = query.run_attempts() => outcome,
            };
            let _ = tx.send(query.settle(id, &token, &flag, outcome, &consumers));
        };

        if spawn_detached("query fetch", task).is_none() {
            self.cancel();
        }

        result
    }

    /// Run the fetch operation until it succeeds or the retry policy gives up.
    async fn run_attempts(self: &Arc<Self>) -> Result<V, QueryError> {
        loop {
            let (query_fn, key) = {
                let inner = self.inner.lock();
                (Arc::clone(&inner.query_fn), inner.config.fetch_key(self.key()))
            };

            let error = match query_fn.call(key).await {
                Ok(data) => return Ok(data),
                Err(source) => QueryError::fetch(self.hash(), source),
            };

            self.dispatch(Action::Failure);

            let (failure_count, config) = {
                let inner = self.inner.lock();
                (inner.state.failure_count, Arc::clone(&inner.config))
            };

            if !config.retry.should_retry(failure_count, &error) {
                return Err(error);
            }

            if self.probe.is_active() {
                let delay = config.retry_delay.delay(failure_count);
                tracing::debug!(
                    "Retrying query {} in {:?} (failure {}): {}",
                    self.hash(),
                    delay,
                    failure_count,
                    error
                );
                tokio::time::sleep(delay).await;
            } else {
                self.wait_for_resume().await;
            }
        }
    }

    /// Park the retry loop until [`Query::resume`] is called.
    async fn wait_for_resume(&self) {
        let notified = self.resume.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.probe.is_active() {
            return;
        }

        tracing::debug!(
            "Pausing retries of query {} until activity resumes",
            self.hash()
        );
        self.inner.lock().paused = true;
        notified.await;
        self.inner.lock().paused = false;
    }

    /// Commit the outcome of attempt `id` unless it was cancelled.
    ///
    /// The transition and the release of the in-flight handle happen in one
    /// critical section, so a fetch started afterwards is never overwritten by
    /// this outcome.
    fn settle(
        self: &Arc<Self>,
        id: u64,
        token: &CancellationToken,
        suspended: &AtomicBool,
        outcome: Result<V, QueryError>,
        subscribers: &[Callbacks<V>],
    ) -> Result<V, QueryError> {
        let mut entry_callbacks = None;
        let mut finish = |inner: &mut QueryInner<V>| {
            // `cancel` already reset the visible state.
            if token.is_cancelled() {
                return false;
            }
            if inner.in_flight.as_ref().is_some_and(|f| f.id == id) {
                inner.in_flight = None;
            }
            inner.paused = false;
            if suspended.load(Ordering::SeqCst) {
                entry_callbacks = Some(inner.config.callbacks.clone());
            }
            true
        };

        match outcome {
            Ok(data) => {
                let data = self.resolve_data(Updater::Value(data));
                let committed = data.clone();
                let action = Action::Success(Box::new(move |_| committed));
                let applied = self.dispatch_if(action, |inner| {
                    if !finish(inner) {
                        return false;
                    }
                    inner.timers.clear_stale();
                    true
                });
                if !applied {
                    return Err(QueryError::Cancelled(self.hash().to_string()));
                }

                self.schedule_stale_timeout();
                for consumer in entry_callbacks.iter().chain(subscribers) {
                    consumer.success(&data);
                }
                Ok(data)
            }
            Err(error) => {
                let action = Action::Error {
                    error: error.clone(),
                    cancelled: false,
                };
                if !self.dispatch_if(action, finish) {
                    return Err(QueryError::Cancelled(self.hash().to_string()));
                }

                tracing::debug!("Query {} failed: {}", self.hash(), error);
                for consumer in entry_callbacks.iter().chain(subscribers) {
                    consumer.error(&error);
                }
                Err(error)
            }
        }
    }

    /// Cancel the in-flight fetch, if any, and stop the refetch interval.
    ///
    /// The running fetch operation is dropped and its result discarded. The
    /// visible status and error stay as they were before the fetch started.
    pub fn cancel(self: &Arc<Self>) {
        let action = Action::Error {
            error: QueryError::Cancelled(self.hash().to_string()),
            cancelled: true,
        };
        let cancelled = self.dispatch_if(action, |inner: &mut QueryInner<V>| {
            inner.timers.clear_interval();
            inner.paused = false;
            match inner.in_flight.take() {
                Some(in_flight) => {
                    in_flight.token.cancel();
                    true
                }
                None => false,
            }
        });

        if cancelled {
            tracing::debug!("Cancelled query {}", self.hash());
        }
    }
}

/// Subscribers whose callbacks fire when the attempt settles.
fn subscriber_callbacks<V>(inner: &QueryInner<V>) -> Vec<Callbacks<V>> {
    inner
        .subscribers
        .iter()
        .map(|s| s.callbacks.clone())
        .collect()
}
