use async_trait::async_trait;
use std::future::Future;

use crate::error::BoxError;
use crate::key::QueryKey;

/// A fetch operation is a common interface for loading the data behind a key.
///
/// The transport is opaque to the cache. Any `Fn(QueryKey) -> Future` closure
/// returning `Result<V, BoxError>` implements this trait.
///
/// Dropping the returned future is how the cache cancels an in-flight attempt,
/// so implementations that hold remote resources should release them on drop.
#[async_trait]
pub trait QueryFn<V>: Send + Sync {
    /// Load the value for the given key parts.
    async fn call(&self, key: QueryKey) -> Result<V, BoxError>;
}

#[async_trait]
impl<V, F, Fut> QueryFn<V> for F
where
    F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, BoxError>> + Send + 'static,
    V: Send + 'static,
{
    async fn call(&self, key: QueryKey) -> Result<V, BoxError> {
        (self)(key).await
    }
}

/// Fetch operation used for placeholder queries created by `set_query_data`.
///
/// It never resolves, so such a query only ever holds data set directly.
pub(crate) struct PendingForever;

#[async_trait]
impl<V> QueryFn<V> for PendingForever
where
    V: Send + 'static,
{
    async fn call(&self, _key: QueryKey) -> Result<V, BoxError> {
        futures::future::pending().await
    }
}
