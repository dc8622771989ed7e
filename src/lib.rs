//! swr-query - An asynchronous query cache with stale-while-revalidate semantics
//!
//! This library keeps the results of asynchronous fetch operations addressed by
//! structured keys, with:
//! - Deduplication of concurrent fetches of the same key
//! - Retries with configurable backoff, paused while the environment is inactive
//! - Cooperative cancellation of in-flight fetches
//! - Stale, garbage-collection and refetch-interval timers
//! - Per-query subscriptions and cache-wide listeners
//!
//! # Example
//!
//! ```ignore
//! use swr_query::{BoxError, InvalidateOptions, QueryCache, QueryConfig, QueryKey};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let cache: QueryCache<Vec<String>> = QueryCache::new();
//!
//!     let todos = cache.build_query(
//!         "todos",
//!         |key: QueryKey| async move {
//!             // Load from the backend - `key` is ["todos"]
//!             Ok::<_, BoxError>(vec![format!("first todo for {}", key)])
//!         },
//!         QueryConfig::new().stale_time(Duration::from_secs(30)),
//!     );
//!
//!     let sub = todos.subscribe(|state| println!("todos: {:?}", state.status), Default::default());
//!     sub.run().await;
//!
//!     // Mark everything under "todos" stale and refetch what is subscribed.
//!     cache
//!         .invalidate_queries("todos", InvalidateOptions::default())
//!         .await
//!         .unwrap();
//! }
//! ```

mod activity;
mod builder;
mod cache;
mod config;
mod error;
mod fetch;
mod key;
mod query;
mod query_fn;
mod registry;
mod state;
mod subscription;
mod timers;
mod utils;

// Re-export public API
pub use activity::{ActivityFlag, ActivityProbe, AlwaysActive};
pub use builder::QueryCacheBuilder;
pub use cache::{
    CacheListener, InvalidateOptions, PrefetchOptions, QueryCache, QueryPredicate, SetDataOptions,
};
pub use config::{
    Callbacks, DEFAULT_CACHE_TIME, DEFAULT_RETRY_COUNT, EqualityFn, ErrorCallback, KeySerializer,
    ParamsFilter, QueryConfig, ResolvedConfig, Retry, RetryDelay, RetryPredicate, SettledCallback,
    SuccessCallback, Ttl,
};
pub use error::{BoxError, QueryError};
pub use key::QueryKey;
pub use query::{Query, Updater};
pub use query_fn::QueryFn;
pub use registry::{CacheRegistry, ManagedCache};
pub use state::{QueryState, QueryStatus};
pub use subscription::{Listener, Subscription};
pub use utils::now_ms;
