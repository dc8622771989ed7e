//! Layered query configuration.
//!
//! A [`QueryConfig`] is a set of optional overrides. Layers are merged with
//! [`QueryConfig::merge`] (per-query over per-cache) and finally resolved into a
//! [`ResolvedConfig`] that fills the remaining gaps with built-in defaults.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::QueryError;
use crate::key::QueryKey;

/// Default time an unused query is kept before being garbage collected.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(5 * 60);

/// Default number of retries after the first failed attempt.
pub const DEFAULT_RETRY_COUNT: u32 = 3;

const MAX_RETRY_DELAY_MS: u64 = 30_000;

pub type SuccessCallback<V> = Arc<dyn Fn(&V) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&QueryError) + Send + Sync>;
pub type SettledCallback<V> = Arc<dyn Fn(Option<&V>, Option<&QueryError>) + Send + Sync>;
pub type EqualityFn<V> = Arc<dyn Fn(&V, &V) -> bool + Send + Sync>;
pub type RetryPredicate = Arc<dyn Fn(u32, &QueryError) -> bool + Send + Sync>;
pub type KeySerializer = Arc<dyn Fn(&QueryKey) -> String + Send + Sync>;
pub type ParamsFilter = Arc<dyn Fn(Vec<Value>) -> Vec<Value> + Send + Sync>;

/// A duration that may be unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    After(Duration),
    Infinite,
}

impl From<Duration> for Ttl {
    fn from(duration: Duration) -> Self {
        Ttl::After(duration)
    }
}

/// Whether a failed attempt should be retried.
#[derive(Clone)]
pub enum Retry {
    Always,
    Never,
    /// Retry while the failure count does not exceed this number.
    Count(u32),
    /// Decide from the failure count and the last error.
    If(RetryPredicate),
}

impl Retry {
    pub fn should_retry(&self, failure_count: u32, error: &QueryError) -> bool {
        match self {
            Retry::Always => true,
            Retry::Never => false,
            Retry::Count(max) => failure_count <= *max,
            Retry::If(predicate) => predicate(failure_count, error),
        }
    }
}

impl From<bool> for Retry {
    fn from(retry: bool) -> Self {
        if retry { Retry::Always } else { Retry::Never }
    }
}

impl From<u32> for Retry {
    fn from(count: u32) -> Self {
        Retry::Count(count)
    }
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Retry::Always => f.write_str("Always"),
            Retry::Never => f.write_str("Never"),
            Retry::Count(n) => write!(f, "Count({n})"),
            Retry::If(_) => f.write_str("If(..)"),
        }
    }
}

/// Delay before the next retry attempt.
#[derive(Clone)]
pub enum RetryDelay {
    Fixed(Duration),
    /// Computed from the current failure count.
    Backoff(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl RetryDelay {
    /// Exponential backoff: `min(1000 * 2^failure_count, 30000)` milliseconds.
    pub fn exponential() -> Self {
        RetryDelay::Backoff(Arc::new(|failure_count| {
            let ms = 1000u64.saturating_mul(1u64 << failure_count.min(20));
            Duration::from_millis(ms.min(MAX_RETRY_DELAY_MS))
        }))
    }

    pub fn delay(&self, failure_count: u32) -> Duration {
        match self {
            RetryDelay::Fixed(delay) => *delay,
            RetryDelay::Backoff(f) => f(failure_count),
        }
    }
}

impl From<Duration> for RetryDelay {
    fn from(delay: Duration) -> Self {
        RetryDelay::Fixed(delay)
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDelay::Fixed(delay) => write!(f, "Fixed({delay:?})"),
            RetryDelay::Backoff(_) => f.write_str("Backoff(..)"),
        }
    }
}

/// Lifecycle callbacks fired when a fetch settles.
pub struct Callbacks<V> {
    pub on_success: Option<SuccessCallback<V>>,
    pub on_error: Option<ErrorCallback>,
    pub on_settled: Option<SettledCallback<V>>,
}

impl<V> Callbacks<V> {
    pub fn new() -> Self {
        Callbacks {
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }

    pub fn on_success(mut self, f: impl Fn(&V) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&QueryError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_settled(
        mut self,
        f: impl Fn(Option<&V>, Option<&QueryError>) + Send + Sync + 'static,
    ) -> Self {
        self.on_settled = Some(Arc::new(f));
        self
    }

    /// Field-wise merge, `self` wins.
    fn merge(self, base: &Callbacks<V>) -> Self {
        Callbacks {
            on_success: self.on_success.or_else(|| base.on_success.clone()),
            on_error: self.on_error.or_else(|| base.on_error.clone()),
            on_settled: self.on_settled.or_else(|| base.on_settled.clone()),
        }
    }

    pub(crate) fn success(&self, data: &V) {
        if let Some(f) = &self.on_success {
            f(data);
        }
        if let Some(f) = &self.on_settled {
            f(Some(data), None);
        }
    }

    pub(crate) fn error(&self, error: &QueryError) {
        if let Some(f) = &self.on_error {
            f(error);
        }
        if let Some(f) = &self.on_settled {
            f(None, Some(error));
        }
    }
}

impl<V> Default for Callbacks<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for Callbacks<V> {
    fn clone(&self) -> Self {
        Callbacks {
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
        }
    }
}

/// One layer of query configuration. Unset fields fall through to the next layer.
pub struct QueryConfig<V> {
    pub enabled: Option<bool>,
    pub retry: Option<Retry>,
    pub retry_delay: Option<RetryDelay>,
    pub stale_time: Option<Ttl>,
    pub cache_time: Option<Ttl>,
    pub refetch_interval: Option<Duration>,
    pub refetch_interval_in_background: Option<bool>,
    pub refetch_on_mount: Option<bool>,
    pub initial_data: Option<V>,
    pub initial_stale: Option<bool>,
    pub is_data_equal: Option<EqualityFn<V>>,
    pub callbacks: Callbacks<V>,
    pub key_serializer: Option<KeySerializer>,
    pub params_filter: Option<ParamsFilter>,
}

impl<V> Default for QueryConfig<V> {
    fn default() -> Self {
        QueryConfig {
            enabled: None,
            retry: None,
            retry_delay: None,
            stale_time: None,
            cache_time: None,
            refetch_interval: None,
            refetch_interval_in_background: None,
            refetch_on_mount: None,
            initial_data: None,
            initial_stale: None,
            is_data_equal: None,
            callbacks: Callbacks::new(),
            key_serializer: None,
            params_filter: None,
        }
    }
}

impl<V> Clone for QueryConfig<V>
where
    V: Clone,
{
    fn clone(&self) -> Self {
        QueryConfig {
            enabled: self.enabled,
            retry: self.retry.clone(),
            retry_delay: self.retry_delay.clone(),
            stale_time: self.stale_time,
            cache_time: self.cache_time,
            refetch_interval: self.refetch_interval,
            refetch_interval_in_background: self.refetch_interval_in_background,
            refetch_on_mount: self.refetch_on_mount,
            initial_data: self.initial_data.clone(),
            initial_stale: self.initial_stale,
            is_data_equal: self.is_data_equal.clone(),
            callbacks: self.callbacks.clone(),
            key_serializer: self.key_serializer.clone(),
            params_filter: self.params_filter.clone(),
        }
    }
}

impl<V> QueryConfig<V>
where
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn retry(mut self, retry: impl Into<Retry>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    pub fn retry_if(mut self, f: impl Fn(u32, &QueryError) -> bool + Send + Sync + 'static) -> Self {
        self.retry = Some(Retry::If(Arc::new(f)));
        self
    }

    pub fn retry_delay(mut self, delay: impl Into<RetryDelay>) -> Self {
        self.retry_delay = Some(delay.into());
        self
    }

    pub fn stale_time(mut self, ttl: impl Into<Ttl>) -> Self {
        self.stale_time = Some(ttl.into());
        self
    }

    pub fn cache_time(mut self, ttl: impl Into<Ttl>) -> Self {
        self.cache_time = Some(ttl.into());
        self
    }

    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    pub fn refetch_interval_in_background(mut self, background: bool) -> Self {
        self.refetch_interval_in_background = Some(background);
        self
    }

    pub fn refetch_on_mount(mut self, refetch: bool) -> Self {
        self.refetch_on_mount = Some(refetch);
        self
    }

    pub fn initial_data(mut self, data: V) -> Self {
        self.initial_data = Some(data);
        self
    }

    pub fn initial_stale(mut self, stale: bool) -> Self {
        self.initial_stale = Some(stale);
        self
    }

    pub fn is_data_equal(mut self, f: impl Fn(&V, &V) -> bool + Send + Sync + 'static) -> Self {
        self.is_data_equal = Some(Arc::new(f));
        self
    }

    pub fn callbacks(mut self, callbacks: Callbacks<V>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn key_serializer(mut self, f: impl Fn(&QueryKey) -> String + Send + Sync + 'static) -> Self {
        self.key_serializer = Some(Arc::new(f));
        self
    }

    pub fn params_filter(
        mut self,
        f: impl Fn(Vec<Value>) -> Vec<Value> + Send + Sync + 'static,
    ) -> Self {
        self.params_filter = Some(Arc::new(f));
        self
    }

    /// Merge this layer over `base`; fields set here win.
    pub fn merge(self, base: &QueryConfig<V>) -> Self {
        QueryConfig {
            enabled: self.enabled.or(base.enabled),
            retry: self.retry.or_else(|| base.retry.clone()),
            retry_delay: self.retry_delay.or_else(|| base.retry_delay.clone()),
            stale_time: self.stale_time.or(base.stale_time),
            cache_time: self.cache_time.or(base.cache_time),
            refetch_interval: self.refetch_interval.or(base.refetch_interval),
            refetch_interval_in_background: self
                .refetch_interval_in_background
                .or(base.refetch_interval_in_background),
            refetch_on_mount: self.refetch_on_mount.or(base.refetch_on_mount),
            initial_data: self.initial_data.or_else(|| base.initial_data.clone()),
            initial_stale: self.initial_stale.or(base.initial_stale),
            is_data_equal: self.is_data_equal.or_else(|| base.is_data_equal.clone()),
            callbacks: self.callbacks.merge(&base.callbacks),
            key_serializer: self.key_serializer.or_else(|| base.key_serializer.clone()),
            params_filter: self.params_filter.or_else(|| base.params_filter.clone()),
        }
    }

    /// Hash a key with the configured serializer, or the canonical hash.
    pub(crate) fn hash_key(&self, key: &QueryKey) -> String {
        match &self.key_serializer {
            Some(serialize) => serialize(key),
            None => key.hash(),
        }
    }

    /// Fill every unset field with the built-in default.
    pub fn resolve(self) -> ResolvedConfig<V> {
        ResolvedConfig {
            enabled: self.enabled.unwrap_or(true),
            retry: self.retry.unwrap_or(Retry::Count(DEFAULT_RETRY_COUNT)),
            retry_delay: self.retry_delay.unwrap_or_else(RetryDelay::exponential),
            stale_time: self.stale_time.unwrap_or(Ttl::After(Duration::ZERO)),
            cache_time: self.cache_time.unwrap_or(Ttl::After(DEFAULT_CACHE_TIME)),
            refetch_interval: self.refetch_interval.filter(|d| !d.is_zero()),
            refetch_interval_in_background: self.refetch_interval_in_background.unwrap_or(false),
            refetch_on_mount: self.refetch_on_mount.unwrap_or(true),
            initial_data: self.initial_data,
            initial_stale: self.initial_stale,
            is_data_equal: self.is_data_equal,
            callbacks: self.callbacks,
            params_filter: self.params_filter,
        }
    }
}

/// Configuration of a built query with every default applied.
pub struct ResolvedConfig<V> {
    pub enabled: bool,
    pub retry: Retry,
    pub retry_delay: RetryDelay,
    pub stale_time: Ttl,
    pub cache_time: Ttl,
    pub refetch_interval: Option<Duration>,
    pub refetch_interval_in_background: bool,
    pub refetch_on_mount: bool,
    pub initial_data: Option<V>,
    pub initial_stale: Option<bool>,
    pub is_data_equal: Option<EqualityFn<V>>,
    pub callbacks: Callbacks<V>,
    pub params_filter: Option<ParamsFilter>,
}

impl<V> ResolvedConfig<V> {
    /// Key parts handed to the fetch operation.
    pub(crate) fn fetch_key(&self, key: &QueryKey) -> QueryKey {
        match &self.params_filter {
            Some(filter) => QueryKey::from(filter(key.parts().to_vec())),
            None => key.clone(),
        }
    }
}
