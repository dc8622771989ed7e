//! Shared utilities for the cache library.

use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Get the current time in milliseconds since UNIX epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Spawn a background task on the current Tokio runtime.
///
/// Returns `None` when called outside of a runtime, in which case the work is skipped.
pub(crate) fn spawn_detached<F>(what: &'static str, fut: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => Some(handle.spawn(fut)),
        Err(_) => {
            tracing::warn!("No Tokio runtime available, skipping {}", what);
            None
        }
    }
}
