use std::sync::Arc;

/// Error returned by a caller-supplied fetch operation.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for query operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    /// The fetch operation failed (after exhausting retries, if any).
    #[error("query '{hash}' failed: {source}")]
    Fetch {
        hash: String,
        source: Arc<dyn std::error::Error + Send + Sync>,
    },
    /// The in-flight fetch was cancelled before it could commit.
    #[error("query '{0}' was cancelled")]
    Cancelled(String),
    /// The key could not be converted into a canonical query key.
    #[error("invalid query key: {0}")]
    InvalidKey(String),
}

impl QueryError {
    /// Create a new fetch error.
    pub fn fetch(hash: impl Into<String>, source: BoxError) -> Self {
        QueryError::Fetch {
            hash: hash.into(),
            source: Arc::from(source),
        }
    }

    /// Whether this error only signals a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled(_))
    }
}
