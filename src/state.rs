//! Visible query state and its transition function.

use serde::Serialize;
use std::fmt;

use crate::error::QueryError;
use crate::utils::now_ms;

/// Produces the next data value from the previous one.
pub type DataUpdater<V> = Box<dyn FnOnce(Option<&V>) -> V + Send>;

/// Replaces the whole state, bypassing fetch bookkeeping.
pub type StateUpdater<V> = Box<dyn FnOnce(&QueryState<V>) -> QueryState<V> + Send>;

/// Lifecycle status of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// Disabled and never fetched.
    Idle,
    /// No data yet, first fetch pending.
    Loading,
    /// Data is available.
    Success,
    /// The last fetch failed terminally.
    Error,
}

/// Snapshot of a query as seen by subscribers.
#[derive(Debug, Clone)]
pub struct QueryState<V> {
    pub status: QueryStatus,
    pub data: Option<V>,
    pub error: Option<QueryError>,
    pub is_fetching: bool,
    pub is_stale: bool,
    pub marked_for_garbage_collection: bool,
    /// Failed attempts of the current fetch.
    pub failure_count: u32,
    /// Unix timestamp in milliseconds of the last data commit, `0` if none.
    pub updated_at: i64,
}

/// Events that move a query from one state to the next.
pub enum Action<V> {
    /// A new fetch started.
    Fetch,
    /// One attempt failed; the retry loop has not decided yet.
    Failure,
    MarkStale,
    MarkGc,
    /// Data was committed.
    Success(DataUpdater<V>),
    /// The fetch settled with an error. Cancelled errors keep the prior status.
    Error { error: QueryError, cancelled: bool },
    SetState(StateUpdater<V>),
}

impl<V> fmt::Debug for Action<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Fetch => f.write_str("Fetch"),
            Action::Failure => f.write_str("Failure"),
            Action::MarkStale => f.write_str("MarkStale"),
            Action::MarkGc => f.write_str("MarkGc"),
            Action::Success(_) => f.write_str("Success"),
            Action::Error { error, cancelled } => f
                .debug_struct("Error")
                .field("error", error)
                .field("cancelled", cancelled)
                .finish(),
            Action::SetState(_) => f.write_str("SetState"),
        }
    }
}

impl<V> QueryState<V>
where
    V: Clone,
{
    /// Starting snapshot for a freshly built query.
    pub fn initial(enabled: bool, initial_data: Option<V>, is_stale: bool) -> Self {
        let has_initial_data = initial_data.is_some();
        let status = if has_initial_data {
            QueryStatus::Success
        } else if enabled {
            QueryStatus::Loading
        } else {
            QueryStatus::Idle
        };

        QueryState {
            status,
            data: initial_data,
            error: None,
            is_fetching: !has_initial_data && enabled,
            is_stale,
            marked_for_garbage_collection: false,
            failure_count: 0,
            updated_at: if has_initial_data { now_ms() } else { 0 },
        }
    }

    /// Apply an action, returning the next state.
    pub fn reduce(&self, action: Action<V>) -> Self {
        match action {
            Action::Fetch => QueryState {
                status: if self.data.is_some() {
                    QueryStatus::Success
                } else {
                    QueryStatus::Loading
                },
                is_fetching: true,
                failure_count: 0,
                ..self.clone()
            },
            Action::Failure => QueryState {
                failure_count: self.failure_count + 1,
                ..self.clone()
            },
            Action::MarkStale => QueryState {
                is_stale: true,
                ..self.clone()
            },
            Action::MarkGc => QueryState {
                marked_for_garbage_collection: true,
                ..self.clone()
            },
            Action::Success(updater) => QueryState {
                data: Some(updater(self.data.as_ref())),
                status: QueryStatus::Success,
                error: None,
                is_stale: false,
                is_fetching: false,
                failure_count: 0,
                updated_at: now_ms(),
                ..self.clone()
            },
            Action::Error { error, cancelled } => {
                let mut next = QueryState {
                    is_fetching: false,
                    is_stale: true,
                    ..self.clone()
                };
                if !cancelled {
                    next.status = QueryStatus::Error;
                    next.error = Some(error);
                }
                next
            }
            Action::SetState(updater) => updater(self),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == QueryStatus::Idle
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }
}
