//! Snapshot Implementation
//!
//! A Snapshot is the immutable, observable state of one cache entry at a
//! point in time. Entries never mutate a snapshot in place; every transition
//! builds a new one and swaps it in, so observers can detect changes by
//! comparing `Arc` identity.
//!
//! # Transitions
//!
//! ```text
//!            begin_fetch                succeeded
//!   idle ───────────────▶ loading ───────────────▶ success
//!     ▲                     │  │                     │ ▲
//!     └──── cancelled ──────┘  └── failed ──▶ error ─┘ │
//!                                              └───────┘
//! ```
//!
//! Only the very first fetch of a key enters `loading`. Background refreshes
//! keep the previous status and only flip `is_fetching`, so a renderer can
//! tell a first-paint spinner from a refresh indicator.
//!
//! Data is sticky: failures and cancellations never clear a previously
//! produced value.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::QueryError;

/// Lifecycle status of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// No fetch has completed or started yet.
    Idle,

    /// The first fetch of the key is in flight.
    Loading,

    /// The most recent committed outcome was a success.
    Success,

    /// The most recent committed outcome was a failure.
    Error,
}

/// Immutable state of one cache entry.
pub struct Snapshot<T> {
    data: Option<Arc<T>>,
    error: Option<QueryError>,
    status: QueryStatus,
    updated_at: Option<Instant>,
    is_fetching: bool,
}

impl<T> Snapshot<T> {
    /// The state of a key that has never been fetched.
    pub fn idle() -> Self {
        Self {
            data: None,
            error: None,
            status: QueryStatus::Idle,
            updated_at: None,
            is_fetching: false,
        }
    }

    /// Most recent successfully produced value.
    pub fn data(&self) -> Option<&Arc<T>> {
        self.data.as_ref()
    }

    /// The failure of the most recent committed outcome, if it failed.
    pub fn error(&self) -> Option<&QueryError> {
        self.error.as_ref()
    }

    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// When the last successful fetch committed.
    pub fn updated_at(&self) -> Option<Instant> {
        self.updated_at
    }

    /// Whether any fetch, initial or background, is in flight.
    pub fn is_fetching(&self) -> bool {
        self.is_fetching
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    /// Time since the last successful fetch.
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.updated_at.map(|at| now.saturating_duration_since(at))
    }

    /// The cached data, if it is recent enough to skip a fetch.
    pub(crate) fn fresh_data(&self, stale_time: Duration, now: Instant) -> Option<Arc<T>> {
        if self.status != QueryStatus::Success {
            return None;
        }
        let age = self.age(now)?;
        if age < stale_time {
            self.data.clone()
        } else {
            None
        }
    }

    /// A fetch has started.
    pub(crate) fn begin_fetch(&self) -> Self {
        let first_load = self.status == QueryStatus::Idle && self.updated_at.is_none();
        Self {
            data: self.data.clone(),
            error: None,
            status: if first_load {
                QueryStatus::Loading
            } else {
                self.status
            },
            updated_at: self.updated_at,
            is_fetching: true,
        }
    }

    /// The producer resolved.
    pub(crate) fn succeeded(&self, data: Arc<T>, now: Instant) -> Self {
        Self {
            data: Some(data),
            error: None,
            status: QueryStatus::Success,
            updated_at: Some(now),
            is_fetching: false,
        }
    }

    /// The call was cancelled. A cancelled first load falls back to idle.
    pub(crate) fn cancelled(&self) -> Self {
        Self {
            data: self.data.clone(),
            error: None,
            status: match self.status {
                QueryStatus::Loading => QueryStatus::Idle,
                status => status,
            },
            updated_at: self.updated_at,
            is_fetching: false,
        }
    }

    /// The producer failed.
    pub(crate) fn failed(&self, error: QueryError) -> Self {
        Self {
            data: self.data.clone(),
            error: Some(error),
            status: QueryStatus::Error,
            updated_at: self.updated_at,
            is_fetching: false,
        }
    }

    /// Marked stale without changing anything observers render.
    pub(crate) fn invalidated(&self) -> Self {
        Self {
            data: self.data.clone(),
            error: self.error.clone(),
            status: self.status,
            updated_at: None,
            is_fetching: self.is_fetching,
        }
    }

    /// Field-by-field comparison; data and error compare by identity.
    pub fn same_state(&self, other: &Self) -> bool {
        let same_data = match (&self.data, &other.data) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        let same_error = match (&self.error, &other.error) {
            (Some(a), Some(b)) => a.ptr_eq(b),
            (None, None) => true,
            _ => false,
        };
        self.status == other.status
            && self.is_fetching == other.is_fetching
            && self.updated_at == other.updated_at
            && same_error
            && same_data
    }
}

impl<T> Default for Snapshot<T> {
    fn default() -> Self {
        Self::idle()
    }
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            error: self.error.clone(),
            status: self.status,
            updated_at: self.updated_at,
            is_fetching: self.is_fetching,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Snapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("status", &self.status)
            .field("is_fetching", &self.is_fetching)
            .field("data", &self.data)
            .field("error", &self.error)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
