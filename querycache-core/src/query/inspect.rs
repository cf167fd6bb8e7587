//! Inspection
//!
//! Read-only, serializable views of every entry in a store, for debug panels
//! and logs. Inspecting never creates entries and never notifies anyone.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::entry::{EntryState, StoredEntry};
use super::snapshot::QueryStatus;
use super::store::QueryCache;
use crate::key::QueryKey;

/// Point-in-time description of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub key: QueryKey,
    pub value_type: &'static str,
    pub status: QueryStatus,
    pub is_fetching: bool,
    pub has_data: bool,
    pub error: Option<String>,
    /// Milliseconds since the last success.
    pub age_ms: Option<u64>,
    pub subscribers: usize,
    pub poll_interval_ms: Option<u64>,
    pub cache_time_ms: u64,
    /// Whether the entry is waiting to be collected.
    pub gc_pending: bool,
}

impl EntryInfo {
    pub(crate) fn new<T>(
        key: &QueryKey,
        value_type: &'static str,
        state: &EntryState<T>,
        now: Instant,
    ) -> Self {
        let snapshot = &state.snapshot;
        Self {
            key: key.clone(),
            value_type,
            status: snapshot.status(),
            is_fetching: snapshot.is_fetching(),
            has_data: snapshot.data().is_some(),
            error: snapshot.error().map(ToString::to_string),
            age_ms: snapshot.age(now).map(millis),
            subscribers: state.subscribers.len(),
            poll_interval_ms: state.polling.active().map(millis),
            cache_time_ms: millis(state.gc_time),
            gc_pending: state
                .gc_timer
                .as_ref()
                .is_some_and(|timer| !timer.is_finished()),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl QueryCache {
    /// Describe every entry, sorted by key.
    pub fn inspect(&self) -> Vec<EntryInfo> {
        // Collect first so no shard lock is held while entry locks are taken.
        let entries: Vec<Arc<dyn StoredEntry>> = self
            .inner()
            .entries
            .iter()
            .map(|stored| Arc::clone(stored.value()))
            .collect();

        let now = Instant::now();
        let mut infos: Vec<EntryInfo> = entries.iter().map(|stored| stored.info(now)).collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// [`inspect`](Self::inspect) rendered as pretty-printed JSON.
    pub fn inspect_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.inspect())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
