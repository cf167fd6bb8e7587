//! Subscription Manager
//!
//! Tracks who observes a key and drives the entry's lifetime from that set:
//!
//! - Subscribing cancels a pending GC timer and raises the entry's retention
//!   to the longest `cache_time` any subscriber asked for.
//! - When the last subscriber leaves, the in-flight call is cancelled,
//!   polling stops and a GC timer starts. If nobody has subscribed again by
//!   the time it fires, the entry is removed from the store.
//!
//! An entry without subscribers therefore never has background work running;
//! only its GC timer may be pending. Entries that are only ever fetched get
//! the same timer once their call settles.
//!
//! Outside a tokio runtime no timer can be started, so the last unsubscribe
//! collects the entry immediately.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;

use super::entry::{CacheEntry, EntryState};
use super::fetch::FetchFuture;
use super::snapshot::Snapshot;
use super::store::StoreInner;
use super::subscriber::{Subscriber, SubscriberId};
use crate::key::QueryKey;

/// Options for [`QueryCache::observe`](super::QueryCache::observe).
#[derive(Debug, Clone)]
pub struct ObserveOptions {
    /// Cached data younger than this is not refetched. Falls back to the
    /// store's configured `stale_time`.
    pub stale_time: Option<Duration>,

    /// Retention after the last subscriber leaves. Falls back to the store's
    /// configured `cache_time`.
    pub cache_time: Option<Duration>,

    /// Refetch at this interval while observed.
    pub poll_interval: Option<Duration>,

    /// When `false`, only subscribe and register the producer.
    pub enabled: bool,
}

impl Default for ObserveOptions {
    fn default() -> Self {
        Self {
            stale_time: None,
            cache_time: None,
            poll_interval: None,
            enabled: true,
        }
    }
}

/// Handle to a registered subscriber.
///
/// Dropping this handle unsubscribes.
pub struct Subscription<T: Send + Sync + 'static> {
    entry: Arc<CacheEntry<T>>,
    id: SubscriberId,
    poll_interval: Option<Duration>,
}

impl<T: Send + Sync + 'static> Subscription<T> {
    pub(crate) fn new(entry: Arc<CacheEntry<T>>, id: SubscriberId) -> Self {
        Self {
            entry,
            id,
            poll_interval: None,
        }
    }

    pub(crate) fn entry(&self) -> &Arc<CacheEntry<T>> {
        &self.entry
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn key(&self) -> &QueryKey {
        self.entry.key()
    }

    /// The current snapshot of the observed entry.
    pub fn snapshot(&self) -> Arc<Snapshot<T>> {
        self.entry.snapshot()
    }

    /// The polling interval this subscriber requested.
    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval
    }

    /// Change the polling interval this subscriber requests.
    ///
    /// `None` withdraws the request. Zero intervals are ignored.
    pub fn set_poll_interval(&mut self, interval: Option<Duration>) {
        let interval = match interval {
            Some(interval) if interval.is_zero() => {
                tracing::warn!(key = %self.key(), "ignoring zero poll interval");
                None
            }
            interval => interval,
        };
        if interval == self.poll_interval {
            return;
        }
        if let Some(interval) = interval {
            self.entry.request_poll(interval);
        }
        if let Some(previous) = std::mem::replace(&mut self.poll_interval, interval) {
            self.entry.release_poll(previous);
        }
    }

    /// Force a fetch with the entry's last registered producer.
    pub fn refetch(&self) -> FetchFuture<T> {
        self.entry.refetch()
    }

    /// Stop observing the entry.
    pub fn unsubscribe(self) {}
}

impl<T: Send + Sync + 'static> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.entry.detach(self.id, self.poll_interval.take());
    }
}

impl<T: Send + Sync + 'static> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", self.key())
            .field("id", &self.id)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl<T: Send + Sync + 'static> CacheEntry<T> {
    /// Register a subscriber and rescue the entry from a pending GC.
    pub(crate) fn attach(&self, subscriber: Subscriber<T>, cache_time: Option<Duration>) {
        let mut state = self.lock();
        if let Some(cache_time) = cache_time {
            state.gc_time = state.gc_time.max(cache_time);
        }
        if state.cancel_gc() {
            tracing::trace!(key = %self.key(), "garbage collection cancelled");
        }
        state.subscribers.insert(subscriber.id(), subscriber);
    }

    /// Remove a subscriber along with its polling request.
    pub(crate) fn detach(self: &Arc<Self>, id: SubscriberId, poll_interval: Option<Duration>) {
        let mut state = self.lock();
        if state.detached || state.subscribers.shift_remove(&id).is_none() {
            return;
        }

        if !state.subscribers.is_empty() {
            if let Some(interval) = poll_interval {
                self.release_poll_locked(&mut state, interval);
            }
            return;
        }

        state.cancel_in_flight();
        state.polling.reset();
        if self.schedule_gc(&mut state) {
            return;
        }
        drop(state);

        // The store locks the shard before the entry, so collect unlocked.
        tracing::warn!(key = %self.key(), "no tokio runtime, collecting immediately");
        if let Some(store) = self.store().upgrade() {
            store.collect(self);
        }
    }

    /// Start the GC timer for an entry nobody observes.
    ///
    /// Returns `false` when called outside a tokio runtime.
    pub(crate) fn schedule_gc(self: &Arc<Self>, state: &mut EntryState<T>) -> bool {
        state.cancel_gc();
        let Ok(runtime) = Handle::try_current() else {
            return false;
        };
        let delay = state.gc_time;
        let store = self.store().clone();
        let entry = Arc::downgrade(self);
        state.gc_timer = Some(runtime.spawn(collect_after(store, entry, delay)));
        tracing::debug!(key = %self.key(), ?delay, "scheduling collection");
        true
    }
}

async fn collect_after<T: Send + Sync + 'static>(
    store: Weak<StoreInner>,
    entry: Weak<CacheEntry<T>>,
    delay: Duration,
) {
    tokio::time::sleep(delay).await;
    if let (Some(store), Some(entry)) = (store.upgrade(), entry.upgrade()) {
        store.collect(&entry);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
