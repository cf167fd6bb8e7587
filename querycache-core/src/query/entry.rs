//! Cache Entry
//!
//! One entry exists per key while the key is observed or retained. It owns
//! the key's current snapshot, its subscriber set, the in-flight call, the GC
//! timer, the polling schedule and the last registered producer.
//!
//! All mutable state lives behind a single per-entry lock. Every critical
//! section is synchronous, and subscriber callbacks always run after the lock
//! is released.
//!
//! # Notification Order
//!
//! Snapshot changes are queued under the lock in the order they happen. One
//! caller at a time drains the queue (see [`CacheEntry::deliver`]), so every
//! subscriber sees every change in the same order and the last snapshot it
//! receives is the entry's current one. A callback that changes the entry
//! again only queues; the active drainer delivers it next.
//!
//! # Type Erasure
//!
//! The store holds entries of different value types side by side, so it sees
//! them through the [`StoredEntry`] trait. Typed access downcasts back to
//! `CacheEntry<T>`.

use std::any::{type_name, Any};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::fetch::{InFlight, SharedProducer};
use super::inspect::EntryInfo;
use super::polling::PollSchedule;
use super::snapshot::Snapshot;
use super::store::StoreInner;
use super::subscriber::{Subscriber, SubscriberId};
use crate::key::QueryKey;

/// The cache record for one key.
pub(crate) struct CacheEntry<T> {
    key: QueryKey,

    /// The store that owns this entry, used by the GC timer.
    store: Weak<StoreInner>,

    state: Mutex<EntryState<T>>,
}

/// Mutable state of an entry, guarded by the entry lock.
pub(crate) struct EntryState<T> {
    /// Replaced on every change, never mutated.
    pub(crate) snapshot: Arc<Snapshot<T>>,

    /// Observers in registration order.
    pub(crate) subscribers: IndexMap<SubscriberId, Subscriber<T>>,

    /// The call currently in flight, if any.
    pub(crate) in_flight: Option<InFlight<T>>,

    /// Producer used by background and poll-triggered fetches.
    pub(crate) producer: Option<SharedProducer<T>>,

    pub(crate) polling: PollSchedule,

    /// Retention after the last subscriber leaves. Only ever grows.
    pub(crate) gc_time: Duration,

    pub(crate) gc_timer: Option<JoinHandle<()>>,

    /// Set once the store is cleared. A detached entry never notifies and
    /// never starts timers.
    pub(crate) detached: bool,

    /// Notifications not yet delivered, oldest first.
    pending: VecDeque<Notification<T>>,

    /// Whether some caller is draining `pending`.
    delivering: bool,
}

/// Subscribers to notify of a snapshot change, collected under the lock.
struct Notification<T> {
    snapshot: Arc<Snapshot<T>>,
    subscribers: SmallVec<[Subscriber<T>; 4]>,
}

impl<T> Notification<T> {
    /// Invoke every collected subscriber with the same snapshot.
    fn dispatch(self) {
        for subscriber in &self.subscribers {
            subscriber.notify(&self.snapshot);
        }
    }
}

impl<T> EntryState<T> {
    /// Swap in `next` if it differs from the current snapshot.
    ///
    /// A semantically identical snapshot is discarded so the current one keeps
    /// its identity. Otherwise a notification is queued, and `true` is
    /// returned if the caller must [`deliver`](CacheEntry::deliver) once the
    /// lock is released.
    #[must_use]
    pub(crate) fn replace_snapshot(&mut self, next: Snapshot<T>) -> bool {
        if self.snapshot.same_state(&next) {
            return false;
        }
        self.snapshot = Arc::new(next);

        if self.detached || self.subscribers.is_empty() {
            return false;
        }
        self.pending.push_back(Notification {
            snapshot: Arc::clone(&self.snapshot),
            subscribers: self.subscribers.values().cloned().collect(),
        });
        !std::mem::replace(&mut self.delivering, true)
    }

    /// Cancel and forget the in-flight call.
    pub(crate) fn cancel_in_flight(&mut self) -> bool {
        match self.in_flight.take() {
            Some(call) => {
                call.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel_gc(&mut self) -> bool {
        match self.gc_timer.take() {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }
}

impl<T: Send + Sync + 'static> CacheEntry<T> {
    pub(crate) fn new(key: QueryKey, store: Weak<StoreInner>, gc_time: Duration) -> Self {
        Self {
            key,
            store,
            state: Mutex::new(EntryState {
                snapshot: Arc::new(Snapshot::idle()),
                subscribers: IndexMap::new(),
                in_flight: None,
                producer: None,
                polling: PollSchedule::default(),
                gc_time,
                gc_timer: None,
                detached: false,
                pending: VecDeque::new(),
                delivering: false,
            }),
        }
    }

    pub(crate) fn key(&self) -> &QueryKey {
        &self.key
    }

    pub(crate) fn store(&self) -> &Weak<StoreInner> {
        &self.store
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EntryState<T>> {
        self.state.lock()
    }

    pub(crate) fn snapshot(&self) -> Arc<Snapshot<T>> {
        Arc::clone(&self.lock().snapshot)
    }

    /// Record the producer without fetching.
    pub(crate) fn register_producer(&self, producer: SharedProducer<T>) {
        self.lock().producer = Some(producer);
    }

    /// Drain the notification queue. Must be called without the entry lock
    /// held, and only after [`EntryState::replace_snapshot`] returned `true`.
    pub(crate) fn deliver(&self) {
        let guard = Delivering(self);
        loop {
            let notification = {
                let mut state = self.lock();
                match state.pending.pop_front() {
                    Some(notification) => notification,
                    None => {
                        state.delivering = false;
                        break;
                    }
                }
            };
            notification.dispatch();
        }
        std::mem::forget(guard);
    }
}

/// Hands the queue back if a subscriber panics mid-delivery.
struct Delivering<'a, T: Send + Sync + 'static>(&'a CacheEntry<T>);

impl<T: Send + Sync + 'static> Drop for Delivering<'_, T> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.pending.clear();
        state.delivering = false;
    }
}

/// Type-erased view of an entry, as held by the store.
pub(crate) trait StoredEntry: Send + Sync {
    fn key(&self) -> &QueryKey;

    /// Name of the value type, for diagnostics.
    fn value_type(&self) -> &'static str;

    /// Mark the data stale without notifying.
    fn invalidate(&self);

    /// Cancel the in-flight call, keeping subscribers.
    fn abort(&self) -> bool;

    /// Stop all background work and detach from the store.
    fn teardown(&self);

    /// Whether no subscriber is registered and no call is running.
    fn is_unobserved(&self) -> bool;

    fn info(&self, now: Instant) -> EntryInfo;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Send + Sync + 'static> StoredEntry for CacheEntry<T> {
    fn key(&self) -> &QueryKey {
        &self.key
    }

    fn value_type(&self) -> &'static str {
        type_name::<T>()
    }

    fn invalidate(&self) {
        let mut state = self.lock();
        let next = state.snapshot.invalidated();
        state.snapshot = Arc::new(next);
        tracing::trace!(key = %self.key, "invalidated");
    }

    fn abort(&self) -> bool {
        let aborted = self.lock().cancel_in_flight();
        if aborted {
            tracing::debug!(key = %self.key, "aborted in-flight call");
        }
        aborted
    }

    fn teardown(&self) {
        let mut state = self.lock();
        state.detached = true;
        state.pending.clear();
        state.cancel_in_flight();
        state.cancel_gc();
        state.polling.reset();
        state.subscribers.clear();
    }

    fn is_unobserved(&self) -> bool {
        let state = self.lock();
        state.subscribers.is_empty() && state.in_flight.is_none()
    }

    fn info(&self, now: Instant) -> EntryInfo {
        let state = self.lock();
        EntryInfo::new(&self.key, type_name::<T>(), &state, now)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Downcast a stored entry to its concrete value type.
pub(crate) fn downcast<T: Send + Sync + 'static>(
    stored: &Arc<dyn StoredEntry>,
) -> Option<Arc<CacheEntry<T>>> {
    Arc::clone(stored).into_any().downcast::<CacheEntry<T>>().ok()
}

/// Whether `stored` and `entry` are the same allocation.
pub(crate) fn same_entry<T>(stored: &Arc<dyn StoredEntry>, entry: &Arc<CacheEntry<T>>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(stored) as *const (),
        Arc::as_ptr(entry) as *const (),
    )
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry() -> Arc<CacheEntry<u64>> {
        Arc::new(CacheEntry::new(
            "tokens:addr1".into(),
            Weak::new(),
            Duration::from_secs(300),
        ))
    }

    #[test]
    fn new_entry_is_idle() {
        let entry = entry();
        let snapshot = entry.snapshot();
        assert!(snapshot.data().is_none());
        assert!(!snapshot.is_fetching());
        assert!(entry.is_unobserved());
    }

    #[test]
    fn identical_snapshot_keeps_identity_and_skips_notification() {
        let entry = entry();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        entry.lock().subscribers.insert(
            SubscriberId::new(),
            Subscriber::new(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let before = entry.snapshot();
        let mut state = entry.lock();
        let next = (*state.snapshot).clone();
        assert!(!state.replace_snapshot(next));
        assert!(Arc::ptr_eq(&before, &state.snapshot));

        let next = state.snapshot.begin_fetch();
        assert!(state.replace_snapshot(next));
        drop(state);
        entry.deliver();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!entry.lock().delivering);
    }

    #[test]
    fn changes_made_by_a_subscriber_are_delivered_in_order() {
        let entry = entry();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&entry);
        let seen_clone = Arc::clone(&seen);
        entry.lock().subscribers.insert(
            SubscriberId::new(),
            Subscriber::new(move |snapshot: &Arc<Snapshot<u64>>| {
                seen_clone.lock().push(Arc::clone(snapshot));
                // Reacting to the first change queues a second one.
                if let Some(entry) = weak.upgrade().filter(|_| snapshot.is_fetching()) {
                    let mut state = entry.lock();
                    let next = state.snapshot.succeeded(Arc::new(1), Instant::now());
                    assert!(!state.replace_snapshot(next));
                }
            }),
        );

        let mut state = entry.lock();
        let next = state.snapshot.begin_fetch();
        assert!(state.replace_snapshot(next));
        drop(state);
        entry.deliver();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].is_fetching());
        assert!(Arc::ptr_eq(&seen[1], &entry.snapshot()));
    }

    #[test]
    fn panicking_subscriber_releases_the_queue() {
        let entry = entry();
        entry
            .lock()
            .subscribers
            .insert(SubscriberId::new(), Subscriber::new(|_| panic!("render failed")));

        let mut state = entry.lock();
        let next = state.snapshot.begin_fetch();
        assert!(state.replace_snapshot(next));
        drop(state);

        let delivered = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| entry.deliver()));
        assert!(delivered.is_err());
        assert!(!entry.lock().delivering);
    }

    #[test]
    fn invalidate_replaces_snapshot_without_notifying() {
        let entry = entry();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        entry.lock().subscribers.insert(
            SubscriberId::new(),
            Subscriber::new(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        entry.invalidate();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(entry.snapshot().updated_at().is_none());
    }

    #[test]
    fn abort_without_call_is_a_no_op() {
        assert!(!entry().abort());
    }

    #[test]
    fn teardown_detaches() {
        let entry = entry();
        entry
            .lock()
            .subscribers
            .insert(SubscriberId::new(), Subscriber::new(|_| {}));

        entry.teardown();
        let state = entry.lock();
        assert!(state.detached);
        assert!(state.subscribers.is_empty());
    }

    #[test]
    fn downcast_checks_value_type() {
        let stored: Arc<dyn StoredEntry> = entry();
        assert!(downcast::<u64>(&stored).is_some());
        assert!(downcast::<String>(&stored).is_none());
        assert_eq!(stored.value_type(), "u64");
    }

    #[test]
    fn same_entry_compares_allocations() {
        let a = entry();
        let b = entry();
        let stored: Arc<dyn StoredEntry> = a.clone();
        assert!(same_entry(&stored, &a));
        assert!(!same_entry(&stored, &b));
    }
}
