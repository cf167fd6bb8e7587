//! Subscriber types for the query cache.
//!
//! A Subscriber is an observer of one cache entry, typically a component of
//! the rendering layer. It is notified with the new snapshot whenever the
//! entry's state changes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::snapshot::Snapshot;

/// Unique identifier for a subscriber.
///
/// Each subscription gets a unique ID when created. The ID keys the entry's
/// subscriber set, so the same callback may be registered twice without the
/// registrations colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

type Notify<T> = dyn Fn(&Arc<Snapshot<T>>) + Send + Sync;

/// An observer of a cache entry.
///
/// Cloning is cheap: the callback is shared, which lets the entry collect
/// its subscribers under the lock and invoke them after releasing it.
pub struct Subscriber<T> {
    id: SubscriberId,
    notify: Arc<Notify<T>>,
}

impl<T> Subscriber<T> {
    /// Create a new subscriber with the given notification callback.
    pub fn new<F>(notify: F) -> Self
    where
        F: Fn(&Arc<Snapshot<T>>) + Send + Sync + 'static,
    {
        Self {
            id: SubscriberId::new(),
            notify: Arc::new(notify),
        }
    }

    /// Get the subscriber's unique ID.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Notify the subscriber that the entry changed.
    pub fn notify(&self, snapshot: &Arc<Snapshot<T>>) {
        (self.notify)(snapshot);
    }
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            notify: Arc::clone(&self.notify),
        }
    }
}
