//! Cache Store
//!
//! The store maps keys to entries. Entries are created lazily by the first
//! `subscribe` or `fetch` for a key and removed by garbage collection or
//! [`QueryCache::clear`].
//!
//! # Thread Safety
//!
//! The registry is a `DashMap`; each entry has its own lock. Locks are always
//! taken shard first, entry second, and entry code never reaches back into
//! the registry while holding its own lock.
//!
//! Each [`QueryCache`] is an independent store. Construct one per application
//! or session, and a fresh one per test.

use std::any::type_name;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future;
use futures_util::FutureExt as _;

use super::entry::{downcast, same_entry, CacheEntry, StoredEntry};
use super::fetch::{FetchFuture, FetchOptions, Producer, SharedProducer};
use super::snapshot::Snapshot;
use super::subscriber::Subscriber;
use super::subscription::{ObserveOptions, Subscription};
use crate::config::QueryCacheConfig;
use crate::error::QueryError;
use crate::key::QueryKey;

/// Registry shared by a [`QueryCache`] and the timers of its entries.
pub(crate) struct StoreInner {
    pub(crate) entries: DashMap<QueryKey, Arc<dyn StoredEntry>>,
    pub(crate) config: QueryCacheConfig,
}

impl StoreInner {
    /// Remove `entry` if it is still registered and still unobserved.
    pub(crate) fn collect<T: Send + Sync + 'static>(&self, entry: &Arc<CacheEntry<T>>) {
        let removed = self.entries.remove_if(entry.key(), |_, stored| {
            same_entry(stored, entry) && stored.is_unobserved()
        });
        if removed.is_some() {
            tracing::debug!(key = %entry.key(), "collected unobserved entry");
        }
    }
}

/// Shared, deduplicated, observable async-value cache.
///
/// Cloning is cheap; clones share the same store.
///
/// # Example
///
/// ```rust,ignore
/// let cache = QueryCache::new();
///
/// let balance = cache
///     .fetch("balance:addr1", fetch_balance, FetchOptions::stale_for(Duration::from_secs(30)))
///     .await?;
/// ```
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<StoreInner>,
}

impl QueryCache {
    /// Create an empty store with the default configuration.
    pub fn new() -> Self {
        Self::with_config(QueryCacheConfig::default())
    }

    /// Create an empty store.
    pub fn with_config(config: QueryCacheConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: DashMap::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &QueryCacheConfig {
        &self.inner.config
    }

    /// Fetch the value of `key`.
    ///
    /// Returns fresh cached data, joins the call already in flight, or starts
    /// a new call to `producer`. All bookkeeping happens before this returns;
    /// the future only waits for the outcome. Must be called within a tokio
    /// runtime.
    pub fn fetch<P>(
        &self,
        key: impl Into<QueryKey>,
        producer: P,
        options: FetchOptions,
    ) -> FetchFuture<P::Output>
    where
        P: Producer,
        P::Output: Send + Sync + 'static,
    {
        match self.entry::<P::Output>(key.into()) {
            Ok(entry) => entry.fetch(Arc::new(producer), options),
            Err(err) => future::ready(Err(err)).boxed(),
        }
    }

    /// Observe `key`.
    ///
    /// `on_change` is called with the new snapshot every time the entry's
    /// state changes. `cache_time` raises the retention of the entry after
    /// its last subscriber leaves.
    pub fn subscribe<T, F>(
        &self,
        key: impl Into<QueryKey>,
        on_change: F,
        cache_time: Option<Duration>,
    ) -> Result<Subscription<T>, QueryError>
    where
        T: Send + Sync + 'static,
        F: Fn(&Arc<Snapshot<T>>) + Send + Sync + 'static,
    {
        let subscriber = Subscriber::new(on_change);
        let id = subscriber.id();
        let entry = self.with_entry(key.into(), |entry: &Arc<CacheEntry<T>>| {
            entry.attach(subscriber, cache_time);
            Arc::clone(entry)
        })?;
        Ok(Subscription::new(entry, id))
    }

    /// Subscribe, fetch and start polling in one call.
    ///
    /// The fetch runs in the background; its outcome reaches `on_change`.
    pub fn observe<T, P, F>(
        &self,
        key: impl Into<QueryKey>,
        producer: P,
        options: ObserveOptions,
        on_change: F,
    ) -> Result<Subscription<T>, QueryError>
    where
        T: Send + Sync + 'static,
        P: Producer<Output = T>,
        F: Fn(&Arc<Snapshot<T>>) + Send + Sync + 'static,
    {
        let mut subscription = self.subscribe(key, on_change, options.cache_time)?;
        let producer: SharedProducer<T> = Arc::new(producer);

        if options.enabled {
            let stale_time = options.stale_time.unwrap_or(self.inner.config.stale_time);
            drop(subscription.entry().fetch(producer, FetchOptions::stale_for(stale_time)));
            subscription.set_poll_interval(options.poll_interval);
        } else {
            subscription.entry().register_producer(producer);
        }
        Ok(subscription)
    }

    /// The current snapshot of `key`, or an idle one if the key has no entry.
    ///
    /// Never creates an entry.
    pub fn get_snapshot<T>(&self, key: impl Into<QueryKey>) -> Result<Arc<Snapshot<T>>, QueryError>
    where
        T: Send + Sync + 'static,
    {
        let key = key.into();
        match self.stored(&key) {
            Some(stored) => Ok(typed::<T>(&stored)?.snapshot()),
            None => Ok(Arc::new(Snapshot::idle())),
        }
    }

    /// Mark the data of `key` stale.
    ///
    /// The next fetch calls the producer. Observers are not notified.
    pub fn invalidate(&self, key: impl Into<QueryKey>) {
        if let Some(stored) = self.stored(&key.into()) {
            stored.invalidate();
        }
    }

    /// Cancel the in-flight call of `key` without unsubscribing anyone.
    pub fn abort(&self, key: impl Into<QueryKey>) {
        if let Some(stored) = self.stored(&key.into()) {
            stored.abort();
        }
    }

    /// Cancel all work and remove every entry. Nobody is notified.
    pub fn clear(&self) {
        let before = self.inner.entries.len();
        self.inner.entries.retain(|_, stored| {
            stored.teardown();
            false
        });
        tracing::debug!(entries = before, "cache cleared");
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn contains_key(&self, key: impl Into<QueryKey>) -> bool {
        self.inner.entries.contains_key(&key.into())
    }

    pub(crate) fn inner(&self) -> &StoreInner {
        &self.inner
    }

    fn stored(&self, key: &QueryKey) -> Option<Arc<dyn StoredEntry>> {
        self.inner
            .entries
            .get(key)
            .map(|stored| Arc::clone(stored.value()))
    }

    fn entry<T: Send + Sync + 'static>(&self, key: QueryKey) -> Result<Arc<CacheEntry<T>>, QueryError> {
        self.with_entry(key, |entry: &Arc<CacheEntry<T>>| Arc::clone(entry))
    }

    /// Run `f` on the entry of `key`, creating it if needed, while the
    /// registry shard is still locked. `f` must not notify subscribers.
    fn with_entry<T, R>(
        &self,
        key: QueryKey,
        f: impl FnOnce(&Arc<CacheEntry<T>>) -> R,
    ) -> Result<R, QueryError>
    where
        T: Send + Sync + 'static,
    {
        let slot = self.inner.entries.entry(key.clone()).or_insert_with(|| {
            tracing::debug!(key = %key, value_type = type_name::<T>(), "creating entry");
            let entry: Arc<dyn StoredEntry> = Arc::new(CacheEntry::<T>::new(
                key.clone(),
                Arc::downgrade(&self.inner),
                self.inner.config.cache_time,
            ));
            entry
        });
        let entry = typed::<T>(slot.value())?;
        Ok(f(&entry))
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("config", &self.inner.config)
            .field("entries", &self.inner.entries.len())
            .finish()
    }
}

fn typed<T: Send + Sync + 'static>(
    stored: &Arc<dyn StoredEntry>,
) -> Result<Arc<CacheEntry<T>>, QueryError> {
    downcast::<T>(stored).ok_or_else(|| QueryError::TypeMismatch {
        key: stored.key().clone(),
        expected: type_name::<T>(),
        found: stored.value_type(),
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
