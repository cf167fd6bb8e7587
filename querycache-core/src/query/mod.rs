//! Query Cache
//!
//! This module implements the cache itself: a registry mapping keys to the
//! result of asynchronous producers, with at most one producer call in flight
//! per key.
//!
//! # Concepts
//!
//! ## Snapshots
//!
//! A Snapshot is the immutable state of one key: its data, its error, its
//! status, when it last succeeded and whether a call is in flight. Every
//! change replaces the snapshot, so observers can detect changes by identity.
//!
//! ## Fetching
//!
//! A fetch either returns fresh cached data, joins the call already in flight
//! for the key, or starts a new one. Failures keep the previous data;
//! cancellations are never reported as failures.
//!
//! ## Subscriptions
//!
//! Observers subscribe to a key and are called with every new snapshot. An
//! entry lives while it is observed; once the last observer leaves, its
//! background work stops and it is collected after its `cache_time`.
//!
//! ## Polling
//!
//! Each observer may ask for a polling interval. The entry polls at the
//! shortest interval currently requested.
//!
//! # Implementation Notes
//!
//! Every entry has its own lock, and every critical section is synchronous.
//! Producers run on spawned tasks, and subscribers are always called after
//! the entry lock has been released.

mod snapshot;
mod subscriber;
mod entry;
mod fetch;
mod subscription;
mod polling;
mod store;
mod inspect;

pub use snapshot::{Snapshot, QueryStatus};
pub use subscriber::{Subscriber, SubscriberId};
pub use fetch::{FetchFuture, FetchOptions, Producer};
pub use subscription::{ObserveOptions, Subscription};
pub use store::QueryCache;
pub use inspect::EntryInfo;
