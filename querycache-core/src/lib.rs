//! QueryCache Core
//!
//! This crate provides a shared, deduplicated, observable async-value cache.
//! It implements:
//!
//! - Keyed caching of the results of asynchronous producers
//! - Deduplication of concurrent fetches of the same key
//! - Staleness checks, polling and cooperative cancellation
//! - Observers notified with immutable snapshots on every change
//! - Garbage collection of entries nobody observes anymore
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `query`: The cache store, its entries and the fetch coordinator
//! - `key`: Cache keys
//! - `config`: Store-wide defaults
//! - `error`: Error types
//!
//! # Example
//!
//! ```rust,ignore
//! use querycache_core::{BoxError, CancellationToken, FetchOptions, QueryCache};
//!
//! let cache = QueryCache::new();
//!
//! // Observe a key
//! let sub = cache.subscribe::<u64, _>("balance:addr1", |snapshot| {
//!     println!("balance: {:?}", snapshot.data());
//! }, None)?;
//!
//! // Fetch it; concurrent fetches of the same key share one call
//! let balance = cache
//!     .fetch("balance:addr1", |_cancel: CancellationToken| async {
//!         Ok::<_, BoxError>(42u64)
//!     }, FetchOptions::default())
//!     .await?;
//! ```

pub mod config;
pub mod error;
pub mod key;
pub mod query;

pub use config::QueryCacheConfig;
pub use error::{BoxError, FetchResult, ProducerPanic, QueryError};
pub use key::QueryKey;
pub use query::{
    EntryInfo, FetchFuture, FetchOptions, ObserveOptions, Producer, QueryCache, QueryStatus,
    Snapshot, Subscriber, SubscriberId, Subscription,
};
pub use tokio_util::sync::CancellationToken;
