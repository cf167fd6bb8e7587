//! Error types for the query cache.
//!
//! Producer failures are shared by every caller joined on the same in-flight
//! call, so [`QueryError`] is cheap to clone and keeps the underlying error
//! behind an `Arc`.

use std::any::Any;
use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

use crate::key::QueryKey;

/// Boxed error returned by producer functions.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Result of a fetch: the current data (absent if no fetch ever succeeded),
/// or the failure of the producer call.
pub type FetchResult<T> = Result<Option<Arc<T>>, QueryError>;

/// An error surfaced by the query cache.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// The producer function failed.
    ///
    /// Recorded on the snapshot of the key and propagated to every caller
    /// awaiting the failed call.
    #[error("producer failed: {0}")]
    Producer(Arc<dyn StdError + Send + Sync>),

    /// The key is already registered with a different value type.
    #[error("query `{key}` holds `{found}`, not `{expected}`")]
    TypeMismatch {
        key: QueryKey,
        expected: &'static str,
        found: &'static str,
    },
}

impl QueryError {
    /// Wrap a producer failure.
    pub fn producer(err: impl Into<BoxError>) -> Self {
        let err: BoxError = err.into();
        Self::Producer(Arc::from(err))
    }

    /// The underlying producer error, if this is a producer failure.
    pub fn producer_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::Producer(err) => Some(err.as_ref()),
            Self::TypeMismatch { .. } => None,
        }
    }

    /// Attempt to downcast the producer error to a concrete type.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.producer_error()?.downcast_ref::<E>()
    }

    /// Identity comparison: two errors are the same if they share the same
    /// allocation. Used for snapshot change detection.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Producer(a), Self::Producer(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// A producer panicked instead of returning.
///
/// Reported as [`QueryError::Producer`]; recover it with
/// [`QueryError::downcast_ref`].
#[derive(Debug, Clone, Error)]
#[error("producer panicked: {message}")]
pub struct ProducerPanic {
    pub message: String,
}

impl ProducerPanic {
    pub(crate) fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_owned()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "opaque panic payload".to_owned()
        };
        Self { message }
    }
}
