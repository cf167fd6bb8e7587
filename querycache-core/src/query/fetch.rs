//! Fetch Coordinator
//!
//! Given an entry and a producer, the coordinator decides whether to return
//! fresh cached data, join the call already in flight, or start a new call.
//!
//! # Algorithm
//!
//! 1. Record the producer on the entry. Background and poll-triggered fetches
//!    use the most recently registered producer.
//!
//! 2. Unless forced, return the cached data if the last success is younger
//!    than `stale_time`.
//!
//! 3. If a call is in flight, join it. At most one call per key is ever in
//!    flight; joined callers share its outcome regardless of their options.
//!
//! 4. Otherwise create a cancellation token for the call (a child of the
//!    caller's token, if any), mark the snapshot as fetching and register the
//!    call as the entry's in-flight handle.
//!
//! 5. Run the producer and commit its outcome:
//!    - success replaces data and sets `updated_at`;
//!    - failure keeps data, records the error and rejects every joined caller;
//!    - a panic inside the producer is a failure like any other;
//!    - cancellation keeps data, records nothing and resolves every joined
//!      caller with the previous data.
//!
//!    If nobody observes the entry once the call settles, its GC timer starts,
//!    so keys that are only ever fetched are collected too.
//!
//! Steps 1-4 run synchronously under the entry lock before [`CacheEntry::fetch`]
//! returns, so two fetches issued back-to-back dedupe even if neither has been
//! awaited yet.
//!
//! # Superseded calls
//!
//! A call only commits while it is still the entry's in-flight call, or while
//! no call is registered at all (it was aborted and nothing replaced it). If a
//! newer call has taken its place, the outcome is dropped without touching the
//! snapshot.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{self, BoxFuture, Shared};
use futures_util::FutureExt as _;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::entry::CacheEntry;
use crate::error::{BoxError, FetchResult, ProducerPanic, QueryError};
use crate::key::QueryKey;

/// Future returned by a fetch. Resolves with the data current after the call
/// settles.
pub type FetchFuture<T> = BoxFuture<'static, FetchResult<T>>;

type SharedFetch<T> = Shared<FetchFuture<T>>;

/// An asynchronous function computing the value of a key.
///
/// The producer receives the call's cancellation token and is expected to
/// stop early once it is cancelled. It is implemented for any
/// `Fn(CancellationToken) -> impl Future<Output = Result<T, E>>`.
pub trait Producer: Send + Sync + 'static {
    /// The value type of the key.
    type Output;

    fn produce(&self, cancel: CancellationToken)
        -> BoxFuture<'static, Result<Self::Output, BoxError>>;
}

/// A producer as stored on an entry.
pub(crate) type SharedProducer<T> = Arc<dyn Producer<Output = T>>;

impl<F, Fut, T, E> Producer for F
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Into<BoxError>,
{
    type Output = T;

    fn produce(&self, cancel: CancellationToken) -> BoxFuture<'static, Result<T, BoxError>> {
        let fut = (self)(cancel);
        async move { fut.await.map_err(Into::into) }.boxed()
    }
}

/// Options for a single fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Cached data younger than this is returned without calling the producer.
    pub stale_time: Duration,

    /// Skip the freshness check. Still joins a call already in flight.
    pub force: bool,

    /// Cancelling this token cancels the call this fetch starts.
    pub cancel: Option<CancellationToken>,
}

impl FetchOptions {
    /// Options accepting cached data younger than `stale_time`.
    pub fn stale_for(stale_time: Duration) -> Self {
        Self {
            stale_time,
            ..Self::default()
        }
    }

    /// Options bypassing the freshness check.
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    /// Link the call to an external cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Identity of one producer call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CallId(u64);

impl CallId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// The entry's in-flight handle.
pub(crate) struct InFlight<T> {
    pub(crate) id: CallId,
    pub(crate) cancel: CancellationToken,
    future: SharedFetch<T>,
}

enum Outcome<T> {
    Success(Arc<T>),
    Failed(QueryError),
    Cancelled,
}

impl<T: Send + Sync + 'static> CacheEntry<T> {
    /// Run the coordinator for this entry.
    ///
    /// Must be called within a tokio runtime: a new call is driven by a
    /// spawned task so that it settles even if every caller drops its future.
    pub(crate) fn fetch(
        self: &Arc<Self>,
        producer: SharedProducer<T>,
        options: FetchOptions,
    ) -> FetchFuture<T> {
        let mut state = self.lock();
        state.producer = Some(Arc::clone(&producer));

        if !options.force {
            if let Some(data) = state.snapshot.fresh_data(options.stale_time, Instant::now()) {
                tracing::trace!(key = %self.key(), "returning fresh data");
                return future::ready(Ok(Some(data))).boxed();
            }
        }

        if let Some(in_flight) = &state.in_flight {
            tracing::trace!(key = %self.key(), "joining in-flight call");
            return in_flight.future.clone().boxed();
        }

        let cancel = match &options.cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let id = CallId::next();
        let call = run_call(Arc::clone(self), id, producer, cancel.clone())
            .boxed()
            .shared();

        let next = state.snapshot.begin_fetch();
        let deliver = state.replace_snapshot(next);
        state.in_flight = Some(InFlight {
            id,
            cancel,
            future: call.clone(),
        });
        state.cancel_gc();
        drop(state);

        tracing::debug!(key = %self.key(), force = options.force, "starting fetch");
        // The call is registered, so it must be driven even if a subscriber
        // panics while being told about it.
        let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| {
            if deliver {
                self.deliver();
            }
        }));
        tokio::spawn(call.clone());
        if let Err(payload) = delivered {
            std::panic::resume_unwind(payload);
        }
        call.boxed()
    }

    /// Forced fetch with the last registered producer.
    ///
    /// Resolves with the current data if no producer was ever registered.
    pub(crate) fn refetch(self: &Arc<Self>) -> FetchFuture<T> {
        let (producer, data) = {
            let state = self.lock();
            (state.producer.clone(), state.snapshot.data().cloned())
        };
        match producer {
            Some(producer) => self.fetch(producer, FetchOptions::forced()),
            None => {
                tracing::trace!(key = %self.key(), "refetch without a registered producer");
                future::ready(Ok(data)).boxed()
            }
        }
    }

    /// Commit the outcome of call `id`.
    fn settle(self: &Arc<Self>, id: CallId, outcome: Outcome<T>) -> FetchResult<T> {
        let mut state = self.lock();
        match state.in_flight.as_ref().map(|call| call.id) {
            Some(current) if current != id => {
                tracing::debug!(key = %self.key(), "dropping result of superseded call");
                return Ok(state.snapshot.data().cloned());
            }
            Some(_) => state.in_flight = None,
            None => {}
        }

        let (next, result) = match outcome {
            Outcome::Success(data) => (
                state.snapshot.succeeded(Arc::clone(&data), Instant::now()),
                Ok(Some(data)),
            ),
            Outcome::Failed(err) => {
                tracing::debug!(key = %self.key(), error = %err, "fetch failed");
                (state.snapshot.failed(err.clone()), Err(err))
            }
            Outcome::Cancelled => {
                tracing::debug!(key = %self.key(), "fetch cancelled");
                (
                    state.snapshot.cancelled(),
                    Ok(state.snapshot.data().cloned()),
                )
            }
        };

        let deliver = state.replace_snapshot(next);
        if !state.detached && state.subscribers.is_empty() && state.gc_timer.is_none() {
            self.schedule_gc(&mut state);
        }
        drop(state);

        if deliver {
            self.deliver();
        }
        result
    }
}

async fn run_call<T: Send + Sync + 'static>(
    entry: Arc<CacheEntry<T>>,
    id: CallId,
    producer: SharedProducer<T>,
    cancel: CancellationToken,
) -> FetchResult<T> {
    // The producer is invoked on first poll so a panic while building its
    // future is caught as well.
    let produced =
        AssertUnwindSafe(async { producer.produce(cancel.clone()).await }).catch_unwind();

    // Biased toward the producer: an outcome that is already available wins
    // over a cancellation that arrived after it.
    let outcome = tokio::select! {
        biased;
        result = produced => match result {
            Ok(Ok(data)) => Outcome::Success(Arc::new(data)),
            Ok(Err(_)) if cancel.is_cancelled() => Outcome::Cancelled,
            Ok(Err(err)) => Outcome::Failed(QueryError::producer(err)),
            Err(payload) => Outcome::Failed(panicked(entry.key(), payload)),
        },
        _ = cancel.cancelled() => Outcome::Cancelled,
    };

    entry.settle(id, outcome)
}

fn panicked(key: &QueryKey, payload: Box<dyn Any + Send>) -> QueryError {
    let panic = ProducerPanic::from_payload(payload.as_ref());
    tracing::warn!(key = %key, error = %panic, "producer panicked");
    QueryError::producer(panic)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Weak;

    use parking_lot::Mutex;

    use crate::query::entry::StoredEntry;
    use crate::query::snapshot::QueryStatus;
    use crate::query::subscriber::Subscriber;

    fn entry() -> Arc<CacheEntry<u64>> {
        Arc::new(CacheEntry::new(
            "balance:addr1".into(),
            Weak::new(),
            Duration::from_secs(300),
        ))
    }

    fn counting(calls: &Arc<AtomicUsize>, value: u64) -> SharedProducer<u64> {
        let calls = Arc::clone(calls);
        Arc::new(move |_cancel: CancellationToken| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, BoxError>(value)
            }
        })
    }

    fn failing(message: &'static str) -> SharedProducer<u64> {
        Arc::new(move |_cancel: CancellationToken| async move {
            Err::<u64, BoxError>(message.into())
        })
    }

    /// Never resolves unless cancelled.
    fn hanging() -> SharedProducer<u64> {
        Arc::new(|cancel: CancellationToken| async move {
            cancel.cancelled().await;
            Err::<u64, BoxError>("aborted".into())
        })
    }

    #[tokio::test]
    async fn fetch_sets_fetching_synchronously() {
        let entry = entry();
        let calls = Arc::new(AtomicUsize::new(0));

        let fut = entry.fetch(counting(&calls, 1), FetchOptions::default());
        let snapshot = entry.snapshot();
        assert!(snapshot.is_fetching());
        assert_eq!(snapshot.status(), QueryStatus::Loading);

        assert_eq!(fut.await.unwrap().as_deref(), Some(&1));
        let snapshot = entry.snapshot();
        assert!(!snapshot.is_fetching());
        assert_eq!(snapshot.status(), QueryStatus::Success);
        assert!(snapshot.updated_at().is_some());
    }

    #[tokio::test]
    async fn back_to_back_fetches_dedupe() {
        let entry = entry();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = entry.fetch(counting(&calls, 7), FetchOptions::default());
        let second = entry.fetch(counting(&calls, 8), FetchOptions::forced());

        let (first, second) = tokio::join!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first.unwrap().unwrap(), &second.unwrap().unwrap()));
    }

    #[tokio::test]
    async fn failure_rejects_and_records_error() {
        let entry = entry();

        let err = entry
            .fetch(failing("rpc down"), FetchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "producer failed: rpc down");

        let snapshot = entry.snapshot();
        assert_eq!(snapshot.status(), QueryStatus::Error);
        assert!(snapshot.error().is_some_and(|e| e.ptr_eq(&err)));
        assert!(snapshot.data().is_none());
    }

    #[tokio::test]
    async fn cancelled_call_resolves_with_previous_data() {
        let entry = entry();
        let calls = Arc::new(AtomicUsize::new(0));
        entry
            .fetch(counting(&calls, 5), FetchOptions::default())
            .await
            .unwrap();

        let pending = entry.fetch(hanging(), FetchOptions::forced());
        assert!(entry.abort());

        assert_eq!(pending.await.unwrap().as_deref(), Some(&5));
        let snapshot = entry.snapshot();
        assert_eq!(snapshot.status(), QueryStatus::Success);
        assert!(!snapshot.is_fetching());
        assert!(snapshot.error().is_none());
    }

    #[tokio::test]
    async fn external_token_cancels_first_load() {
        let entry = entry();
        let token = CancellationToken::new();

        let pending = entry.fetch(hanging(), FetchOptions::default().with_cancel(token.clone()));
        token.cancel();

        assert_eq!(pending.await.unwrap(), None);
        let snapshot = entry.snapshot();
        assert_eq!(snapshot.status(), QueryStatus::Idle);
        assert!(!snapshot.is_fetching());
    }

    #[tokio::test]
    async fn cancelling_call_leaves_external_token_alone() {
        let entry = entry();
        let token = CancellationToken::new();

        let pending = entry.fetch(hanging(), FetchOptions::default().with_cancel(token.clone()));
        entry.abort();
        pending.await.unwrap();

        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn superseded_result_is_dropped() {
        let entry = entry();

        // Ignores its token and resolves late.
        let stubborn: SharedProducer<u64> = Arc::new(|_cancel: CancellationToken| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, BoxError>(1)
        });
        let calls = Arc::new(AtomicUsize::new(0));

        let old = entry.fetch(stubborn, FetchOptions::default());
        entry.abort();
        let new = entry.fetch(counting(&calls, 2), FetchOptions::default());

        // The aborted call settles while the new one is registered.
        assert_eq!(old.await.unwrap(), None);
        assert!(entry.snapshot().is_fetching());

        assert_eq!(new.await.unwrap().as_deref(), Some(&2));
        assert_eq!(entry.snapshot().data().map(|d| **d), Some(2));
    }

    #[tokio::test]
    async fn fetch_records_latest_producer() {
        let entry = entry();
        let calls = Arc::new(AtomicUsize::new(0));

        entry
            .fetch(counting(&calls, 1), FetchOptions::default())
            .await
            .unwrap();
        let refetched = entry.refetch().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(refetched.as_deref(), Some(&1));
    }

    #[tokio::test]
    async fn refetch_without_producer_returns_current_data() {
        let entry = entry();
        assert_eq!(entry.refetch().await.unwrap(), None);
        assert!(!entry.snapshot().is_fetching());
    }

    #[tokio::test]
    async fn subscribers_are_notified_once_per_transition() {
        let entry = entry();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        entry.attach(
            Subscriber::new(move |snapshot| seen_clone.lock().push(Arc::clone(snapshot))),
            None,
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let a = entry.fetch(counting(&calls, 3), FetchOptions::default());
        let b = entry.fetch(counting(&calls, 3), FetchOptions::default());
        let _ = tokio::join!(a, b);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].is_fetching());
        assert_eq!(seen[1].status(), QueryStatus::Success);
        assert!(Arc::ptr_eq(&seen[1], &entry.snapshot()));
    }

    #[tokio::test]
    async fn panicking_producer_fails_and_releases_the_key() {
        let entry = entry();
        let panicking: SharedProducer<u64> = Arc::new(|_cancel: CancellationToken| async {
            if true {
                panic!("slot out of range");
            }
            Ok::<u64, BoxError>(1)
        });

        let err = entry
            .fetch(panicking, FetchOptions::default())
            .await
            .unwrap_err();
        let panic = err.downcast_ref::<ProducerPanic>().unwrap();
        assert_eq!(panic.message, "slot out of range");

        let snapshot = entry.snapshot();
        assert_eq!(snapshot.status(), QueryStatus::Error);
        assert!(!snapshot.is_fetching());
        assert!(entry.lock().in_flight.is_none());

        let calls = Arc::new(AtomicUsize::new(0));
        let value = entry
            .fetch(counting(&calls, 9), FetchOptions::forced())
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some(&9));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn producer_panicking_before_its_future_is_caught() {
        let entry = entry();
        let eager: SharedProducer<u64> =
            Arc::new(|_cancel: CancellationToken| -> future::Ready<Result<u64, BoxError>> {
                panic!("bad request")
            });

        let err = entry.fetch(eager, FetchOptions::default()).await.unwrap_err();
        assert!(err.downcast_ref::<ProducerPanic>().is_some());
        assert!(!entry.snapshot().is_fetching());
    }

    #[tokio::test]
    async fn abort_after_success_changes_nothing() {
        let entry = entry();
        let calls = Arc::new(AtomicUsize::new(0));
        let value = entry
            .fetch(counting(&calls, 4), FetchOptions::default())
            .await
            .unwrap();

        let before = entry.snapshot();
        assert!(!entry.abort());
        let after = entry.snapshot();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.status(), QueryStatus::Success);
        assert!(Arc::ptr_eq(after.data().unwrap(), &value.unwrap()));
    }

    #[tokio::test]
    async fn external_token_cancelled_after_settle_keeps_data() {
        let entry = entry();
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        entry
            .fetch(counting(&calls, 6), FetchOptions::default().with_cancel(token.clone()))
            .await
            .unwrap();

        token.cancel();
        tokio::task::yield_now().await;

        let snapshot = entry.snapshot();
        assert_eq!(snapshot.status(), QueryStatus::Success);
        assert_eq!(snapshot.data().map(|d| **d), Some(6));
        assert!(!snapshot.is_fetching());
    }

    #[tokio::test]
    async fn ready_result_wins_over_earlier_cancellation() {
        let entry = entry();
        let token = CancellationToken::new();
        let ready: SharedProducer<u64> =
            Arc::new(|_cancel: CancellationToken| async { Ok::<u64, BoxError>(11) });

        // Cancelled before the spawned call is first polled.
        let pending = entry.fetch(ready, FetchOptions::default().with_cancel(token.clone()));
        token.cancel();

        assert_eq!(pending.await.unwrap().as_deref(), Some(&11));
        assert_eq!(entry.snapshot().status(), QueryStatus::Success);
    }

    #[tokio::test]
    async fn settled_call_schedules_collection_when_unobserved() {
        let entry = entry();
        let calls = Arc::new(AtomicUsize::new(0));

        let pending = entry.fetch(counting(&calls, 1), FetchOptions::default());
        assert!(entry.lock().gc_timer.is_none());
        pending.await.unwrap();
        assert!(entry.lock().gc_timer.is_some());

        // A new call holds the entry until it settles.
        let pending = entry.fetch(counting(&calls, 2), FetchOptions::forced());
        assert!(entry.lock().gc_timer.is_none());
        assert!(!entry.is_unobserved());
        pending.await.unwrap();
        assert!(entry.lock().gc_timer.is_some());
        assert!(entry.is_unobserved());
    }

    #[tokio::test]
    async fn settled_call_leaves_observed_entries_alone() {
        let entry = entry();
        entry.attach(Subscriber::new(|_| {}), None);
        let calls = Arc::new(AtomicUsize::new(0));

        entry
            .fetch(counting(&calls, 1), FetchOptions::default())
            .await
            .unwrap();
        assert!(entry.lock().gc_timer.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn last_notification_matches_settled_snapshot() {
        for _ in 0..500 {
            let entry = entry();
            let last = Arc::new(Mutex::new(None));
            let last_clone = Arc::clone(&last);
            entry.attach(
                Subscriber::new(move |snapshot| *last_clone.lock() = Some(Arc::clone(snapshot))),
                None,
            );

            let ready: SharedProducer<u64> =
                Arc::new(|_cancel: CancellationToken| async { Ok::<u64, BoxError>(1) });
            entry.fetch(ready, FetchOptions::default()).await.unwrap();

            let last = last.lock().clone().unwrap();
            assert!(!last.is_fetching());
            assert_eq!(last.status(), QueryStatus::Success);
            assert!(Arc::ptr_eq(&last, &entry.snapshot()));
        }
    }
}
