//! Polling Scheduler
//!
//! Each observer of an entry may request a polling interval. The entry keeps
//! a multiset of requested intervals (interval → number of observers asking
//! for it) and runs a single timer at the shortest one. Every tick issues a
//! forced fetch with the entry's last registered producer; a tick that lands
//! while a call is in flight simply joins it.
//!
//! The number of distinct intervals per key is always small, so the minimum
//! is recomputed from scratch on every change.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::entry::{CacheEntry, EntryState};
use super::fetch::FetchOptions;

/// Ref-counted polling intervals of one entry and the timer serving them.
#[derive(Debug, Default)]
pub(crate) struct PollSchedule {
    requested: HashMap<Duration, usize>,
    active: Option<Duration>,
    timer: Option<JoinHandle<()>>,
}

impl PollSchedule {
    /// Count one more observer asking for `interval`.
    ///
    /// Returns `true` if the active interval changed.
    pub(crate) fn request(&mut self, interval: Duration) -> bool {
        *self.requested.entry(interval).or_insert(0) += 1;
        self.recompute()
    }

    /// Drop one request for `interval`. Unknown intervals are ignored.
    ///
    /// Returns `true` if the active interval changed.
    pub(crate) fn release(&mut self, interval: Duration) -> bool {
        if let Some(count) = self.requested.get_mut(&interval) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.requested.remove(&interval);
            }
        }
        self.recompute()
    }

    fn recompute(&mut self) -> bool {
        let min = self.requested.keys().min().copied();
        if min == self.active {
            return false;
        }
        self.active = min;
        true
    }

    /// The interval the timer runs at, if any.
    pub(crate) fn active(&self) -> Option<Duration> {
        self.active
    }

    /// Install a new timer, aborting the previous one.
    pub(crate) fn replace_timer(&mut self, timer: Option<JoinHandle<()>>) {
        if let Some(old) = std::mem::replace(&mut self.timer, timer) {
            old.abort();
        }
    }

    /// Stop the timer and forget every request.
    pub(crate) fn reset(&mut self) {
        self.requested.clear();
        self.active = None;
        self.replace_timer(None);
    }

    #[cfg(test)]
    fn count(&self, interval: Duration) -> usize {
        self.requested.get(&interval).copied().unwrap_or(0)
    }

    #[cfg(test)]
    fn has_timer(&self) -> bool {
        self.timer.is_some()
    }
}

impl<T: Send + Sync + 'static> CacheEntry<T> {
    /// Add a polling request on behalf of one observer.
    pub(crate) fn request_poll(self: &Arc<Self>, interval: Duration) {
        let mut state = self.lock();
        if state.detached {
            return;
        }
        if state.polling.request(interval) {
            self.restart_poll_timer(&mut state);
        }
    }

    /// Remove a polling request of one observer.
    pub(crate) fn release_poll(self: &Arc<Self>, interval: Duration) {
        let mut state = self.lock();
        self.release_poll_locked(&mut state, interval);
    }

    pub(crate) fn release_poll_locked(
        self: &Arc<Self>,
        state: &mut EntryState<T>,
        interval: Duration,
    ) {
        if state.polling.release(interval) {
            self.restart_poll_timer(state);
        }
    }

    fn restart_poll_timer(self: &Arc<Self>, state: &mut EntryState<T>) {
        let period = state.polling.active();
        let timer = period.and_then(|period| spawn_poll_timer(Arc::downgrade(self), period));
        if period.is_some() && timer.is_none() {
            tracing::warn!(key = %self.key(), ?period, "no tokio runtime, polling not started");
        }
        state.polling.replace_timer(timer);
        tracing::debug!(key = %self.key(), ?period, "poll timer restarted");
    }

    fn poll_tick(self: &Arc<Self>) {
        let producer = self.lock().producer.clone();
        match producer {
            Some(producer) => {
                tracing::trace!(key = %self.key(), "poll tick");
                // The call settles on its own; the tick has no one to report to.
                drop(self.fetch(producer, FetchOptions::forced()));
            }
            None => tracing::trace!(key = %self.key(), "poll tick without a producer"),
        }
    }
}

/// Spawn a timer firing every `period`, starting one period from now.
///
/// Returns `None` outside a tokio runtime.
fn spawn_poll_timer<T: Send + Sync + 'static>(
    entry: Weak<CacheEntry<T>>,
    period: Duration,
) -> Option<JoinHandle<()>> {
    let runtime = Handle::try_current().ok()?;
    Some(runtime.spawn(async move {
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            let Some(entry) = entry.upgrade() else {
                break;
            };
            entry.poll_tick();
        }
    }))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
