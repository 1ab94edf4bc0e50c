//! Synchronization events.
//!
//! An [`Event`] follows stream-event semantics: recording on a stream enqueues
//! a completion marker, and waiters block (or suspend) until every recorded
//! marker has executed. An event that was never recorded is trivially ready.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

#[derive(Default)]
struct EventState {
    /// Generation counter of recordings issued.
    pending: u64,
    /// Generation counter of recordings completed.
    completed: u64,
}

struct EventInner {
    state: Mutex<EventState>,
    cond: Condvar,
    notify: Notify,
}

/// A recordable, awaitable synchronization point between streams and the host.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    /// Create a new event in the ready state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventInner {
                state: Mutex::new(EventState::default()),
                cond: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Register one recording; returns the generation the marker must complete.
    pub(crate) fn mark_pending(&self) -> u64 {
        let mut state = self.inner.state.lock();
        state.pending += 1;
        state.pending
    }

    /// Complete the marker for `generation`, waking all waiters.
    pub(crate) fn complete(&self, generation: u64) {
        {
            let mut state = self.inner.state.lock();
            state.completed = state.completed.max(generation);
        }
        self.inner.cond.notify_all();
        self.inner.notify.notify_waiters();
    }

    /// Whether every recording so far has completed (non-blocking).
    pub fn is_ready(&self) -> bool {
        let state = self.inner.state.lock();
        state.completed >= state.pending
    }

    /// Block the calling thread until the event is ready.
    pub fn synchronize(&self) {
        let mut state = self.inner.state.lock();
        while state.completed < state.pending {
            self.inner.cond.wait(&mut state);
        }
    }

    /// Suspend until the event is ready.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking, so a completion racing this wait
            // cannot slip between the check and the first poll.
            notified.as_mut().enable();
            if self.is_ready() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrecorded_event_is_ready() {
        let event = Event::new();
        assert!(event.is_ready());
        event.synchronize(); // must not block
    }

    #[test]
    fn test_record_then_complete() {
        let event = Event::new();
        let generation = event.mark_pending();
        assert!(!event.is_ready());
        event.complete(generation);
        assert!(event.is_ready());
    }

    #[tokio::test]
    async fn test_async_wait_wakes() {
        let event = Event::new();
        let generation = event.mark_pending();

        let waiter = event.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        // Complete from another thread after a short delay.
        let completer = event.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            completer.complete(generation);
        });

        handle.await.unwrap();
        assert!(event.is_ready());
    }
}
