//! Recurring event used to build wait/retry loops.

use alloc::vec::Vec;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

use crate::sync::Spinlock;

struct EventInner {
    /// Incremented by every notification. A listener compares against the
    /// value captured at creation to decide whether it missed anything.
    epoch: u64,
    wakers: Vec<Waker>,
}

/// A recurring event.
///
/// Unlike a one-shot channel, an [`Event`] can be notified any number of
/// times. The intended use is the classic check-under-lock pattern:
///
/// 1. take the state lock and inspect the condition;
/// 2. if not satisfied, create a listener *while still holding the lock*;
/// 3. release the lock and await the listener;
/// 4. re-check from step 1.
///
/// Because the listener captures the notification epoch before the lock is
/// released, a notification arriving between steps 3 and 4 is never lost:
/// the listener completes immediately.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use ksched::sync::Event;
///
/// let ev = Arc::new(Event::new());
/// ksched::task::spawn(async move {
///     let listener = ev.listen();
///     ev.notify_all();
///     listener.await;
/// })
/// .unwrap();
/// ksched::task::run_all();
/// ```
pub struct Event {
    inner: Spinlock<EventInner>,
}

impl Event {
    /// Creates a new event with no pending notifications.
    pub const fn new() -> Self {
        Self {
            inner: Spinlock::new(EventInner {
                epoch: 0,
                wakers: Vec::new(),
            }),
        }
    }

    /// Creates a listener completing at the next notification.
    ///
    /// The listener observes every notification issued after this call, even
    /// ones issued before it is first polled.
    pub fn listen(&self) -> EventListener<'_> {
        let epoch = self.inner.lock().epoch;
        EventListener { event: self, epoch }
    }

    /// Wakes up every current listener.
    pub fn notify_all(&self) {
        let wakers = {
            let mut g = self.inner.lock();
            g.epoch = g.epoch.wrapping_add(1);
            core::mem::take(&mut g.wakers)
        };
        for w in wakers {
            w.wake();
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Event::new()
    }
}

impl core::fmt::Debug for Event {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.pad("Event { .. }")
    }
}

/// A future that completes once the event has been notified.
///
/// Created by [`Event::listen`].
#[must_use = "listeners do nothing unless awaited"]
pub struct EventListener<'a> {
    event: &'a Event,
    epoch: u64,
}

impl Future for EventListener<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut g = self.event.inner.lock();
        if g.epoch != self.epoch {
            Poll::Ready(())
        } else {
            g.wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}
