//! Cancellation tokens for long-lived waits.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::Waker;

use crate::sync::Spinlock;

struct CancelShared {
    flag: AtomicBool,
    wakers: Spinlock<Vec<Waker>>,
}

/// The owning side of a cancellation pair.
///
/// Dropping the source cancels every token derived from it, so a background
/// task polling with a token cannot outlive the object that spawned it.
///
/// # Examples
///
/// ```
/// use ksched::cancel::CancelSource;
///
/// let src = CancelSource::new();
/// let token = src.token();
/// assert!(!token.is_cancelled());
/// src.cancel();
/// assert!(token.is_cancelled());
/// ```
pub struct CancelSource {
    shared: Arc<CancelShared>,
}

impl CancelSource {
    /// Creates a new, uncancelled source.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(CancelShared {
                flag: AtomicBool::new(false),
                wakers: Spinlock::new(Vec::new()),
            }),
        }
    }

    /// Derives a token observing this source.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            shared: self.shared.clone(),
        }
    }

    /// Cancels all derived tokens and wakes every registered waiter.
    pub fn cancel(&self) {
        self.shared.flag.store(true, Ordering::Release);
        let wakers = core::mem::take(&mut *self.shared.wakers.lock());
        for w in wakers {
            w.wake();
        }
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        CancelSource::new()
    }
}

impl Drop for CancelSource {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// The observing side of a cancellation pair.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<CancelShared>,
}

impl CancelToken {
    /// Creates a token that is never cancelled.
    pub fn never() -> Self {
        // No CancelSource ever references this shared state.
        Self {
            shared: Arc::new(CancelShared {
                flag: AtomicBool::new(false),
                wakers: Spinlock::new(Vec::new()),
            }),
        }
    }

    /// Whether the source has been cancelled or dropped.
    pub fn is_cancelled(&self) -> bool {
        self.shared.flag.load(Ordering::Acquire)
    }

    /// Registers a waker to be woken on cancellation.
    ///
    /// Callers must re-check [`is_cancelled`](Self::is_cancelled) after
    /// registering, since cancellation may have raced with the registration.
    pub fn register(&self, waker: &Waker) {
        self.shared.wakers.lock().push(waker.clone());
    }
}

impl core::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_on_drop() {
        let src = CancelSource::new();
        let token = src.token();
        drop(src);
        assert!(token.is_cancelled());
    }

    #[test]
    fn never_token() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
    }
}
