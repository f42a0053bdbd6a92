//! Range eviction with post-and-acknowledge fan-out.
//!
//! A view that can evict memory owns one [`EvictionQueue`]; every address
//! space that maps the view attaches a [`MemoryObserver`]. An eviction
//! completes only after every observer attached at the moment of posting
//! has done its local work (unmapping, TLB invalidation) and acknowledged.
//! Only then may the owner release the physical page. A stuck observer
//! therefore stalls further eviction on that queue; the alternative is a
//! use-after-unmap.

use ksched::cancel::CancelToken;
use ksched::postack::{PostAckAgent, PostAckHandle, PostAckMechanism};

/// A range of a view whose physical backing is being removed.
#[derive(Debug, Clone, Copy)]
pub struct RangeToEvict {
    /// Byte offset of the range within the view.
    pub offset: usize,
    /// Length of the range in bytes.
    pub size: usize,
}

/// One observer's handle on a posted eviction.
///
/// Dropping the handle acknowledges as well; [`done`](Self::done) makes the
/// acknowledgement explicit at the point the local unmapping is finished.
pub struct Eviction {
    handle: PostAckHandle<RangeToEvict>,
}

impl Eviction {
    /// Byte offset of the evicted range.
    pub fn offset(&self) -> usize {
        self.handle.value().offset
    }

    /// Length of the evicted range in bytes.
    pub fn size(&self) -> usize {
        self.handle.value().size
    }

    /// Acknowledge that every page of the range has been unmapped locally.
    pub fn done(self) {
        self.handle.ack();
    }
}

/// A participant that must acknowledge evictions before pages are freed.
pub struct MemoryObserver {
    agent: PostAckAgent<RangeToEvict>,
}

impl MemoryObserver {
    /// Create a detached observer.
    pub const fn new() -> Self {
        Self {
            agent: PostAckAgent::new(),
        }
    }

    /// Wait for the next eviction on the queue this observer is attached
    /// to. Returns [`None`] if `token` is cancelled or the observer is
    /// detached; a pending eviction is never lost to cancellation.
    pub async fn poll_eviction(&self, token: &CancelToken) -> Option<Eviction> {
        self.agent
            .poll(token)
            .await
            .map(|handle| Eviction { handle })
    }
}

impl Default for MemoryObserver {
    fn default() -> Self {
        MemoryObserver::new()
    }
}

/// Fan-out of range-eviction events with ack-based backpressure.
pub struct EvictionQueue {
    mechanism: PostAckMechanism<RangeToEvict>,
}

impl EvictionQueue {
    /// Create a queue with no observers.
    pub fn new() -> Self {
        Self {
            mechanism: PostAckMechanism::new(),
        }
    }

    /// Attach an observer. It sees evictions posted from now on.
    pub fn add_observer(&self, observer: &MemoryObserver) {
        observer.agent.attach(&self.mechanism);
    }

    /// Detach an observer, acknowledging anything it still owes.
    pub fn remove_observer(&self, observer: &MemoryObserver) {
        observer.agent.detach();
    }

    /// Post an eviction of `[offset, offset + size)` and wait until every
    /// observer attached at the time of posting has acknowledged it.
    pub async fn evict_range(&self, offset: usize, size: usize) {
        log::trace!("evict [{:#x}, {:#x})", offset, offset + size);
        self.mechanism.post(RangeToEvict { offset, size }).await;
    }
}

impl Default for EvictionQueue {
    fn default() -> Self {
        EvictionQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use std::prelude::v1::*;

    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use ksched::task;

    #[test]
    fn eviction_completes_after_all_acks() {
        let queue = Arc::new(EvictionQueue::new());
        let a = Arc::new(MemoryObserver::new());
        let b = Arc::new(MemoryObserver::new());
        queue.add_observer(&a);
        queue.add_observer(&b);

        let acks = Arc::new(AtomicUsize::new(0));
        let complete = Arc::new(AtomicBool::new(false));

        let poster_queue = queue.clone();
        let poster_acks = acks.clone();
        let poster_complete = complete.clone();
        task::spawn(async move {
            poster_queue.evict_range(0x1000, 0x1000).await;
            assert_eq!(poster_acks.load(Ordering::SeqCst), 2);
            poster_complete.store(true, Ordering::SeqCst);
        })
        .unwrap();

        for observer in [a, b] {
            let acks = acks.clone();
            let queue = queue.clone();
            task::spawn(async move {
                let token = CancelToken::never();
                let eviction = observer.poll_eviction(&token).await.unwrap();
                assert_eq!(eviction.offset(), 0x1000);
                assert_eq!(eviction.size(), 0x1000);
                acks.fetch_add(1, Ordering::SeqCst);
                eviction.done();
                queue.remove_observer(&observer);
            })
            .unwrap();
        }

        task::run_all();
        assert!(complete.load(Ordering::SeqCst));
    }
}
