//! Reference-counted cache pages and the reclaim engine.
//!
//! A [`CachePage`] is the reclaim-side handle on one page-sized physical
//! extent. The view that owns the page embeds it in its own page record;
//! the [`ReclaimEngine`] walks cache pages on its LRU list without ever
//! touching view state, and calls back into the owner through the
//! [`PageBundle`] trait. Keeping the two separate avoids a lock-order
//! hazard between reclaim and the views.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{fence, AtomicU32, Ordering};

use async_trait::async_trait;
use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink};
use kalloc::{FrameAllocator, PhysicalAddr};
use ksched::sync::Spinlock;

use crate::error::{Error, Result};
use crate::PAGE_SIZE;

/// Mask of the reclaim state bits within [`CachePage`] flags.
pub const RECLAIM_STATE_MASK: u32 = 0x03;
/// Page is clean and evictable (on the reclaim LRU list).
pub const RECLAIM_CACHED: u32 = 0x01;
/// Page is currently being evicted (not on the LRU list).
pub const RECLAIM_UNCACHING: u32 = 0x02;

/// The reclaim-side face of a memory object owner.
#[async_trait]
pub trait PageBundle: Send + Sync {
    /// Try to release the physical backing of `page`.
    ///
    /// Returns `Ok(true)` once the page has been evicted, `Ok(false)` if it
    /// is not evictable right now (locked, dirty or already gone). Errors
    /// are logged by the engine and the page stays resident.
    async fn uncache_page(&self, page: &CachePage) -> Result<bool>;

    /// Called once the reference count of a [`CachePage`] reaches zero.
    fn retire_page(&self, page: &CachePage);
}

/// Reclaim handle on one page-sized physical extent.
pub struct CachePage {
    /// Bundle that owns this page.
    pub bundle: Weak<dyn PageBundle>,
    /// Identity of the page as part of the bundle. Bundles can use this
    /// field however they like; pager-managed spaces store the page-aligned
    /// offset.
    pub identity: u64,
    /// Hook for the LRU and pager work lists. Which list a page is on is
    /// implied by its load state and reclaim flags; it is never on two.
    pub link: LinkedListLink,
    /// To coordinate memory reclaim and the bundle that owns this page, we
    /// need a reference counter. This is not related to memory locking.
    refcount: AtomicU32,
    flags: AtomicU32,
}

// The link is only touched under the lock of whichever list owns the page.
unsafe impl Send for CachePage {}
unsafe impl Sync for CachePage {}

intrusive_adapter!(pub(crate) CachePageAdapter = Arc<CachePage>: CachePage { link: LinkedListLink });

impl CachePage {
    /// Create a page handle with a zero reference count.
    pub fn new(bundle: Weak<dyn PageBundle>, identity: u64) -> Arc<Self> {
        Arc::new(Self {
            bundle,
            identity,
            link: LinkedListLink::new(),
            refcount: AtomicU32::new(0),
            flags: AtomicU32::new(0),
        })
    }

    /// Take a reference on the page.
    pub fn retain(&self) {
        let old = self.refcount.fetch_add(1, Ordering::Relaxed);
        debug_assert!(old < u32::MAX);
    }

    /// Drop a reference on the page. The owner's
    /// [`retire_page`](PageBundle::retire_page) hook runs on the final
    /// decrement.
    pub fn release(&self) {
        if self.refcount.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            if let Some(bundle) = self.bundle.upgrade() {
                bundle.retire_page(self);
            }
        }
    }

    /// Current reference count.
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Relaxed)
    }

    /// Current reclaim state bits.
    pub fn reclaim_state(&self) -> u32 {
        self.flags.load(Ordering::Relaxed) & RECLAIM_STATE_MASK
    }

    /// Replace the reclaim state bits. Callers hold the lock of the list
    /// the page is moving on or off of.
    pub fn set_reclaim_state(&self, state: u32) {
        debug_assert_eq!(state & !RECLAIM_STATE_MASK, 0);
        let old = self.flags.load(Ordering::Relaxed);
        self.flags
            .store((old & !RECLAIM_STATE_MASK) | state, Ordering::Relaxed);
    }
}

/// Process-wide LRU of evictable pages.
///
/// The physical allocator signals pressure by calling
/// [`reclaim`](Self::reclaim); the engine picks the least recently used
/// clean pages and asks their owners to uncache them. Owners move pages on
/// and off the list as they become eligible.
pub struct ReclaimEngine {
    lru: Spinlock<LinkedList<CachePageAdapter>>,
}

impl ReclaimEngine {
    /// Create an engine with an empty LRU list.
    pub fn new() -> Self {
        Self {
            lru: Spinlock::new(LinkedList::new(CachePageAdapter::new())),
        }
    }

    /// Number of pages currently evictable.
    pub fn evictable(&self) -> usize {
        self.lru.lock().iter().count()
    }

    /// Mark `page` clean-and-evictable and append it to the LRU list.
    ///
    /// No-op unless the page is currently in the `none` reclaim state, so a
    /// page whose eviction is in flight cannot be re-cached under it.
    pub fn cache(&self, page: &Arc<CachePage>) {
        let mut g = self.lru.lock();
        if page.reclaim_state() != 0 {
            return;
        }
        debug_assert!(!page.link.is_linked());
        page.set_reclaim_state(RECLAIM_CACHED);
        g.push_back(page.clone());
    }

    /// Remove `page` from the LRU list, pinning it against reclaim.
    pub fn uncache(&self, page: &Arc<CachePage>) {
        let mut g = self.lru.lock();
        if page.reclaim_state() != RECLAIM_CACHED {
            return;
        }
        let mut cur = unsafe { g.cursor_mut_from_ptr(Arc::as_ptr(page)) };
        cur.remove();
        page.set_reclaim_state(0);
    }

    /// Try to evict up to `npages` pages. Returns the number evicted.
    pub async fn reclaim(&self, npages: usize) -> usize {
        let mut reclaimed = 0;
        while reclaimed < npages {
            let page = {
                let mut g = self.lru.lock();
                match g.pop_front() {
                    Some(p) => {
                        p.set_reclaim_state(RECLAIM_UNCACHING);
                        p
                    }
                    None => break,
                }
            };
            let bundle = match page.bundle.upgrade() {
                Some(b) => b,
                None => {
                    // The owner is gone; the entry was stale.
                    page.set_reclaim_state(0);
                    continue;
                }
            };
            match bundle.uncache_page(&page).await {
                Ok(true) => reclaimed += 1,
                Ok(false) => {
                    // Became pinned or dirty since it was listed; the owner
                    // re-caches it when it is eligible again.
                    page.set_reclaim_state(0);
                }
                Err(err) => {
                    log::warn!("reclaim: failed to evict page {}: {:?}", page.identity, err);
                    let mut g = self.lru.lock();
                    page.set_reclaim_state(RECLAIM_CACHED);
                    g.push_back(page.clone());
                }
            }
        }
        reclaimed
    }
}

impl Default for ReclaimEngine {
    fn default() -> Self {
        ReclaimEngine::new()
    }
}

/// Allocate physical memory, falling back to reclaim under pressure.
pub(crate) async fn allocate_frames(
    allocator: &Arc<dyn FrameAllocator>,
    reclaim: &Arc<ReclaimEngine>,
    bits: u32,
    size: usize,
    align: usize,
) -> Result<PhysicalAddr> {
    if let Some(pa) = allocator.allocate(bits, size, align) {
        return Ok(pa);
    }
    let want = (size + PAGE_SIZE - 1) / PAGE_SIZE;
    reclaim.reclaim(want.max(1)).await;
    allocator.allocate(bits, size, align).ok_or(Error::OutOfMemory)
}

#[cfg(test)]
mod tests {
    use std::prelude::v1::*;

    use super::*;
    use core::sync::atomic::AtomicUsize;
    use crate::error::Result;
    use ksched::task;

    struct CountingBundle {
        retired: AtomicUsize,
    }

    #[async_trait]
    impl PageBundle for CountingBundle {
        async fn uncache_page(&self, page: &CachePage) -> Result<bool> {
            page.release();
            Ok(true)
        }

        fn retire_page(&self, _page: &CachePage) {
            self.retired.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn refcount_reaches_zero_only_via_retire() {
        let bundle = Arc::new(CountingBundle {
            retired: AtomicUsize::new(0),
        });
        let bundle_dyn: Arc<dyn PageBundle> = bundle.clone();
        let weak: Weak<dyn PageBundle> = Arc::downgrade(&bundle_dyn);
        let page = CachePage::new(weak, 7);
        page.retain();
        page.retain();
        assert_eq!(page.refcount(), 2);
        page.release();
        assert_eq!(bundle.retired.load(Ordering::SeqCst), 0);
        page.release();
        assert_eq!(page.refcount(), 0);
        assert_eq!(bundle.retired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reclaim_walks_lru_in_order() {
        let bundle = Arc::new(CountingBundle {
            retired: AtomicUsize::new(0),
        });
        let engine = Arc::new(ReclaimEngine::new());
        for identity in 0..4u64 {
            let bundle_dyn: Arc<dyn PageBundle> = bundle.clone();
            let weak: Weak<dyn PageBundle> = Arc::downgrade(&bundle_dyn);
            let page = CachePage::new(weak, identity);
            page.retain();
            engine.cache(&page);
        }
        assert_eq!(engine.evictable(), 4);

        let engine2 = engine.clone();
        task::spawn(async move {
            assert_eq!(engine2.reclaim(3).await, 3);
        })
        .unwrap();
        task::run_all();
        assert_eq!(engine.evictable(), 1);
    }

    #[test]
    fn stale_pages_are_skipped() {
        let engine = Arc::new(ReclaimEngine::new());
        {
            let bundle = Arc::new(CountingBundle {
                retired: AtomicUsize::new(0),
            });
            let bundle_dyn: Arc<dyn PageBundle> = bundle.clone();
            let weak: Weak<dyn PageBundle> = Arc::downgrade(&bundle_dyn);
            let page = CachePage::new(weak, 0);
            engine.cache(&page);
            // Bundle dropped here; the LRU entry goes stale.
        }
        let engine2 = engine.clone();
        task::spawn(async move {
            assert_eq!(engine2.reclaim(1).await, 0);
        })
        .unwrap();
        task::run_all();
        assert_eq!(engine.evictable(), 0);
    }
}
