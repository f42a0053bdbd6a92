//! Copy-on-write views and the fork-time snapshot chain.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use async_trait::async_trait;
use hashbrown::HashMap;
use kalloc::wrapper::vec_push;
use kalloc::{FrameAllocator, PageWindow, PhysicalAddr};
use ksched::sync::{Event, Spinlock};

use crate::error::{Error, Result};
use crate::evict::EvictionQueue;
use crate::page::{allocate_frames, ReclaimEngine};
use crate::utils::{each_page, round_down};
use crate::view::{AddressIdentity, CachingMode, MemoryView, PhysicalRange};
use crate::PAGE_SIZE;

/// One snapshot's page map.
///
/// A chain node is filled at the fork that creates it and immutable
/// afterwards; nodes link towards older snapshots through `super_chain`,
/// forming a list (never a cycle: children never reference descendants).
pub struct CowChain {
    super_chain: Option<Arc<CowChain>>,
    pages: Spinlock<HashMap<usize, PhysicalAddr>>,
    allocator: Arc<dyn FrameAllocator>,
}

impl CowChain {
    fn new(
        super_chain: Option<Arc<CowChain>>,
        pages: HashMap<usize, PhysicalAddr>,
        allocator: Arc<dyn FrameAllocator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            super_chain,
            pages: Spinlock::new(pages),
            allocator,
        })
    }

    /// Find the nearest snapshot copy of the page at `offset`.
    fn find(&self, offset: usize) -> Option<PhysicalAddr> {
        if let Some(pa) = self.pages.lock().get(&offset).copied() {
            return Some(pa);
        }
        let mut node = self.super_chain.clone();
        while let Some(chain) = node {
            if let Some(pa) = chain.pages.lock().get(&offset).copied() {
                return Some(pa);
            }
            node = chain.super_chain.clone();
        }
        None
    }
}

impl Drop for CowChain {
    fn drop(&mut self) {
        for (_, pa) in self.pages.get_mut().drain() {
            self.allocator.free(pa, PAGE_SIZE);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum CowState {
    /// The view has no private copy of the page.
    #[default]
    Vacant,
    /// Another task is currently copying the page up; wait on the copy
    /// event and re-check.
    InProgress,
    /// The view owns a private copy.
    HasCopy,
}

#[derive(Default)]
struct CowPage {
    physical: Option<PhysicalAddr>,
    state: CowState,
    lock_count: usize,
    /// Locks taken on the source on this page's behalf. Kept separately so
    /// unlocks release exactly what locks acquired, even after a copy-up
    /// changed what backs the page.
    source_locks: usize,
}

struct CowInner {
    chain: Option<Arc<CowChain>>,
    pages: HashMap<usize, CowPage>,
}

/// A view observing a snapshot of a source view, copying pages up on
/// first touch.
///
/// Lookup order on fetch: the view's own pages, then the chain nodes from
/// nearest to furthest, then the source view. Nothing upstream can change
/// because chain nodes are immutable after the fork that fills them.
pub struct CopyOnWriteMemory {
    inner: Spinlock<CowInner>,
    copy_event: Event,
    evict_queue: EvictionQueue,
    source: Arc<dyn MemoryView>,
    source_offset: usize,
    length: usize,
    allocator: Arc<dyn FrameAllocator>,
    reclaim: Arc<ReclaimEngine>,
}

impl CopyOnWriteMemory {
    /// Create a view over `[source_offset, source_offset + length)` of
    /// `source`. Both bounds must be page-aligned.
    pub fn new(
        source: Arc<dyn MemoryView>,
        source_offset: usize,
        length: usize,
        allocator: Arc<dyn FrameAllocator>,
        reclaim: Arc<ReclaimEngine>,
    ) -> Result<Self> {
        if source_offset % PAGE_SIZE != 0 || length % PAGE_SIZE != 0 {
            return Err(Error::Fault);
        }
        let end = source_offset.checked_add(length).ok_or(Error::Fault)?;
        if end > source.length() {
            return Err(Error::Fault);
        }
        Ok(Self {
            inner: Spinlock::new(CowInner {
                chain: None,
                pages: HashMap::new(),
            }),
            copy_event: Event::new(),
            evict_queue: EvictionQueue::new(),
            source,
            source_offset,
            length,
            allocator,
            reclaim,
        })
    }

    fn check(&self, offset: usize, size: usize) -> Result<()> {
        let end = offset.checked_add(size).ok_or(Error::Fault)?;
        if end > self.length {
            return Err(Error::Fault);
        }
        Ok(())
    }

    /// Copy the page at `aligned` into a fresh frame, sourcing from the
    /// nearest snapshot copy or, failing that, the source view.
    async fn copy_page(&self, aligned: usize, snapshot: Option<PhysicalAddr>) -> Result<PhysicalAddr> {
        let pa = allocate_frames(&self.allocator, &self.reclaim, 64, PAGE_SIZE, PAGE_SIZE).await?;
        let dst = PageWindow::map(pa, PAGE_SIZE);
        if let Some(src_pa) = snapshot {
            let src = PageWindow::map(src_pa, PAGE_SIZE);
            dst.as_mut_slice().copy_from_slice(src.as_slice());
            return Ok(pa);
        }
        let src_off = self.source_offset + aligned;
        if let Err(err) = self.source.async_lock_range(src_off, PAGE_SIZE).await {
            self.allocator.free(pa, PAGE_SIZE);
            return Err(err);
        }
        let result = match self.source.fetch_range(src_off).await {
            Ok(range) => {
                debug_assert!(range.len >= PAGE_SIZE);
                let src = PageWindow::map(range.addr, PAGE_SIZE);
                dst.as_mut_slice().copy_from_slice(src.as_slice());
                Ok(())
            }
            Err(err) => Err(err),
        };
        self.source.unlock_range(src_off, PAGE_SIZE);
        match result {
            Ok(()) => Ok(pa),
            Err(err) => {
                self.allocator.free(pa, PAGE_SIZE);
                Err(err)
            }
        }
    }

    async fn fetch_cow(&self, offset: usize) -> Result<PhysicalRange> {
        if offset >= self.length {
            return Err(Error::Fault);
        }
        let aligned = round_down(offset, PAGE_SIZE);
        let misalign = offset - aligned;
        loop {
            let mut wait = None;
            let mut copy = false;
            let mut snapshot = None;
            {
                let mut g = self.inner.lock();
                {
                    let page = g.pages.entry(aligned).or_default();
                    match page.state {
                        CowState::HasCopy => {
                            if let Some(pa) = page.physical {
                                return Ok(PhysicalRange {
                                    addr: pa + misalign,
                                    len: PAGE_SIZE - misalign,
                                    caching: CachingMode::WriteBack,
                                });
                            }
                            debug_assert!(false, "copied page without backing");
                            return Err(Error::NoSuchResource);
                        }
                        CowState::InProgress => {
                            wait = Some(self.copy_event.listen());
                        }
                        CowState::Vacant => {
                            page.state = CowState::InProgress;
                            copy = true;
                        }
                    }
                }
                if copy {
                    snapshot = g.chain.as_ref().and_then(|chain| chain.find(aligned));
                }
            }
            if copy {
                let copied = self.copy_page(aligned, snapshot).await;
                {
                    let mut g = self.inner.lock();
                    let page = g.pages.entry(aligned).or_default();
                    debug_assert_eq!(page.state, CowState::InProgress);
                    match copied {
                        Ok(pa) => {
                            page.physical = Some(pa);
                            page.state = CowState::HasCopy;
                        }
                        Err(err) => {
                            page.state = CowState::Vacant;
                            drop(g);
                            self.copy_event.notify_all();
                            return Err(err);
                        }
                    }
                }
                self.copy_event.notify_all();
            } else if let Some(listener) = wait {
                listener.await;
            }
        }
    }

    /// Undo a partially taken range lock, releasing in reverse order.
    fn unwind_locks(&self, secured: Vec<(usize, bool)>) {
        let mut g = self.inner.lock();
        for (off, source_locked) in secured.into_iter().rev() {
            if let Some(page) = g.pages.get_mut(&off) {
                debug_assert!(page.lock_count > 0);
                page.lock_count -= 1;
                if source_locked {
                    debug_assert!(page.source_locks > 0);
                    page.source_locks -= 1;
                    self.source
                        .unlock_range(self.source_offset + off, PAGE_SIZE);
                }
            }
        }
    }
}

impl Drop for CopyOnWriteMemory {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for (_, page) in inner.pages.drain() {
            if let Some(pa) = page.physical {
                self.allocator.free(pa, PAGE_SIZE);
            }
        }
    }
}

#[async_trait]
impl MemoryView for CopyOnWriteMemory {
    fn length(&self) -> usize {
        self.length
    }

    fn address_identity(&self, offset: usize) -> Result<AddressIdentity> {
        self.check(offset, 1)?;
        Ok(AddressIdentity {
            object: self as *const Self as usize,
            offset,
        })
    }

    fn lock_range(&self, offset: usize, size: usize) -> Result<()> {
        self.check(offset, size)?;
        let mut g = self.inner.lock();
        let mut secured: Vec<(usize, bool)> = Vec::new();
        for off in each_page(offset, size) {
            let lock_source = {
                let page = g.pages.entry(off).or_default();
                page.lock_count += 1;
                // Pages without a private copy pin whatever currently backs
                // them; ancestor copies are pinned by the chain itself, so
                // only the source needs a lock.
                page.state != CowState::HasCopy
            };
            if lock_source {
                if let Err(err) = self.source.lock_range(self.source_offset + off, PAGE_SIZE) {
                    if let Some(page) = g.pages.get_mut(&off) {
                        page.lock_count -= 1;
                    }
                    drop(g);
                    self.unwind_locks(secured);
                    return Err(err);
                }
                if let Some(page) = g.pages.get_mut(&off) {
                    page.source_locks += 1;
                }
            }
            if vec_push(&mut secured, (off, lock_source)).is_err() {
                if let Some(page) = g.pages.get_mut(&off) {
                    page.lock_count -= 1;
                    if lock_source {
                        page.source_locks -= 1;
                        self.source
                            .unlock_range(self.source_offset + off, PAGE_SIZE);
                    }
                }
                drop(g);
                self.unwind_locks(secured);
                return Err(Error::OutOfMemory);
            }
        }
        Ok(())
    }

    async fn async_lock_range(&self, offset: usize, size: usize) -> Result<()> {
        self.check(offset, size)?;
        let mut secured: Vec<(usize, bool)> = Vec::new();
        for off in each_page(offset, size) {
            loop {
                let mut wait = None;
                let mut lock_source = false;
                {
                    let mut g = self.inner.lock();
                    let page = g.pages.entry(off).or_default();
                    match page.state {
                        CowState::InProgress => wait = Some(self.copy_event.listen()),
                        CowState::HasCopy => {
                            page.lock_count += 1;
                        }
                        CowState::Vacant => {
                            page.lock_count += 1;
                            lock_source = true;
                        }
                    }
                }
                if let Some(listener) = wait {
                    listener.await;
                    continue;
                }
                if lock_source {
                    if let Err(err) = self
                        .source
                        .async_lock_range(self.source_offset + off, PAGE_SIZE)
                        .await
                    {
                        if let Some(page) = self.inner.lock().pages.get_mut(&off) {
                            page.lock_count -= 1;
                        }
                        self.unwind_locks(secured);
                        return Err(err);
                    }
                    if let Some(page) = self.inner.lock().pages.get_mut(&off) {
                        page.source_locks += 1;
                    }
                }
                if vec_push(&mut secured, (off, lock_source)).is_err() {
                    self.unwind_locks(alloc::vec![(off, lock_source)]);
                    self.unwind_locks(secured);
                    return Err(Error::OutOfMemory);
                }
                break;
            }
        }
        Ok(())
    }

    fn unlock_range(&self, offset: usize, size: usize) {
        let mut g = self.inner.lock();
        for off in each_page(offset, size) {
            let page = match g.pages.get_mut(&off) {
                Some(page) => page,
                None => {
                    debug_assert!(false, "unlocking a page that was never locked");
                    continue;
                }
            };
            debug_assert!(page.lock_count > 0);
            page.lock_count -= 1;
            if page.source_locks > 0 {
                page.source_locks -= 1;
                self.source
                    .unlock_range(self.source_offset + off, PAGE_SIZE);
            }
        }
    }

    fn peek_range(&self, offset: usize) -> Option<(PhysicalAddr, CachingMode)> {
        if offset >= self.length {
            return None;
        }
        let aligned = round_down(offset, PAGE_SIZE);
        let misalign = offset - aligned;
        {
            let g = self.inner.lock();
            if let Some(page) = g.pages.get(&aligned) {
                if page.state == CowState::HasCopy {
                    return page
                        .physical
                        .map(|pa| (pa + misalign, CachingMode::WriteBack));
                }
            }
            if let Some(pa) = g.chain.as_ref().and_then(|chain| chain.find(aligned)) {
                return Some((pa + misalign, CachingMode::WriteBack));
            }
        }
        self.source.peek_range(self.source_offset + offset)
    }

    async fn fetch_range(&self, offset: usize) -> Result<PhysicalRange> {
        self.fetch_cow(offset).await
    }

    /// Writes through a copy-on-write view land in private pages; there is
    /// nothing to write back.
    fn mark_dirty(&self, _offset: usize, _size: usize) {}

    async fn fork(&self) -> Result<Arc<dyn MemoryView>> {
        let child_chain = {
            let mut g = self.inner.lock();
            let mut moved: HashMap<usize, PhysicalAddr> = HashMap::new();
            moved.try_reserve(g.pages.len())?;

            // Locked pages must keep their physical stable for the lock
            // holders, so the snapshot receives duplicates of them.
            let mut duplicates: Vec<(usize, PhysicalAddr)> = Vec::new();
            for (&off, page) in g.pages.iter() {
                if page.state != CowState::HasCopy || page.lock_count == 0 {
                    continue;
                }
                let src = match page.physical {
                    Some(pa) => pa,
                    None => continue,
                };
                let dup = match self.allocator.allocate(64, PAGE_SIZE, PAGE_SIZE) {
                    Some(pa) => pa,
                    None => {
                        for (_, pa) in duplicates {
                            self.allocator.free(pa, PAGE_SIZE);
                        }
                        return Err(Error::OutOfMemory);
                    }
                };
                if vec_push(&mut duplicates, (off, dup)).is_err() {
                    self.allocator.free(dup, PAGE_SIZE);
                    for (_, pa) in duplicates {
                        self.allocator.free(pa, PAGE_SIZE);
                    }
                    return Err(Error::OutOfMemory);
                }
                PageWindow::map(dup, PAGE_SIZE)
                    .as_mut_slice()
                    .copy_from_slice(PageWindow::map(src, PAGE_SIZE).as_slice());
            }
            for (off, pa) in duplicates {
                moved.insert(off, pa);
            }

            // Unlocked copies migrate into the snapshot wholesale.
            g.pages.retain(|&off, page| {
                if page.state == CowState::HasCopy && page.lock_count == 0 {
                    if let Some(pa) = page.physical.take() {
                        moved.insert(off, pa);
                    }
                    false
                } else {
                    true
                }
            });

            let chain = CowChain::new(g.chain.take(), moved, self.allocator.clone());
            g.chain = Some(chain.clone());
            chain
        };

        // Every mapping of this view must re-fault, so future writes go
        // through a fresh copy-up instead of the pages that are now part
        // of the immutable snapshot.
        self.evict_queue.evict_range(0, self.length).await;

        Ok(Arc::new(CopyOnWriteMemory {
            inner: Spinlock::new(CowInner {
                chain: Some(child_chain),
                pages: HashMap::new(),
            }),
            copy_event: Event::new(),
            evict_queue: EvictionQueue::new(),
            source: self.source.clone(),
            source_offset: self.source_offset,
            length: self.length,
            allocator: self.allocator.clone(),
            reclaim: self.reclaim.clone(),
        }))
    }

    fn eviction_queue(&self) -> Option<&EvictionQueue> {
        Some(&self.evict_queue)
    }
}

#[cfg(test)]
mod tests {
    use std::prelude::v1::*;

    use super::*;
    use crate::anon::AllocatedMemory;
    use crate::transfer::{copy_from_view, copy_to_view};
    use kalloc::HeapFrames;
    use ksched::task;

    fn setup(
        source_len: usize,
    ) -> (
        Arc<HeapFrames>,
        Arc<dyn FrameAllocator>,
        Arc<ReclaimEngine>,
        Arc<dyn MemoryView>,
    ) {
        let heap = Arc::new(HeapFrames::new());
        let alloc: Arc<dyn FrameAllocator> = heap.clone();
        let reclaim = Arc::new(ReclaimEngine::new());
        let source: Arc<dyn MemoryView> = Arc::new(AllocatedMemory::new(
            source_len,
            alloc.clone(),
            reclaim.clone(),
        ));
        (heap, alloc, reclaim, source)
    }

    #[test]
    fn fork_isolates_writes() {
        let (heap, alloc, reclaim, source) = setup(2 * PAGE_SIZE);
        let heap2 = heap.clone();
        task::spawn(async move {
            let fill = vec![0xAA; 2 * PAGE_SIZE];
            copy_to_view(&*source, 0, &fill).await.unwrap();

            let v1 = Arc::new(
                CopyOnWriteMemory::new(source.clone(), 0, 2 * PAGE_SIZE, alloc, reclaim).unwrap(),
            );
            let v2 = v1.fork().await.unwrap();

            copy_to_view(&*v1, 0, &[0xBB]).await.unwrap();

            let mut byte = [0u8; 1];
            copy_from_view(&*v2, 0, &mut byte).await.unwrap();
            assert_eq!(byte[0], 0xAA);
            copy_from_view(&*v1, 0, &mut byte).await.unwrap();
            assert_eq!(byte[0], 0xBB);

            // The untouched page is still backed by the single source
            // page for both siblings.
            let (pa1, _) = v1.peek_range(PAGE_SIZE).unwrap();
            let (pa2, _) = v2.peek_range(PAGE_SIZE).unwrap();
            let (src_pa, _) = source.peek_range(PAGE_SIZE).unwrap();
            assert_eq!(pa1, pa2);
            assert_eq!(pa1, src_pa);

            // Two source pages, v1's copy of page 0, and v2's copy-up
            // made while reading it back.
            assert_eq!(heap2.outstanding(), 4);
        })
        .unwrap();
        task::run_all();
        assert_eq!(heap.outstanding(), 0);
    }

    #[test]
    fn child_sees_pre_fork_writes() {
        let (heap, alloc, reclaim, source) = setup(PAGE_SIZE);
        task::spawn(async move {
            let v1 = Arc::new(
                CopyOnWriteMemory::new(source, 0, PAGE_SIZE, alloc, reclaim).unwrap(),
            );
            copy_to_view(&*v1, 10, b"before").await.unwrap();

            let v2 = v1.fork().await.unwrap();
            copy_to_view(&*v1, 10, b"after!").await.unwrap();

            let mut seen = [0u8; 6];
            copy_from_view(&*v2, 10, &mut seen).await.unwrap();
            assert_eq!(&seen, b"before");
            copy_from_view(&*v1, 10, &mut seen).await.unwrap();
            assert_eq!(&seen, b"after!");
        })
        .unwrap();
        task::run_all();
        assert_eq!(heap.outstanding(), 0);
    }

    #[test]
    fn grandchildren_walk_the_chain() {
        let (heap, alloc, reclaim, source) = setup(PAGE_SIZE);
        task::spawn(async move {
            let v1 = Arc::new(
                CopyOnWriteMemory::new(source, 0, PAGE_SIZE, alloc, reclaim).unwrap(),
            );
            copy_to_view(&*v1, 0, b"gen1").await.unwrap();
            let v2 = v1.fork().await.unwrap();
            copy_to_view(&*v1, 0, b"gen2").await.unwrap();
            let v3 = v1.fork().await.unwrap();

            let mut seen = [0u8; 4];
            copy_from_view(&*v2, 0, &mut seen).await.unwrap();
            assert_eq!(&seen, b"gen1");
            copy_from_view(&*v3, 0, &mut seen).await.unwrap();
            assert_eq!(&seen, b"gen2");
            copy_from_view(&*v1, 0, &mut seen).await.unwrap();
            assert_eq!(&seen, b"gen2");
        })
        .unwrap();
        task::run_all();
        assert_eq!(heap.outstanding(), 0);
    }

    #[test]
    fn locked_pages_survive_fork_in_place() {
        let (heap, alloc, reclaim, source) = setup(PAGE_SIZE);
        task::spawn(async move {
            let v1 = Arc::new(
                CopyOnWriteMemory::new(source, 0, PAGE_SIZE, alloc, reclaim).unwrap(),
            );
            copy_to_view(&*v1, 0, b"pinned").await.unwrap();
            v1.lock_range(0, PAGE_SIZE).unwrap();
            let (before, _) = v1.peek_range(0).unwrap();

            let v2 = v1.fork().await.unwrap();

            // The lock holder keeps addressing the same physical page.
            let (after, _) = v1.peek_range(0).unwrap();
            assert_eq!(before, after);

            // The sibling still observes the snapshot contents.
            let mut seen = [0u8; 6];
            copy_from_view(&*v2, 0, &mut seen).await.unwrap();
            assert_eq!(&seen, b"pinned");

            v1.unlock_range(0, PAGE_SIZE);
        })
        .unwrap();
        task::run_all();
        assert_eq!(heap.outstanding(), 0);
    }

    #[test]
    fn source_is_never_written() {
        let (_heap, alloc, reclaim, source) = setup(PAGE_SIZE);
        task::spawn(async move {
            let fill = vec![0x5A; PAGE_SIZE];
            copy_to_view(&*source, 0, &fill).await.unwrap();
            let v1 = Arc::new(
                CopyOnWriteMemory::new(source.clone(), 0, PAGE_SIZE, alloc, reclaim).unwrap(),
            );
            copy_to_view(&*v1, 0, &[0x00, 0x00, 0x00]).await.unwrap();
            let mut seen = [0u8; 3];
            copy_from_view(&*source, 0, &mut seen).await.unwrap();
            assert_eq!(seen, [0x5A, 0x5A, 0x5A]);
        })
        .unwrap();
        task::run_all();
    }

    #[test]
    fn misaligned_construction_faults() {
        let (_heap, alloc, reclaim, source) = setup(2 * PAGE_SIZE);
        assert!(
            CopyOnWriteMemory::new(source.clone(), 1, PAGE_SIZE, alloc.clone(), reclaim.clone())
                .is_err()
        );
        assert!(
            CopyOnWriteMemory::new(source, 0, 3 * PAGE_SIZE, alloc, reclaim).is_err()
        );
    }
}
