//! Pager-managed memory.
//!
//! A [`ManagedSpace`] is a page database whose contents are produced and
//! persisted by an external pager. Two views share one space:
//! [`BackingMemory`] is the pager-facing half, which presents every page
//! whether or not it is initialized and carries the management protocol;
//! [`FrontalMemory`] is the consumer-facing half, whose fetches suspend
//! until the pager has initialized the touched page.
//!
//! Per page the space runs the load state machine described on
//! [`LoadState`]; dirty pages queue for writeback, evictable pages sit on
//! the reclaim engine's LRU, and eviction completes through the
//! post-and-acknowledge protocol before physical memory is released.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::cell::UnsafeCell;

use async_trait::async_trait;
use intrusive_collections::{intrusive_adapter, Bound, KeyAdapter, LinkedList, RBTree, RBTreeLink};
use kalloc::{FrameAllocator, PhysicalAddr};
use ksched::sync::{Event, Spinlock};

use crate::error::{Error, Result};
use crate::evict::EvictionQueue;
use crate::page::{
    allocate_frames, CachePage, CachePageAdapter, PageBundle, ReclaimEngine, RECLAIM_CACHED,
};
use crate::utils::{each_page, round_down};
use crate::view::{
    AddressIdentity, CachingMode, ManageEvent, ManageRequest, MemoryView, PhysicalRange,
};
use crate::PAGE_SIZE;

/// Load state of one pager-managed page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// No initialized backing; nobody has asked for any.
    Missing,
    /// Initialized and clean.
    Present,
    /// A fetch wants the pager to initialize the page.
    WantInitialization,
    /// The pager has picked the page up for initialization.
    Initialization,
    /// The page is dirty and waiting for the pager to pick it up.
    WantWriteback,
    /// The pager has picked the page up for writeback.
    Writeback,
    /// The page was redirtied while a writeback was outstanding.
    AnotherWriteback,
    /// The page is being evicted; not every observer has acknowledged yet.
    Evicting,
}

struct ManagedPageInner {
    physical: Option<PhysicalAddr>,
    load: LoadState,
    lock_count: usize,
}

/// One page record. Fields behind `inner` are guarded by the space lock.
struct ManagedPage {
    offset: usize,
    rb_link: RBTreeLink,
    cache: Arc<CachePage>,
    inner: UnsafeCell<ManagedPageInner>,
}

// `inner` is only dereferenced under the owning space's lock (or after the
// row has been detached from the table, when it is exclusively owned).
unsafe impl Send for ManagedPage {}
unsafe impl Sync for ManagedPage {}

impl ManagedPage {
    /// SAFETY: the caller holds the owning space's lock, or exclusively
    /// owns a detached row.
    #[allow(clippy::mut_from_ref)]
    unsafe fn state(&self) -> &mut ManagedPageInner {
        &mut *self.inner.get()
    }
}

intrusive_adapter!(ManagedPageAdapter = Arc<ManagedPage>: ManagedPage { rb_link: RBTreeLink });

impl<'a> KeyAdapter<'a> for ManagedPageAdapter {
    type Key = usize;
    fn get_key(&self, page: &'a ManagedPage) -> usize {
        page.offset
    }
}

struct SpaceInner {
    pages: RBTree<ManagedPageAdapter>,
    init_list: LinkedList<CachePageAdapter>,
    writeback_list: LinkedList<CachePageAdapter>,
    length: usize,
}

/// Page database shared by a [`FrontalMemory`]/[`BackingMemory`] pair.
pub struct ManagedSpace {
    inner: Spinlock<SpaceInner>,
    evict_queue: EvictionQueue,
    /// Wakes pagers waiting in `submit_manage` when work is queued.
    management_event: Event,
    /// Wakes fetchers and load initiators when a page makes progress.
    monitor_event: Event,
    allocator: Arc<dyn FrameAllocator>,
    reclaim: Arc<ReclaimEngine>,
}

impl ManagedSpace {
    /// Create a space of `length` bytes. `length` must be page-aligned.
    pub fn new(
        length: usize,
        allocator: Arc<dyn FrameAllocator>,
        reclaim: Arc<ReclaimEngine>,
    ) -> Arc<Self> {
        debug_assert_eq!(length % PAGE_SIZE, 0);
        Arc::new(Self {
            inner: Spinlock::new(SpaceInner {
                pages: RBTree::new(ManagedPageAdapter::new()),
                init_list: LinkedList::new(CachePageAdapter::new()),
                writeback_list: LinkedList::new(CachePageAdapter::new()),
                length,
            }),
            evict_queue: EvictionQueue::new(),
            management_event: Event::new(),
            monitor_event: Event::new(),
            allocator,
            reclaim,
        })
    }

    fn page_or_create(
        space: &Arc<ManagedSpace>,
        inner: &mut SpaceInner,
        offset: usize,
    ) -> Arc<ManagedPage> {
        if let Some(page) = inner.pages.find(&offset).clone_pointer() {
            return page;
        }
        let space_dyn: Arc<dyn PageBundle> = space.clone();
        let bundle: Weak<dyn PageBundle> = Arc::downgrade(&space_dyn);
        let page = Arc::new(ManagedPage {
            offset,
            rb_link: RBTreeLink::new(),
            cache: CachePage::new(bundle, offset as u64),
            inner: UnsafeCell::new(ManagedPageInner {
                physical: None,
                load: LoadState::Missing,
                lock_count: 0,
            }),
        });
        inner.pages.insert(page.clone());
        page
    }

    fn unlink_from(list: &mut LinkedList<CachePageAdapter>, cache: &Arc<CachePage>) {
        if cache.link.is_linked() {
            let mut cur = unsafe { list.cursor_mut_from_ptr(Arc::as_ptr(cache)) };
            cur.remove();
        }
    }

    fn lock_pages(space: &Arc<Self>, offset: usize, size: usize) -> Result<()> {
        let mut g = space.inner.lock();
        let end = offset.checked_add(size).ok_or(Error::Fault)?;
        if end > g.length {
            return Err(Error::Fault);
        }
        for off in each_page(offset, size) {
            let page = Self::page_or_create(space, &mut g, off);
            let st = unsafe { page.state() };
            st.lock_count += 1;
            // A locked page must not sit on the evictable LRU list.
            if page.cache.reclaim_state() == RECLAIM_CACHED {
                space.reclaim.uncache(&page.cache);
            }
        }
        Ok(())
    }

    fn unlock_pages(&self, offset: usize, size: usize) {
        let g = self.inner.lock();
        for off in each_page(offset, size) {
            let page = match g.pages.find(&off).clone_pointer() {
                Some(page) => page,
                None => {
                    debug_assert!(false, "unlocking a page that was never locked");
                    continue;
                }
            };
            let st = unsafe { page.state() };
            debug_assert!(st.lock_count > 0);
            st.lock_count -= 1;
            if st.lock_count == 0 && st.load == LoadState::Present {
                self.reclaim.cache(&page.cache);
            }
        }
    }

    fn peek_page(&self, offset: usize) -> Option<(PhysicalAddr, CachingMode)> {
        let g = self.inner.lock();
        if offset >= g.length {
            return None;
        }
        let aligned = round_down(offset, PAGE_SIZE);
        let page = g.pages.find(&aligned).clone_pointer()?;
        let st = unsafe { page.state() };
        match st.load {
            LoadState::Present
            | LoadState::WantWriteback
            | LoadState::Writeback
            | LoadState::AnotherWriteback => st
                .physical
                .map(|pa| (pa + (offset - aligned), CachingMode::WriteBack)),
            _ => None,
        }
    }

    fn mark_dirty_pages(&self, offset: usize, size: usize) {
        let mut notify = false;
        {
            let mut g = self.inner.lock();
            for off in each_page(offset, size) {
                let page = match g.pages.find(&off).clone_pointer() {
                    Some(page) => page,
                    None => continue,
                };
                let st = unsafe { page.state() };
                match st.load {
                    LoadState::Present => {
                        st.load = LoadState::WantWriteback;
                        if page.cache.reclaim_state() == RECLAIM_CACHED {
                            self.reclaim.uncache(&page.cache);
                        }
                        g.writeback_list.push_back(page.cache.clone());
                        notify = true;
                    }
                    LoadState::Writeback => {
                        st.load = LoadState::AnotherWriteback;
                    }
                    // WantWriteback and AnotherWriteback are already queued;
                    // dirtying is idempotent.
                    _ => {}
                }
            }
        }
        if notify {
            self.management_event.notify_all();
        }
    }

    /// Frontal fetch: drive the page to `Present`, suspending for the pager.
    async fn fetch_frontal(space: &Arc<Self>, offset: usize) -> Result<PhysicalRange> {
        let aligned = round_down(offset, PAGE_SIZE);
        let misalign = offset - aligned;
        loop {
            let listener;
            let mut notify = false;
            {
                let mut g = space.inner.lock();
                if offset >= g.length {
                    return Err(Error::Fault);
                }
                let page = Self::page_or_create(space, &mut g, aligned);
                let st = unsafe { page.state() };
                match st.load {
                    LoadState::Present
                    | LoadState::WantWriteback
                    | LoadState::Writeback
                    | LoadState::AnotherWriteback => {
                        if let Some(pa) = st.physical {
                            return Ok(PhysicalRange {
                                addr: pa + misalign,
                                len: PAGE_SIZE - misalign,
                                caching: CachingMode::WriteBack,
                            });
                        }
                        debug_assert!(false, "initialized page without backing");
                    }
                    LoadState::Missing => {
                        st.load = LoadState::WantInitialization;
                        g.init_list.push_back(page.cache.clone());
                        notify = true;
                    }
                    LoadState::WantInitialization
                    | LoadState::Initialization
                    | LoadState::Evicting => {}
                }
                listener = space.monitor_event.listen();
            }
            if notify {
                space.management_event.notify_all();
            }
            listener.await;
        }
    }

    /// Backing fetch: present the page whether or not it is initialized,
    /// allocating backing on demand for the pager to fill.
    async fn fetch_backing(space: &Arc<Self>, offset: usize) -> Result<PhysicalRange> {
        let aligned = round_down(offset, PAGE_SIZE);
        let misalign = offset - aligned;
        loop {
            {
                let mut g = space.inner.lock();
                if offset >= g.length {
                    return Err(Error::Fault);
                }
                let page = Self::page_or_create(space, &mut g, aligned);
                let st = unsafe { page.state() };
                if let Some(pa) = st.physical {
                    return Ok(PhysicalRange {
                        addr: pa + misalign,
                        len: PAGE_SIZE - misalign,
                        caching: CachingMode::WriteBack,
                    });
                }
            }
            let pa =
                allocate_frames(&space.allocator, &space.reclaim, 64, PAGE_SIZE, PAGE_SIZE).await?;
            let mut g = space.inner.lock();
            if offset >= g.length {
                drop(g);
                space.allocator.free(pa, PAGE_SIZE);
                return Err(Error::Fault);
            }
            let page = Self::page_or_create(space, &mut g, aligned);
            let st = unsafe { page.state() };
            if st.physical.is_none() {
                st.physical = Some(pa);
                // The space holds one reference for as long as the page is
                // resident; eviction drops it and the retire hook frees.
                page.cache.retain();
            } else {
                drop(g);
                space.allocator.free(pa, PAGE_SIZE);
            }
        }
    }

    fn next_request(g: &mut SpaceInner) -> Option<ManageEvent> {
        while let Some(cache) = g.init_list.pop_front() {
            let off = cache.identity as usize;
            if let Some(page) = g.pages.find(&off).clone_pointer() {
                let st = unsafe { page.state() };
                if st.load == LoadState::WantInitialization {
                    st.load = LoadState::Initialization;
                    return Some(ManageEvent {
                        kind: ManageRequest::Initialize,
                        offset: off,
                        size: PAGE_SIZE,
                    });
                }
            }
        }
        while let Some(cache) = g.writeback_list.pop_front() {
            let off = cache.identity as usize;
            if let Some(page) = g.pages.find(&off).clone_pointer() {
                let st = unsafe { page.state() };
                if st.load == LoadState::WantWriteback {
                    st.load = LoadState::Writeback;
                    return Some(ManageEvent {
                        kind: ManageRequest::Writeback,
                        offset: off,
                        size: PAGE_SIZE,
                    });
                }
            }
        }
        None
    }

    /// Hand one queued unit of pager work out, initialization first.
    async fn submit_management(&self) -> Result<ManageEvent> {
        loop {
            let listener;
            {
                let mut g = self.inner.lock();
                if let Some(event) = Self::next_request(&mut g) {
                    return Ok(event);
                }
                listener = self.management_event.listen();
            }
            listener.await;
        }
    }

    async fn initiate_load(
        space: &Arc<Self>,
        kind: ManageRequest,
        offset: usize,
        size: usize,
    ) -> Result<()> {
        let end = offset.checked_add(size).ok_or(Error::Fault)?;
        loop {
            let listener;
            let mut notify = false;
            {
                let mut g = space.inner.lock();
                if end > g.length {
                    return Err(Error::Fault);
                }
                let mut pending = false;
                for off in each_page(offset, size) {
                    match kind {
                        ManageRequest::Initialize => {
                            let page = Self::page_or_create(space, &mut g, off);
                            let st = unsafe { page.state() };
                            match st.load {
                                LoadState::Missing => {
                                    st.load = LoadState::WantInitialization;
                                    g.init_list.push_back(page.cache.clone());
                                    notify = true;
                                    pending = true;
                                }
                                LoadState::WantInitialization
                                | LoadState::Initialization
                                | LoadState::Evicting => pending = true,
                                _ => {}
                            }
                        }
                        ManageRequest::Writeback => {
                            // A clean or missing page has nothing to write
                            // back; a dirty one subsumes the outstanding
                            // writeback notification.
                            if let Some(page) = g.pages.find(&off).clone_pointer() {
                                let st = unsafe { page.state() };
                                if matches!(
                                    st.load,
                                    LoadState::WantWriteback
                                        | LoadState::Writeback
                                        | LoadState::AnotherWriteback
                                ) {
                                    pending = true;
                                }
                            }
                        }
                    }
                }
                if !pending {
                    return Ok(());
                }
                listener = space.monitor_event.listen();
            }
            if notify {
                space.management_event.notify_all();
            }
            listener.await;
        }
    }

    /// Pager completion over `[offset, offset + size)`.
    ///
    /// Pages the pager had no business updating fault; valid pages in the
    /// range are still processed, so a buggy pager cannot poison the space.
    fn update_pages(
        space: &Arc<Self>,
        kind: ManageRequest,
        offset: usize,
        size: usize,
    ) -> Result<()> {
        if offset % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return Err(Error::Fault);
        }
        let end = offset.checked_add(size).ok_or(Error::Fault)?;
        let mut result = Ok(());
        let mut progressed = false;
        let mut notify_management = false;
        {
            let mut g = space.inner.lock();
            if end > g.length {
                return Err(Error::Fault);
            }
            for off in each_page(offset, size) {
                match kind {
                    ManageRequest::Initialize => {
                        let page = Self::page_or_create(space, &mut g, off);
                        let st = unsafe { page.state() };
                        match st.load {
                            LoadState::Missing
                            | LoadState::WantInitialization
                            | LoadState::Initialization => {
                                if st.load == LoadState::WantInitialization {
                                    Self::unlink_from(&mut g.init_list, &page.cache);
                                }
                                if st.physical.is_none() {
                                    // The pager never wrote the page; back
                                    // it with zeroes.
                                    match space.allocator.allocate(64, PAGE_SIZE, PAGE_SIZE) {
                                        Some(pa) => {
                                            st.physical = Some(pa);
                                            page.cache.retain();
                                        }
                                        None => {
                                            st.load = LoadState::WantInitialization;
                                            g.init_list.push_back(page.cache.clone());
                                            notify_management = true;
                                            result = Err(Error::OutOfMemory);
                                            continue;
                                        }
                                    }
                                }
                                st.load = LoadState::Present;
                                progressed = true;
                                if st.lock_count == 0 {
                                    space.reclaim.cache(&page.cache);
                                }
                            }
                            // Initializing twice is benign.
                            LoadState::Present => {}
                            _ => result = Err(Error::Fault),
                        }
                    }
                    ManageRequest::Writeback => {
                        let page = match g.pages.find(&off).clone_pointer() {
                            Some(page) => page,
                            None => {
                                result = Err(Error::Fault);
                                continue;
                            }
                        };
                        let st = unsafe { page.state() };
                        match st.load {
                            LoadState::Writeback => {
                                st.load = LoadState::Present;
                                progressed = true;
                                if st.lock_count == 0 {
                                    space.reclaim.cache(&page.cache);
                                }
                            }
                            LoadState::AnotherWriteback => {
                                st.load = LoadState::WantWriteback;
                                g.writeback_list.push_back(page.cache.clone());
                                notify_management = true;
                                progressed = true;
                            }
                            _ => result = Err(Error::Fault),
                        }
                    }
                }
            }
        }
        if progressed {
            space.monitor_event.notify_all();
        }
        if notify_management {
            space.management_event.notify_all();
        }
        result
    }

    async fn resize_space(&self, new_len: usize) -> Result<()> {
        if new_len % PAGE_SIZE != 0 {
            return Err(Error::Fault);
        }
        let (old_len, removed) = {
            let mut g = self.inner.lock();
            let old_len = g.length;
            if new_len >= old_len {
                g.length = new_len;
                return Ok(());
            }
            g.length = new_len;

            // Count the doomed rows, then detach them.
            let mut count = 0;
            let mut cur = g.pages.lower_bound(Bound::Included(&new_len));
            while cur.get().is_some() {
                count += 1;
                cur.move_next();
            }
            let mut removed = Vec::new();
            removed.try_reserve(count)?;
            while let Some(page) = g.pages.lower_bound(Bound::Included(&new_len)).clone_pointer()
            {
                let _ = g.pages.find_mut(&page.offset).remove();
                if page.cache.reclaim_state() == RECLAIM_CACHED {
                    self.reclaim.uncache(&page.cache);
                } else if page.cache.link.is_linked() {
                    let st = unsafe { page.state() };
                    let list = match st.load {
                        LoadState::WantInitialization => &mut g.init_list,
                        _ => &mut g.writeback_list,
                    };
                    Self::unlink_from(list, &page.cache);
                }
                removed.push(page);
            }
            (old_len, removed)
        };
        // No new fetch can reach the detached rows; every observer must
        // acknowledge the removal before the memory is released.
        self.evict_queue
            .evict_range(new_len, old_len - new_len)
            .await;
        for page in &removed {
            // Detached rows are exclusively ours.
            let st = unsafe { page.state() };
            if let Some(pa) = st.physical.take() {
                self.allocator.free(pa, PAGE_SIZE);
            }
            page.cache.set_reclaim_state(0);
        }
        self.monitor_event.notify_all();
        Ok(())
    }

    fn space_length(&self) -> usize {
        self.inner.lock().length
    }
}

#[async_trait]
impl PageBundle for ManagedSpace {
    async fn uncache_page(&self, page: &CachePage) -> Result<bool> {
        let offset = page.identity as usize;
        {
            let g = self.inner.lock();
            let row = match g.pages.find(&offset).clone_pointer() {
                Some(row) => row,
                None => return Ok(false),
            };
            debug_assert!(core::ptr::eq(Arc::as_ptr(&row.cache), page));
            let st = unsafe { row.state() };
            // Locked pages never enter eviction, and only clean present
            // pages may lose their backing.
            if st.load != LoadState::Present || st.lock_count > 0 || st.physical.is_none() {
                return Ok(false);
            }
            st.load = LoadState::Evicting;
        }
        self.evict_queue.evict_range(offset, PAGE_SIZE).await;
        // Every observer has unmapped the range; dropping the residency
        // reference lets the retire hook free the page.
        page.release();
        Ok(true)
    }

    fn retire_page(&self, page: &CachePage) {
        let offset = page.identity as usize;
        let pa = {
            let g = self.inner.lock();
            let row = match g.pages.find(&offset).clone_pointer() {
                Some(row) => row,
                None => return,
            };
            let st = unsafe { row.state() };
            debug_assert_eq!(st.load, LoadState::Evicting);
            st.load = LoadState::Missing;
            st.physical.take()
        };
        page.set_reclaim_state(0);
        if let Some(pa) = pa {
            self.allocator.free(pa, PAGE_SIZE);
        }
        // Fetchers that were waiting out the eviction restart the
        // initialization protocol.
        self.monitor_event.notify_all();
    }
}

impl Drop for ManagedSpace {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        while inner.init_list.pop_front().is_some() {}
        while inner.writeback_list.pop_front().is_some() {}
        let mut cur = inner.pages.front_mut();
        while let Some(page) = cur.remove() {
            if page.cache.reclaim_state() != 0 {
                self.reclaim.uncache(&page.cache);
            }
            let st = unsafe { page.state() };
            if let Some(pa) = st.physical.take() {
                self.allocator.free(pa, PAGE_SIZE);
            }
        }
    }
}

/// Consumer-facing half of a [`ManagedSpace`].
pub struct FrontalMemory {
    managed: Arc<ManagedSpace>,
}

impl FrontalMemory {
    /// Create the frontal view of `managed`.
    pub fn new(managed: Arc<ManagedSpace>) -> Self {
        Self { managed }
    }
}

#[async_trait]
impl MemoryView for FrontalMemory {
    fn length(&self) -> usize {
        self.managed.space_length()
    }

    fn address_identity(&self, offset: usize) -> Result<AddressIdentity> {
        if offset >= self.managed.space_length() {
            return Err(Error::Fault);
        }
        // Both halves resolve to the shared space, so futexes on either
        // view of the same byte meet in the same bucket.
        Ok(AddressIdentity {
            object: Arc::as_ptr(&self.managed) as usize,
            offset,
        })
    }

    fn lock_range(&self, offset: usize, size: usize) -> Result<()> {
        ManagedSpace::lock_pages(&self.managed, offset, size)
    }

    fn unlock_range(&self, offset: usize, size: usize) {
        self.managed.unlock_pages(offset, size);
    }

    fn peek_range(&self, offset: usize) -> Option<(PhysicalAddr, CachingMode)> {
        self.managed.peek_page(offset)
    }

    async fn fetch_range(&self, offset: usize) -> Result<PhysicalRange> {
        ManagedSpace::fetch_frontal(&self.managed, offset).await
    }

    fn mark_dirty(&self, offset: usize, size: usize) {
        self.managed.mark_dirty_pages(offset, size);
    }

    async fn submit_initiate_load(
        &self,
        kind: ManageRequest,
        offset: usize,
        size: usize,
    ) -> Result<()> {
        ManagedSpace::initiate_load(&self.managed, kind, offset, size).await
    }

    fn eviction_queue(&self) -> Option<&EvictionQueue> {
        Some(&self.managed.evict_queue)
    }
}

/// Pager-facing half of a [`ManagedSpace`].
pub struct BackingMemory {
    managed: Arc<ManagedSpace>,
}

impl BackingMemory {
    /// Create the backing view of `managed`.
    pub fn new(managed: Arc<ManagedSpace>) -> Self {
        Self { managed }
    }
}

#[async_trait]
impl MemoryView for BackingMemory {
    fn length(&self) -> usize {
        self.managed.space_length()
    }

    fn address_identity(&self, offset: usize) -> Result<AddressIdentity> {
        if offset >= self.managed.space_length() {
            return Err(Error::Fault);
        }
        Ok(AddressIdentity {
            object: Arc::as_ptr(&self.managed) as usize,
            offset,
        })
    }

    fn lock_range(&self, offset: usize, size: usize) -> Result<()> {
        ManagedSpace::lock_pages(&self.managed, offset, size)
    }

    fn unlock_range(&self, offset: usize, size: usize) {
        self.managed.unlock_pages(offset, size);
    }

    fn peek_range(&self, offset: usize) -> Option<(PhysicalAddr, CachingMode)> {
        self.managed.peek_page(offset)
    }

    async fn fetch_range(&self, offset: usize) -> Result<PhysicalRange> {
        ManagedSpace::fetch_backing(&self.managed, offset).await
    }

    /// The pager writes through this view while servicing requests; its
    /// stores are not user dirtying and do not queue writebacks.
    fn mark_dirty(&self, _offset: usize, _size: usize) {}

    async fn resize(&self, new_len: usize) -> Result<()> {
        self.managed.resize_space(new_len).await
    }

    async fn submit_manage(&self) -> Result<ManageEvent> {
        self.managed.submit_management().await
    }

    fn update_range(&self, kind: ManageRequest, offset: usize, size: usize) -> Result<()> {
        ManagedSpace::update_pages(&self.managed, kind, offset, size)
    }

    fn eviction_queue(&self) -> Option<&EvictionQueue> {
        Some(&self.managed.evict_queue)
    }
}
