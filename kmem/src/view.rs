//! The memory view contract.
//!
//! Every concrete view exposes the same verb set; variants differ only in
//! how physical backing is produced. Verbs that may suspend are `async`;
//! everything else must return without blocking.

use alloc::boxed::Box;
use alloc::sync::Arc;

use async_trait::async_trait;
use kalloc::PhysicalAddr;

use crate::error::{Error, Result};
use crate::evict::{EvictionQueue, MemoryObserver};

/// Caching mode of a physical range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachingMode {
    /// Ordinary cached memory.
    WriteBack,
    /// Write-combining, for framebuffers and the like.
    WriteCombining,
    /// Writes go straight to memory, reads are cached.
    WriteThrough,
    /// No caching at all, for device registers.
    Uncached,
}

/// Resolved physical backing of an offset within a view.
#[derive(Debug, Clone, Copy)]
pub struct PhysicalRange {
    /// Physical address of the requested byte.
    pub addr: PhysicalAddr,
    /// Contiguous bytes available from `addr` before the caller must fetch
    /// again (the residue of the backing page or chunk).
    pub len: usize,
    /// Caching mode the range must be mapped with.
    pub caching: CachingMode,
}

/// Kind of work exchanged with a pager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManageRequest {
    /// Fill a range with its initial contents.
    Initialize,
    /// Write a dirty range back.
    Writeback,
}

/// One unit of pager work yielded by [`MemoryView::submit_manage`].
#[derive(Debug, Clone, Copy)]
pub struct ManageEvent {
    /// What the pager is asked to do.
    pub kind: ManageRequest,
    /// Page-aligned byte offset of the range.
    pub offset: usize,
    /// Length of the range in bytes.
    pub size: usize,
}

/// Stable identity of one byte of memory.
///
/// The futex subsystem hashes sleepers by this key. Within one view,
/// distinct offsets yield distinct identities; equal identities always name
/// the same byte for as long as both views exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressIdentity {
    /// Address of the object owning the byte.
    pub object: usize,
    /// Byte offset within that object.
    pub offset: usize,
}

/// A window of another view: `(view, offset into view, length)`.
#[derive(Clone)]
pub struct MemorySlice {
    view: Arc<dyn MemoryView>,
    offset: usize,
    len: usize,
}

impl MemorySlice {
    /// Create a slice over `[offset, offset + len)` of `view`.
    ///
    /// Fails with [`Error::Fault`] if the window exceeds the view.
    pub fn new(view: Arc<dyn MemoryView>, offset: usize, len: usize) -> Result<Self> {
        let end = offset.checked_add(len).ok_or(Error::Fault)?;
        if end > view.length() {
            return Err(Error::Fault);
        }
        Ok(Self { view, offset, len })
    }

    /// The underlying view.
    pub fn view(&self) -> &Arc<dyn MemoryView> {
        &self.view
    }

    /// Byte offset of the window within the view.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the window in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// View on some pages of memory.
///
/// Range locks pin resident pages against eviction but do not force pages
/// to become resident; that is what [`fetch_range`](Self::fetch_range) is
/// for. While a lock is held, the results of
/// [`peek_range`](Self::peek_range) and `fetch_range` stay consistent.
#[async_trait]
pub trait MemoryView: Send + Sync {
    /// Byte length of the view. Constant except across a successful
    /// [`resize`](Self::resize).
    fn length(&self) -> usize;

    /// Returns a unique identity for each memory address.
    /// This is used as a key to access futexes.
    fn address_identity(&self, offset: usize) -> Result<AddressIdentity>;

    /// Acquire a lock on a memory range without suspending.
    ///
    /// Locks nest: each page covered by the range carries a counter, and
    /// locks and unlocks accumulate per page rather than pairing up.
    fn lock_range(&self, offset: usize, size: usize) -> Result<()>;

    /// Acquire a lock on a memory range, suspending where the variant must
    /// wait (e.g. for a copy-up in flight). Defaults to
    /// [`lock_range`](Self::lock_range).
    async fn async_lock_range(&self, offset: usize, size: usize) -> Result<()> {
        self.lock_range(offset, size)
    }

    /// Release a lock previously acquired over the same range.
    fn unlock_range(&self, offset: usize, size: usize);

    /// Optimistically returns the physical memory that backs an offset, or
    /// [`None`] if it is not resident. Never suspends. The caller must hold
    /// a range lock covering the page for the answer to remain valid.
    fn peek_range(&self, offset: usize) -> Option<(PhysicalAddr, CachingMode)>;

    /// Returns the physical memory that backs an offset, making it resident
    /// first if necessary. The result stays valid until an eviction that the
    /// caller's observer has acknowledged.
    async fn fetch_range(&self, offset: usize) -> Result<PhysicalRange>;

    /// Marks every page overlapping the range as dirty. Idempotent.
    fn mark_dirty(&self, offset: usize, size: usize);

    /// Grow or shrink the view. Only anonymous and backing views support
    /// this; shrinking evicts the removed pages before freeing them.
    async fn resize(&self, _new_len: usize) -> Result<()> {
        Err(Error::IllegalObject)
    }

    /// Produce a sibling view observing the current contents as of this
    /// call, even if this view is subsequently written.
    async fn fork(&self) -> Result<Arc<dyn MemoryView>> {
        Err(Error::IllegalObject)
    }

    /// Pager side: wait for the next unit of pager work.
    async fn submit_manage(&self) -> Result<ManageEvent> {
        Err(Error::IllegalObject)
    }

    /// User side: request pager work over a range and wait until the range
    /// reaches the requested state.
    async fn submit_initiate_load(
        &self,
        _kind: ManageRequest,
        _offset: usize,
        _size: usize,
    ) -> Result<()> {
        Err(Error::IllegalObject)
    }

    /// Pager side: report completion of pager work over a range.
    fn update_range(&self, _kind: ManageRequest, _offset: usize, _size: usize) -> Result<()> {
        Err(Error::IllegalObject)
    }

    /// Bind `slot` of an indirection table to a window of another view.
    fn set_indirection(
        &self,
        _slot: usize,
        _view: Arc<dyn MemoryView>,
        _offset: usize,
        _size: usize,
    ) -> Result<()> {
        Err(Error::IllegalObject)
    }

    /// The eviction queue of this view, if it can evict memory.
    fn eviction_queue(&self) -> Option<&EvictionQueue> {
        None
    }

    /// Whether this view can evict memory.
    fn can_evict_memory(&self) -> bool {
        self.eviction_queue().is_some()
    }

    /// Attach a memory observer. It will be notified of page evictions.
    fn add_observer(&self, observer: &MemoryObserver) {
        if let Some(q) = self.eviction_queue() {
            q.add_observer(observer);
        }
    }

    /// Detach a memory observer, acknowledging anything it still owes.
    fn remove_observer(&self, observer: &MemoryObserver) {
        if let Some(q) = self.eviction_queue() {
            q.remove_observer(observer);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::prelude::v1::*;

    use super::*;
    use crate::anon::AllocatedMemory;
    use crate::page::ReclaimEngine;
    use kalloc::HeapFrames;
    use std::collections::HashMap;

    #[test]
    fn identities_hash_like_futex_keys() {
        let frames: Arc<dyn kalloc::FrameAllocator> = Arc::new(HeapFrames::new());
        let reclaim = Arc::new(ReclaimEngine::new());
        let a = AllocatedMemory::new(4 * crate::PAGE_SIZE, frames.clone(), reclaim.clone());
        let b = AllocatedMemory::new(4 * crate::PAGE_SIZE, frames, reclaim);

        // Simulate the futex table: sleepers bucketed by identity.
        let mut table: HashMap<AddressIdentity, usize> = HashMap::new();
        table.insert(a.address_identity(16).unwrap(), 1);
        table.insert(a.address_identity(24).unwrap(), 2);
        table.insert(b.address_identity(16).unwrap(), 3);
        assert_eq!(table.len(), 3);

        // Identities are stable and injective per view.
        assert_eq!(table[&a.address_identity(16).unwrap()], 1);
        assert_ne!(
            a.address_identity(16).unwrap(),
            a.address_identity(17).unwrap()
        );

        // Out-of-range offsets carry no identity.
        assert_eq!(a.address_identity(4 * crate::PAGE_SIZE), Err(Error::Fault));
    }
}
