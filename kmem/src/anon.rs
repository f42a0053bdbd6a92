//! Anonymous chunk-allocated memory.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::min;

use async_trait::async_trait;
use kalloc::wrapper::vec_push;
use kalloc::{FrameAllocator, PhysicalAddr};
use ksched::sync::Spinlock;

use crate::error::{Error, Result};
use crate::evict::EvictionQueue;
use crate::page::{allocate_frames, ReclaimEngine};
use crate::view::{AddressIdentity, CachingMode, MemoryView, PhysicalRange};
use crate::PAGE_SIZE;

struct AllocatedInner {
    /// One entry per chunk; [`None`] until the chunk is first fetched.
    chunks: Vec<Option<PhysicalAddr>>,
    length: usize,
}

/// Anonymous memory, allocated chunk by chunk on first touch.
///
/// Chunks are an integer multiple of the page size, with caller-chosen
/// alignment and address-bit ceiling so the memory can be handed to
/// constrained DMA engines. Pages materialize zeroed on fetch and stay
/// resident until the view shrinks or is dropped.
pub struct AllocatedMemory {
    inner: Spinlock<AllocatedInner>,
    evict_queue: EvictionQueue,
    allocator: Arc<dyn FrameAllocator>,
    reclaim: Arc<ReclaimEngine>,
    address_bits: u32,
    chunk_size: usize,
    chunk_align: usize,
}

impl AllocatedMemory {
    /// Create a view of `length` bytes with page-sized chunks and no
    /// address-bit constraint.
    pub fn new(
        length: usize,
        allocator: Arc<dyn FrameAllocator>,
        reclaim: Arc<ReclaimEngine>,
    ) -> Self {
        Self::with_chunks(length, 64, PAGE_SIZE, PAGE_SIZE, allocator, reclaim)
    }

    /// Create a view of `length` bytes carved into chunks of `chunk_size`
    /// bytes aligned to `chunk_align`, with physical addresses constrained
    /// to `address_bits` bits.
    pub fn with_chunks(
        length: usize,
        address_bits: u32,
        chunk_size: usize,
        chunk_align: usize,
        allocator: Arc<dyn FrameAllocator>,
        reclaim: Arc<ReclaimEngine>,
    ) -> Self {
        debug_assert!(chunk_size >= PAGE_SIZE && chunk_size % PAGE_SIZE == 0);
        debug_assert!(chunk_align.is_power_of_two());
        let nchunks = (length + chunk_size - 1) / chunk_size;
        let mut chunks = Vec::new();
        chunks.resize(nchunks, None);
        Self {
            inner: Spinlock::new(AllocatedInner { chunks, length }),
            evict_queue: EvictionQueue::new(),
            allocator,
            reclaim,
            address_bits,
            chunk_size,
            chunk_align,
        }
    }

    fn check(&self, offset: usize, size: usize) -> Result<()> {
        let end = offset.checked_add(size).ok_or(Error::Fault)?;
        if end > self.inner.lock().length {
            return Err(Error::Fault);
        }
        Ok(())
    }
}

impl Drop for AllocatedMemory {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for chunk in inner.chunks.drain(..).flatten() {
            self.allocator.free(chunk, self.chunk_size);
        }
    }
}

#[async_trait]
impl MemoryView for AllocatedMemory {
    fn length(&self) -> usize {
        self.inner.lock().length
    }

    fn address_identity(&self, offset: usize) -> Result<AddressIdentity> {
        self.check(offset, 1)?;
        Ok(AddressIdentity {
            object: self as *const Self as usize,
            offset,
        })
    }

    fn lock_range(&self, offset: usize, size: usize) -> Result<()> {
        // Anonymous chunks are only released by resize or drop, so locking
        // only validates the range.
        self.check(offset, size)
    }

    fn unlock_range(&self, _offset: usize, _size: usize) {}

    fn peek_range(&self, offset: usize) -> Option<(PhysicalAddr, CachingMode)> {
        let g = self.inner.lock();
        if offset >= g.length {
            return None;
        }
        let chunk = g.chunks[offset / self.chunk_size]?;
        Some((chunk + offset % self.chunk_size, CachingMode::WriteBack))
    }

    async fn fetch_range(&self, offset: usize) -> Result<PhysicalRange> {
        loop {
            {
                let g = self.inner.lock();
                if offset >= g.length {
                    return Err(Error::Fault);
                }
                if let Some(chunk) = g.chunks[offset / self.chunk_size] {
                    let in_chunk = offset % self.chunk_size;
                    return Ok(PhysicalRange {
                        addr: chunk + in_chunk,
                        len: min(self.chunk_size - in_chunk, g.length - offset),
                        caching: CachingMode::WriteBack,
                    });
                }
            }
            let pa = allocate_frames(
                &self.allocator,
                &self.reclaim,
                self.address_bits,
                self.chunk_size,
                self.chunk_align,
            )
            .await?;
            let mut g = self.inner.lock();
            let idx = offset / self.chunk_size;
            if idx < g.chunks.len() && g.chunks[idx].is_none() {
                g.chunks[idx] = Some(pa);
            } else {
                // Lost a race against another fetch or a shrink.
                drop(g);
                self.allocator.free(pa, self.chunk_size);
            }
        }
    }

    fn mark_dirty(&self, _offset: usize, _size: usize) {}

    async fn resize(&self, new_len: usize) -> Result<()> {
        let (old_len, removed) = {
            let mut g = self.inner.lock();
            let old_len = g.length;
            let nchunks = (new_len + self.chunk_size - 1) / self.chunk_size;
            if new_len >= old_len {
                while g.chunks.len() < nchunks {
                    vec_push(&mut g.chunks, None)?;
                }
                g.length = new_len;
                return Ok(());
            }
            let removed: Vec<PhysicalAddr> = g.chunks.drain(nchunks..).flatten().collect();
            g.length = new_len;
            (old_len, removed)
        };
        // The table no longer hands the pages out; every observer must
        // acknowledge the removal before the memory is reused.
        self.evict_queue.evict_range(new_len, old_len - new_len).await;
        for chunk in removed {
            self.allocator.free(chunk, self.chunk_size);
        }
        Ok(())
    }

    fn eviction_queue(&self) -> Option<&EvictionQueue> {
        Some(&self.evict_queue)
    }
}
