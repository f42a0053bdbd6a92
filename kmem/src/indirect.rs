//! Slot-table indirection over other views.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use async_trait::async_trait;
use kalloc::PhysicalAddr;
use ksched::cancel::{CancelSource, CancelToken};
use ksched::sync::Spinlock;
use ksched::task;

use crate::error::{Error, Result};
use crate::evict::{EvictionQueue, MemoryObserver};
use crate::view::{AddressIdentity, CachingMode, MemorySlice, MemoryView, PhysicalRange};
use crate::PAGE_SIZE;

struct IndirectionSlot {
    slice: MemorySlice,
    /// Cancels the eviction forwarder of this binding.
    cancel: CancelSource,
}

/// A fixed-size table of slots, each forwarding a range of this view to a
/// window of a child view.
///
/// Rebinding a slot detaches the old child's observer (acknowledging
/// anything it still owed) and attaches a fresh one. Accesses that land in
/// an unbound slot fault without blocking.
pub struct IndirectMemory {
    slots: Spinlock<Vec<Option<IndirectionSlot>>>,
    slot_size: usize,
    evict_queue: Arc<EvictionQueue>,
}

impl IndirectMemory {
    /// Create a table of `num_slots` slots, each spanning `slot_size` bytes
    /// of this view's offset space.
    pub fn new(num_slots: usize, slot_size: usize) -> Self {
        debug_assert_eq!(slot_size % PAGE_SIZE, 0);
        let mut slots = Vec::new();
        slots.resize_with(num_slots, || None);
        Self {
            slots: Spinlock::new(slots),
            slot_size,
            evict_queue: Arc::new(EvictionQueue::new()),
        }
    }

    /// Resolve `offset` to the bound child and the offset inside it.
    fn resolve(&self, offset: usize) -> Result<(Arc<dyn MemoryView>, usize, usize)> {
        let g = self.slots.lock();
        let slot = offset / self.slot_size;
        if slot >= g.len() {
            return Err(Error::Fault);
        }
        let in_slot = offset % self.slot_size;
        match &g[slot] {
            Some(bound) if in_slot < bound.slice.len() => Ok((
                bound.slice.view().clone(),
                bound.slice.offset() + in_slot,
                bound.slice.len() - in_slot,
            )),
            _ => Err(Error::Fault),
        }
    }

    /// Split `[offset, offset + size)` into per-slot subranges.
    fn for_each_subrange(
        &self,
        offset: usize,
        size: usize,
        mut f: impl FnMut(Arc<dyn MemoryView>, usize, usize) -> Result<()>,
    ) -> Result<()> {
        let mut progress = 0;
        while progress < size {
            let (view, child_offset, residue) = self.resolve(offset + progress)?;
            let chunk = residue.min(size - progress);
            f(view, child_offset, chunk)?;
            progress += chunk;
        }
        Ok(())
    }

    /// Spawn the task that re-posts child evictions, translated into this
    /// view's offset space, and acknowledges the child once local observers
    /// have acknowledged in turn. The observer is already attached, so no
    /// eviction can slip past before the task first runs.
    fn spawn_forwarder(
        &self,
        observer: MemoryObserver,
        child: Arc<dyn MemoryView>,
        slot_base: usize,
        child_offset: usize,
        size: usize,
        token: CancelToken,
    ) -> Result<()> {
        if !child.can_evict_memory() {
            return Ok(());
        }
        let queue = self.evict_queue.clone();
        task::spawn(async move {
            loop {
                let eviction = match observer.poll_eviction(&token).await {
                    Some(eviction) => eviction,
                    None => break,
                };
                let lo = eviction.offset().max(child_offset);
                let hi = (eviction.offset() + eviction.size()).min(child_offset + size);
                if lo < hi {
                    queue
                        .evict_range(slot_base + (lo - child_offset), hi - lo)
                        .await;
                }
                eviction.done();
            }
            child.remove_observer(&observer);
        })
        .map_err(|_| Error::OutOfMemory)
    }
}

#[async_trait]
impl MemoryView for IndirectMemory {
    fn length(&self) -> usize {
        self.slots.lock().len() * self.slot_size
    }

    fn address_identity(&self, offset: usize) -> Result<AddressIdentity> {
        // Identities forward to the bound child, so a futex on the
        // indirection and one on the child meet in the same bucket.
        let (view, child_offset, _) = self.resolve(offset)?;
        view.address_identity(child_offset)
    }

    fn lock_range(&self, offset: usize, size: usize) -> Result<()> {
        let mut locked: Vec<(Arc<dyn MemoryView>, usize, usize)> = Vec::new();
        let result = self.for_each_subrange(offset, size, |view, child_offset, chunk| {
            view.lock_range(child_offset, chunk)?;
            locked.push((view, child_offset, chunk));
            Ok(())
        });
        if result.is_err() {
            // Back out in reverse so a partial lock never leaks.
            for (view, child_offset, chunk) in locked.into_iter().rev() {
                view.unlock_range(child_offset, chunk);
            }
        }
        result
    }

    fn unlock_range(&self, offset: usize, size: usize) {
        let _ = self.for_each_subrange(offset, size, |view, child_offset, chunk| {
            view.unlock_range(child_offset, chunk);
            Ok(())
        });
    }

    fn peek_range(&self, offset: usize) -> Option<(PhysicalAddr, CachingMode)> {
        let (view, child_offset, _) = self.resolve(offset).ok()?;
        view.peek_range(child_offset)
    }

    async fn fetch_range(&self, offset: usize) -> Result<PhysicalRange> {
        let (view, child_offset, residue) = self.resolve(offset)?;
        let mut range = view.fetch_range(child_offset).await?;
        range.len = range.len.min(residue);
        Ok(range)
    }

    fn mark_dirty(&self, offset: usize, size: usize) {
        let _ = self.for_each_subrange(offset, size, |view, child_offset, chunk| {
            view.mark_dirty(child_offset, chunk);
            Ok(())
        });
    }

    fn set_indirection(
        &self,
        slot: usize,
        view: Arc<dyn MemoryView>,
        offset: usize,
        size: usize,
    ) -> Result<()> {
        if size > self.slot_size {
            return Err(Error::Fault);
        }
        let slice = MemorySlice::new(view.clone(), offset, size)?;
        let cancel = CancelSource::new();
        let token = cancel.token();
        let observer = MemoryObserver::new();
        view.add_observer(&observer);
        let previous = {
            let mut g = self.slots.lock();
            if slot >= g.len() {
                view.remove_observer(&observer);
                return Err(Error::Fault);
            }
            g[slot].replace(IndirectionSlot { slice, cancel })
        };
        // Dropping the old binding cancels its forwarder, which detaches
        // the old observer and acknowledges anything still pending.
        drop(previous);
        let result = self.spawn_forwarder(observer, view, slot * self.slot_size, offset, size, token);
        if result.is_err() {
            self.slots.lock()[slot] = None;
        }
        result
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
    use crate::page::ReclaimEngine;
    use crate::transfer::{copy_from_view, copy_to_view};
    use kalloc::{FrameAllocator, HeapFrames};
    use ksched::task;

    fn anon(len: usize) -> (Arc<HeapFrames>, Arc<dyn MemoryView>) {
        let heap = Arc::new(HeapFrames::new());
        let alloc: Arc<dyn FrameAllocator> = heap.clone();
        let reclaim = Arc::new(ReclaimEngine::new());
        (heap, Arc::new(AllocatedMemory::new(len, alloc, reclaim)))
    }

    #[test]
    fn rebinding_switches_backing() {
        let (_heap_a, a) = anon(PAGE_SIZE);
        let (_heap_b, b) = anon(PAGE_SIZE);

        task::spawn(async move {
            let table = IndirectMemory::new(4, PAGE_SIZE);
            assert_eq!(table.length(), 4 * PAGE_SIZE);
            table.set_indirection(0, a.clone(), 0, PAGE_SIZE).unwrap();

            copy_to_view(&table, 0, b"into a").await.unwrap();

            // Rebind slot 0; reads now come from B, and the bytes written
            // into A are no longer reachable through the table.
            table.set_indirection(0, b.clone(), 0, PAGE_SIZE).unwrap();
            let mut seen = [0u8; 6];
            copy_from_view(&table, 0, &mut seen).await.unwrap();
            assert_eq!(&seen, b"\0\0\0\0\0\0");

            // A still holds the old bytes when addressed directly.
            let mut direct = [0u8; 6];
            copy_from_view(&*a, 0, &mut direct).await.unwrap();
            assert_eq!(&direct, b"into a");
            // The table is dropped here, cancelling its forwarders.
        })
        .unwrap();
        task::run_all();
    }

    #[test]
    fn unbound_slot_faults_without_blocking() {
        let (_heap, a) = anon(PAGE_SIZE);
        task::spawn(async move {
            let table = IndirectMemory::new(2, PAGE_SIZE);
            table.set_indirection(1, a, 0, PAGE_SIZE).unwrap();

            assert_eq!(table.fetch_range(0).await.unwrap_err(), Error::Fault);
            assert!(table.peek_range(0).is_none());
            assert_eq!(table.lock_range(0, PAGE_SIZE), Err(Error::Fault));
            assert_eq!(
                table.address_identity(PAGE_SIZE - 1).unwrap_err(),
                Error::Fault
            );

            // The bound slot works.
            assert!(table.fetch_range(PAGE_SIZE).await.is_ok());
            // Out-of-table offsets fault as well.
            assert_eq!(
                table.fetch_range(2 * PAGE_SIZE).await.unwrap_err(),
                Error::Fault
            );
        })
        .unwrap();
        task::run_all();
    }

    #[test]
    fn oversized_binding_is_rejected() {
        let (_heap, a) = anon(4 * PAGE_SIZE);
        let table = IndirectMemory::new(2, PAGE_SIZE);
        assert_eq!(
            table.set_indirection(0, a.clone(), 0, 2 * PAGE_SIZE),
            Err(Error::Fault)
        );
        assert_eq!(
            table.set_indirection(5, a, 0, PAGE_SIZE),
            Err(Error::Fault)
        );
    }

    #[test]
    fn child_evictions_are_translated() {
        let (_heap, a) = anon(4 * PAGE_SIZE);
        let table = Arc::new(IndirectMemory::new(4, PAGE_SIZE));
        // Slot 2 maps the child's second page.
        table
            .set_indirection(2, a.clone(), PAGE_SIZE, PAGE_SIZE)
            .unwrap();

        let observer = Arc::new(MemoryObserver::new());
        table.add_observer(&observer);

        let watcher_table = table.clone();
        task::spawn(async move {
            let token = CancelToken::never();
            let eviction = observer.poll_eviction(&token).await.unwrap();
            // The child shrank to one page; the overlap with the slot's
            // window lands at the slot's base.
            assert_eq!(
                (eviction.offset(), eviction.size()),
                (2 * PAGE_SIZE, PAGE_SIZE)
            );
            eviction.done();
            watcher_table.remove_observer(&observer);
        })
        .unwrap();

        task::spawn(async move {
            a.fetch_range(PAGE_SIZE).await.unwrap();
            a.resize(0).await.unwrap();
            // Dropping the table cancels the forwarder.
            drop(table);
        })
        .unwrap();
        task::run_all();
    }
}
