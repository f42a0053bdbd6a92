//! Fixed physical windows without paging.

use alloc::boxed::Box;
use core::cmp::min;

use async_trait::async_trait;
use kalloc::PhysicalAddr;

use crate::error::{Error, Result};
use crate::utils::round_down;
use crate::view::{AddressIdentity, CachingMode, MemoryView, PhysicalRange};
use crate::PAGE_SIZE;

/// A view over a fixed physical range, e.g. a device BAR.
///
/// Backing never changes: peek and fetch always answer identically, locks
/// and dirtying are no-ops, and the view is not evictable.
pub struct HardwareMemory {
    base: PhysicalAddr,
    length: usize,
    mode: CachingMode,
}

impl HardwareMemory {
    /// Create a view over `[base, base + length)` mapped with `mode`.
    pub fn new(base: PhysicalAddr, length: usize, mode: CachingMode) -> Self {
        debug_assert_eq!(base % PAGE_SIZE, 0);
        debug_assert_eq!(length % PAGE_SIZE, 0);
        Self { base, length, mode }
    }

    fn check(&self, offset: usize, size: usize) -> Result<()> {
        let end = offset.checked_add(size).ok_or(Error::Fault)?;
        if end > self.length {
            return Err(Error::Fault);
        }
        Ok(())
    }
}

#[async_trait]
impl MemoryView for HardwareMemory {
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
        // Hardware ranges cannot be evicted; locking only validates.
        self.check(offset, size)
    }

    fn unlock_range(&self, _offset: usize, _size: usize) {}

    fn peek_range(&self, offset: usize) -> Option<(PhysicalAddr, CachingMode)> {
        if offset >= self.length {
            return None;
        }
        Some((self.base + offset, self.mode))
    }

    async fn fetch_range(&self, offset: usize) -> Result<PhysicalRange> {
        self.check(offset, 1)?;
        let residue = PAGE_SIZE - (offset - round_down(offset, PAGE_SIZE));
        Ok(PhysicalRange {
            addr: self.base + offset,
            len: min(residue, self.length - offset),
            caching: self.mode,
        })
    }

    fn mark_dirty(&self, _offset: usize, _size: usize) {}
}
