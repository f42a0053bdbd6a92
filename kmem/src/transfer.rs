//! Cross-view byte transfer helpers.
//!
//! All helpers follow the same shape: lock the ranges, loop fetching page
//! by page, copy through a transient window, dirty the destination, unlock
//! in reverse. The loop advances by the minimum of each side's in-page
//! residue, so straddling page and chunk boundaries needs no special
//! casing.

use kalloc::PageWindow;

use crate::error::{Error, Result};
use crate::utils::round_up;
use crate::view::MemoryView;
use crate::PAGE_SIZE;

async fn copy_in(view: &dyn MemoryView, offset: usize, bytes: &[u8]) -> Result<()> {
    let mut progress = 0;
    while progress < bytes.len() {
        let range = view.fetch_range(offset + progress).await?;
        let chunk = range.len.min(bytes.len() - progress);
        let window = PageWindow::map(range.addr, chunk);
        window
            .as_mut_slice()
            .copy_from_slice(&bytes[progress..progress + chunk]);
        progress += chunk;
    }
    Ok(())
}

/// Copy `bytes` into `view` at `offset`, marking the touched pages dirty.
pub async fn copy_to_view(view: &dyn MemoryView, offset: usize, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    view.async_lock_range(offset, bytes.len()).await?;
    let result = copy_in(view, offset, bytes).await;
    if result.is_ok() {
        let misalign = offset % PAGE_SIZE;
        view.mark_dirty(offset - misalign, round_up(bytes.len() + misalign, PAGE_SIZE));
    }
    view.unlock_range(offset, bytes.len());
    result
}

/// Copy bytes out of `view` at `offset` into `bytes`.
pub async fn copy_from_view(view: &dyn MemoryView, offset: usize, bytes: &mut [u8]) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    view.async_lock_range(offset, bytes.len()).await?;
    let result = async {
        let mut progress = 0;
        while progress < bytes.len() {
            let range = view.fetch_range(offset + progress).await?;
            let chunk = range.len.min(bytes.len() - progress);
            let window = PageWindow::map(range.addr, chunk);
            bytes[progress..progress + chunk].copy_from_slice(window.as_slice());
            progress += chunk;
        }
        Ok(())
    }
    .await;
    view.unlock_range(offset, bytes.len());
    result
}

/// Copy `length` bytes from `src` at `src_offset` to `dest` at
/// `dest_offset`, fetching both sides page by page.
pub async fn transfer_between_views(
    dest: &dyn MemoryView,
    dest_offset: usize,
    src: &dyn MemoryView,
    src_offset: usize,
    length: usize,
) -> Result<()> {
    if length == 0 {
        return Ok(());
    }
    let dest_end = dest_offset.checked_add(length).ok_or(Error::BufferTooSmall)?;
    if dest_end > dest.length() {
        return Err(Error::BufferTooSmall);
    }
    let src_end = src_offset.checked_add(length).ok_or(Error::Fault)?;
    if src_end > src.length() {
        return Err(Error::Fault);
    }

    dest.async_lock_range(dest_offset, length).await?;
    if let Err(err) = src.async_lock_range(src_offset, length).await {
        dest.unlock_range(dest_offset, length);
        return Err(err);
    }

    let result = async {
        let mut progress = 0;
        while progress < length {
            let to = dest.fetch_range(dest_offset + progress).await?;
            let from = src.fetch_range(src_offset + progress).await?;
            let chunk = to.len.min(from.len).min(length - progress);
            PageWindow::map(to.addr, chunk)
                .as_mut_slice()
                .copy_from_slice(PageWindow::map(from.addr, chunk).as_slice());
            progress += chunk;
        }
        Ok(())
    }
    .await;

    if result.is_ok() {
        let misalign = dest_offset % PAGE_SIZE;
        dest.mark_dirty(dest_offset - misalign, round_up(length + misalign, PAGE_SIZE));
    }
    src.unlock_range(src_offset, length);
    dest.unlock_range(dest_offset, length);
    result
}

#[cfg(test)]
mod tests {
    use std::prelude::v1::*;

    use super::*;
    use crate::anon::AllocatedMemory;
    use crate::page::ReclaimEngine;
    use crate::view::CachingMode;
    use alloc::sync::Arc;
    use kalloc::{FrameAllocator, HeapFrames};
    use ksched::task;
    use ktest::{rand_bytes, rand_int};

    fn anon(len: usize) -> Arc<AllocatedMemory> {
        let alloc: Arc<dyn FrameAllocator> = Arc::new(HeapFrames::new());
        let reclaim = Arc::new(ReclaimEngine::new());
        Arc::new(AllocatedMemory::new(len, alloc, reclaim))
    }

    #[test]
    fn anonymous_fetch_write_read() {
        let mem = anon(4 * PAGE_SIZE);
        task::spawn(async move {
            mem.lock_range(0, 4 * PAGE_SIZE).unwrap();
            let range = mem.fetch_range(0).await.unwrap();
            assert!(range.len >= PAGE_SIZE);
            assert_eq!(range.caching, CachingMode::WriteBack);

            // The write straddles the boundary between pages 1 and 2.
            copy_to_view(&*mem, 2 * PAGE_SIZE - 2, b"hello").await.unwrap();
            let mut seen = [0u8; 5];
            copy_from_view(&*mem, 2 * PAGE_SIZE - 2, &mut seen)
                .await
                .unwrap();
            assert_eq!(&seen, b"hello");
            mem.unlock_range(0, 4 * PAGE_SIZE);
        })
        .unwrap();
        task::run_all();
    }

    #[test]
    fn random_round_trips() {
        // Each task owns a disjoint strip; strips deliberately straddle
        // page boundaries.
        const STRIP: usize = PAGE_SIZE / 2;
        let mem = anon(8 * PAGE_SIZE);
        for i in 0..16 {
            let mem = mem.clone();
            task::spawn(async move {
                let len = rand_int(1..STRIP);
                let offset = i * STRIP + rand_int(0..STRIP - len);
                let bytes = rand_bytes(len);
                copy_to_view(&*mem, offset, &bytes).await.unwrap();
                let mut seen = vec![0u8; len];
                copy_from_view(&*mem, offset, &mut seen).await.unwrap();
                assert_eq!(seen, bytes);
            })
            .unwrap();
        }
        ktest::run_multi(4);
    }

    #[test]
    fn transfer_crosses_view_boundaries() {
        let a = anon(2 * PAGE_SIZE);
        let b = anon(2 * PAGE_SIZE);
        task::spawn(async move {
            let bytes = rand_bytes(PAGE_SIZE + 100);
            copy_to_view(&*a, 50, &bytes).await.unwrap();
            transfer_between_views(&*b, PAGE_SIZE - 25, &*a, 50, PAGE_SIZE + 25)
                .await
                .unwrap();
            let mut seen = vec![0u8; PAGE_SIZE + 25];
            copy_from_view(&*b, PAGE_SIZE - 25, &mut seen).await.unwrap();
            assert_eq!(&seen[..], &bytes[..PAGE_SIZE + 25]);
        })
        .unwrap();
        task::run_all();
    }

    #[test]
    fn transfer_checks_bounds() {
        let a = anon(PAGE_SIZE);
        let b = anon(PAGE_SIZE);
        task::spawn(async move {
            assert_eq!(
                transfer_between_views(&*b, PAGE_SIZE - 10, &*a, 0, 20)
                    .await
                    .unwrap_err(),
                Error::BufferTooSmall
            );
            assert_eq!(
                transfer_between_views(&*b, 0, &*a, PAGE_SIZE - 10, 20)
                    .await
                    .unwrap_err(),
                Error::Fault
            );
        })
        .unwrap();
        task::run_all();
    }

    #[test]
    fn out_of_range_writes_fault() {
        let mem = anon(PAGE_SIZE);
        task::spawn(async move {
            assert_eq!(
                copy_to_view(&*mem, PAGE_SIZE - 2, b"spill").await.unwrap_err(),
                Error::Fault
            );
        })
        .unwrap();
        task::run_all();
    }
}
