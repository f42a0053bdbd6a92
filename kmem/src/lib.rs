//! Memory-view objects.
//!
//! A memory view is a logical window of addressable bytes that can resolve
//! offsets to physical backing. Concrete variants back the bytes with a
//! fixed hardware window, anonymous chunks, a user-space pager, a slot
//! table forwarding to other views, or a copy-on-write snapshot chain.
//! Address spaces consume the uniform verb set of [`view::MemoryView`];
//! reclaim walks [`page::CachePage`]s and evicts through the
//! post-and-acknowledge protocol of [`evict::EvictionQueue`].

#![deny(missing_docs)]
#![no_std]

// So that we can use std when testing.
#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

pub mod anon;
pub mod cow;
pub mod error;
pub mod evict;
pub mod hardware;
pub mod indirect;
pub mod managed;
pub mod page;
pub mod transfer;
pub mod utils;
pub mod view;

pub use error::{Error, Result};

/// Size of one page in bytes.
pub const PAGE_SIZE: usize = 4096;
