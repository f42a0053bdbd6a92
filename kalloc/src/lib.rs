//! # Physical memory allocation seam for kernel development.
//!
//! The memory subsystem never allocates physical pages directly; it goes
//! through the [`frame::FrameAllocator`] trait, which is passed explicitly
//! to every object that owns pages. [`frame::HeapFrames`] implements the
//! trait on top of the process heap so the whole subsystem can be exercised
//! hosted, with physical addresses that are directly dereferencable through
//! [`frame::PageWindow`].
#![deny(missing_docs)]
#![no_std]

// So that we can use std when testing.
#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

pub mod frame;
pub mod wrapper;

pub use frame::{FrameAllocator, HeapFrames, PageWindow, PhysicalAddr};
pub use wrapper::AllocError;
