//! Task-runtime primitives for kernel development.
//!
//! This crate collects the scheduling and synchronization building blocks
//! that the memory subsystem is written against: a ticket spinlock, a
//! recurring event for wait/retry loops, a post-and-acknowledge mechanism
//! for fan-out notifications with backpressure, cancellation tokens, and a
//! minimal async executor that can be driven from one or many host threads.

#![no_std]

// So that we can use std when testing.
#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

pub mod cancel;
pub mod event;
pub mod postack;
pub mod sched;
pub mod spinlock;
pub mod yield_now;

pub mod sync {
    pub use super::event::{Event, EventListener};
    pub use super::spinlock::{Spinlock, SpinlockGuard};
}

pub mod task {
    pub use super::sched::{run, run_all, spawn};
    pub use super::yield_now::yield_now;
}
