//! Common error types for the memory subsystem.

use alloc::collections::TryReserveError;

use kalloc::AllocError;

/// Memory subsystem errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Argument out of range, unaligned where alignment is required, or an
    /// access landed in an unassigned indirection slot.
    Fault,
    /// The verb is not implemented by this view variant.
    IllegalObject,
    /// Allocation failed and eviction could not free enough storage.
    OutOfMemory,
    /// The transfer destination is insufficient.
    BufferTooSmall,
    /// The underlying object was destroyed concurrently.
    NoSuchResource,
}

/// Sugar of error.
pub type Result<T> = core::result::Result<T, Error>;

impl From<AllocError> for Error {
    fn from(_: AllocError) -> Self {
        Error::OutOfMemory
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Error::OutOfMemory
    }
}

impl From<hashbrown::TryReserveError> for Error {
    fn from(_: hashbrown::TryReserveError) -> Self {
        Error::OutOfMemory
    }
}
