//! Caller-surfaced error types.
//!
//! Only allocation and array indexing report recoverable errors. Structural
//! failures (a corrupted tag byte, overlapping reservations, inverted scan
//! bounds) are panics: forwarding may have half-completed and the heap
//! cannot be trusted afterwards.

use thiserror::Error;

/// Errors surfaced by allocation. The heap state is unchanged when one of
/// these is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The requested size is zero or exceeds the live-data cap.
    #[error("invalid allocation size {size} (limit {max})")]
    AllocTooLarge {
        /// Requested size in bytes.
        size: usize,
        /// Largest size a single allocation may have.
        max: usize,
    },
    /// Allocation still failed after a full collection.
    #[error("heap exhausted after collection")]
    OutOfHeap,
}

/// A checked array access fell outside the element range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("index {index} out of range for array of length {len}")]
pub struct IndexOutOfRange {
    /// The offending index.
    pub index: usize,
    /// The array length.
    pub len: usize,
}
