//! The process-wide default collector.
//!
//! One collector instance of a compile-time-chosen size, initialized on
//! first use. It uses the concurrent policy so any thread may allocate
//! through it.

use std::sync::LazyLock;

use crate::error::AllocError;
use crate::heap::CopyingCollector;
use crate::policy::{CollectHandle, Concurrent};
use crate::ptr::FatPtr;
use crate::roots::GcRoots;
use crate::stack;

/// Heap size of the default collector, per half-space (before page
/// rounding). Half of it is usable for live data.
pub const DEFAULT_HEAP_SIZE: usize = 1 << 20;

static COLLECTOR: LazyLock<CopyingCollector<Concurrent>> =
    LazyLock::new(|| CopyingCollector::new(DEFAULT_HEAP_SIZE));

/// The process-wide collector.
pub fn default_collector() -> &'static CopyingCollector<Concurrent> {
    LazyLock::force(&COLLECTOR)
}

/// Allocates `size` bytes with alignment `align` from the default
/// collector.
pub fn alloc(size: usize, align: usize) -> Result<FatPtr, AllocError> {
    GcRoots::global().update_stack_range(stack::caller_frame());
    COLLECTOR.alloc_aligned(size, align)
}

/// Starts a collection of the default heap rooted at the caller's frame.
///
/// Returns immediately; wait on the handle to observe completion and the
/// promoted-object list.
pub fn collect() -> CollectHandle {
    let roots = GcRoots::global().get_roots(stack::caller_frame());
    COLLECTOR.async_collect(&roots)
}
