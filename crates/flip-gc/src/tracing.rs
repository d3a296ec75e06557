//! Collection tracing support.
//!
//! When the `tracing` feature is enabled this module provides structured
//! spans for collections, correlated by a monotonically increasing id.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    // leading :: so the extern crate is named, not this module
    use ::tracing::{span, Level};

    /// Stable identifier for one collection run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique collection id.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering one entire collection.
    pub fn trace_collection(gc_id: GcId) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_collect", gc_id = gc_id.0).entered()
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub id when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub generator when tracing is disabled.
    pub fn next_gc_id() -> GcId {
        GcId(0)
    }
}

pub use internal::GcId;
