//! Page-granular OS memory support for the collector.
//!
//! This crate owns everything that talks to the virtual-memory subsystem:
//! page size queries, page-aligned anonymous mappings for the heap
//! half-spaces, protection toggles, and the process-wide table of registered
//! heap regions consulted by the fault handler.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

mod registry;

pub use registry::register_heap;

/// Smallest multiple of the page size that is `>= n`.
///
/// `page_size_ceil(0)` is 0.
#[must_use]
pub fn page_size_ceil(n: usize) -> usize {
    let page = page_size();
    n.div_ceil(page) * page
}

/// Rounds `addr` down to the start of its page.
#[must_use]
pub fn page_align_floor(addr: usize) -> usize {
    addr & !(page_size() - 1)
}

/// A page-aligned anonymous read-write mapping.
///
/// The region is unmapped when this handle is dropped. The base address is
/// always a multiple of the page size and never changes over the mapping's
/// lifetime.
pub struct PageBuf {
    inner: os::MapInner,
}

impl PageBuf {
    /// Maps `len` bytes of zeroed anonymous memory. `len` is rounded up to a
    /// whole number of pages.
    pub fn map(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "mapping length must be greater than 0",
            ));
        }
        let inner = os::MapInner::map_anon(page_size_ceil(len))?;
        Ok(Self { inner })
    }

    /// Returns the base of the mapping.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the mapping in bytes (a page multiple).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping is empty. Always false for a live map.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Returns `true` if `addr` falls inside this mapping.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.ptr() as usize;
        addr >= base && addr < base + self.len()
    }
}

// SAFETY: the mapping is plain anonymous memory; ownership of the handle is
// what grants access, and unmapping happens exactly once on drop.
unsafe impl Send for PageBuf {}
unsafe impl Sync for PageBuf {}

/// Scoped read-only protection over the pages covering a byte region.
///
/// On construction every page overlapping `[start, start + len)` is marked
/// read-only; on drop the pages are restored to read-write. The restore runs
/// on all exit paths, including unwinding.
pub struct ReadOnlyGuard {
    page_start: usize,
    page_len: usize,
    active: bool,
}

impl ReadOnlyGuard {
    /// Protects the pages overlapping the region.
    pub fn new(start: *const u8, len: usize) -> io::Result<Self> {
        let page_start = page_align_floor(start as usize);
        let page_len = start as usize + len - page_start;
        os::protect(page_start, page_len, os::Protection::ReadOnly)?;
        Ok(Self {
            page_start,
            page_len,
            active: true,
        })
    }

    /// Restores read-write access early, before the guard is dropped.
    pub fn release(&mut self) -> io::Result<()> {
        if self.active {
            os::protect(self.page_start, self.page_len, os::Protection::ReadWrite)?;
            self.active = false;
        }
        Ok(())
    }
}

impl Drop for ReadOnlyGuard {
    fn drop(&mut self) {
        let _ = self.release();
    }
}
