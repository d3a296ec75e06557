//! The fat-pointer primitive.
//!
//! Every managed pointer is a two-word value: a constant header word
//! followed by a pointer word whose most significant byte carries a constant
//! tag. Together the sixteen bytes act as a signature that a conservative
//! scan can recognize in stack or static memory with near-certainty, without
//! precise stack maps.
//!
//! The header is written once at construction and never mutated afterwards,
//! so scanners may read it without synchronization. Only the pointer word
//! changes (when the collector forwards an object), and every access to it
//! is a seq-cst atomic operation.

use std::fmt;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

#[cfg(not(target_pointer_width = "64"))]
compile_error!("flip-gc requires a 64-bit target: the tag occupies the pointer's top byte");

/// Header sentinel preceding every managed pointer word.
pub const PTR_HEADER: usize = usize::from_le_bytes(*b"GcFatPtr");

/// Tag value stored in the most significant byte of a managed pointer word.
pub const TAG_BYTE: u8 = 0xA7;

/// The tag shifted into the pointer word's top byte.
pub const TAG: usize = (TAG_BYTE as usize) << 56;

/// Mask selecting the tag byte of a pointer word.
pub const TAG_MASK: usize = 0xFF << 56;

/// Mask selecting the payload address of a pointer word.
pub const ADDR_MASK: usize = (1 << 56) - 1;

/// Padding scanned below a thread's recorded stack pointer, to catch
/// compiler-emitted writes below the nominal frame.
pub const RED_ZONE: usize = 128;

/// A raw payload address extracted from a [`FatPtr`].
///
/// Never stored anywhere the scanner could see it; used transiently to
/// address object payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcPtr(pub usize);

impl GcPtr {
    /// The address as a byte pointer.
    #[must_use]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}

/// The two-word managed pointer representation.
///
/// `FatPtr` is plain data: copying one snapshots the pointer word at that
/// instant. The authoritative value lives in a *slot* (a stack local, a
/// static, or a position inside an object payload), and concurrent access to
/// a slot goes through the atomic operations below.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FatPtr {
    header: usize,
    word: usize,
}

impl FatPtr {
    /// Builds a fat pointer to `addr`. Any bits in the tag byte of `addr`
    /// are discarded.
    #[must_use]
    pub const fn from_addr(addr: usize) -> Self {
        Self {
            header: PTR_HEADER,
            word: (addr & ADDR_MASK) | TAG,
        }
    }

    /// The distinguished empty handle (payload address zero).
    #[must_use]
    pub const fn null() -> Self {
        Self::from_addr(0)
    }

    /// Returns `true` if this is the empty handle.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.word == TAG
    }

    /// The payload address.
    #[must_use]
    pub const fn addr(self) -> usize {
        self.word & ADDR_MASK
    }

    /// The untagged payload pointer.
    #[must_use]
    pub const fn gc_ptr(self) -> GcPtr {
        GcPtr(self.addr())
    }

    /// The payload as a byte pointer.
    #[must_use]
    pub const fn as_ptr(self) -> *mut u8 {
        self.addr() as *mut u8
    }

    /// The raw tagged pointer word.
    #[must_use]
    pub(crate) const fn word(self) -> usize {
        self.word
    }

    /// Loads the pointer word of the slot behind `&self` with sequential
    /// consistency.
    ///
    /// # Panics
    ///
    /// Panics if the tag byte has been corrupted; the slot no longer holds a
    /// managed pointer and the collection cannot continue safely.
    #[must_use]
    pub fn atomic_load(&self) -> usize {
        // SAFETY: `word` is only ever mutated through atomic operations.
        let atom = unsafe { AtomicUsize::from_ptr(std::ptr::addr_of!(self.word).cast_mut()) };
        let word = atom.load(Ordering::SeqCst);
        assert!(word & TAG_MASK == TAG, "invalid pointer: tag byte corrupted");
        word
    }

    /// True when the two words at `addr` look like a fat pointer: header
    /// sentinel followed by a tagged word.
    ///
    /// # Safety
    ///
    /// `addr` and `addr + 1` must be readable and word-aligned. The words
    /// may be concurrently mutated; the header of a real fat pointer never
    /// is, which is what makes the check meaningful without a lock.
    #[must_use]
    pub unsafe fn maybe_ptr(addr: *const usize) -> bool {
        debug_assert!(addr as usize % std::mem::align_of::<usize>() == 0);
        fence(Ordering::SeqCst);
        let header = unsafe { std::ptr::read_volatile(addr) };
        let word = unsafe { std::ptr::read_volatile(addr.add(1)) };
        header == PTR_HEADER && word & TAG_MASK == TAG
    }

    /// Re-reads `slot` atomically and returns the value only if it still
    /// looks like a fat pointer. Used whenever the slot may be concurrently
    /// mutated.
    ///
    /// # Safety
    ///
    /// `slot` must be readable for sixteen bytes and aligned to `FatPtr`.
    #[must_use]
    pub unsafe fn test_ptr(slot: *const FatPtr) -> Option<FatPtr> {
        fence(Ordering::SeqCst);
        let header = unsafe { std::ptr::read_volatile(std::ptr::addr_of!((*slot).header)) };
        // SAFETY: pointer-word reads are always atomic.
        let word = unsafe { AtomicUsize::from_ptr(std::ptr::addr_of!((*slot).word).cast_mut()) }
            .load(Ordering::SeqCst);
        if header == PTR_HEADER && word & TAG_MASK == TAG {
            Some(FatPtr {
                header: PTR_HEADER,
                word,
            })
        } else {
            None
        }
    }

    /// Atomically replaces the pointer word of `slot` with that of `new`.
    /// The header is never touched. Sequentially consistent.
    ///
    /// # Safety
    ///
    /// `slot` must point to a live fat-pointer slot and all concurrent
    /// accesses to its pointer word must be atomic.
    pub unsafe fn atomic_update(slot: *mut FatPtr, new: FatPtr) {
        let atom = unsafe { AtomicUsize::from_ptr(std::ptr::addr_of_mut!((*slot).word)) };
        atom.swap(new.word, Ordering::SeqCst);
    }

    /// Strong compare-and-swap on the pointer word of `slot`. Returns `None`
    /// on success or the observed value on failure; never fails spuriously.
    ///
    /// # Safety
    ///
    /// Same contract as [`FatPtr::atomic_update`].
    pub unsafe fn compare_exchange(
        slot: *mut FatPtr,
        expected: FatPtr,
        desired: FatPtr,
    ) -> Option<FatPtr> {
        let atom = unsafe { AtomicUsize::from_ptr(std::ptr::addr_of_mut!((*slot).word)) };
        match atom.compare_exchange(expected.word, desired.word, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => None,
            Err(observed) => Some(FatPtr {
                header: PTR_HEADER,
                word: observed,
            }),
        }
    }
}

impl Default for FatPtr {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for FatPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FatPtr").field(&self.addr()).finish()
    }
}

/// Scans `[begin, end)` for fat-pointer slots, calling `f` on every
/// qualifying address. The walk is aligned to `FatPtr`'s alignment and steps
/// one word at a time, so overlapping candidates are all considered.
///
/// # Safety
///
/// The region must be readable. Hits are conservative: a coincidental byte
/// pattern is reported like a real pointer and it is the caller's job to
/// validate the target.
pub unsafe fn scan_region(begin: usize, end: usize, mut f: impl FnMut(*mut FatPtr)) {
    let align = std::mem::align_of::<FatPtr>();
    let mut cur = begin.div_ceil(align) * align;
    while cur + std::mem::size_of::<FatPtr>() <= end {
        if unsafe { FatPtr::maybe_ptr(cur as *const usize) } {
            f(cur as *mut FatPtr);
        }
        cur += align;
    }
}
