//! The two-space copying heap.
//!
//! Two fixed, page-aligned half-spaces; exactly one is *active* at a time
//! and serves bump allocations. When allocation pressure triggers a
//! collection the active index flips and the forwarding traversal (see
//! `collect`) moves survivors into the new active space.
//!
//! Per-object bookkeeping is a map from fat pointer to `{size, alignment}`,
//! mutated only inside the policy's critical section. The bump cursors are
//! advanced by compare-and-swap so reservation itself never blocks.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use sys_pages::{page_size_ceil, register_heap, PageBuf};

use crate::error::AllocError;
use crate::generation::{GenerationPolicy, NoPromotion};
use crate::policy::{CollectHandle, Counter, LockingPolicy, SpaceFlag};
use crate::ptr::{FatPtr, ADDR_MASK};
use crate::roots::{GcRoots, RootSlot};
use crate::stack;

/// Index of one of the two half-spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SpaceNum {
    /// The first half-space.
    Zero = 0,
    /// The second half-space.
    One = 1,
}

impl SpaceNum {
    /// The space named by the low bit of `index`.
    #[must_use]
    pub fn from_index(index: u8) -> Self {
        if index & 1 == 0 {
            Self::Zero
        } else {
            Self::One
        }
    }

    /// The space's array index.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// The other half-space.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Zero => Self::One,
            Self::One => Self::Zero,
        }
    }
}

/// Size and alignment of one live object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaData {
    /// Payload size in bytes.
    pub size: usize,
    /// Requested alignment (a power of two).
    pub align: usize,
}

/// Shared state of a collector, reference-counted so a scheduled collection
/// can outlive the borrow it was created from.
pub struct CollectorState<P: LockingPolicy, G: GenerationPolicy = NoPromotion> {
    /// Byte size of each half-space (a page multiple).
    heap_size: usize,
    /// Cap on live data; the other half is headroom for the next copy.
    max_alloc_size: usize,
    spaces: [PageBuf; 2],
    cursors: [P::Cursor; 2],
    active: P::Flag,
    /// Keyed by fat pointer; covers every live object in either space.
    /// Guarded by the policy lock.
    metadata: UnsafeCell<HashMap<FatPtr, MetaData>>,
    /// Guarded by the policy lock.
    generation: UnsafeCell<G>,
    /// Handle of the collection started by the trigger logic, if any.
    inflight: Mutex<Option<CollectHandle>>,
    policy: P,
}

// SAFETY: the UnsafeCell fields are only touched inside `with_tables`, which
// runs under the policy's critical section. The cursor/flag bounds restrict
// cross-thread sharing to policies whose counters really are atomic: a
// serial collector's `Cell` counters make it !Sync.
unsafe impl<P, G> Send for CollectorState<P, G>
where
    P: LockingPolicy + Send,
    G: GenerationPolicy,
{
}
unsafe impl<P, G> Sync for CollectorState<P, G>
where
    P: LockingPolicy + Sync,
    P::Cursor: Sync,
    P::Flag: Sync,
    G: GenerationPolicy,
{
}

impl<P: LockingPolicy, G: GenerationPolicy> CollectorState<P, G> {
    /// Runs `f` with exclusive access to the metadata map and the
    /// generation policy, inside the policy's critical section.
    pub(crate) fn with_tables<R>(&self, f: impl FnOnce(&mut HashMap<FatPtr, MetaData>, &mut G) -> R) -> R {
        self.policy.with_lock(|| {
            // SAFETY: the policy lock serializes every access to the tables.
            let metadata = unsafe { &mut *self.metadata.get() };
            let generation = unsafe { &mut *self.generation.get() };
            f(metadata, generation)
        })
    }

    pub(crate) fn policy(&self) -> &P {
        &self.policy
    }

    /// Base address of a half-space.
    pub(crate) fn space_base(&self, space: SpaceNum) -> usize {
        self.spaces[space.index()].ptr() as usize
    }

    /// Byte size of each half-space.
    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    /// Largest amount of live data the heap will hold.
    #[must_use]
    pub fn max_alloc_size(&self) -> usize {
        self.max_alloc_size
    }

    /// The half-space currently serving allocations.
    pub(crate) fn active_space(&self) -> SpaceNum {
        SpaceNum::from_index(self.active.load())
    }

    /// True if `addr` lies within either half-space.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.spaces[0].contains(addr) || self.spaces[1].contains(addr)
    }

    /// The half-space containing `addr`, if any.
    pub(crate) fn space_of(&self, addr: usize) -> Option<SpaceNum> {
        if self.spaces[0].contains(addr) {
            Some(SpaceNum::Zero)
        } else if self.spaces[1].contains(addr) {
            Some(SpaceNum::One)
        } else {
            None
        }
    }

    /// Bytes still available in the active space before the live-data cap.
    #[must_use]
    pub fn free_space(&self) -> usize {
        let next = self.cursors[self.active_space().index()].load();
        self.max_alloc_size.saturating_sub(next)
    }

    /// Number of live objects tracked by the metadata map.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.with_tables(|metadata, _| metadata.len())
    }

    /// Offset of the active space's next allocation.
    pub(crate) fn active_cursor(&self) -> usize {
        self.cursors[self.active_space().index()].load()
    }

    /// Reserves `size` bytes plus alignment padding in `space`, refusing to
    /// advance the cursor past `cap`. Returns the post-padding offset.
    pub(crate) fn reserve(
        &self,
        size: usize,
        space: SpaceNum,
        align: usize,
        cap: usize,
    ) -> Option<usize> {
        let cursor = &self.cursors[space.index()];
        let base = self.space_base(space);
        let mut next = cursor.load();
        loop {
            let padding = padding_for(base + next, align);
            if next + size + padding > cap {
                return None;
            }
            match cursor.compare_exchange(next, next + size + padding) {
                Ok(_) => return Some(next + padding),
                Err(observed) => next = observed,
            }
        }
    }

    /// Verifies a fresh reservation does not intersect any live object.
    /// Runs inside `with_tables`.
    ///
    /// # Panics
    ///
    /// Panics on overlap: the heap bookkeeping is corrupt.
    pub(crate) fn check_overlap(
        &self,
        metadata: &HashMap<FatPtr, MetaData>,
        space: SpaceNum,
        index: usize,
        size: usize,
    ) {
        let addr = self.space_base(space) + index;
        for (ptr, meta) in metadata {
            let existing = ptr.addr();
            let overlaps =
                (existing <= addr && existing + meta.size > addr)
                    || (addr <= existing && addr + size > existing);
            assert!(
                !overlaps,
                "heap corruption: reservation {addr:#x}+{size} overlaps object {existing:#x}+{}",
                meta.size
            );
        }
    }

    /// Records a freshly allocated object at `index` in `space` and returns
    /// its fat pointer.
    pub(crate) fn register_object(&self, space: SpaceNum, meta: MetaData, index: usize) -> FatPtr {
        assert!(
            index + meta.size <= self.heap_size,
            "reservation escapes the half-space"
        );
        let ptr = FatPtr::from_addr(self.space_base(space) + index);
        self.with_tables(|metadata, generation| {
            metadata.insert(ptr, meta);
            generation.on_alloc(ptr);
        });
        ptr
    }

    /// Size and alignment of the object at `ptr`, if it is live.
    #[must_use]
    pub fn metadata_of(&self, ptr: FatPtr) -> Option<MetaData> {
        self.with_tables(|metadata, _| metadata.get(&ptr).copied())
    }
}

/// Bytes of padding needed to bring `addr` up to `align`.
fn padding_for(addr: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    addr.wrapping_neg() & (align - 1)
}

/// A two-space conservative copying collector.
///
/// `P` selects the locking policy ([`crate::Serial`] or
/// [`crate::Concurrent`]), `G` the generation policy (default: no
/// promotion).
pub struct CopyingCollector<P: LockingPolicy, G: GenerationPolicy = NoPromotion> {
    state: Arc<CollectorState<P, G>>,
}

impl<P: LockingPolicy, G: GenerationPolicy> CopyingCollector<P, G> {
    /// Builds a collector whose live-data cap is `size / 2` bytes; each
    /// half-space buffer is `size` rounded up to a page multiple.
    ///
    /// # Panics
    ///
    /// Panics if `size` reaches into the tag byte's address range, if the
    /// half-spaces cannot be mapped, or if the two mappings collide.
    #[must_use]
    pub fn new(size: usize) -> Self {
        assert!(
            size < ADDR_MASK,
            "heap size {size} exceeds the tagged address range"
        );
        let heap_size = page_size_ceil(size);
        let spaces = [
            PageBuf::map(heap_size).unwrap_or_else(|e| panic!("failed to map half-space: {e}")),
            PageBuf::map(heap_size).unwrap_or_else(|e| panic!("failed to map half-space: {e}")),
        ];
        register_heap(spaces[0].ptr(), heap_size);
        register_heap(spaces[1].ptr(), heap_size);
        assert_ne!(
            spaces[0].ptr() as usize,
            spaces[1].ptr() as usize,
            "half-spaces collide on a page boundary"
        );

        Self {
            state: Arc::new(CollectorState {
                heap_size,
                max_alloc_size: size / 2,
                spaces,
                cursors: [P::Cursor::default(), P::Cursor::default()],
                active: P::Flag::default(),
                metadata: UnsafeCell::new(HashMap::new()),
                generation: UnsafeCell::new(G::default()),
                inflight: Mutex::new(None),
                policy: P::new(),
            }),
        }
    }

    /// Allocates `size` bytes with alignment 1.
    pub fn alloc(&self, size: usize) -> Result<FatPtr, AllocError> {
        self.alloc_aligned(size, 1)
    }

    /// Allocates `size` bytes aligned to `align` (a power of two).
    ///
    /// On pressure this triggers one collection and retries once before
    /// reporting [`AllocError::OutOfHeap`].
    pub fn alloc_aligned(&self, size: usize, align: usize) -> Result<FatPtr, AllocError> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        GcRoots::global().update_stack_range(stack::caller_frame());
        if size == 0 || size > self.state.max_alloc_size {
            return Err(AllocError::AllocTooLarge {
                size,
                max: self.state.max_alloc_size,
            });
        }
        self.alloc_attempt(size, align, 0)
    }

    fn alloc_attempt(&self, size: usize, align: usize, attempts: u8) -> Result<FatPtr, AllocError> {
        let (to_space, index) = self.state.with_tables(|metadata, _| {
            let to_space = self.state.active_space();
            let index = self
                .state
                .reserve(size, to_space, align, self.state.max_alloc_size);
            if let Some(index) = index {
                self.state.check_overlap(metadata, to_space, index, size);
            }
            (to_space, index)
        });
        match index {
            Some(index) => Ok(self
                .state
                .register_object(to_space, MetaData { size, align }, index)),
            None if attempts == 0 => {
                self.collect(size);
                self.alloc_attempt(size, align, attempts + 1)
            }
            None => Err(AllocError::OutOfHeap),
        }
    }

    /// Ensures `needed_space` bytes can be allocated, starting a collection
    /// if none is in flight and the space is still missing.
    ///
    /// Waits for an in-flight collection first, so at most one runs at a
    /// time.
    pub fn collect(&self, needed_space: usize) {
        loop {
            let inflight = self.state.inflight.lock().clone();
            match inflight {
                Some(handle) if !handle.is_ready() && self.state.free_space() < needed_space => {
                    let _ = handle.wait();
                }
                _ => break,
            }
        }

        let mut slot = self.state.inflight.lock();
        let idle = slot.as_ref().is_none_or(CollectHandle::is_ready);
        if idle && self.state.free_space() < needed_space {
            *slot = Some(self.start_collection(Vec::new()));
        }
    }

    /// Flips the active space and schedules a collection of everything
    /// reachable from the scanner's roots plus `extra_roots`.
    ///
    /// The returned handle completes with the promoted-object list.
    pub fn async_collect(&self, extra_roots: &[RootSlot]) -> CollectHandle {
        self.start_collection(extra_roots.to_vec())
    }

    fn start_collection(&self, extra_roots: Vec<RootSlot>) -> CollectHandle {
        let old = self.state.active.fetch_xor(1);
        let from_space = SpaceNum::from_index(old);
        // The from space is rebuilt on the next flip; resetting its cursor
        // now means an abandoned collection cannot leak budget.
        self.state.cursors[from_space.index()].store(0);
        P::schedule(&self.state, from_space.other(), extra_roots)
    }

    /// True if `addr` lies within either half-space.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.state.contains(addr)
    }

    /// Bytes left before the next collection triggers.
    #[must_use]
    pub fn free_space(&self) -> usize {
        self.state.free_space()
    }

    /// Number of live objects.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.state.live_objects()
    }

    /// Size and alignment recorded for `ptr`, if it is live.
    #[must_use]
    pub fn metadata_of(&self, ptr: FatPtr) -> Option<MetaData> {
        self.state.metadata_of(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Serial;

    fn collector(size: usize) -> CopyingCollector<Serial> {
        CopyingCollector::new(size)
    }

    #[test]
    fn construction_rounds_and_halves() {
        let gc = collector(1024);
        assert_eq!(gc.state.heap_size, sys_pages::page_size_ceil(1024));
        assert_eq!(gc.state.max_alloc_size, 512);
        assert_eq!(gc.free_space(), 512);
        assert_eq!(gc.live_objects(), 0);
    }

    #[test]
    fn alloc_zero_and_oversized_fail() {
        let gc = collector(1024);
        assert_eq!(
            gc.alloc(0),
            Err(AllocError::AllocTooLarge { size: 0, max: 512 })
        );
        assert_eq!(
            gc.alloc(513),
            Err(AllocError::AllocTooLarge { size: 513, max: 512 })
        );
    }

    #[test]
    fn alloc_whole_cap_succeeds_once() {
        let gc = collector(1024);
        let p = gc.alloc(512).expect("first fill");
        assert!(gc.contains(p.addr()));
        assert_eq!(gc.free_space(), 0);
        // nothing roots `p`'s slot deterministically here, but a second
        // oversized request must fail without corrupting state
        assert_eq!(gc.metadata_of(p).map(|m| m.size), Some(512));
    }

    #[test]
    fn bump_allocations_do_not_overlap() {
        let gc = collector(4096);
        let a = gc.alloc(16).expect("a");
        let b = gc.alloc(16).expect("b");
        let c = gc.alloc(32).expect("c");
        assert!(a.addr() + 16 <= b.addr());
        assert!(b.addr() + 16 <= c.addr());
        assert_eq!(gc.live_objects(), 3);
    }

    #[test]
    fn alignment_pads_the_cursor() {
        let gc = collector(4096);
        let _ = gc.alloc(3).expect("filler");
        let aligned = gc.alloc_aligned(64, 64).expect("aligned");
        assert_eq!(aligned.addr() % 64, 0);
        assert_eq!(gc.metadata_of(aligned).map(|m| m.align), Some(64));
    }

    #[test]
    fn free_space_tracks_the_cursor() {
        let gc = collector(1024);
        let before = gc.free_space();
        let _ = gc.alloc(100).expect("alloc");
        assert_eq!(gc.free_space(), before - 100);
        assert_eq!(gc.state.active_cursor(), 100);
    }

    #[test]
    fn padding_for_is_exact() {
        assert_eq!(padding_for(0x1000, 1), 0);
        assert_eq!(padding_for(0x1001, 1), 0);
        assert_eq!(padding_for(0x1001, 8), 7);
        assert_eq!(padding_for(0x1008, 8), 0);
        assert_eq!(padding_for(0x1001, 64), 63);
    }

    #[test]
    fn contains_rejects_foreign_addresses() {
        let gc = collector(1024);
        let local = 0usize;
        assert!(!gc.contains(std::ptr::addr_of!(local) as usize));
        assert!(!gc.contains(0));
    }
}
