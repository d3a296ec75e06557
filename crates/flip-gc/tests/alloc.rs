//! Bump-allocation behavior on both locking policies.

use flip_gc::{AllocError, Concurrent, CopyingCollector, FatPtr, LockingPolicy, Serial};
use rand::seq::SliceRandom;

fn fill(ptr: FatPtr, len: usize, value: u8) {
    unsafe { std::ptr::write_bytes(ptr.as_ptr(), value, len) };
}

fn assert_filled(ptr: FatPtr, len: usize, value: u8) {
    for i in 0..len {
        let byte = unsafe { std::ptr::read(ptr.as_ptr().add(i)) };
        assert_eq!(byte, value, "byte {i} of object at {:#x}", ptr.addr());
    }
}

/// Allocate `count` objects, write a distinct byte into each, shuffle, and
/// verify every byte survived its neighbors.
fn alloc_pattern_test<P: LockingPolicy>(heap_size: usize, obj_size: fn(u8) -> usize, count: u8) {
    let collector = CopyingCollector::<P>::new(heap_size);

    let mut objects = Vec::new();
    for i in 0..count {
        let size = obj_size(i);
        let ptr = collector.alloc(size).expect("allocation failed");
        fill(ptr, size, i + 1);
        objects.push((ptr, size, i + 1));
    }

    objects.shuffle(&mut rand::thread_rng());
    for (ptr, size, value) in objects {
        assert_filled(ptr, size, value);
    }
}

#[test]
fn small_bump_allocations_shuffled_read_back() {
    alloc_pattern_test::<Serial>(128, |_| 16, 4);
}

#[test]
fn large_allocations() {
    alloc_pattern_test::<Serial>(1_024_000, |_| 1024, 20);
}

#[test]
fn random_sized_allocations() {
    alloc_pattern_test::<Serial>(5_120_000, |i| (i as usize * 199) % 5000 + 1, 100);
}

#[test]
fn concurrent_policy_allocates_too() {
    alloc_pattern_test::<Concurrent>(1_024_000, |_| 512, 16);
}

#[test]
fn zero_sized_allocation_is_rejected() {
    let collector = CopyingCollector::<Serial>::new(1024);
    assert_eq!(
        collector.alloc(0),
        Err(AllocError::AllocTooLarge { size: 0, max: 512 })
    );
}

#[test]
fn full_cap_allocation_succeeds_only_at_cursor_zero() {
    let collector = CopyingCollector::<Serial>::new(1024);
    let first = collector.alloc(512).expect("fills the cap");
    fill(first, 512, 1);
    // keep the object pinned on the stack so the retry collection cannot
    // reclaim it
    std::hint::black_box(&first);
    assert_eq!(collector.alloc(512), Err(AllocError::OutOfHeap));
    assert_filled(first, 512, 1);
}

#[test]
fn alignment_larger_than_page_size_is_honored() {
    let align = 2 * flip_gc::page_size();
    let collector = CopyingCollector::<Serial>::new(512 * 1024);
    let small = collector.alloc(3).expect("filler");
    fill(small, 3, 0xEE);
    let big_align = collector
        .alloc_aligned(128, align)
        .expect("page-aligned allocation");
    assert_eq!(big_align.addr() % align, 0);
    fill(big_align, 128, 0xDD);
    // padding must not have overlapped the preceding allocation
    assert_filled(small, 3, 0xEE);
    assert!(small.addr() + 3 <= big_align.addr());
}

#[test]
fn metadata_matches_the_request() {
    let collector = CopyingCollector::<Serial>::new(8192);
    let ptr = collector.alloc_aligned(100, 16).expect("alloc");
    let meta = collector.metadata_of(ptr).expect("tracked");
    assert_eq!(meta.size, 100);
    assert_eq!(meta.align, 16);
    assert_eq!(ptr.addr() % 16, 0);
}
