//! Collection scenarios: survivors, graphs, alignment, pressure.

use flip_gc::{
    AgePromotion, CopyingCollector, FatPtr, NoPromotion, RootSlot, Serial,
};

fn fill(ptr: FatPtr, len: usize, value: u8) {
    unsafe { std::ptr::write_bytes(ptr.as_ptr(), value, len) };
}

fn assert_filled(ptr: FatPtr, len: usize, value: u8) {
    for i in 0..len {
        let byte = unsafe { std::ptr::read(ptr.as_ptr().add(i)) };
        assert_eq!(byte, value, "byte {i} of object at {:#x}", ptr.addr());
    }
}

#[test]
fn empty_root_set_leaves_nothing_behind() {
    let collector = CopyingCollector::<Serial>::new(1024);
    let promoted = collector.async_collect(&[]).wait();
    assert!(promoted.is_empty());
    assert_eq!(collector.live_objects(), 0);
    assert_eq!(collector.free_space(), 512);
}

#[test]
fn two_survivors_keep_their_bytes_at_new_addresses() {
    let collector = CopyingCollector::<Serial>::new(1024);

    let mut p1 = collector.alloc(16).expect("p1");
    fill(p1, 16, 1);
    let old_addr1 = p1.addr();

    for i in 0..10u8 {
        let scratch = collector.alloc(16).expect("scratch");
        fill(scratch, 16, 10 + i);
    }

    let mut p2 = collector.alloc(16).expect("p2");
    fill(p2, 16, 2);
    let old_addr2 = p2.addr();

    let promoted = collector
        .async_collect(&[RootSlot::new(&mut p1), RootSlot::new(&mut p2)])
        .wait();
    assert!(promoted.is_empty());

    // the two survivors account for 32 bytes; conservative stack hits may
    // pin some of the ten scratch objects but never more than all of them
    assert!(collector.free_space() <= 512 - 32);
    assert!(collector.free_space() >= 512 - 12 * 16);

    assert_filled(p1, 16, 1);
    assert_filled(p2, 16, 2);
    assert_ne!(p1.addr(), old_addr1);
    assert_ne!(p2.addr(), old_addr2);
}

// Node layout: { next: FatPtr, value: i64 }
const NODE_SIZE: usize = 24;
const VALUE_OFFSET: usize = 16;

unsafe fn write_node(node: FatPtr, next: FatPtr, value: i64) {
    unsafe {
        std::ptr::write(node.as_ptr().cast::<FatPtr>(), next);
        std::ptr::write(node.as_ptr().add(VALUE_OFFSET).cast::<i64>(), value);
    }
}

unsafe fn read_node(node: FatPtr) -> (FatPtr, i64) {
    unsafe {
        (
            std::ptr::read(node.as_ptr().cast::<FatPtr>()),
            std::ptr::read(node.as_ptr().add(VALUE_OFFSET).cast::<i64>()),
        )
    }
}

#[test]
fn linked_list_of_seventeen_nodes_survives_in_order() {
    let collector = CopyingCollector::<Serial>::new(1024);

    let mut head = collector.alloc_aligned(NODE_SIZE, 8).expect("head");
    let mut tail = head;
    for i in 0..16 {
        let next = collector.alloc_aligned(NODE_SIZE, 8).expect("node");
        unsafe { write_node(tail, next, i) };
        tail = next;
    }
    unsafe { write_node(tail, FatPtr::null(), 16) };

    let _ = collector.async_collect(&[RootSlot::new(&mut head)]).wait();

    let mut expected = 0i64;
    let mut node = head;
    loop {
        let (next, value) = unsafe { read_node(node) };
        assert_eq!(value, expected);
        expected += 1;
        if next.is_null() {
            break;
        }
        node = next;
    }
    assert_eq!(expected, 17);
}

#[test]
fn cyclic_graph_terminates_and_survives() {
    let collector = CopyingCollector::<Serial>::new(1024);

    let mut a = collector.alloc_aligned(NODE_SIZE, 8).expect("a");
    let b = collector.alloc_aligned(NODE_SIZE, 8).expect("b");
    unsafe {
        write_node(a, b, 1);
        write_node(b, a, 2);
    }

    let _ = collector.async_collect(&[RootSlot::new(&mut a)]).wait();

    let (a_next, a_value) = unsafe { read_node(a) };
    assert_eq!(a_value, 1);
    let (b_next, b_value) = unsafe { read_node(a_next) };
    assert_eq!(b_value, 2);
    // the cycle closes onto the forwarded copy of a
    assert_eq!(b_next.addr(), a.addr());
}

#[test]
fn sixty_four_byte_alignment_survives_the_copy() {
    let collector = CopyingCollector::<Serial>::new(1024);

    let mut ptr = collector.alloc_aligned(64, 64).expect("aligned");
    fill(ptr, 64, 1);
    assert_eq!(ptr.addr() % 64, 0);
    let old_addr = ptr.addr();

    let _ = collector.async_collect(&[RootSlot::new(&mut ptr)]).wait();

    assert_ne!(ptr.addr(), old_addr);
    assert_eq!(ptr.addr() % 64, 0);
    assert_filled(ptr, 64, 1);
}

#[test]
fn alloc_collect_alloc_reuses_the_heap() {
    let collector = CopyingCollector::<Serial>::new(1024);
    let mut first = collector.alloc(256).expect("first half");
    fill(first, 256, 0xAB);

    let _ = collector
        .async_collect(&[RootSlot::new(&mut first)])
        .wait();

    let second = collector.alloc(256).expect("second half after collect");
    fill(second, 256, 0xCD);
    assert_filled(first, 256, 0xAB);
    assert_filled(second, 256, 0xCD);
}

#[inline(never)]
fn churn_with_pin(collector: &CopyingCollector<Serial>, pinned: &mut FatPtr) {
    let mut scratch = collector.alloc_aligned(52, 4).expect("scratch");
    let _ = collector
        .async_collect(&[RootSlot::new(pinned), RootSlot::new(&mut scratch)])
        .wait();
    for j in 0..13u32 {
        unsafe {
            std::ptr::write(scratch.as_ptr().cast::<u32>().add(j as usize), 1000 + j);
        }
    }
    for j in 0..13u32 {
        let value = unsafe { std::ptr::read(scratch.as_ptr().cast::<u32>().add(j as usize)) };
        assert_eq!(value, 1000 + j);
    }
}

#[test]
fn nested_allocation_under_pressure_preserves_the_pinned_array() {
    let collector = CopyingCollector::<Serial>::new(2048);

    let mut array = collector.alloc_aligned(400, 4).expect("array");
    for i in 0..100u32 {
        unsafe { std::ptr::write(array.as_ptr().cast::<u32>().add(i as usize), i) };
    }

    for _ in 0..64 {
        churn_with_pin(&collector, &mut array);
    }

    for i in 0..100u32 {
        let value = unsafe { std::ptr::read(array.as_ptr().cast::<u32>().add(i as usize)) };
        assert_eq!(value, i);
    }
}

#[test]
fn repeated_reallocation_holding_one_pin() {
    let collector = CopyingCollector::<Serial>::new(4096);

    let mut pinned = collector.alloc(32).expect("pinned");
    fill(pinned, 32, 0x5A);
    std::hint::black_box(&mut pinned);

    // the trigger path starts collections on its own once the cap fills
    for _ in 0..128 {
        let scratch = collector.alloc(100).expect("scratch");
        fill(scratch, 100, 0x11);
    }

    assert_filled(pinned, 32, 0x5A);
}

#[test]
fn age_promotion_reports_old_survivors() {
    let collector = CopyingCollector::<Serial, AgePromotion>::new(4096);

    let mut old_timer = collector.alloc(16).expect("old timer");
    fill(old_timer, 16, 0x77);

    // below the default threshold nothing is promoted
    let mut promoted = Vec::new();
    for _ in 0..AgePromotion::DEFAULT_THRESHOLD {
        promoted = collector
            .async_collect(&[RootSlot::new(&mut old_timer)])
            .wait();
    }
    assert!(promoted.is_empty());

    // the next collection sees an object past the threshold
    let promoted = collector
        .async_collect(&[RootSlot::new(&mut old_timer)])
        .wait();
    assert_eq!(promoted.len(), 1);
    assert_eq!(promoted[0].addr(), old_timer.addr());
    // promoted objects leave the managed heap
    assert_eq!(collector.metadata_of(promoted[0]), None);
    assert_filled(old_timer, 16, 0x77);
}

#[test]
fn no_promotion_policy_never_reports() {
    let collector = CopyingCollector::<Serial, NoPromotion>::new(2048);
    let mut ptr = collector.alloc(16).expect("ptr");
    fill(ptr, 16, 0x42);
    for _ in 0..8 {
        let promoted = collector.async_collect(&[RootSlot::new(&mut ptr)]).wait();
        assert!(promoted.is_empty());
    }
    assert_filled(ptr, 16, 0x42);
}
