//! The collection task: root filtering, forwarding traversal, reaping.
//!
//! Forwarding is depth-first over an explicit stack of slot addresses, so a
//! pathological object graph cannot overflow the call stack. Cycles
//! terminate through the `visited` map: the second time an object is seen
//! its slot is swung to the recorded copy and traversal stops there.
//!
//! An object is copied before its payload is scanned, and the scan walks the
//! *destination* payload: the inner slots pushed onto the stack belong to
//! the surviving copy, so the forwarded child pointers land in the object
//! that lives on. Payload copies run outside the collector lock; the
//! seq-cst copy primitive keeps them sound against concurrent mutator
//! writes.

use std::collections::HashMap;
use std::time::Instant;

use crate::atomic_copy::seq_cst_copy;
use crate::generation::GenerationPolicy;
use crate::heap::{CollectorState, MetaData, SpaceNum};
use crate::metrics::{self, GcMetrics};
use crate::policy::{LockingPolicy, PromotedList};
use crate::ptr::{scan_region, FatPtr};
use crate::roots::{GcRoots, RootSlot};
use crate::stack;

#[cfg(feature = "tracing")]
use crate::tracing::internal::{next_gc_id, trace_collection};

/// Per-collection tallies for the metrics snapshot.
#[derive(Default)]
struct Tally {
    objects_copied: usize,
    bytes_copied: usize,
}

/// Runs one full collection into `to_space` and returns the promoted list.
pub(crate) fn run_collection<P: LockingPolicy, G: GenerationPolicy>(
    state: &CollectorState<P, G>,
    to_space: SpaceNum,
    extra_roots: Vec<RootSlot>,
) -> PromotedList {
    #[cfg(feature = "tracing")]
    let _span = trace_collection(next_gc_id());

    let started = Instant::now();
    let mut tally = Tally::default();
    let mut visited: HashMap<FatPtr, FatPtr> = HashMap::new();
    let mut promoted = PromotedList::new();

    let mut roots = GcRoots::global().get_roots(stack::current_frame());
    roots.extend(extra_roots);

    for slot in roots {
        // Only slots that still hold a fat pointer into this collector's
        // half-spaces are roots of ours.
        let Some(value) = (unsafe { FatPtr::test_ptr(slot.as_ptr()) }) else {
            continue;
        };
        if !state.contains(value.addr()) {
            continue;
        }
        forward_ptr(state, to_space, slot, &mut visited, &mut promoted, &mut tally);
    }

    // Reap: every metadata entry still outside the to space was not reached.
    let objects_reclaimed = state.with_tables(|metadata, generation| {
        let before = metadata.len();
        metadata.retain(|ptr, _| {
            let keep = state.space_of(ptr.addr()) == Some(to_space) || visited.contains_key(ptr);
            if !keep {
                generation.on_reclaim(*ptr);
            }
            keep
        });
        before - metadata.len()
    });

    metrics::record_collection(GcMetrics {
        duration: started.elapsed(),
        objects_copied: tally.objects_copied,
        objects_reclaimed,
        objects_promoted: promoted.len(),
        bytes_copied: tally.bytes_copied,
        total_collections: 0, // filled in by the recorder
    });

    promoted
}

/// Forwards the object behind `root` and everything reachable from it.
fn forward_ptr<P: LockingPolicy, G: GenerationPolicy>(
    state: &CollectorState<P, G>,
    to_space: SpaceNum,
    root: RootSlot,
    visited: &mut HashMap<FatPtr, FatPtr>,
    promoted: &mut PromotedList,
    tally: &mut Tally,
) {
    let mut pending = vec![root];

    while let Some(slot) = pending.pop() {
        // The slot may have been overwritten since it was discovered.
        let Some(value) = (unsafe { FatPtr::test_ptr(slot.as_ptr()) }) else {
            continue;
        };

        if let Some(forwarded) = visited.get(&value) {
            unsafe { FatPtr::compare_exchange(slot.as_ptr(), value, *forwarded) };
            continue;
        }

        // Skip anything we do not manage or that already lives in to-space.
        let meta = state.with_tables(|metadata, _| {
            if state.space_of(value.addr()) == Some(to_space) {
                None
            } else {
                metadata.get(&value).copied()
            }
        });
        let Some(meta) = meta else { continue };

        let promote = state.with_tables(|_, generation| generation.should_promote(value));
        let (new_ptr, scan_base) = if promote {
            state.with_tables(|metadata, generation| {
                metadata.remove(&value);
                generation.on_promote(value);
            });
            promoted.push(value);
            // A promoted object stays put; its children are still reachable
            // and must be forwarded in place.
            (value, value.addr())
        } else {
            let new_ptr = copy(state, to_space, slot, value, meta, tally);
            (new_ptr, new_ptr.addr())
        };
        visited.insert(value, new_ptr);

        // Scan the surviving payload for managed pointers.
        unsafe {
            scan_region(scan_base, scan_base + meta.size, |inner| {
                pending.push(RootSlot::new(inner));
            });
        }
    }
}

/// Copies `value`'s payload into `to_space`, swings `slot` to the copy, and
/// retires the old metadata entry. Returns the copy's fat pointer.
fn copy<P: LockingPolicy, G: GenerationPolicy>(
    state: &CollectorState<P, G>,
    to_space: SpaceNum,
    slot: RootSlot,
    value: FatPtr,
    meta: MetaData,
    tally: &mut Tally,
) -> FatPtr {
    // Copies may use the full half-space, not just the live-data cap; the
    // cap guarantees survivors always fit.
    let index = state
        .reserve(meta.size, to_space, meta.align, state.heap_size())
        .unwrap_or_else(|| panic!("to-space exhausted while copying {} bytes", meta.size));

    let new_ptr = FatPtr::from_addr(state.space_base(to_space) + index);
    state.with_tables(|metadata, generation| {
        state.check_overlap(metadata, to_space, index, meta.size);
        metadata.insert(new_ptr, meta);
        generation.on_copy(value, new_ptr);
    });

    // Word-atomic copy: a concurrent mutator write to the old payload is
    // observed either entirely or not at all, never torn.
    unsafe { seq_cst_copy(new_ptr.as_ptr(), value.as_ptr(), meta.size) };

    // Install the forward; if the mutator already redirected the slot, its
    // value wins.
    unsafe { FatPtr::compare_exchange(slot.as_ptr(), value, new_ptr) };

    state.with_tables(|metadata, _| {
        metadata.remove(&value);
    });

    tally.objects_copied += 1;
    tally.bytes_copied += meta.size;
    new_ptr
}
