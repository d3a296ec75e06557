//! Conservative root discovery.
//!
//! Roots come from two places: the executable's data segments, scanned once
//! at first use, and the stacks of every thread known to have allocated,
//! scanned anew on every enumeration. Stack extents are tracked per thread
//! as a `(high, low)` range that only ever widens; the scan covers
//! `[low - RED_ZONE, high + 1)` so writes below the nominal frame are still
//! seen.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::thread::ThreadId;

use parking_lot::RwLock;

use crate::ptr::{scan_region, FatPtr, RED_ZONE};
use crate::stack;

/// Address of a fat-pointer slot discovered by a scan.
///
/// A thin wrapper so slot addresses can cross threads: the collection task
/// runs on a worker while the slots live on mutator stacks or in static
/// data, and every dereference revalidates through
/// [`FatPtr::test_ptr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootSlot(*mut FatPtr);

impl RootSlot {
    /// Wraps a slot address.
    #[must_use]
    pub fn new(slot: *mut FatPtr) -> Self {
        Self(slot)
    }

    /// The raw slot address.
    #[must_use]
    pub fn as_ptr(self) -> *mut FatPtr {
        self.0
    }
}

// SAFETY: a RootSlot is just an address; all access to the slot it names is
// performed through the atomic fat-pointer operations.
unsafe impl Send for RootSlot {}
unsafe impl Sync for RootSlot {}

/// Recorded stack extent of one thread: `high` is the numerically greatest
/// frame base observed, `low` the most recent stack pointer.
#[derive(Debug, Clone, Copy)]
struct StackRange {
    high: usize,
    low: usize,
}

/// Process-wide root registry.
pub struct GcRoots {
    /// Fat-pointer slots found in the executable's data segments. Immutable
    /// after construction.
    global_roots: Vec<RootSlot>,
    /// Per-thread stack ranges. Read lock for enumeration and the no-change
    /// fast path; write lock for widening and insertion.
    stack_ranges: RwLock<HashMap<ThreadId, StackRange>>,
}

static INSTANCE: OnceLock<GcRoots> = OnceLock::new();

/// Removes the owning thread's stack range when the thread exits.
struct RangeGuard {
    id: ThreadId,
}

impl Drop for RangeGuard {
    fn drop(&mut self) {
        if let Some(registry) = INSTANCE.get() {
            registry.stack_ranges.write().remove(&self.id);
        }
    }
}

thread_local! {
    static RANGE_GUARD: std::cell::OnceCell<RangeGuard> = const { std::cell::OnceCell::new() };
}

impl GcRoots {
    /// The process-wide instance. The first call scans the data segments.
    pub fn global() -> &'static GcRoots {
        INSTANCE.get_or_init(|| GcRoots {
            global_roots: scan_data_segments(),
            stack_ranges: RwLock::new(HashMap::new()),
        })
    }

    /// Widens the recorded stack range of the calling thread.
    ///
    /// `base` is a frame-pointer candidate for the high end; it is clamped
    /// into the OS-reported stack so a bogus candidate can never push the
    /// scan outside mapped memory. The range is monotonically widened at the
    /// high end and tracks the latest stack pointer at the low end.
    pub fn update_stack_range(&self, base: usize) {
        let sp = stack::stack_pointer();
        let bounds = stack::stack_bounds();
        let high_candidate = base.clamp(sp, bounds.bottom.max(sp));
        let id = std::thread::current().id();

        {
            let ranges = self.stack_ranges.read();
            if let Some(range) = ranges.get(&id) {
                if high_candidate <= range.high && sp == range.low {
                    return;
                }
            }
        }

        let mut ranges = self.stack_ranges.write();
        ranges
            .entry(id)
            .and_modify(|range| {
                range.high = range.high.max(high_candidate);
                range.low = sp;
            })
            .or_insert(StackRange {
                high: high_candidate,
                low: sp,
            });
        drop(ranges);

        // Unregister the range when this thread exits so a later scan never
        // touches a stack that may have been unmapped.
        RANGE_GUARD.with(|guard| {
            guard.get_or_init(|| RangeGuard { id });
        });
    }

    /// Enumerates every root currently visible: fat-pointer slots on all
    /// registered thread stacks plus the immutable global roots.
    ///
    /// Stacks are rescanned on every call; no per-thread cache is kept,
    /// because an address pattern can legitimately reappear after unrelated
    /// stack mutation.
    ///
    /// # Panics
    ///
    /// Panics if a recorded range is inverted, which would mean the registry
    /// itself is corrupt.
    pub fn get_roots(&self, base: usize) -> Vec<RootSlot> {
        self.update_stack_range(base);

        let mut out = Vec::with_capacity(self.global_roots.len() + 64);
        {
            let ranges = self.stack_ranges.read();
            for range in ranges.values() {
                let begin = range.low.saturating_sub(RED_ZONE);
                let end = range.high + 1;
                assert!(begin <= end, "stack scan range inverted");
                // SAFETY: the range lies within a registered thread's stack,
                // clamped to OS bounds at registration time.
                unsafe {
                    scan_region(begin, end, |slot| out.push(RootSlot::new(slot)));
                }
            }
        }
        out.extend_from_slice(&self.global_roots);
        out
    }

    /// The slots found in the data segments at startup.
    #[must_use]
    pub fn global_roots(&self) -> &[RootSlot] {
        &self.global_roots
    }

    /// Number of threads with a recorded stack range.
    #[must_use]
    pub fn tracked_threads(&self) -> usize {
        self.stack_ranges.read().len()
    }
}

/// Scans the process image's readable, non-executable segments for
/// fat-pointer slots. Linux only; other platforms start with no global
/// roots.
#[cfg(target_os = "linux")]
fn scan_data_segments() -> Vec<RootSlot> {
    let Ok(maps) = std::fs::read_to_string("/proc/self/maps") else {
        eprintln!("flip-gc: could not read /proc/self/maps; global roots disabled");
        return Vec::new();
    };
    let exe = std::env::current_exe()
        .ok()
        .and_then(|p| p.to_str().map(String::from))
        .unwrap_or_default();
    if exe.is_empty() {
        eprintln!("flip-gc: could not resolve the executable path; global roots disabled");
        return Vec::new();
    }

    let mut out = Vec::new();
    for line in maps.lines() {
        // <start>-<end> <perms> <offset> <dev> <inode> <path>
        if !line.ends_with(&exe) {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(range) = fields.next() else { continue };
        let Some(perms) = fields.next() else { continue };
        if !perms.starts_with('r') || perms.contains('x') {
            continue;
        }
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (
            usize::from_str_radix(start, 16),
            usize::from_str_radix(end, 16),
        ) else {
            continue;
        };
        // SAFETY: the segment is mapped readable per its permission bits.
        unsafe {
            scan_region(start, end, |slot| out.push(RootSlot::new(slot)));
        }
    }
    out
}

#[cfg(not(target_os = "linux"))]
fn scan_data_segments() -> Vec<RootSlot> {
    eprintln!("flip-gc: no data-segment scanner for this platform; global roots disabled");
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_then_enumerate_finds_a_local() {
        let local = FatPtr::from_addr(0x6100);
        std::hint::black_box(&local);

        let roots = GcRoots::global().get_roots(stack::current_frame());
        let addr = std::ptr::addr_of!(local) as usize;
        assert!(
            roots.iter().any(|slot| slot.as_ptr() as usize == addr),
            "local fat pointer not found among {} roots",
            roots.len()
        );
    }

    #[test]
    fn range_widens_but_never_narrows() {
        let registry = GcRoots::global();
        registry.update_stack_range(stack::current_frame());
        let id = std::thread::current().id();
        let high_before = registry.stack_ranges.read()[&id].high;

        // a lower candidate must not shrink the recorded high end
        registry.update_stack_range(stack::stack_pointer());
        let high_after = registry.stack_ranges.read()[&id].high;
        assert!(high_after >= high_before);
    }

    #[test]
    fn each_live_thread_gets_its_own_range() {
        let registry = GcRoots::global();
        registry.update_stack_range(stack::current_frame());

        let (seen_tx, seen_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            GcRoots::global().update_stack_range(stack::current_frame());
            seen_tx
                .send(GcRoots::global().tracked_threads())
                .expect("main thread gone");
            release_rx.recv().ok();
        });

        let while_alive = seen_rx.recv().expect("worker died");
        assert!(while_alive >= 2);
        release_tx.send(()).ok();
        handle.join().expect("worker panicked");
    }
}
