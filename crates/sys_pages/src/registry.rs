//! Process-wide table of registered heap regions.
//!
//! The collector registers each half-space here. On Unix the first
//! registration also installs a SIGSEGV handler: a fault whose address lies
//! inside a registered heap (a stray access to a temporarily read-only page)
//! restores the page to read-write and resumes, while any other fault falls
//! through to the default action.
//!
//! The table is a fixed array of atomics so the signal handler can read it
//! without taking locks.

use std::sync::atomic::{AtomicUsize, Ordering};

const MAX_HEAPS: usize = 128;

struct HeapEntry {
    start: AtomicUsize,
    end: AtomicUsize,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_ENTRY: HeapEntry = HeapEntry {
    start: AtomicUsize::new(0),
    end: AtomicUsize::new(0),
};

static HEAPS: [HeapEntry; MAX_HEAPS] = [EMPTY_ENTRY; MAX_HEAPS];
static HEAP_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Registers a heap region so faults inside it can be resumed.
///
/// Re-registering an identical region is a no-op. The first call installs
/// the fault handler on platforms that support it.
///
/// # Panics
///
/// Panics if more than 128 distinct regions are registered.
pub fn register_heap(start: *const u8, len: usize) {
    let start = start as usize;
    let end = start + len;

    let count = HEAP_COUNT.load(Ordering::Acquire);
    for entry in HEAPS.iter().take(count) {
        if entry.start.load(Ordering::Relaxed) == start
            && entry.end.load(Ordering::Relaxed) == end
        {
            return;
        }
    }

    let idx = HEAP_COUNT.fetch_add(1, Ordering::AcqRel);
    assert!(idx < MAX_HEAPS, "too many registered heaps");
    // end is published after start; the handler reads count with Acquire and
    // tolerates a zero end (the range check just fails).
    HEAPS[idx].start.store(start, Ordering::Relaxed);
    HEAPS[idx].end.store(end, Ordering::Release);

    install_fault_handler();
}

/// Returns `true` if `addr` lies inside a registered heap region.
pub(crate) fn is_registered(addr: usize) -> bool {
    let count = HEAP_COUNT.load(Ordering::Acquire);
    for entry in HEAPS.iter().take(count) {
        let start = entry.start.load(Ordering::Relaxed);
        let end = entry.end.load(Ordering::Acquire);
        if addr >= start && addr < end {
            return true;
        }
    }
    false
}

#[cfg(unix)]
fn install_fault_handler() {
    use std::sync::Once;

    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| unsafe {
        let handler: unsafe extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            segv_handler;
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_sigaction = handler as usize;
        let ret = libc::sigaction(libc::SIGSEGV, &sa, std::ptr::null_mut());
        assert_eq!(ret, 0, "failed to install fault handler");
    });
}

#[cfg(not(unix))]
fn install_fault_handler() {}

/// Fault handler: unprotect-and-resume for registered heaps, default action
/// for everything else. Only syscalls are made here; the heap table is
/// lock-free.
#[cfg(unix)]
unsafe extern "C" fn segv_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    #[cfg(target_os = "linux")]
    let addr = unsafe { (*info).si_addr() as usize };
    #[cfg(not(target_os = "linux"))]
    let addr = unsafe { (*info).si_addr as usize };
    if is_registered(addr) {
        // The faulting access was a stray touch of a temporarily read-only
        // heap page. Restore write access and resume the interrupted
        // instruction.
        let page = addr & !(crate::page_size() - 1);
        unsafe {
            libc::mprotect(
                page as *mut libc::c_void,
                crate::page_size(),
                libc::PROT_READ | libc::PROT_WRITE,
            );
        }
        return;
    }

    // Not ours: restore the default handler and re-raise.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(sig, &sa, std::ptr::null_mut());
        libc::raise(sig);
    }
}
