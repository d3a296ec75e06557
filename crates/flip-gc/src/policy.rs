//! Locking policies.
//!
//! The collector is generic over a [`LockingPolicy`] chosen at construction.
//! [`Serial`] runs everything, collections included, on the calling thread
//! with plain-word counters and a pass-through lock; [`Concurrent`] guards
//! the shared tables with a mutex, uses true atomics for the cursors and the
//! space index, and runs collections on an owned worker thread.
//!
//! A serial collector is `!Sync` by construction (its counters are `Cell`s),
//! so the type system rules out sharing one across threads.

use std::cell::Cell;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::collect::run_collection;
use crate::generation::GenerationPolicy;
use crate::heap::{CollectorState, SpaceNum};
use crate::ptr::FatPtr;
use crate::roots::RootSlot;
use crate::task::{TaskHandle, Worker};

/// Objects promoted out of the managed heap by one collection.
pub type PromotedList = Vec<FatPtr>;

/// Completion handle for a scheduled collection.
pub type CollectHandle = TaskHandle<PromotedList>;

/// A bump cursor: a plain machine word under the serial policy, an atomic
/// under the concurrent one.
pub trait Counter: Default + Send {
    /// Reads the current value.
    fn load(&self) -> usize;
    /// Overwrites the value.
    fn store(&self, value: usize);
    /// Strong compare-and-swap; `Err` carries the observed value.
    fn compare_exchange(&self, current: usize, new: usize) -> Result<usize, usize>;
}

impl Counter for Cell<usize> {
    fn load(&self) -> usize {
        self.get()
    }

    fn store(&self, value: usize) {
        self.set(value);
    }

    fn compare_exchange(&self, current: usize, new: usize) -> Result<usize, usize> {
        let observed = self.get();
        if observed == current {
            self.set(new);
            Ok(observed)
        } else {
            Err(observed)
        }
    }
}

impl Counter for AtomicUsize {
    fn load(&self) -> usize {
        AtomicUsize::load(self, Ordering::SeqCst)
    }

    fn store(&self, value: usize) {
        AtomicUsize::store(self, value, Ordering::SeqCst);
    }

    fn compare_exchange(&self, current: usize, new: usize) -> Result<usize, usize> {
        AtomicUsize::compare_exchange(self, current, new, Ordering::SeqCst, Ordering::SeqCst)
    }
}

/// The one-bit active-space index, plain or atomic per policy.
pub trait SpaceFlag: Default + Send {
    /// Reads the current index.
    fn load(&self) -> u8;
    /// XORs `mask` in and returns the previous value.
    fn fetch_xor(&self, mask: u8) -> u8;
}

impl SpaceFlag for Cell<u8> {
    fn load(&self) -> u8 {
        self.get()
    }

    fn fetch_xor(&self, mask: u8) -> u8 {
        let old = self.get();
        self.set(old ^ mask);
        old
    }
}

impl SpaceFlag for AtomicU8 {
    fn load(&self) -> u8 {
        AtomicU8::load(self, Ordering::SeqCst)
    }

    fn fetch_xor(&self, mask: u8) -> u8 {
        AtomicU8::fetch_xor(self, mask, Ordering::SeqCst)
    }
}

/// How the collector serializes its critical sections and where it runs
/// collections.
pub trait LockingPolicy: Sized + Send + 'static {
    /// Bump-cursor representation.
    type Cursor: Counter;
    /// Active-space-index representation.
    type Flag: SpaceFlag;

    /// Builds the policy's own state (mutex, worker).
    fn new() -> Self;

    /// Runs `f` inside the collector's critical section.
    fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R;

    /// Runs a collection over `extra_roots` into `to_space`, either inline
    /// or on the policy's worker, returning its completion handle.
    fn schedule<G: GenerationPolicy>(
        state: &Arc<CollectorState<Self, G>>,
        to_space: SpaceNum,
        extra_roots: Vec<RootSlot>,
    ) -> CollectHandle;
}

/// Everything on the calling thread; the lock is a pass-through.
#[derive(Debug, Default)]
pub struct Serial;

impl LockingPolicy for Serial {
    type Cursor = Cell<usize>;
    type Flag = Cell<u8>;

    fn new() -> Self {
        Self
    }

    fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        f()
    }

    fn schedule<G: GenerationPolicy>(
        state: &Arc<CollectorState<Self, G>>,
        to_space: SpaceNum,
        extra_roots: Vec<RootSlot>,
    ) -> CollectHandle {
        CollectHandle::ready(run_collection(state, to_space, extra_roots))
    }
}

/// Mutex-guarded critical sections, atomic counters, and a dedicated
/// collection worker.
pub struct Concurrent {
    mutex: Mutex<()>,
    worker: Worker<PromotedList>,
}

impl LockingPolicy for Concurrent {
    type Cursor = AtomicUsize;
    type Flag = AtomicU8;

    fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            worker: Worker::new("flip-gc-collect"),
        }
    }

    fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.mutex.lock();
        f()
    }

    fn schedule<G: GenerationPolicy>(
        state: &Arc<CollectorState<Self, G>>,
        to_space: SpaceNum,
        extra_roots: Vec<RootSlot>,
    ) -> CollectHandle {
        let task_state = Arc::clone(state);
        state.policy().worker.push_work(Box::new(move || {
            run_collection(&task_state, to_space, extra_roots)
        }))
    }
}
