//! An embedded, conservative, copying garbage collector.
//!
//! `flip-gc` manages a two-space heap inside a host process. Application
//! code allocates variable-sized, arbitrarily-aligned objects; unreferenced
//! objects are reclaimed by walking the process's roots (data segments and
//! live thread stacks) and forwarding survivors into a fresh half-space.
//!
//! # Fat pointers
//!
//! Managed pointers are two-word [`FatPtr`] values: a constant header word
//! plus a pointer word tagged in its top byte. The pair acts as a signature
//! the conservative scanner can recognize on stacks and in static data, so
//! no precise stack maps are needed. A coincidental match merely pins its
//! target; it can never corrupt the heap, because forwarding only follows
//! pointers that land in a managed half-space and still have metadata.
//!
//! # Quick start
//!
//! ```no_run
//! use flip_gc::{collect, make_safe};
//!
//! let x = make_safe(42i64)?;
//! assert_eq!(*x, 42);
//!
//! let _promoted = collect().wait(); // survivors move; handles follow automatically
//! assert_eq!(*x, 42);
//! # Ok::<(), flip_gc::AllocError>(())
//! ```
//!
//! # Policies
//!
//! [`CopyingCollector`] is generic over a [`LockingPolicy`] — [`Serial`]
//! runs collections inline on the calling thread, [`Concurrent`] on a
//! dedicated worker with mutex-guarded internals — and over a
//! [`GenerationPolicy`] deciding whether long-lived survivors are promoted
//! out of the managed heap.
//!
//! # Limitations
//!
//! Global roots are discovered once at startup; libraries loaded afterwards
//! are not scanned. Objects are reclaimed without running destructors. The
//! host must not hide pointers through arithmetic that strips the tag byte.

#![warn(missing_docs)]

mod atomic_copy;
mod collect;
mod error;
mod generation;
mod global;
mod heap;
mod metrics;
mod policy;
pub mod ptr;
pub mod roots;
mod safe_ptr;
pub mod stack;
mod task;
mod tracing;

pub use atomic_copy::seq_cst_copy;
pub use error::{AllocError, IndexOutOfRange};
pub use generation::{AgePromotion, GenerationPolicy, NoPromotion};
pub use global::{alloc, collect, default_collector, DEFAULT_HEAP_SIZE};
pub use heap::{CollectorState, CopyingCollector, MetaData, SpaceNum};
pub use metrics::{last_gc_metrics, GcMetrics};
pub use policy::{CollectHandle, Concurrent, LockingPolicy, PromotedList, Serial};
pub use ptr::{FatPtr, GcPtr};
pub use roots::{GcRoots, RootSlot};
pub use safe_ptr::{make_safe, make_safe_array, SafeArray, SafePtr};
pub use task::TaskHandle;

pub use sys_pages::{page_size, page_size_ceil};
