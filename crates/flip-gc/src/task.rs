//! Single-consumer worker thread and one-shot result handles.
//!
//! The concurrent locking policy owns one [`Worker`]; the trigger logic
//! guarantees at most one collection is ever queued at a time, so the FIFO
//! never grows beyond a handful of entries.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};

/// A cloneable one-shot holding the result of a scheduled task.
///
/// `wait` blocks until the task publishes its result; every clone observes
/// the same value.
pub struct TaskHandle<R> {
    inner: Arc<HandleInner<R>>,
}

struct HandleInner<R> {
    slot: Mutex<Option<R>>,
    ready: Condvar,
}

impl<R: Clone> TaskHandle<R> {
    /// A handle with no result yet.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                slot: Mutex::new(None),
                ready: Condvar::new(),
            }),
        }
    }

    /// A handle that is already complete, for tasks that ran inline.
    #[must_use]
    pub fn ready(value: R) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                slot: Mutex::new(Some(value)),
                ready: Condvar::new(),
            }),
        }
    }

    /// True once the result has been published.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.slot.lock().is_some()
    }

    /// Blocks until the result is available and returns a copy of it.
    #[must_use]
    pub fn wait(&self) -> R {
        let mut slot = self.inner.slot.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            self.inner.ready.wait(&mut slot);
        }
    }

    /// Publishes the result and wakes every waiter.
    pub(crate) fn complete(&self, value: R) {
        let mut slot = self.inner.slot.lock();
        debug_assert!(slot.is_none(), "task completed twice");
        *slot = Some(value);
        self.inner.ready.notify_all();
    }
}

impl<R> Clone for TaskHandle<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

type Job<R> = Box<dyn FnOnce() -> R + Send>;

enum Msg<R> {
    Run(Job<R>, TaskHandle<R>),
    Stop,
}

/// A dedicated thread draining a FIFO of closures, one at a time.
///
/// On drop the worker receives a stop message queued behind any pending
/// work, so every handle handed out before teardown still completes.
pub struct Worker<R> {
    sender: Sender<Msg<R>>,
    thread: Option<JoinHandle<()>>,
}

impl<R: Clone + Send + 'static> Worker<R> {
    /// Spawns the worker thread.
    #[must_use]
    pub fn new(name: &str) -> Self {
        let (sender, receiver) = unbounded::<Msg<R>>();
        let thread = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                while let Ok(msg) = receiver.recv() {
                    match msg {
                        Msg::Run(job, handle) => handle.complete(job()),
                        Msg::Stop => break,
                    }
                }
            })
            .expect("failed to spawn worker thread");
        Self {
            sender,
            thread: Some(thread),
        }
    }

    /// Enqueues a closure and returns a handle to its eventual result.
    pub fn push_work(&self, job: Job<R>) -> TaskHandle<R> {
        let handle = TaskHandle::pending();
        // A send can only fail after teardown, when nobody can observe the
        // handle anyway.
        let _ = self.sender.send(Msg::Run(job, handle.clone()));
        handle
    }
}

impl<R> Drop for Worker<R> {
    fn drop(&mut self) {
        let _ = self.sender.send(Msg::Stop);
        if let Some(thread) = self.thread.take() {
            // The last owner of the queue may be a job running on the worker
            // itself; joining from there would wait on the current thread.
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}
