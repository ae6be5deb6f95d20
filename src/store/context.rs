//! SerialContext — a store session's private execution context.
//!
//! Work runs under a re-entrant lock, so at most one thread is inside the
//! context at a time while code already inside may call back in freely.
//! `perform` queues a task; the queue is drained immediately unless a commit
//! is holding it, in which case the task waits for [`SerialContext::release`].
//!
//! A task queued from inside a running task is picked up by the outer drain
//! loop once the current task returns, never nested inside it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Mutex, ReentrantMutex};

use super::traits::Task;

pub struct SerialContext {
    lock: ReentrantMutex<()>,
    queue: Mutex<VecDeque<Task>>,
    /// Number of in-flight commits holding the queue.
    holds: AtomicUsize,
    /// Only ever read or written with `lock` held.
    draining: AtomicBool,
}

impl SerialContext {
    pub fn new() -> Self {
        Self {
            lock: ReentrantMutex::new(()),
            queue: Mutex::new(VecDeque::new()),
            holds: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
        }
    }

    pub fn perform(&self, task: Task) {
        self.queue.lock().push_back(task);
        if self.holds.load(Ordering::Acquire) == 0 {
            self.drain();
        }
    }

    pub fn perform_and_wait<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock.lock();
        f()
    }

    /// Enter the context and keep queued tasks from running until the
    /// returned guard is released.
    pub fn hold(&self) -> Hold<'_> {
        let guard = self.lock.lock();
        self.holds.fetch_add(1, Ordering::AcqRel);
        Hold {
            context: self,
            _guard: guard,
        }
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    fn drain(&self) {
        let _guard = self.lock.lock();
        if self.draining.swap(true, Ordering::AcqRel) {
            // Re-entered from a running task; the outer loop picks it up.
            return;
        }
        let _reset = DrainReset(&self.draining);
        loop {
            if self.holds.load(Ordering::Acquire) > 0 {
                break;
            }
            let next = self.queue.lock().pop_front();
            match next {
                Some(task) => task(),
                None => break,
            }
        }
    }
}

impl Default for SerialContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps the context entered and the queue paused. Dropping it releases the
/// hold and drains whatever was queued meanwhile.
pub struct Hold<'a> {
    context: &'a SerialContext,
    _guard: parking_lot::ReentrantMutexGuard<'a, ()>,
}

impl Hold<'_> {
    pub fn release(self) {}
}

impl Drop for Hold<'_> {
    fn drop(&mut self) {
        if self.context.holds.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.context.drain();
        }
    }
}

struct DrainReset<'a>(&'a AtomicBool);

impl Drop for DrainReset<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
