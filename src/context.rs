use crate::scheduler::scheduler::{Handle, Scheduler};
use crate::scheduler::worker::Worker;
use std::cell::RefCell;
use std::sync::Arc;
use std::thread_local;

thread_local! {
    /// The worker currently attached on this thread, if any. Swapped on
    /// attach and restored on detach so nested code can always find "my
    /// deque" without plumbing.
    static CURRENT_WORKER: RefCell<Option<Arc<Worker>>> = const { RefCell::new(None) };

    /// Lazily-created per-thread default scheduler.
    static DEFAULT_SCHEDULER: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

pub(crate) fn swap_worker(worker: Option<Arc<Worker>>) -> Option<Arc<Worker>> {
    CURRENT_WORKER.with(|cell| cell.replace(worker))
}

pub(crate) fn current_worker() -> Option<Arc<Worker>> {
    CURRENT_WORKER.with(|cell| cell.borrow().clone())
}

/// The calling thread's default scheduler, created on first use. Clones
/// of the handle share the underlying scheduler.
pub fn instance() -> Handle {
    DEFAULT_SCHEDULER.with(|cell| {
        cell.borrow_mut()
            .get_or_insert_with(|| Scheduler::new().into_handle())
            .clone()
    })
}
