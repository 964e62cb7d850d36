use crate::scheduler::worker::Worker;
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicIsize, AtomicU8, Ordering};
use std::sync::Arc;

/// Type-erased task body. Runs exactly once; a failing or panicking body
/// cancels the owning scheduler.
pub(crate) type TaskFn = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

const DONE: u8 = 0;
const INITIALIZED: u8 = 1;

/// State shared by every deque record of one logical task. A stolen copy
/// and its origin point at the same inner, so the one-shot claim below is
/// what guarantees the closure executes exactly once.
pub(crate) struct TaskInner {
    /// INITIALIZED -> DONE, won by exactly one runner.
    state: AtomicU8,

    /// 1 + number of spawned children; the task is complete at 0.
    dependencies: AtomicIsize,

    /// Back link to the spawning task. Children never point down, so the
    /// Arc cannot form a cycle.
    parent: Option<Arc<TaskInner>>,

    /// Taken by the claim winner.
    closure: Mutex<Option<TaskFn>>,

    /// Approximate work size; thieves use it to skip empty victims.
    size: usize,
}

impl TaskInner {
    fn new(closure: TaskFn, parent: Option<Arc<TaskInner>>, size: usize) -> Self {
        Self {
            state: AtomicU8::new(INITIALIZED),
            dependencies: AtomicIsize::new(1),
            parent,
            closure: Mutex::new(Some(closure)),
            // A zero hint would read as "empty" to thieves probing the
            // left end and starve the victim.
            size: size.max(1),
        }
    }

    pub(crate) fn add_dependencies(&self, delta: isize) {
        self.dependencies.fetch_add(delta, Ordering::AcqRel);
    }

    pub(crate) fn dependencies(&self) -> isize {
        self.dependencies.load(Ordering::Acquire)
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Acquire) == INITIALIZED
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    fn try_claim(&self) -> bool {
        self.state
            .compare_exchange(INITIALIZED, DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// A deque record: a cheap handle onto a task plus the owner's arena
/// cursor at spawn time. `stack_ptr` is `None` on stolen copies, which
/// must not roll back the thief's arena.
#[derive(Clone)]
pub(crate) struct Task {
    pub(crate) inner: Arc<TaskInner>,
    pub(crate) stack_ptr: Option<usize>,
}

impl Task {
    /// Allocates a fresh task and charges the parent's dependency count
    /// for it.
    pub(crate) fn new(
        closure: TaskFn,
        parent: Option<Arc<TaskInner>>,
        stack_ptr: Option<usize>,
        size: usize,
    ) -> Self {
        if let Some(parent) = &parent {
            parent.add_dependencies(1);
        }
        Self {
            inner: Arc::new(TaskInner::new(closure, parent, size)),
            stack_ptr,
        }
    }

    /// Handle onto the same task for a thief's deque.
    pub(crate) fn stolen_copy(&self) -> Task {
        Task {
            inner: Arc::clone(&self.inner),
            stack_ptr: None,
        }
    }

    pub(crate) fn same_task(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Runs this record on `worker`.
    ///
    /// The claim winner executes the closure, releases its own dependency
    /// unit and, once the subtree has drained, notifies the parent. A
    /// record that loses the claim (its task was stolen, or the stolen
    /// copy raced us) still helps out until the dependency count reaches
    /// zero, so an owner popping a hollow record cannot return before the
    /// stolen work has finished.
    pub(crate) fn run(&self, worker: &Worker) {
        let winner = self.inner.try_claim();
        if winner {
            let closure = self.inner.closure.lock().take();
            let prev = worker.swap_current(Some(self.clone()));

            // A recorded failure turns the rest of the drain into empty
            // executions.
            if worker.scheduler().cancelled().is_none() {
                if let Some(closure) = closure {
                    match panic::catch_unwind(AssertUnwindSafe(closure)) {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => worker.scheduler().cancel(err),
                        Err(payload) => worker
                            .scheduler()
                            .cancel(anyhow!("task panicked: {}", panic_message(&payload))),
                    }
                }
            }

            worker.swap_current(prev);
            self.inner.add_dependencies(-1);
        }

        // Cooperative wait for spawned children: drain the local deque up
        // to this record, stealing when it runs dry.
        worker.steal_loop(
            || self.inner.dependencies() > 0,
            || while worker.queue().execute_local(worker, Some(self)) {},
        );

        if winner {
            if let Some(parent) = &self.inner.parent {
                parent.add_dependencies(-1);
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "opaque panic payload"
    }
}
