use crate::context;
use crate::errors::CancelError;
use crate::scheduler::pool;
use crate::scheduler::worker::Worker;
use crate::utils::sys::{num_logical_cpus, pause_cpu};
use anyhow::Result;
use parking_lot::{Condvar, Mutex, RwLock};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

/// A scheduler instance: one root task graph plus the directory of
/// threads currently driving it. Threads attach dynamically (pool workers
/// through the thread pool's dispatch loop, user threads through `join`)
/// and every attached thread runs the same steal loop until the graph is
/// drained.
pub struct Scheduler {
    /// Directory of attached workers, indexed by dense thread index.
    /// Sized with 2x headroom because joining user threads and worker
    /// attach/detach churn consume indices beyond the pool size.
    pub(crate) thread_local: Box<[RwLock<Option<Arc<Worker>>>]>,

    /// Number of threads currently attached (post-increment allocator).
    pub(crate) thread_counter: AtomicUsize,

    /// Strictly positive while any attached thread is executing tasks;
    /// zero only at global quiescence.
    pub(crate) any_tasks_running: AtomicUsize,

    /// Signals parked `join` callers that a root task was published.
    pub(crate) has_root_task: AtomicBool,

    /// First failure from any task; first writer wins, never replaced.
    cancelling: OnceLock<CancelError>,

    /// Guards only the root-task handshake below.
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Scheduler {
    pub fn new() -> Self {
        let slots = 2 * num_logical_cpus().max(pool::size());
        let thread_local = (0..slots)
            .map(|_| RwLock::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            thread_local,
            thread_counter: AtomicUsize::new(0),
            any_tasks_running: AtomicUsize::new(0),
            has_root_task: AtomicBool::new(false),
            cancelling: OnceLock::new(),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    pub fn into_handle(self) -> Handle {
        Handle(Arc::new(self))
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable, shared reference to a [`Scheduler`]. The thread pool and
/// any external holder share ownership through it.
#[derive(Clone)]
pub struct Handle(Arc<Scheduler>);

impl Handle {
    pub(crate) fn same(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn alloc_thread_index(&self) -> usize {
        let index = self.thread_counter.fetch_add(1, Ordering::AcqRel);
        assert!(
            index < self.thread_local.len(),
            "scheduler thread directory exhausted ({} slots); \
             create schedulers after resizing the pool",
            self.thread_local.len()
        );
        index
    }

    pub(crate) fn active_threads(&self) -> usize {
        self.thread_counter.load(Ordering::Acquire)
    }

    /// Records the first failure; later ones are dropped.
    pub(crate) fn cancel(&self, err: anyhow::Error) {
        if self.cancelling.set(CancelError::new(err)).is_ok() {
            tracing::debug!("scheduler cancelled by task failure");
        }
    }

    pub(crate) fn cancelled(&self) -> Option<&CancelError> {
        self.cancelling.get()
    }

    /// Spawn a child of the currently executing task on this scheduler.
    /// Falls back to running `closure` as a root task when the calling
    /// thread is not attached here.
    pub fn spawn<F>(&self, size: usize, closure: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        match context::current_worker() {
            Some(worker) if worker.scheduler().same(self) => {
                let parent = worker.current().map(|task| task.inner);
                worker
                    .queue()
                    .push_spawned(Box::new(closure), parent, size);
                Ok(())
            }
            _ => self.spawn_root(closure),
        }
    }

    /// Publishes `closure` as the root task and drives this scheduler to
    /// quiescence from the calling thread; pool workers pitch in while it
    /// runs. Returns the first recorded failure, if any.
    pub fn spawn_root<F>(&self, closure: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        pool::start_threads()?;

        let index = self.alloc_thread_index();
        let worker = Arc::new(Worker::new(index, self.clone()));
        *self.thread_local[index].write() = Some(worker.clone());
        let prev = context::swap_worker(Some(worker.clone()));

        worker.queue().push_spawned(Box::new(closure), None, 1);
        {
            let _guard = self.mutex.lock();
            self.any_tasks_running.fetch_add(1, Ordering::AcqRel);
            self.has_root_task.store(true, Ordering::Release);
            self.condvar.notify_all();
        }
        pool::add_scheduler(self);

        while worker.queue().execute_local(&worker, None) {}
        self.any_tasks_running.fetch_sub(1, Ordering::AcqRel);
        pool::remove_scheduler(self);

        *self.thread_local[index].write() = None;
        context::swap_worker(prev);

        self.leave().map_or(Ok(()), |err| Err(err.into()))
    }

    /// Attach the calling thread to this scheduler until it drains. Parks
    /// until a root task exists, then participates like a pool worker.
    pub fn join(&self) -> Result<()> {
        let index = {
            let mut guard = self.mutex.lock();
            let index = self.alloc_thread_index();
            while !self.has_root_task.load(Ordering::Acquire) {
                self.condvar.wait(&mut guard);
            }
            index
        };
        self.thread_loop(index).map_or(Ok(()), |err| Err(err.into()))
    }

    /// Clears the root-task flag so a drained scheduler can be reused.
    pub fn reset(&self) {
        self.has_root_task.store(false, Ordering::Release);
    }

    /// Main loop of an attached thread: steal and drain while any work is
    /// outstanding anywhere on the scheduler. The increment/decrement
    /// bracket around the drain keeps `any_tasks_running` strictly
    /// positive as long as any thread is executing, so it reaches zero
    /// only at global quiescence.
    pub(crate) fn thread_loop(&self, index: usize) -> Option<CancelError> {
        let worker = Arc::new(Worker::new(index, self.clone()));
        *self.thread_local[index].write() = Some(worker.clone());
        let prev = context::swap_worker(Some(worker.clone()));
        tracing::trace!(index, "worker attached");

        while self.any_tasks_running.load(Ordering::Acquire) > 0 {
            worker.steal_loop(
                || self.any_tasks_running.load(Ordering::Acquire) > 0,
                || {
                    self.any_tasks_running.fetch_add(1, Ordering::AcqRel);
                    while worker.queue().execute_local(&worker, None) {}
                    self.any_tasks_running.fetch_sub(1, Ordering::AcqRel);
                },
            );
        }

        *self.thread_local[index].write() = None;
        context::swap_worker(prev);
        tracing::trace!(index, "worker detached");

        self.leave()
    }

    /// Detach epilogue: pick up the recorded failure, then wait for all
    /// peer threads to detach so the directory is fully quiesced before
    /// anyone returns to the caller.
    fn leave(&self) -> Option<CancelError> {
        let failure = self.cancelled().cloned();
        self.thread_counter.fetch_sub(1, Ordering::AcqRel);
        while self.thread_counter.load(Ordering::Acquire) > 0 {
            thread::yield_now();
        }
        failure
    }

    /// One rotating scan over the other attached workers, starting just
    /// past our own index. Victims with nothing at their left end are
    /// skipped without touching their slots.
    pub(crate) fn steal_from_other_threads(&self, thief: &Worker) -> bool {
        let own = thief.index();
        let count = self.thread_counter.load(Ordering::Acquire);

        for i in 1..count {
            pause_cpu(32);
            let mut victim = own + i;
            if victim >= count {
                victim -= count;
            }

            let slot = self.thread_local[victim].read();
            let other = match &*slot {
                Some(other) => other,
                None => continue,
            };
            if other.queue().task_size_at_left() == 0 {
                continue;
            }
            if other.queue().steal(thief) {
                return true;
            }
        }
        false
    }
}

#[doc(hidden)]
impl Deref for Handle {
    type Target = Scheduler;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
