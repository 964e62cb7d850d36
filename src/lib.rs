//! Work-stealing fork/join task scheduler for ray-tracing kernels.
//!
//! Divide-and-conquer workloads (BVH builds, parallel loops, reductions)
//! spawn tasks onto per-thread bounded deques; the owning thread drains
//! its deque LIFO while idle threads steal the oldest work from the left
//! end. A fixed pool of OS threads services any number of scheduler
//! instances in FIFO order, and a thread that would otherwise block on a
//! subtask instead helps drain outstanding work, so every thread is
//! always either executing or stealing.
//!
//! ```no_run
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use std::sync::Arc;
//!
//! rayweft::create(0, false).unwrap();
//!
//! let total = Arc::new(AtomicU64::new(0));
//! let cell = total.clone();
//! rayweft::instance()
//!     .spawn_root(move || {
//!         cell.fetch_add(42, Ordering::Relaxed);
//!         Ok(())
//!     })
//!     .unwrap();
//! assert_eq!(total.load(Ordering::Relaxed), 42);
//! ```

mod builder;
pub use builder::Builder;

mod context;
pub use context::instance;

mod errors;
pub use errors::CancelError;

mod scheduler;
pub use scheduler::{Handle, Scheduler};

mod task;

mod utils;

use crate::scheduler::pool;
use anyhow::Result;

/// Initializes the process-wide thread pool. Idempotent: a second call
/// adjusts the thread count. `num_threads == 0` selects the logical CPU
/// count; `set_affinity` pins worker N to CPU N.
pub fn create(num_threads: usize, set_affinity: bool) -> Result<()> {
    Builder::new()
        .num_threads(num_threads)
        .set_affinity(set_affinity)
        .install()
}

/// Tears the pool down, joining all OS threads.
pub fn destroy() {
    pool::destroy();
}

/// Spins the pool's OS threads up, creating the pool with defaults if
/// [`create`] was never called.
pub fn start_threads() -> Result<()> {
    pool::start_threads()
}

/// Resizes the pool online. Newly spawned threads pick up work
/// immediately; excess threads exit once their current scheduler drains.
pub fn set_num_threads(num_threads: usize, start_now: bool) -> Result<()> {
    pool::resize(num_threads, start_now)
}

/// Registers a scheduler with the pool; parked workers wake to serve it.
pub fn add_scheduler(scheduler: &Handle) {
    pool::add_scheduler(scheduler);
}

/// Deregisters a scheduler from the pool.
pub fn remove_scheduler(scheduler: &Handle) {
    pool::remove_scheduler(scheduler);
}

/// Dense worker index of the calling thread; 0 when not attached.
pub fn thread_index() -> usize {
    context::current_worker().map(|w| w.index()).unwrap_or(0)
}

/// Number of threads the process-wide pool is configured for.
pub fn thread_count() -> usize {
    pool::size()
}

/// Spawns `closure` as a child of the currently executing task. `size`
/// is a hint for the approximate amount of work, used by thieves to skip
/// drained victims. Outside a task this falls back to running the
/// closure as a root task on the per-thread default scheduler, returning
/// once it (and everything it spawned) completed.
pub fn spawn<F>(size: usize, closure: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    match context::current_worker() {
        Some(worker) => {
            let parent = worker.current().map(|task| task.inner);
            worker.queue().push_spawned(Box::new(closure), parent, size);
            Ok(())
        }
        None => instance().spawn_root(closure),
    }
}

/// Drains every task the current task has spawned, executing them (and
/// helping with stolen ones) before returning. Returns `false` iff the
/// scheduler was cancelled by a failing task. Outside a task this is a
/// no-op returning `true`.
pub fn wait() -> bool {
    let worker = match context::current_worker() {
        Some(worker) => worker,
        None => return true,
    };
    let wait_for = worker.current();
    while worker.queue().execute_local(&worker, wait_for.as_ref()) {}
    worker.scheduler().cancelled().is_none()
}
