use crate::scheduler::scheduler::Handle;
use crate::utils::sys::{num_logical_cpus, pin_current_thread};
use anyhow::{anyhow, Context as _, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Worker stacks match the deep recursion of divide-and-conquer kernels.
const WORKER_STACK_SIZE: usize = 4 * 1024 * 1024;

/// Resolved pool configuration, assembled by [`crate::Builder`].
pub(crate) struct PoolConfig {
    /// 0 selects the logical CPU count.
    pub(crate) num_threads: usize,
    /// Pin worker N to CPU N.
    pub(crate) set_affinity: bool,
    pub(crate) stack_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            set_affinity: false,
            stack_size: WORKER_STACK_SIZE,
        }
    }
}

/// The process-wide set of OS worker threads.
///
/// Idle workers park on the condition variable and wake to service the
/// front scheduler of the FIFO list. The pool can be resized online:
/// growing spawns threads, shrinking signals the highest-indexed threads
/// to exit and joins them.
pub(crate) struct ThreadPool {
    set_affinity: bool,
    stack_size: usize,

    /// Whether OS threads have been started at all.
    running: AtomicBool,

    /// Serializes resizes and teardown. Never held by code a worker needs
    /// to make progress, so joining threads under it cannot deadlock.
    resize_lock: Mutex<()>,

    state: Mutex<PoolState>,
    condvar: Condvar,

    /// Join handles for global thread indices 1..; index 0 is the user
    /// thread and never gets an OS thread.
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

struct PoolState {
    num_threads: usize,
    /// Threads with a global index at or above this exit their loop.
    num_threads_running: usize,
    /// FIFO service order: workers always pick the front scheduler.
    schedulers: VecDeque<Handle>,
}

impl ThreadPool {
    fn new(cfg: &PoolConfig) -> Self {
        Self {
            set_affinity: cfg.set_affinity,
            stack_size: cfg.stack_size,
            running: AtomicBool::new(false),
            resize_lock: Mutex::new(()),
            state: Mutex::new(PoolState {
                num_threads: 0,
                num_threads_running: 0,
                schedulers: VecDeque::new(),
            }),
            condvar: Condvar::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Updates the pool size; with `start_now` (or once running) this
    /// spawns missing threads and joins excess ones.
    fn set_num_threads(self: &Arc<Self>, num_threads: usize, start_now: bool) -> Result<()> {
        let _resize = self.resize_lock.lock();

        let num_threads = if num_threads == 0 {
            num_logical_cpus()
        } else {
            num_threads
        };
        self.state.lock().num_threads = num_threads;

        if !start_now && !self.running.load(Ordering::Acquire) {
            return Ok(());
        }
        self.running.store(true, Ordering::Release);

        let active = {
            let mut state = self.state.lock();
            let active = state.num_threads_running;
            state.num_threads_running = num_threads;
            active
        };
        self.condvar.notify_all();
        tracing::debug!(from = active, to = num_threads, "thread pool resized");

        for index in active.max(1)..num_threads {
            self.spawn_worker(index)?;
        }

        // Shrink: the highest-indexed threads observed the new bound and
        // exit once their current scheduler drains.
        let mut handles = self.handles.lock();
        while handles.len() > num_threads.saturating_sub(1) {
            let handle = handles.pop().expect("handle for running worker");
            handle
                .join()
                .map_err(|_| anyhow!("worker thread panicked during resize"))?;
        }
        Ok(())
    }

    fn start_threads(self: &Arc<Self>) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }
        let num_threads = self.state.lock().num_threads;
        self.set_num_threads(num_threads, true)
    }

    fn spawn_worker(self: &Arc<Self>, index: usize) -> Result<()> {
        let pool = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("rayweft-{index}"))
            .stack_size(self.stack_size)
            .spawn(move || {
                if pool.set_affinity {
                    if let Err(err) = pin_current_thread(index) {
                        tracing::debug!(index, %err, "cpu pinning failed");
                    }
                }
                pool.thread_loop(index);
            })
            .with_context(|| format!("failed to start worker thread {index}"))?;

        self.handles.lock().push(handle);
        Ok(())
    }

    /// Dispatch loop of one OS worker: park until a scheduler is attached
    /// (or shutdown), serve the front scheduler until it drains, repeat.
    fn thread_loop(&self, global_index: usize) {
        loop {
            let (scheduler, local_index) = {
                let mut state = self.state.lock();
                loop {
                    if global_index >= state.num_threads_running {
                        return;
                    }
                    if let Some(front) = state.schedulers.front().cloned() {
                        let local_index = front.alloc_thread_index();
                        break (front, local_index);
                    }
                    self.condvar.wait(&mut state);
                }
            };
            scheduler.thread_loop(local_index);
        }
    }

    fn add(&self, scheduler: &Handle) {
        self.state.lock().schedulers.push_back(scheduler.clone());
        self.condvar.notify_all();
    }

    fn remove(&self, scheduler: &Handle) {
        self.state
            .lock()
            .schedulers
            .retain(|other| !other.same(scheduler));
    }

    /// Signals every worker to exit and joins them. Idempotent.
    fn shutdown(&self) {
        self.state.lock().num_threads_running = 0;
        self.condvar.notify_all();

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                tracing::debug!("worker thread panicked during shutdown");
            }
        }
        self.running.store(false, Ordering::Release);
        tracing::debug!("thread pool shut down");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The singleton pool slot. `create` fills it, `destroy` empties it; the
/// per-thread scheduler/worker bindings live in `crate::context`.
static POOL: Mutex<Option<Arc<ThreadPool>>> = Mutex::new(None);

fn current() -> Option<Arc<ThreadPool>> {
    POOL.lock().clone()
}

/// Initializes the process-wide pool, or adjusts its thread count when it
/// already exists.
pub(crate) fn create(cfg: PoolConfig) -> Result<()> {
    let pool = {
        let mut slot = POOL.lock();
        if slot.is_none() {
            *slot = Some(Arc::new(ThreadPool::new(&cfg)));
        }
        slot.as_ref().map(Arc::clone).expect("pool initialized above")
    };
    // The slot lock is released before resizing: joining threads while
    // holding it would block workers that query the pool.
    pool.set_num_threads(cfg.num_threads, false)
}

/// Tears the pool down, joining all OS threads.
pub(crate) fn destroy() {
    let pool = POOL.lock().take();
    if let Some(pool) = pool {
        pool.shutdown();
    }
}

/// Spins the pool up lazily, creating it with defaults if `create` was
/// never called.
pub(crate) fn start_threads() -> Result<()> {
    let pool = match current() {
        Some(pool) => pool,
        None => {
            create(PoolConfig::default())?;
            current().ok_or_else(|| anyhow!("thread pool was destroyed concurrently"))?
        }
    };
    pool.start_threads()
}

pub(crate) fn resize(num_threads: usize, start_now: bool) -> Result<()> {
    match current() {
        Some(pool) => pool.set_num_threads(num_threads, start_now),
        None => Err(anyhow!("thread pool is not initialized")),
    }
}

pub(crate) fn add_scheduler(scheduler: &Handle) {
    match current() {
        Some(pool) => pool.add(scheduler),
        None => panic!("scheduler registered after thread pool shutdown"),
    }
}

pub(crate) fn remove_scheduler(scheduler: &Handle) {
    match current() {
        Some(pool) => pool.remove(scheduler),
        None => panic!("scheduler deregistered after thread pool shutdown"),
    }
}

/// Number of threads the pool is configured for; 0 when no pool exists.
pub(crate) fn size() -> usize {
    current().map(|pool| pool.state.lock().num_threads).unwrap_or(0)
}
