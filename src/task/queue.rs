use crate::scheduler::worker::Worker;
use crate::task::arena::TaskArena;
use crate::task::task::{Task, TaskFn, TaskInner};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Upper bound on in-flight tasks per worker deque. Fixed so stealing
/// works against stable slot addresses and the hot path never allocates.
pub(crate) const TASK_STACK_SIZE: usize = 1024;

/// Bounded per-thread deque of tasks.
///
/// The owning thread pushes and pops on the right end (LIFO, so freshly
/// spawned work stays cache-hot); thieves take the oldest record from the
/// left. Only the owner writes `right`; thieves advance `left` with a
/// fetch-add and treat a failed slot copy as authoritative. The slot
/// mutexes serialize a thief's copy against the owner's push/pop of the
/// same slot; publication order is carried by the two indices.
pub(crate) struct TaskQueue {
    /// Next index a thief may take. May transiently overshoot `right`;
    /// the owner clamps it back while popping.
    left: CachePadded<AtomicUsize>,

    /// One past the owner's last push.
    right: CachePadded<AtomicUsize>,

    slots: Box<[Mutex<Option<Task>>]>,

    /// Scoped keep-alive storage behind `Task::stack_ptr`; owner-only.
    arena: Mutex<TaskArena>,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        let slots = (0..TASK_STACK_SIZE)
            .map(|_| Mutex::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            left: CachePadded::new(AtomicUsize::new(0)),
            right: CachePadded::new(AtomicUsize::new(0)),
            slots,
            arena: Mutex::new(TaskArena::new()),
        }
    }

    /// Owner-side spawn: allocate the record, remember the arena cursor,
    /// and publish it on the right end.
    pub(crate) fn push_spawned(
        &self,
        closure: TaskFn,
        parent: Option<Arc<TaskInner>>,
        size: usize,
    ) {
        let right = self.checked_right();
        let task = {
            let mut arena = self.arena.lock();
            let task = Task::new(closure, parent, Some(arena.mark()), size);
            arena.retain(task.clone());
            task
        };
        *self.slots[right].lock() = Some(task);
        self.right.store(right + 1, Ordering::Release);
    }

    /// Thief-side push of a record stolen from another deque.
    fn push_stolen(&self, task: Task) {
        let right = self.checked_right();
        *self.slots[right].lock() = Some(task);
        self.right.store(right + 1, Ordering::Release);
    }

    fn checked_right(&self) -> usize {
        let right = self.right.load(Ordering::Relaxed);
        if right >= self.slots.len() {
            panic!(
                "task deque overflow: {} tasks in flight on one worker",
                self.slots.len()
            );
        }
        right
    }

    /// Runs the owner's newest task and pops it.
    ///
    /// Stops without running anything when the deque is empty or the top
    /// record is `wait_for`, the task the owner is currently inside of and
    /// must not re-enter. Returns whether the deque still has work.
    pub(crate) fn execute_local(&self, worker: &Worker, wait_for: Option<&Task>) -> bool {
        let right = self.right.load(Ordering::Relaxed);
        if right == 0 {
            return false;
        }

        let task = self.slots[right - 1]
            .lock()
            .clone()
            .expect("deque slot below right is occupied");
        if let Some(wait_for) = wait_for {
            if task.same_task(wait_for) {
                return false;
            }
        }

        task.run(worker);

        // `run` waits for the task's subtree, so the top of the deque must
        // be back where it started; anything else means a task spawned
        // sub-work and returned without waiting for it.
        if self.right.load(Ordering::Relaxed) != right {
            panic!("spawned subtasks must be waited for before their task returns");
        }

        // Pop, then roll the scoped arena back to the spawn point.
        self.slots[right - 1].lock().take();
        let right = right - 1;
        self.right.store(right, Ordering::Release);
        if let Some(mark) = task.stack_ptr {
            self.arena.lock().release(mark);
        }

        // An overshooting thief index is clamped here: left > right means
        // no thief holds a live claim on these slots.
        if self.left.load(Ordering::Acquire) >= right {
            self.left.store(right, Ordering::Release);
        }

        right != 0
    }

    /// Thief-side: take the oldest record and copy it into `thief`'s own
    /// deque. The fetch-add may overshoot when racing the owner's pops;
    /// bailing out is fine because the owner clamps `left` back.
    pub(crate) fn steal(&self, thief: &Worker) -> bool {
        let left = self.left.load(Ordering::Acquire);
        if left >= self.right.load(Ordering::Acquire) {
            return false;
        }

        let left = self.left.fetch_add(1, Ordering::AcqRel);
        if left >= self.right.load(Ordering::Acquire) {
            return false;
        }

        let stolen = match self.slots[left].try_lock() {
            Some(slot) => match &*slot {
                Some(task) if task.inner.is_initialized() => task.stolen_copy(),
                _ => return false,
            },
            None => return false,
        };

        thief.queue().push_stolen(stolen);
        true
    }

    /// Size hint of the record a thief would take next; 0 when empty.
    /// Lets thieves skip drained victims without touching their slots.
    pub(crate) fn task_size_at_left(&self) -> usize {
        let left = self.left.load(Ordering::Acquire);
        if left >= self.right.load(Ordering::Acquire) {
            return 0;
        }
        match self.slots[left].try_lock() {
            Some(slot) => slot.as_ref().map(|task| task.inner.size()).unwrap_or(0),
            None => 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.right.load(Ordering::Acquire) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use parking_lot::Mutex;

    fn scratch_worker(index: usize) -> Worker {
        Worker::new(index, Scheduler::new().into_handle())
    }

    fn push_tagged(queue: &TaskQueue, log: &Arc<Mutex<Vec<usize>>>, tag: usize, size: usize) {
        let log = Arc::clone(log);
        queue.push_spawned(
            Box::new(move || {
                log.lock().push(tag);
                Ok(())
            }),
            None,
            size,
        );
    }

    #[test]
    fn owner_drains_lifo() {
        let worker = scratch_worker(0);
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3 {
            push_tagged(worker.queue(), &log, tag, 1);
        }
        while worker.queue().execute_local(&worker, None) {}

        assert_eq!(*log.lock(), vec![2, 1, 0]);
        assert!(worker.queue().is_empty());
    }

    #[test]
    fn thief_takes_the_oldest_record() {
        let scheduler = Scheduler::new().into_handle();
        let victim = Worker::new(0, scheduler.clone());
        let thief = Worker::new(1, scheduler);
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3 {
            push_tagged(victim.queue(), &log, tag, tag + 1);
        }

        assert_eq!(victim.queue().task_size_at_left(), 1);
        assert!(victim.queue().steal(&thief));
        while thief.queue().execute_local(&thief, None) {}

        // The oldest record went to the thief; the victim keeps the rest.
        assert_eq!(*log.lock(), vec![0]);
        assert_eq!(victim.queue().task_size_at_left(), 2);
    }

    #[test]
    fn stolen_records_are_hollow_for_the_owner() {
        let scheduler = Scheduler::new().into_handle();
        let victim = Worker::new(0, scheduler.clone());
        let thief = Worker::new(1, scheduler);
        let log = Arc::new(Mutex::new(Vec::new()));

        push_tagged(victim.queue(), &log, 7, 1);
        assert!(victim.queue().steal(&thief));
        while thief.queue().execute_local(&thief, None) {}

        // The owner still pops its record, but the closure already ran on
        // the thief.
        while victim.queue().execute_local(&victim, None) {}
        assert_eq!(*log.lock(), vec![7]);
    }

    #[test]
    fn steal_fails_on_an_empty_deque() {
        let scheduler = Scheduler::new().into_handle();
        let victim = Worker::new(0, scheduler.clone());
        let thief = Worker::new(1, scheduler);

        assert!(!victim.queue().steal(&thief));
        assert_eq!(victim.queue().task_size_at_left(), 0);
    }

    #[test]
    #[should_panic(expected = "task deque overflow")]
    fn overflowing_the_deque_is_fatal() {
        let queue = TaskQueue::new();
        for _ in 0..=TASK_STACK_SIZE {
            queue.push_spawned(Box::new(|| Ok(())), None, 1);
        }
    }
}
