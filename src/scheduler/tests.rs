use super::scheduler::{Handle, Scheduler};
use super::worker::Worker;
use crate as rayweft;
use crate::errors::CancelError;
use crate::utils::thread::get_current_thread_name;
use anyhow::{anyhow, Result};
use parking_lot::{Mutex, RwLock};
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

assert_impl_all!(Scheduler: Send, Sync);
assert_impl_all!(Handle: Send, Sync, Clone);
assert_impl_all!(Worker: Send, Sync);

/// The pool is process-global and Rust tests share one process: normal
/// tests hold the gate shared, tests that resize or tear the pool down
/// hold it exclusively.
static POOL_GATE: RwLock<()> = RwLock::new(());

fn ensure_pool() {
    rayweft::create(0, false).expect("pool creation is idempotent");
}

const SUM_CUTOFF: u64 = 16;

/// Recursive fork/join sum over [lo, hi).
fn parallel_sum(lo: u64, hi: u64, total: &Arc<AtomicU64>) {
    if hi - lo <= SUM_CUTOFF {
        total.fetch_add((lo..hi).sum::<u64>(), Ordering::Relaxed);
        return;
    }

    let mid = lo + (hi - lo) / 2;
    let low_half = Arc::clone(total);
    rayweft::spawn((mid - lo) as usize, move || {
        parallel_sum(lo, mid, &low_half);
        Ok(())
    })
    .expect("spawn low half");

    let high_half = Arc::clone(total);
    rayweft::spawn((hi - mid) as usize, move || {
        parallel_sum(mid, hi, &high_half);
        Ok(())
    })
    .expect("spawn high half");

    assert!(rayweft::wait());
}

fn run_sum(scheduler: &Handle, lo: u64, hi: u64) -> Result<u64> {
    let total = Arc::new(AtomicU64::new(0));
    let cell = Arc::clone(&total);
    scheduler.spawn_root(move || {
        parallel_sum(lo, hi, &cell);
        Ok(())
    })?;
    Ok(total.load(Ordering::Relaxed))
}

#[test]
fn test_single_root_task() -> Result<()> {
    let _gate = POOL_GATE.read();
    ensure_pool();

    let scheduler = Scheduler::new().into_handle();
    let result = Arc::new(AtomicUsize::new(0));
    let cell = Arc::clone(&result);
    scheduler.spawn_root(move || {
        cell.store(42, Ordering::Relaxed);
        Ok(())
    })?;

    assert_eq!(result.load(Ordering::Relaxed), 42);
    assert_eq!(scheduler.any_tasks_running.load(Ordering::Acquire), 0);
    assert_eq!(scheduler.thread_counter.load(Ordering::Acquire), 0);
    Ok(())
}

#[rstest]
#[case::small(1, 101, 5050)]
#[case::classic(1, 1001, 500_500)]
#[case::offset(500, 1501, 1_001_000)]
fn test_fork_join_sum(#[case] lo: u64, #[case] hi: u64, #[case] expected: u64) -> Result<()> {
    let _gate = POOL_GATE.read();
    ensure_pool();

    let scheduler = Scheduler::new().into_handle();
    assert_eq!(run_sum(&scheduler, lo, hi)?, expected);
    Ok(())
}

#[test]
fn test_nested_wait() -> Result<()> {
    let _gate = POOL_GATE.read();
    ensure_pool();

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let scheduler = Scheduler::new().into_handle();

    let log = Arc::clone(&order);
    scheduler.spawn_root(move || {
        // A spawns B and C; B spawns D; each waits for its own spawns.
        let b_log = Arc::clone(&log);
        rayweft::spawn(2, move || {
            let d_log = Arc::clone(&b_log);
            rayweft::spawn(1, move || {
                d_log.lock().push("D");
                Ok(())
            })?;
            assert!(rayweft::wait());
            b_log.lock().push("B");
            Ok(())
        })?;

        let c_log = Arc::clone(&log);
        rayweft::spawn(1, move || {
            c_log.lock().push("C");
            Ok(())
        })?;

        assert!(rayweft::wait());
        log.lock().push("A");
        Ok(())
    })?;

    let order = order.lock();
    assert_eq!(order.len(), 4);
    assert_eq!(*order.last().expect("non-empty"), "A");
    let d_at = order.iter().position(|s| *s == "D").expect("D completed");
    let b_at = order.iter().position(|s| *s == "B").expect("B completed");
    assert!(d_at < b_at, "B waits on D");
    Ok(())
}

#[test]
fn test_task_error_cancels_the_scheduler() -> Result<()> {
    let _gate = POOL_GATE.read();
    ensure_pool();

    let scheduler = Scheduler::new().into_handle();
    let executed = Arc::new(AtomicUsize::new(0));
    let wait_saw_cancel = Arc::new(AtomicBool::new(false));

    let counter = Arc::clone(&executed);
    let cancelled = Arc::clone(&wait_saw_cancel);
    let result = scheduler.spawn_root(move || {
        for i in 0..1000 {
            let counter = Arc::clone(&counter);
            rayweft::spawn(1, move || {
                if i == 137 {
                    return Err(anyhow!("boom in task 137"));
                }
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })?;
        }
        cancelled.store(!rayweft::wait(), Ordering::Relaxed);
        Ok(())
    });

    let err = result.expect_err("the failure propagates to spawn_root");
    let cancel = err
        .downcast_ref::<CancelError>()
        .expect("the failure is a cancellation");
    assert!(cancel.cause().to_string().contains("boom in task 137"));
    assert!(wait_saw_cancel.load(Ordering::Relaxed));

    // Cancellation still drains to quiescence.
    assert_eq!(scheduler.any_tasks_running.load(Ordering::Acquire), 0);
    assert_eq!(scheduler.thread_counter.load(Ordering::Acquire), 0);

    // A fresh scheduler afterwards is unaffected.
    let fresh = Scheduler::new().into_handle();
    assert_eq!(run_sum(&fresh, 1, 1001)?, 500_500);
    Ok(())
}

#[test]
fn test_task_panic_is_captured() {
    let _gate = POOL_GATE.read();
    ensure_pool();

    let scheduler = Scheduler::new().into_handle();
    let result = scheduler.spawn_root(|| {
        rayweft::spawn(1, || panic!("kaboom"))?;
        rayweft::wait();
        Ok(())
    });

    let err = result.expect_err("the panic propagates as an error");
    assert!(err.downcast_ref::<CancelError>().is_some());
    assert!(err.to_string().contains("kaboom"));
}

#[test]
fn test_pool_resize_and_worker_names() -> Result<()> {
    let _gate = POOL_GATE.write();
    ensure_pool();

    for num_threads in [1, 2, 8] {
        rayweft::set_num_threads(num_threads, true)?;
        assert_eq!(rayweft::thread_count(), num_threads);

        // Schedulers size their thread directory from the pool, so they
        // must be created after the resize.
        let scheduler = Scheduler::new().into_handle();
        assert_eq!(run_sum(&scheduler, 1, 1001)?, 500_500);
    }

    // Every thread that executes tasks is either the caller or a named
    // pool worker.
    let caller = get_current_thread_name()?;
    let names: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let scheduler = Scheduler::new().into_handle();
    let seen = Arc::clone(&names);
    scheduler.spawn_root(move || {
        for _ in 0..256 {
            let seen = Arc::clone(&seen);
            rayweft::spawn(1, move || {
                seen.lock().insert(get_current_thread_name()?);
                Ok(())
            })?;
        }
        rayweft::wait();
        Ok(())
    })?;
    for name in names.lock().iter() {
        assert!(
            name == &caller || name.starts_with("rayweft-"),
            "unexpected worker name: {name}"
        );
    }

    // Back to the logical CPU count for the rest of the suite.
    rayweft::set_num_threads(0, true)?;
    Ok(())
}

#[test]
fn test_two_schedulers_share_the_pool() -> Result<()> {
    let _gate = POOL_GATE.read();
    ensure_pool();

    let a = Scheduler::new().into_handle();
    let b = Scheduler::new().into_handle();

    let helper = thread::spawn(move || run_sum(&b, 1, 1001));
    let a_total = run_sum(&a, 1, 501)?;
    let b_total = helper.join().expect("helper thread panicked")?;

    assert_eq!(a_total, 125_250);
    assert_eq!(b_total, 500_500);
    Ok(())
}

#[test]
fn test_join_participates_in_the_run() -> Result<()> {
    let _gate = POOL_GATE.read();
    ensure_pool();

    let scheduler = Scheduler::new().into_handle();
    let joiner = {
        let scheduler = scheduler.clone();
        thread::spawn(move || scheduler.join())
    };

    assert_eq!(run_sum(&scheduler, 1, 1001)?, 500_500);
    joiner.join().expect("joiner thread panicked")?;
    Ok(())
}

#[test]
fn test_spawn_through_the_handle() -> Result<()> {
    let _gate = POOL_GATE.read();
    ensure_pool();

    let scheduler = Scheduler::new().into_handle();
    let count = Arc::new(AtomicUsize::new(0));

    let handle = scheduler.clone();
    let counter = Arc::clone(&count);
    scheduler.spawn_root(move || {
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            handle.spawn(1, move || {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })?;
        }
        assert!(rayweft::wait());
        Ok(())
    })?;

    assert_eq!(count.load(Ordering::Relaxed), 8);
    Ok(())
}

#[test]
fn test_scheduler_reuse_after_reset() -> Result<()> {
    let _gate = POOL_GATE.read();
    ensure_pool();

    let scheduler = Scheduler::new().into_handle();
    assert_eq!(run_sum(&scheduler, 1, 101)?, 5050);

    scheduler.reset();
    assert_eq!(run_sum(&scheduler, 1, 1001)?, 500_500);
    Ok(())
}

#[test]
fn test_spawn_outside_a_task_runs_to_completion() -> Result<()> {
    let _gate = POOL_GATE.read();
    ensure_pool();

    let cell = Arc::new(AtomicUsize::new(0));
    let result = Arc::clone(&cell);
    rayweft::spawn(1, move || {
        result.store(7, Ordering::Relaxed);
        Ok(())
    })?;

    assert_eq!(cell.load(Ordering::Relaxed), 7);
    Ok(())
}

#[test]
fn test_wait_outside_a_task_is_a_noop() {
    let _gate = POOL_GATE.read();
    assert!(rayweft::wait());
    assert_eq!(rayweft::thread_index(), 0);
}

#[test]
fn test_destroy_and_recreate() -> Result<()> {
    let _gate = POOL_GATE.write();
    ensure_pool();

    rayweft::destroy();
    assert_eq!(rayweft::thread_count(), 0);

    // Registration against a destroyed pool is a structural bug.
    let scheduler = Scheduler::new().into_handle();
    let panicked =
        std::panic::catch_unwind(AssertUnwindSafe(|| rayweft::add_scheduler(&scheduler)));
    assert!(panicked.is_err());

    ensure_pool();
    let fresh = Scheduler::new().into_handle();
    assert_eq!(run_sum(&fresh, 1, 101)?, 5050);
    Ok(())
}
