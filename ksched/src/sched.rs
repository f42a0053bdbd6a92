//! A minimal global executor.
//!
//! Tasks are plain boxed futures on a FIFO run queue. [`run`] drains the
//! queue until it is empty; [`run_all`] loops until every spawned task has
//! completed, which lets several host threads participate by calling it
//! concurrently.

use alloc::collections::TryReserveError;

use futures::task::ArcWake;
use lazy_static::lazy_static;
use {
    alloc::{boxed::Box, collections::vec_deque::VecDeque, sync::Arc},
    core::{
        future::Future,
        pin::Pin,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        task::Context,
    },
    spin::Mutex,
};

/// Executor holds a list of tasks to be processed
struct Executor {
    tasks: VecDeque<Arc<Task>>,
}

/// Task is our unit of execution and holds a future we are waiting on
struct Task {
    future: Mutex<Pin<Box<dyn Future<Output = ()> + Send + 'static>>>,
    /// Whether the task is currently on the run queue. Guards against
    /// double-enqueue when a waker fires while the task is being polled.
    queued: AtomicBool,
    done: AtomicBool,
}

/// Wake by rescheduling.
impl ArcWake for Task {
    fn wake_by_ref(t: &Arc<Self>) {
        if t.done.load(Ordering::Acquire) {
            return;
        }
        if !t.queued.swap(true, Ordering::AcqRel) {
            DEFAULT_EXECUTOR.lock().tasks.push_back(t.clone());
        }
    }
}

lazy_static! {
    static ref DEFAULT_EXECUTOR: Mutex<Executor> = Mutex::new(Executor {
        tasks: VecDeque::new(),
    });
}

/// Number of unfinished tasks. Always greater or equal to the queue length.
static NTASKS: AtomicUsize = AtomicUsize::new(0);

/// Spawn a new task to be run.
///
/// # Examples
///
/// ```
/// ksched::task::spawn(async {
///    println!("hello, world");
/// }).expect("oom");
/// ksched::task::run_all();
/// ```
pub fn spawn(future: impl Future<Output = ()> + 'static + Send) -> Result<(), TryReserveError> {
    let t = Arc::new(Task {
        future: Mutex::new(Box::pin(future)),
        queued: AtomicBool::new(true),
        done: AtomicBool::new(false),
    });
    let mut g = DEFAULT_EXECUTOR.lock();
    g.tasks.try_reserve(1)?;
    NTASKS.fetch_add(1, Ordering::SeqCst);
    g.tasks.push_back(t);
    Ok(())
}

/// Run tasks until the queue is drained.
///
/// Tasks that are waiting for a wakeup are not on the queue; use
/// [`run_all`] to run until everything has completed.
///
/// # Examples
///
/// ```
/// use ksched::task::{spawn, run, yield_now};
///
/// spawn(async {
///     yield_now().await;
/// }).expect("oom");
/// run();
/// ```
pub fn run() {
    loop {
        let t = DEFAULT_EXECUTOR.lock().tasks.pop_front();
        let t = match t {
            Some(t) => t,
            None => break,
        };
        // Clear the queued flag before polling so that wakeups arriving
        // during the poll re-enqueue the task.
        t.queued.store(false, Ordering::Release);
        if t.done.load(Ordering::Acquire) {
            continue;
        }
        // Another thread may still be inside a poll of this task; the lock
        // serializes the polls.
        let mut future = t.future.lock();
        if t.done.load(Ordering::Acquire) {
            continue;
        }
        let w = futures::task::waker(t.clone());
        let mut cx = Context::from_waker(&w);
        if future.as_mut().poll(&mut cx).is_ready() {
            t.done.store(true, Ordering::Release);
            NTASKS.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Run until all tasks are finished.
///
/// Several host threads may call this at once to emulate multiple cpus.
///
/// # Examples
///
/// ```
/// ksched::task::run_all();
/// ```
pub fn run_all() {
    while NTASKS.load(Ordering::SeqCst) > 0 {
        run();
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task;

    fn run_multi(ncpu: usize) {
        let mut threads = vec![];
        for _ in 0..ncpu {
            let t = std::thread::spawn(move || {
                task::run_all();
            });
            threads.push(t);
        }
        for thread in threads {
            thread.join().unwrap();
        }
    }

    #[test]
    fn test_spawn_and_run() {
        const N: usize = 100;
        let cnt = Arc::new(AtomicUsize::new(0));
        for _ in 0..N {
            let cnt = cnt.clone();
            task::spawn(async move {
                task::yield_now().await;
                cnt.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        task::run_all();
        assert_eq!(cnt.load(Ordering::SeqCst), N);
    }

    #[test]
    fn test_run_multi() {
        const N: usize = 1000;
        const NCPU: usize = 4;
        let cnt = Arc::new(AtomicUsize::new(0));
        for _ in 0..N {
            let cnt = cnt.clone();
            task::spawn(async move {
                task::yield_now().await;
                cnt.fetch_add(1, Ordering::SeqCst);
                task::yield_now().await;
            })
            .unwrap();
        }
        run_multi(NCPU);
        assert_eq!(cnt.load(Ordering::SeqCst), N);
    }
}
