use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::pow;
use crate::stats::Statistics;
use crate::task::Task;

/// Fixed-size pool of OS worker threads draining a shared FIFO. Spawned once
/// per node process and reused across rounds: each round resets the
/// round-complete latch and feeds in a fresh batch of tasks.
pub struct WorkerPool {
    inner: Arc<Inner>,
    started: AtomicBool,
}

struct Inner {
    pool_size: usize,
    queue: Mutex<VecDeque<Task>>,
    queue_cv: Condvar,
    /// round-complete latch: starts each round at 1, decremented to 0 by the
    /// first worker that empties the queue after executing a task.
    latch: Mutex<usize>,
    latch_cv: Condvar,
    stats: Arc<Statistics>,
    shutdown: AtomicBool,
}

impl WorkerPool {
    pub fn new(pool_size: usize, stats: Arc<Statistics>) -> Self {
        assert!(
            (2..=16).contains(&pool_size),
            "poolSize must be in [2, 16], got {pool_size}"
        );
        Self {
            inner: Arc::new(Inner {
                pool_size,
                queue: Mutex::new(VecDeque::new()),
                queue_cv: Condvar::new(),
                latch: Mutex::new(1),
                latch_cv: Condvar::new(),
                stats,
                shutdown: AtomicBool::new(false),
            }),
            started: AtomicBool::new(false),
        }
    }

    /// Spawns the worker threads. Idempotent: only the first call actually
    /// spawns anything, matching "the pool is constructed once per node
    /// process and reused across rounds".
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for worker_id in 0..self.inner.pool_size {
            let inner = Arc::clone(&self.inner);
            std::thread::Builder::new()
                .name(format!("pow-worker-{worker_id}"))
                .spawn(move || worker_loop(inner))
                .expect("failed to spawn worker thread");
        }
    }

    /// Appends tasks to the FIFO queue. Callers guarantee no duplicate task
    /// identities within a round.
    pub fn add_tasks(&self, tasks: impl IntoIterator<Item = Task>) {
        let mut queue = self.inner.queue.lock();
        queue.extend(tasks);
        drop(queue);
        self.inner.queue_cv.notify_all();
    }

    /// Resets the round-complete latch to 1 before a new round's tasks are
    /// enqueued. Must be called before `add_tasks` for the new round.
    pub fn begin_round(&self) {
        *self.inner.latch.lock() = 1;
    }

    /// Blocks (on a dedicated blocking-pool thread, not the calling async
    /// task) until a worker has observed the queue empty after executing a
    /// task.
    pub async fn wait_round_complete(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut latch = inner.latch.lock();
            inner.latch_cv.wait_while(&mut latch, |count| *count > 0);
        })
        .await
        .expect("round-complete wait thread panicked");
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.queue_cv.notify_all();
    }
}

fn worker_loop(inner: Arc<Inner>) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                if inner.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                inner.queue_cv.wait(&mut queue);
            }
        };
        let Some(task) = task else { return };

        // a panicking PoW run is a safety net, not a retry channel: it is
        // logged and still counted as completed
        if panic::catch_unwind(AssertUnwindSafe(|| pow::solve(&task))).is_err() {
            tracing::warn!("proof-of-work panicked for task {:?}, counting as completed", task);
        }
        inner.stats.add_completed(1);

        let empty_after_execute = inner.queue.lock().is_empty();
        if empty_after_execute {
            let mut latch = inner.latch.lock();
            if *latch > 0 {
                *latch = 0;
                inner.latch_cv.notify_all();
            }
        }
    }
}
