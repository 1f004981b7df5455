//! Fixed-size worker pool for long-running stream tasks.
//!
//! Each worker is an OS thread that takes one job at a time from a shared
//! queue. Stream tasks hold their worker for their whole lifetime, so the pool
//! size bounds how many streams run concurrently; extra jobs wait in the queue
//! until a worker frees up.
//!
//! Every submitted job gets a [`TaskFuture`] which reports completion and
//! carries a cooperative interruption flag.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

/// Cooperative interruption flag handed to a running job.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    /// Create an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether interruption was requested.
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Request interruption.
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct FutureState {
    done: AtomicBool,
    cancelled: AtomicBool,
    interrupt: Interrupt,
}

/// Completion handle for a submitted job.
#[derive(Debug, Clone, Default)]
pub struct TaskFuture {
    state: Arc<FutureState>,
}

impl TaskFuture {
    /// Whether the job has finished, failed, or was cancelled before it ran.
    pub fn is_done(&self) -> bool {
        self.state.done.load(Ordering::SeqCst)
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Cancel the job.
    ///
    /// A queued job will never run. A running job is only asked to stop, via
    /// its [`Interrupt`], when `may_interrupt` is set. Returns false if the job
    /// had already completed.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        if self.is_done() {
            return false;
        }
        self.state.cancelled.store(true, Ordering::SeqCst);
        if may_interrupt {
            self.state.interrupt.set();
        }
        true
    }

    fn complete(&self) {
        self.state.done.store(true, Ordering::SeqCst);
    }
}

type Job = Box<dyn FnOnce(Interrupt) + Send + 'static>;

struct QueuedJob {
    job: Job,
    future: TaskFuture,
}

struct PoolShared {
    queue: Mutex<VecDeque<QueuedJob>>,
    available: Condvar,
    shutdown: AtomicBool,
}

/// A fixed set of worker threads draining a shared job queue.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Start a pool with `size` worker threads (at least one).
    pub fn new(size: usize) -> std::io::Result<Self> {
        let size = size.max(1);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("changefeed-worker-{}", index))
                .spawn(move || Self::worker_loop(shared))?;
            workers.push(handle);
        }

        tracing::debug!(size, "worker pool started");
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            size,
        })
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Whether the pool has been shut down.
    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Check if any worker thread is still running.
    pub fn is_running(&self) -> bool {
        self.workers.lock().iter().any(|handle| !handle.is_finished())
    }

    /// Queue a job. After shutdown the job is rejected and its future is
    /// already complete and cancelled.
    pub fn submit<F>(&self, job: F) -> TaskFuture
    where
        F: FnOnce(Interrupt) + Send + 'static,
    {
        let future = TaskFuture::default();
        if self.is_shutdown() {
            future.cancel(true);
            future.complete();
            return future;
        }

        self.shared.queue.lock().push_back(QueuedJob {
            job: Box::new(job),
            future: future.clone(),
        });
        self.shared.available.notify_one();
        future
    }

    /// Stop accepting jobs, discard queued ones and wake idle workers.
    ///
    /// Running jobs are not waited for; callers interrupt them through their
    /// futures. Returns the number of discarded jobs.
    pub fn shutdown_now(&self) -> usize {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let drained: Vec<QueuedJob> = self.shared.queue.lock().drain(..).collect();
        for queued in &drained {
            queued.future.cancel(true);
            queued.future.complete();
        }
        self.shared.available.notify_all();
        if !drained.is_empty() {
            tracing::debug!(discarded = drained.len(), "discarded queued jobs");
        }
        drained.len()
    }

    fn worker_loop(shared: Arc<PoolShared>) {
        loop {
            let next = {
                let mut queue = shared.queue.lock();
                loop {
                    if shared.shutdown.load(Ordering::SeqCst) {
                        break None;
                    }
                    if let Some(queued) = queue.pop_front() {
                        break Some(queued);
                    }
                    shared.available.wait(&mut queue);
                }
            };

            let Some(QueuedJob { job, future }) = next else {
                return;
            };

            if future.is_cancelled() {
                future.complete();
                continue;
            }

            let interrupt = future.state.interrupt.clone();
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| job(interrupt))) {
                tracing::error!(panic = %panic_message(&*panic), "worker job panicked");
            }
            future.complete();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown_now();
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
