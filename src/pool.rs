//! A fixed pool of worker threads for offloading socket work.
//!
//! The `pool` module provides [`ThreadPool`], which runs `(work, promise, lock)` items on a fixed set of OS threads.
//! A worker pops an item, acquires the item's lock, runs the work with the lock held and settles the promise with the
//! result. The lock is released on every path, including when the work panics, because the guard is owned by the
//! work itself.
//!
//! Connections use the pool through [`Execution::Offload`]: both the "encode the outbound queue and write it" step and
//! the "read, reassemble and dispatch" step are scheduled with the connection's single I/O lock, which keeps exactly
//! one thread on the socket at a time while reads and writes of different connections proceed in parallel.
//! [`Execution::Inline`] runs the very same closures on the calling thread.
//!
//! # Features
//! - **Bounded waits**: idle workers wait on a condition variable with a timeout, so shutdown is always observed.
//! - **Panic capture**: a panicking work item fails its promise with [`Error::WorkerPanicked`].
//! - **Deterministic teardown**: [`ThreadPool::abort`] cancels every queued item and joins all workers.
//!
//! # Example
//!
//! ```
//! use std::{sync::Arc, time::Duration};
//!
//! use parking_lot::Mutex;
//! use smbmux::{Promise, ThreadPool};
//!
//! let pool = ThreadPool::new(2, Duration::from_millis(50))?;
//! let counter = Arc::new(Mutex::new(0u32));
//!
//! let done = Promise::new();
//! pool.schedule(|mut count| { *count += 1; Ok(*count) }, done.clone(), counter.clone())?;
//! assert_eq!(done.wait(Duration::from_secs(5))?, 1);
//!
//! pool.abort()?;
//! # Ok::<(), smbmux::Error>(())
//! ```

use std::{
    any::Any,
    cell::Cell,
    collections::VecDeque,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

use crate::{
    config::EngineConfig,
    error::{Error, Result},
    promise::Promise,
};

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static CURRENT_POOL: Cell<usize> = const { Cell::new(0) };
}

enum Disposal {
    Run,
    Cancel,
}

type Job = Box<dyn FnOnce(Disposal) + Send + 'static>;

struct Queue {
    jobs: Mutex<VecDeque<Job>>,
    available: Condvar,
    shutdown: AtomicBool,
}

/// A fixed set of worker threads pulling work items from a shared queue.
pub struct ThreadPool {
    id: usize,
    queue: Arc<Queue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl ThreadPool {
    /// Starts `size` workers. Idle workers re-check for shutdown every `worker_wait`.
    pub fn new(size: usize, worker_wait: Duration) -> Result<Self> {
        if size == 0 {
            return Err(Error::invalid_state("a thread pool needs at least one worker"));
        }

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(Queue {
            jobs: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let pool = ThreadPool {
            id,
            queue,
            workers: Mutex::new(Vec::with_capacity(size)),
            size,
        };

        for index in 0..size {
            let queue = pool.queue.clone();
            let spawned = thread::Builder::new()
                .name(format!("smbmux-worker-{id}-{index}"))
                .spawn(move || worker_loop(id, queue, worker_wait));
            match spawned {
                Ok(handle) => pool.workers.lock().push(handle),
                Err(err) => {
                    // Dropping the pool joins the workers already started.
                    return Err(err.into());
                }
            }
        }

        debug!(pool = id, size, "thread pool started");
        Ok(pool)
    }

    /// Starts a pool sized and tuned by `config`.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::new(config.workers, config.worker_wait)
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of items waiting for a worker.
    pub fn queued(&self) -> usize {
        self.queue.jobs.lock().len()
    }

    /// Returns `true` once [`abort`](Self::abort) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.queue.shutdown.load(Ordering::Acquire)
    }

    /// Returns `true` when called from one of this pool's workers.
    pub fn is_worker_thread(&self) -> bool {
        CURRENT_POOL.with(Cell::get) == self.id
    }

    /// Queues `work` to run on a worker with `lock` held, settling `promise` with its result.
    ///
    /// Cancels `promise` and returns [`Error::PoolShutdown`] if the pool has been aborted.
    pub fn schedule<L, T, F>(&self, work: F, promise: Promise<T>, lock: Arc<Mutex<L>>) -> Result<()>
    where
        L: Send + 'static,
        T: Send + Sync + 'static,
        F: FnOnce(MutexGuard<'_, L>) -> Result<T> + Send + 'static,
    {
        let job: Job = Box::new(move |disposal| match disposal {
            Disposal::Run => run_guarded(work, &lock, &promise),
            Disposal::Cancel => {
                promise.cancel();
            }
        });

        {
            let mut jobs = self.queue.jobs.lock();
            if self.queue.shutdown.load(Ordering::Acquire) {
                drop(jobs);
                job(Disposal::Cancel);
                return Err(Error::PoolShutdown);
            }
            jobs.push_back(job);
        }
        self.queue.available.notify_one();
        Ok(())
    }

    /// Signals shutdown, cancels every queued item and joins all workers.
    ///
    /// Items already running finish normally. Returns [`Error::InvalidState`] when called from one of this pool's
    /// own workers, since a worker cannot join itself.
    pub fn abort(&self) -> Result<()> {
        if self.is_worker_thread() {
            return Err(Error::invalid_state(
                "ThreadPool::abort called from one of its own workers",
            ));
        }
        self.shutdown(true);
        Ok(())
    }

    fn shutdown(&self, join: bool) {
        let backlog: Vec<Job> = {
            let mut jobs = self.queue.jobs.lock();
            self.queue.shutdown.store(true, Ordering::Release);
            jobs.drain(..).collect()
        };
        self.queue.available.notify_all();

        if !backlog.is_empty() {
            debug!(pool = self.id, cancelled = backlog.len(), "cancelling queued work on shutdown");
        }
        for job in backlog {
            job(Disposal::Cancel);
        }

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        if !join {
            return;
        }
        for worker in workers {
            if worker.join().is_err() {
                warn!(pool = self.id, "worker thread exited with a panic");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // The last handle may be dropped on a worker, which cannot join itself.
        let join = !self.is_worker_thread();
        self.shutdown(join);
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("queued", &self.queued())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

fn worker_loop(pool: usize, queue: Arc<Queue>, worker_wait: Duration) {
    CURRENT_POOL.with(|current| current.set(pool));
    trace!(pool, "worker started");

    loop {
        let job = {
            let mut jobs = queue.jobs.lock();
            loop {
                if queue.shutdown.load(Ordering::Acquire) {
                    trace!(pool, "worker stopping");
                    return;
                }
                if let Some(job) = jobs.pop_front() {
                    break job;
                }
                queue.available.wait_for(&mut jobs, worker_wait);
            }
        };
        job(Disposal::Run);
    }
}

/// Runs `work` with `lock` held and settles `promise` with the result, turning a panic into
/// [`Error::WorkerPanicked`]. The guard is dropped before the promise is settled.
pub(crate) fn run_guarded<L, T, F>(work: F, lock: &Mutex<L>, promise: &Promise<T>)
where
    F: FnOnce(MutexGuard<'_, L>) -> Result<T>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| work(lock.lock()))) {
        Ok(Ok(value)) => {
            promise.complete(value);
        }
        Ok(Err(err)) => {
            promise.fail(err);
        }
        Err(panic) => {
            let msg = panic_message(panic.as_ref());
            error!(%msg, "work item panicked");
            promise.fail(Error::WorkerPanicked(msg));
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Where a connection runs its socket work.
#[derive(Clone, Debug, Default)]
pub enum Execution {
    /// On the thread that triggers it: the event-loop thread for reads, the submitting thread for writes.
    #[default]
    Inline,
    /// On a worker of the given pool, serialized by the connection's I/O lock.
    Offload(Arc<ThreadPool>),
}

impl Execution {
    /// Offloads to a new pool sized by `config`.
    pub fn offload(config: &EngineConfig) -> Result<Self> {
        Ok(Execution::Offload(Arc::new(ThreadPool::from_config(config)?)))
    }

    /// Returns `true` for [`Execution::Offload`].
    pub fn is_offload(&self) -> bool {
        matches!(self, Execution::Offload(_))
    }

    /// Runs `work` with `lock` held, here or on the pool, and returns the promise settled with its result.
    pub(crate) fn run<L, T, F>(&self, lock: &Arc<Mutex<L>>, work: F) -> Promise<T>
    where
        L: Send + 'static,
        T: Send + Sync + 'static,
        F: FnOnce(MutexGuard<'_, L>) -> Result<T> + Send + 'static,
    {
        let promise = Promise::new();
        match self {
            Execution::Inline => run_guarded(work, lock, &promise),
            Execution::Offload(pool) => {
                if let Err(err) = pool.schedule(work, promise.clone(), lock.clone()) {
                    debug!(%err, "offload rejected");
                }
            }
        }
        promise
    }
}
