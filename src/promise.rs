//! A single-assignment, observe-many completion cell.
//!
//! A [`Promise`] is created when an operation is submitted and is settled exactly once: fulfilled with a value,
//! failed with an [`Error`], or cancelled. Any number of handles may observe it. While it is still pending it may carry
//! an *interim* value, which is overwritten by every [`update_interim`](Promise::update_interim) and does not count
//! as completion.
//!
//! # Where continuations run
//!
//! Continuations registered with [`add_continuation`](Promise::add_continuation) run synchronously on whichever
//! thread settles the promise. In cooperative mode that is the event-loop thread; with an offload pool it is a pool
//! worker. Callers that need their continuation on the event-loop thread regardless of who completes the promise can
//! use [`on_loop`](Promise::on_loop), which marshals the continuation through a [`LoopHandle`].
//!
//! # Blocking
//!
//! [`wait`](Promise::wait) blocks the calling thread. Never call it from inside a continuation or from the thread
//! that drives the [`EventLoop`](crate::EventLoop): in cooperative mode nothing else can make progress, so the wait
//! can only end in a timeout. Waiting inside a continuation is detected and logged as a warning.

use std::{
    cell::Cell,
    fmt,
    future::IntoFuture,
    mem,
    panic::Location,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{future::BoxFuture, FutureExt};
use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::{
    codec::RequestRef,
    error::{Error, Result},
    event_loop::LoopHandle,
};

type Continuation<T> = Box<dyn FnOnce(&Outcome<T>) + Send + 'static>;

thread_local! {
    static CONTINUATION_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Terminal result of a promise.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome<T> {
    /// The operation completed with a value.
    Fulfilled(T),
    /// The operation failed.
    Failed(Error),
    /// The operation was cancelled.
    Cancelled,
}

impl<T> Outcome<T> {
    /// Converts the outcome into a `Result`, mapping cancellation to [`Error::Cancelled`].
    pub fn into_result(self) -> Result<T> {
        match self {
            Outcome::Fulfilled(value) => Ok(value),
            Outcome::Failed(err) => Err(err),
            Outcome::Cancelled => Err(Error::Cancelled),
        }
    }

    /// Borrows the fulfilled value, if any.
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Fulfilled(value) => Some(value),
            _ => None,
        }
    }

    /// Borrows the error, if the outcome is a failure.
    pub fn error(&self) -> Option<&Error> {
        match self {
            Outcome::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Returns `true` if the outcome is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }
}

/// Observable state of a promise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromiseState {
    /// Not settled, no interim value.
    Pending,
    /// Not settled, carrying an interim value.
    Interim,
    /// Settled with a value.
    Fulfilled,
    /// Settled with an error.
    Failed,
    /// Settled by cancellation.
    Cancelled,
}

impl PromiseState {
    /// Returns `true` for the three settled states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PromiseState::Fulfilled | PromiseState::Failed | PromiseState::Cancelled
        )
    }
}

struct Slot<T> {
    outcome: Option<Arc<Outcome<T>>>,
    interim: Option<T>,
    continuations: Vec<Continuation<T>>,
    request: Option<RequestRef>,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    settled: Condvar,
}

/// A single-assignment completion cell shared between the engine and its callers.
///
/// Cloning a `Promise` creates another handle to the same cell. The settled outcome is shared by all handles, so a
/// promise can only move between threads when `T` is both `Send` and `Sync`.
///
/// Async callers can `.await` a promise directly:
///
/// ```
/// use smbmux::Promise;
///
/// # tokio_test::block_on(async {
/// let promise = Promise::new();
/// let waiter = promise.clone();
/// std::thread::spawn(move || promise.complete("negotiated"));
///
/// assert_eq!(waiter.await?, "negotiated");
/// # Ok::<(), smbmux::Error>(())
/// # });
/// ```
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    /// Creates a pending promise.
    pub fn new() -> Self {
        Promise {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    outcome: None,
                    interim: None,
                    continuations: Vec::new(),
                    request: None,
                }),
                settled: Condvar::new(),
            }),
        }
    }

    pub(crate) fn for_request(request: RequestRef) -> Self {
        let promise = Self::new();
        promise.inner.slot.lock().request = Some(request);
        promise
    }

    /// Creates a promise that is already fulfilled.
    pub fn ready(value: T) -> Self {
        let promise = Self::new();
        promise.complete(value);
        promise
    }

    /// Creates a promise that has already failed.
    pub fn failed(err: Error) -> Self {
        let promise = Self::new();
        promise.fail(err);
        promise
    }

    /// Fulfils the promise. Returns `false` and discards `value` if it was already settled.
    pub fn complete(&self, value: T) -> bool {
        self.settle(Outcome::Fulfilled(value))
    }

    /// Fails the promise. Returns `false` and discards `err` if it was already settled.
    pub fn fail(&self, err: Error) -> bool {
        self.settle(Outcome::Failed(err))
    }

    /// Cancels the promise. Returns `false` if it was already settled.
    ///
    /// A late `complete` or `fail` from an operation that was still in flight is discarded.
    pub fn cancel(&self) -> bool {
        self.settle(Outcome::Cancelled)
    }

    /// Settles the promise with `outcome`, running continuations on the calling thread.
    pub fn settle(&self, outcome: Outcome<T>) -> bool {
        let (outcome, continuations) = {
            let mut slot = self.inner.slot.lock();
            if slot.outcome.is_some() {
                trace!("discarding late settlement of an already settled promise");
                return false;
            }
            let outcome = Arc::new(outcome);
            slot.outcome = Some(Arc::clone(&outcome));
            (outcome, mem::take(&mut slot.continuations))
        };
        self.inner.settled.notify_all();

        for continuation in continuations {
            run_continuation(continuation, &outcome);
        }
        true
    }

    /// Stores an interim value. Only valid while pending; returns `false` once the promise is settled.
    pub fn update_interim(&self, value: T) -> bool {
        let mut slot = self.inner.slot.lock();
        if slot.outcome.is_some() {
            return false;
        }
        slot.interim = Some(value);
        true
    }

    /// Registers a continuation, run once with the terminal outcome.
    ///
    /// If the promise is already settled the continuation runs immediately on the calling thread, so a continuation
    /// is never missed because it raced with completion.
    pub fn add_continuation<F>(&self, f: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let mut slot = self.inner.slot.lock();
        match &slot.outcome {
            Some(outcome) => {
                let outcome = Arc::clone(outcome);
                drop(slot);
                run_continuation(Box::new(f), &outcome);
            }
            None => slot.continuations.push(Box::new(f)),
        }
    }

    /// Runs `f` on the event-loop thread behind `handle` once the promise settles.
    ///
    /// If the event loop has already been dropped, `f` is dropped without running and a warning is logged.
    pub fn on_loop<F>(&self, handle: &LoopHandle, f: F)
    where
        T: Clone + Send + 'static,
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let handle = handle.clone();
        self.add_continuation(move |outcome| {
            let outcome = outcome.clone();
            if handle.post(move || f(&outcome)).is_err() {
                warn!("event loop is gone, dropping marshalled continuation");
            }
        });
    }

    /// Returns the current state.
    pub fn state(&self) -> PromiseState {
        let slot = self.inner.slot.lock();
        match slot.outcome.as_deref() {
            Some(Outcome::Fulfilled(_)) => PromiseState::Fulfilled,
            Some(Outcome::Failed(_)) => PromiseState::Failed,
            Some(Outcome::Cancelled) => PromiseState::Cancelled,
            None if slot.interim.is_some() => PromiseState::Interim,
            None => PromiseState::Pending,
        }
    }

    /// Returns `true` once the promise is settled.
    pub fn is_done(&self) -> bool {
        self.inner.slot.lock().outcome.is_some()
    }

    /// The request this promise was created for, including its async id once re-keyed.
    pub fn request(&self) -> Option<RequestRef> {
        self.inner.slot.lock().request
    }

    pub(crate) fn set_request(&self, request: RequestRef) {
        self.inner.slot.lock().request = Some(request);
    }

    /// Returns `true` if both handles refer to the same promise.
    pub fn ptr_eq(&self, other: &Promise<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone> Promise<T> {
    /// Returns the latest interim value, if any.
    pub fn interim(&self) -> Option<T> {
        self.inner.slot.lock().interim.clone()
    }

    /// Returns the terminal outcome without blocking, if settled.
    pub fn outcome(&self) -> Option<Outcome<T>> {
        self.inner.slot.lock().outcome.as_deref().cloned()
    }

    /// Blocks until the promise settles or `timeout` elapses.
    ///
    /// Returns [`Error::Timeout`] on expiry and [`Error::Cancelled`] for a cancelled promise. Must not be called from
    /// a continuation or from the event-loop thread in cooperative mode.
    #[track_caller]
    pub fn wait(&self, timeout: Duration) -> Result<T> {
        self.wait_deadline(Some(Instant::now() + timeout), Location::caller())
    }

    /// Blocks until the promise settles, with no timeout.
    #[track_caller]
    pub fn wait_forever(&self) -> Result<T> {
        self.wait_deadline(None, Location::caller())
    }

    fn wait_deadline(&self, deadline: Option<Instant>, called_at: &'static Location<'static>) -> Result<T> {
        if CONTINUATION_DEPTH.with(Cell::get) > 0 {
            warn!(
                "At {called_at}, a promise is waited on from inside a continuation, which will likely deadlock a single-threaded event loop"
            );
        }

        let mut slot = self.inner.slot.lock();
        loop {
            if let Some(outcome) = slot.outcome.as_deref() {
                return outcome.clone().into_result();
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .inner
                        .settled
                        .wait_until(&mut slot, deadline)
                        .timed_out()
                    {
                        return match slot.outcome.as_deref() {
                            Some(outcome) => outcome.clone().into_result(),
                            None => Err(Error::Timeout),
                        };
                    }
                }
                None => self.inner.settled.wait(&mut slot),
            }
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Awaits the promise, giving up after `timeout`.
    pub async fn wait_async(&self, timeout: Duration) -> Result<T> {
        tokio::time::timeout(timeout, self.clone().into_future())
            .await
            .map_err(|_| Error::Timeout)?
    }
}

impl<T: Clone + Send + 'static> IntoFuture for Promise<T> {
    type Output = Result<T>;
    type IntoFuture = BoxFuture<'static, Result<T>>;

    fn into_future(self) -> Self::IntoFuture {
        let (tx, rx) = oneshot::channel();
        self.add_continuation(move |outcome| {
            let _ = tx.send(outcome.clone().into_result());
        });
        async move { rx.await.unwrap_or(Err(Error::Cancelled)) }.boxed()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state())
            .field("request", &self.request())
            .finish()
    }
}

fn run_continuation<T>(continuation: Continuation<T>, outcome: &Outcome<T>) {
    struct DepthGuard;

    impl Drop for DepthGuard {
        fn drop(&mut self) {
            CONTINUATION_DEPTH.with(|depth| depth.set(depth.get() - 1));
        }
    }

    CONTINUATION_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let _guard = DepthGuard;
    continuation(outcome);
}
