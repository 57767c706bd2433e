//! The readiness-driven event loop.
//!
//! An [`EventLoop`] owns one injected [`Poller`] and the endpoints registered with it. Each call to
//! [`run_once`](EventLoop::run_once) waits for readiness and turns it into endpoint callbacks:
//!
//! - a socket whose connect is in progress gets exactly one [`Endpoint::handle_connect`] success, after which it is
//!   watched for reads only, plus writes while it has unflushed output;
//! - a readable socket gets [`Endpoint::handle_read`], a writable one [`Endpoint::handle_write`];
//! - failures reported by those callbacks are routed by class: would-block style conditions are ignored, benign
//!   disconnects (reset, not connected, shutdown, aborted, end of stream) go to [`Endpoint::handle_close`], and
//!   everything else goes to [`Endpoint::handle_error`].
//!
//! Endpoints that report themselves closed are deregistered automatically.
//!
//! Closures posted through a [`LoopHandle`] run on the loop thread at the start and end of every iteration.

use std::{
    collections::HashMap,
    fmt, io, mem,
    sync::Arc,
    time::{Duration, Instant},
};

use mio::{Interest, Token};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::{
    codec::Codec,
    config::EngineConfig,
    connection::Connection,
    error::{Error, ErrorClass, Result},
    poller::{Backend, Poller, Readiness, Wake, WAKE_TOKEN},
};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something the event loop drives: a socket plus the callbacks readiness is delivered to.
///
/// [`Connection`] is the endpoint used in practice; the trait exists so the loop can be exercised in isolation.
pub trait Endpoint: Send + Sync {
    /// Token identifying the endpoint's socket. Must be unique within a loop.
    fn token(&self) -> Token;

    /// Registers the socket with `poller`.
    fn attach(&self, poller: &mut dyn Poller, interest: Interest) -> io::Result<()>;

    /// Changes the registered interest.
    fn reattach(&self, poller: &mut dyn Poller, interest: Interest) -> io::Result<()>;

    /// Deregisters the socket from `poller`.
    fn detach(&self, poller: &mut dyn Poller) -> io::Result<()>;

    /// Whether the socket's connect is still in progress.
    fn is_connecting(&self) -> bool;

    /// Whether there is encoded output the socket did not accept yet.
    fn wants_write(&self) -> bool;

    /// Whether the endpoint is finished and should be deregistered.
    fn is_closed(&self) -> bool;

    /// Called when a connecting socket becomes writable or reports an error. Returns `true` once connected.
    fn handle_connect(&self) -> Result<bool>;

    /// Called when the socket is readable.
    fn handle_read(&self) -> Result<()>;

    /// Called when the socket is writable after a partial write.
    fn handle_write(&self) -> Result<()>;

    /// The peer closed the connection in an orderly fashion.
    fn handle_close(&self);

    /// The connection failed.
    fn handle_error(&self, err: Error);

    /// Called once on registration with a handle to the loop.
    fn bind_loop(&self, _handle: &LoopHandle) {}
}

/// Routes a failure reported by an endpoint callback according to its [`ErrorClass`].
pub fn route_failure(endpoint: &dyn Endpoint, err: Error) {
    match err.class() {
        ErrorClass::Transient => {
            trace!(token = ?endpoint.token(), %err, "transient socket condition");
        }
        ErrorClass::OrderlyClose => {
            debug!(token = ?endpoint.token(), %err, "connection closed by peer");
            endpoint.handle_close();
        }
        _ => {
            error!(token = ?endpoint.token(), %err, "connection failed");
            endpoint.handle_error(err);
        }
    }
}

struct Registered {
    endpoint: Arc<dyn Endpoint>,
    interest: Interest,
    connecting: bool,
}

/// Drives one [`Poller`] and the endpoints registered with it.
pub struct EventLoop {
    poller: Box<dyn Poller>,
    endpoints: HashMap<Token, Registered>,
    events: Vec<Readiness>,
    tasks: mpsc::UnboundedReceiver<Task>,
    handle: LoopHandle,
    poll_timeout: Duration,
}

impl EventLoop {
    /// Creates a loop around an explicitly chosen poller.
    pub fn new(poller: Box<dyn Poller>, config: &EngineConfig) -> Self {
        let (tx, tasks) = mpsc::unbounded_channel();
        let handle = LoopHandle {
            tx,
            waker: poller.waker(),
        };
        debug!(backend = poller.name(), "event loop created");
        EventLoop {
            poller,
            endpoints: HashMap::new(),
            events: Vec::with_capacity(config.event_capacity),
            tasks,
            handle,
            poll_timeout: config.poll_timeout,
        }
    }

    /// Creates a loop around the best poller the platform supports.
    pub fn probe(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(Backend::probe(config), config))
    }

    /// Creates a loop around a specific backend.
    pub fn with_backend(backend: Backend, config: &EngineConfig) -> Result<Self> {
        Ok(Self::new(backend.create(config)?, config))
    }

    /// Name of the poller backend in use.
    pub fn backend(&self) -> &'static str {
        self.poller.name()
    }

    /// A cloneable, thread-safe handle for posting closures onto this loop.
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Number of registered endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Starts driving `conn`.
    pub fn register<C: Codec>(&mut self, conn: &Connection<C>) -> Result<()> {
        self.register_endpoint(conn.endpoint())
    }

    /// Starts driving an arbitrary endpoint.
    pub fn register_endpoint(&mut self, endpoint: Arc<dyn Endpoint>) -> Result<()> {
        let token = endpoint.token();
        if token == WAKE_TOKEN || self.endpoints.contains_key(&token) {
            return Err(Error::invalid_state(format!(
                "token {} is already registered",
                token.0
            )));
        }
        if endpoint.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let connecting = endpoint.is_connecting();
        let interest = desired_interest(connecting, endpoint.wants_write());
        endpoint.attach(self.poller.as_mut(), interest)?;
        endpoint.bind_loop(&self.handle);
        debug!(?token, ?interest, connecting, backend = self.poller.name(), "endpoint registered");

        self.endpoints.insert(
            token,
            Registered {
                endpoint,
                interest,
                connecting,
            },
        );
        Ok(())
    }

    /// Stops driving the endpoint registered under `token`. Returns `false` if there was none.
    pub fn unregister(&mut self, token: Token) -> bool {
        match self.endpoints.remove(&token) {
            Some(registered) => {
                if let Err(err) = registered.endpoint.detach(self.poller.as_mut()) {
                    debug!(?token, %err, "deregistering endpoint failed");
                }
                debug!(?token, "endpoint unregistered");
                true
            }
            None => false,
        }
    }

    /// Runs one iteration: posted closures, interest updates, one readiness wait of at most `timeout` (forever for
    /// `None`), the resulting callbacks, posted closures again, and removal of closed endpoints.
    ///
    /// Returns the number of readiness events delivered to endpoints.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<usize> {
        self.run_tasks();
        self.reap_closed();
        self.sync_interests();

        self.events.clear();
        if let Err(err) = self.poller.poll(&mut self.events, timeout) {
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err.into());
        }

        let mut events = mem::take(&mut self.events);
        let mut delivered = 0;
        for readiness in events.drain(..) {
            if readiness.token == WAKE_TOKEN {
                continue;
            }
            if self.deliver(readiness) {
                delivered += 1;
            }
        }
        self.events = events;

        self.run_tasks();
        self.reap_closed();
        Ok(delivered)
    }

    /// Runs iterations until `budget` has elapsed.
    pub fn run_for(&mut self, budget: Duration) -> Result<()> {
        let deadline = Instant::now() + budget;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            self.run_once(Some((deadline - now).min(self.poll_timeout)))?;
        }
    }

    /// Runs exactly `iterations` iterations, each waiting at most the configured poll timeout.
    pub fn run_iterations(&mut self, iterations: usize) -> Result<()> {
        for _ in 0..iterations {
            self.run_once(Some(self.poll_timeout))?;
        }
        Ok(())
    }

    /// Runs iterations until `done` returns `true` or `budget` elapses. Returns whether `done` was satisfied.
    pub fn run_until<F>(&mut self, mut done: F, budget: Duration) -> Result<bool>
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + budget;
        loop {
            if done() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.run_once(Some((deadline - now).min(self.poll_timeout)))?;
        }
    }

    fn deliver(&mut self, readiness: Readiness) -> bool {
        let Some(registered) = self.endpoints.get_mut(&readiness.token) else {
            trace!(token = ?readiness.token, "readiness for unknown token");
            return false;
        };
        let endpoint = registered.endpoint.clone();
        if endpoint.is_closed() {
            return false;
        }

        if registered.connecting {
            if !(readiness.writable || readiness.error || readiness.hangup) {
                return false;
            }
            match endpoint.handle_connect() {
                Ok(true) => {
                    registered.connecting = false;
                    let interest = desired_interest(false, endpoint.wants_write());
                    if let Err(err) = endpoint.reattach(self.poller.as_mut(), interest) {
                        route_failure(endpoint.as_ref(), err.into());
                    } else {
                        registered.interest = interest;
                    }
                }
                Ok(false) => {}
                Err(err) => route_failure(endpoint.as_ref(), err),
            }
            return true;
        }

        if readiness.readable || readiness.error || readiness.hangup {
            if let Err(err) = endpoint.handle_read() {
                route_failure(endpoint.as_ref(), err);
            }
        }
        if readiness.writable && !endpoint.is_closed() {
            if let Err(err) = endpoint.handle_write() {
                route_failure(endpoint.as_ref(), err);
            }
        }
        true
    }

    fn run_tasks(&mut self) {
        while let Ok(task) = self.tasks.try_recv() {
            task();
        }
    }

    fn sync_interests(&mut self) {
        for (token, registered) in &mut self.endpoints {
            if registered.connecting {
                continue;
            }
            let interest = desired_interest(false, registered.endpoint.wants_write());
            if interest == registered.interest {
                continue;
            }
            match registered.endpoint.reattach(self.poller.as_mut(), interest) {
                Ok(()) => {
                    trace!(?token, ?interest, "interest updated");
                    registered.interest = interest;
                }
                Err(err) => route_failure(registered.endpoint.as_ref(), err.into()),
            }
        }
    }

    fn reap_closed(&mut self) {
        let closed: Vec<Token> = self
            .endpoints
            .iter()
            .filter(|(_, registered)| registered.endpoint.is_closed())
            .map(|(token, _)| *token)
            .collect();
        for token in closed {
            self.unregister(token);
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("backend", &self.poller.name())
            .field("endpoints", &self.endpoints.len())
            .field("poll_timeout", &self.poll_timeout)
            .finish()
    }
}

fn desired_interest(connecting: bool, wants_write: bool) -> Interest {
    if connecting {
        Interest::WRITABLE
    } else if wants_write {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}

/// Posts closures onto an [`EventLoop`] thread from anywhere.
#[derive(Clone)]
pub struct LoopHandle {
    tx: mpsc::UnboundedSender<Task>,
    waker: Arc<dyn Wake>,
}

impl LoopHandle {
    /// Queues `f` to run on the loop thread and wakes the loop.
    ///
    /// Fails with [`Error::InvalidState`] if the loop has been dropped.
    pub fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(Box::new(f))
            .map_err(|_| Error::invalid_state("event loop has been dropped"))?;
        self.wake();
        Ok(())
    }

    /// Interrupts the loop's current readiness wait.
    pub fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            warn!(%err, "failed to wake event loop");
        }
    }

    /// Returns `true` once the loop has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        thread,
    };

    use mio::net::TcpStream;
    use parking_lot::Mutex;

    use super::*;
    use crate::promise::Promise;

    #[derive(Default)]
    struct ScriptedPoller {
        script: Arc<Mutex<VecDeque<Vec<Readiness>>>>,
    }

    struct NoopWake;

    impl Wake for NoopWake {
        fn wake(&self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Poller for ScriptedPoller {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn register(&mut self, _: &mut TcpStream, _: Token, _: Interest) -> io::Result<()> {
            Ok(())
        }

        fn reregister(&mut self, _: &mut TcpStream, _: Token, _: Interest) -> io::Result<()> {
            Ok(())
        }

        fn deregister(&mut self, _: &mut TcpStream, _: Token) -> io::Result<()> {
            Ok(())
        }

        fn poll(&mut self, events: &mut Vec<Readiness>, _: Option<Duration>) -> io::Result<()> {
            if let Some(batch) = self.script.lock().pop_front() {
                events.extend(batch);
            }
            Ok(())
        }

        fn waker(&self) -> Arc<dyn Wake> {
            Arc::new(NoopWake)
        }
    }

    #[derive(Default)]
    struct Recorder {
        connecting: AtomicBool,
        closed: AtomicBool,
        connect_calls: AtomicUsize,
        reads: AtomicUsize,
        writes: AtomicUsize,
        closes: AtomicUsize,
        errors: Mutex<Vec<Error>>,
        interests: Mutex<Vec<Interest>>,
        read_result: Mutex<Option<Error>>,
    }

    impl Endpoint for Recorder {
        fn token(&self) -> Token {
            Token(1)
        }

        fn attach(&self, _: &mut dyn Poller, interest: Interest) -> io::Result<()> {
            self.interests.lock().push(interest);
            Ok(())
        }

        fn reattach(&self, _: &mut dyn Poller, interest: Interest) -> io::Result<()> {
            self.interests.lock().push(interest);
            Ok(())
        }

        fn detach(&self, _: &mut dyn Poller) -> io::Result<()> {
            Ok(())
        }

        fn is_connecting(&self) -> bool {
            self.connecting.load(Ordering::SeqCst)
        }

        fn wants_write(&self) -> bool {
            false
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn handle_connect(&self) -> Result<bool> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            self.connecting.store(false, Ordering::SeqCst);
            Ok(true)
        }

        fn handle_read(&self) -> Result<()> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            match self.read_result.lock().take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        fn handle_write(&self) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn handle_close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
        }

        fn handle_error(&self, err: Error) {
            self.errors.lock().push(err);
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn scripted(batches: Vec<Vec<Readiness>>) -> EventLoop {
        let poller = ScriptedPoller {
            script: Arc::new(Mutex::new(batches.into())),
        };
        EventLoop::new(Box::new(poller), &EngineConfig::default())
    }

    fn event(readable: bool, writable: bool) -> Readiness {
        Readiness {
            token: Token(1),
            readable,
            writable,
            error: false,
            hangup: false,
        }
    }

    fn io_err(kind: io::ErrorKind) -> Error {
        Error::from(io::Error::from(kind))
    }

    #[test]
    fn connect_completes_exactly_once() {
        let recorder = Arc::new(Recorder::default());
        recorder.connecting.store(true, Ordering::SeqCst);

        let mut event_loop = scripted(vec![
            vec![event(true, false)],
            vec![event(false, true)],
            vec![event(false, true)],
        ]);
        event_loop.register_endpoint(recorder.clone()).unwrap();
        event_loop.run_iterations(3).unwrap();

        assert_eq!(recorder.connect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.reads.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.writes.load(Ordering::SeqCst), 1);
        assert_eq!(
            *recorder.interests.lock(),
            vec![Interest::WRITABLE, Interest::READABLE]
        );
    }

    #[test]
    fn benign_read_failures_close_the_endpoint() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::NotConnected,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe,
        ] {
            let recorder = Arc::new(Recorder::default());
            *recorder.read_result.lock() = Some(io_err(kind));

            let mut event_loop = scripted(vec![vec![event(true, false)]]);
            event_loop.register_endpoint(recorder.clone()).unwrap();
            event_loop.run_once(None).unwrap();

            assert_eq!(recorder.closes.load(Ordering::SeqCst), 1, "{kind:?}");
            assert!(recorder.errors.lock().is_empty(), "{kind:?}");
            assert!(event_loop.is_empty(), "closed endpoint should be reaped");
        }
    }

    #[test]
    fn other_read_failures_are_errors() {
        let recorder = Arc::new(Recorder::default());
        *recorder.read_result.lock() = Some(Error::Unroutable {
            message_id: crate::codec::MessageId(9),
        });

        let mut event_loop = scripted(vec![vec![event(true, false)]]);
        event_loop.register_endpoint(recorder.clone()).unwrap();
        event_loop.run_once(None).unwrap();

        assert_eq!(recorder.closes.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.errors.lock().len(), 1);
    }

    #[test]
    fn would_block_is_ignored() {
        let recorder = Arc::new(Recorder::default());
        *recorder.read_result.lock() = Some(io_err(io::ErrorKind::WouldBlock));

        let mut event_loop = scripted(vec![vec![event(true, false)]]);
        event_loop.register_endpoint(recorder.clone()).unwrap();
        event_loop.run_once(None).unwrap();

        assert_eq!(recorder.closes.load(Ordering::SeqCst), 0);
        assert!(recorder.errors.lock().is_empty());
        assert_eq!(event_loop.len(), 1);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut event_loop = scripted(Vec::new());
        event_loop
            .register_endpoint(Arc::new(Recorder::default()))
            .unwrap();
        assert!(matches!(
            event_loop.register_endpoint(Arc::new(Recorder::default())),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn posted_closures_run_on_the_loop_thread() {
        let mut event_loop = EventLoop::probe(&EngineConfig::default()).unwrap();
        let handle = event_loop.handle();
        let loop_thread = thread::current().id();

        let ran_on = Arc::new(Mutex::new(None));
        let poster = {
            let ran_on = ran_on.clone();
            thread::spawn(move || {
                handle
                    .post(move || *ran_on.lock() = Some(thread::current().id()))
                    .unwrap();
            })
        };
        poster.join().unwrap();

        assert!(event_loop
            .run_until(|| ran_on.lock().is_some(), Duration::from_secs(5))
            .unwrap());
        assert_eq!(*ran_on.lock(), Some(loop_thread));
    }

    #[test]
    fn on_loop_marshals_continuations() {
        let mut event_loop = EventLoop::probe(&EngineConfig::default()).unwrap();
        let loop_thread = thread::current().id();

        let promise = Promise::<u32>::new();
        let seen = Arc::new(Mutex::new(None));
        promise.on_loop(&event_loop.handle(), {
            let seen = seen.clone();
            move |outcome| *seen.lock() = Some((*outcome.value().unwrap(), thread::current().id()))
        });

        let completer = promise.clone();
        thread::spawn(move || completer.complete(3)).join().unwrap();
        assert!(seen.lock().is_none());

        assert!(event_loop
            .run_until(|| seen.lock().is_some(), Duration::from_secs(5))
            .unwrap());
        assert_eq!(*seen.lock(), Some((3, loop_thread)));
    }

    #[test]
    fn posting_to_a_dropped_loop_fails() {
        let event_loop = scripted(Vec::new());
        let handle = event_loop.handle();
        drop(event_loop);
        assert!(handle.is_closed());
        assert!(handle.post(|| {}).is_err());
    }
}
