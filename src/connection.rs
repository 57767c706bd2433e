//! The connection multiplexer.
//!
//! A [`Connection`] owns one socket and correlates everything that travels over it. Callers [`submit`] operations
//! and get a [`Promise`] per operation back; the promise is settled when the matching reply is dispatched.
//!
//! # Correlation
//!
//! Every request is assigned the next [`MessageId`] and sits in the outbound queue until it is encoded and written.
//! Right before it is written it is entered into the pending map under that id. Replies are matched by the async id
//! they carry (if it is known), then by message id, then by break token:
//!
//! - a final reply settles and removes the pending entry, with the body or, for a failure status, with
//!   [`Error::Status`];
//! - an async-processing reply moves the entry from its message id to the async id in one step under the connection
//!   lock and stores the body as the promise's interim value;
//! - a cancel acknowledgement cancels the promise;
//! - a break notification completes the registration's promise (first notification only) and calls its
//!   acknowledgement callback (every notification);
//! - a break notification nobody registered for is buffered, up to [`EngineConfig::max_orphan_breaks`], and replayed
//!   on [`register_break`](Connection::register_break);
//! - anything else is unroutable and fails the connection.
//!
//! # Cancellation
//!
//! [`Operation::Cancel`] looks its target up by async id, then by message id, then in the outbound queue. A target
//! that is still queued is removed and cancelled on the spot without touching the network. A target already sent
//! gets a protocol cancel and stays pending until its real reply or the cancel acknowledgement arrives, whichever
//! comes first. The cancel operation's own promise settles with whatever the target settles with.
//!
//! # Locks
//!
//! The *I/O lock* guards the socket, the frame assembler and the encoded-but-unsent bytes; it is the lock socket work
//! is scheduled with, so only one thread touches the socket at a time. The *connection lock* guards the pending map,
//! the outbound queue, break registrations and the sticky error. The I/O lock is always taken first, and neither
//! is held while promises are settled.
//!
//! [`submit`]: Connection::submit

use std::{
    collections::{HashMap, VecDeque},
    fmt, io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use bytes::{Buf, BytesMut};
use mio::{Interest, Token};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

use crate::{
    codec::{
        Body, BreakToken, Codec, CorrelationKey, Disposition, Incoming, MessageId, Outgoing,
        ReplyHeader, RequestRef,
    },
    config::EngineConfig,
    error::{Error, ErrorClass, Result},
    event_loop::{route_failure, Endpoint, LoopHandle},
    framing::{encode_frame, FrameAssembler},
    poller::Poller,
    pool::Execution,
    promise::{Outcome, Promise},
    transport::TcpTransport,
};

static NEXT_CONNECTION_ID: AtomicUsize = AtomicUsize::new(1);

/// Callback invoked for every break notification delivered to a registration.
pub type BreakAck<R> = Arc<dyn Fn(&Incoming<R>) + Send + Sync + 'static>;

/// An operation submitted to a [`Connection`].
pub enum Operation<C: Codec> {
    /// A request, assigned the next message id.
    Request(C::Request),
    /// A cancel of the request behind the given promise.
    Cancel(Promise<C::Reply>),
}

impl<C: Codec> fmt::Debug for Operation<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Request(_) => f.write_str("Request(..)"),
            Operation::Cancel(target) => f.debug_tuple("Cancel").field(target).finish(),
        }
    }
}

struct Io {
    transport: TcpTransport,
    assembler: FrameAssembler,
    send_buf: BytesMut,
    scratch: Vec<u8>,
}

enum Queued<C: Codec> {
    Request {
        request: RequestRef,
        body: C::Request,
        promise: Promise<C::Reply>,
    },
    Cancel {
        target: RequestRef,
    },
}

struct PendingEntry<R> {
    promise: Promise<R>,
    request: RequestRef,
    /// A cancel frame for this entry has been queued; later cancels only mirror it.
    cancel_requested: bool,
}

impl<R> PendingEntry<R> {
    fn sent(promise: Promise<R>, request: RequestRef) -> Self {
        PendingEntry {
            promise,
            request,
            cancel_requested: false,
        }
    }
}

struct BreakRegistration<R> {
    promise: Promise<R>,
    ack: Option<BreakAck<R>>,
}

struct State<C: Codec> {
    next_id: u64,
    pending: HashMap<CorrelationKey, PendingEntry<C::Reply>>,
    queue: VecDeque<Queued<C>>,
    breaks: HashMap<BreakToken, BreakRegistration<C::Reply>>,
    orphans: VecDeque<Incoming<C::Reply>>,
    sticky: Option<Error>,
}

enum Route<R> {
    Settle(Promise<R>, Outcome<R>),
    Interim(Promise<R>, R),
    Break {
        promise: Promise<R>,
        ack: Option<BreakAck<R>>,
        message: Incoming<R>,
    },
    Buffered(BreakToken),
}

enum CancelPlan<R> {
    /// The target was sent; a cancel frame is queued or already on its way.
    Sent(Promise<R>),
    /// The target was still queued and has been removed.
    Unsent(Promise<R>),
    /// Nothing to cancel; the cancel fails with this error.
    Rejected(Error),
}

impl<C: Codec> State<C> {
    fn new() -> Self {
        State {
            next_id: 0,
            pending: HashMap::new(),
            queue: VecDeque::new(),
            breaks: HashMap::new(),
            orphans: VecDeque::new(),
            sticky: None,
        }
    }

    fn next_request(&mut self) -> RequestRef {
        let id = MessageId(self.next_id);
        self.next_id += 1;
        RequestRef::new(id)
    }

    fn plan_cancel(&mut self, target: &Promise<C::Reply>) -> CancelPlan<C::Reply> {
        let Some(request) = target.request() else {
            return CancelPlan::Rejected(Error::invalid_state(
                "cannot cancel a promise that was not returned by submit",
            ));
        };

        let by_async = request.async_id.map(CorrelationKey::Async);
        let by_message = Some(CorrelationKey::Message(request.message_id));
        for key in [by_async, by_message].into_iter().flatten() {
            if let Some(entry) = self.pending.get_mut(&key) {
                if !entry.promise.ptr_eq(target) {
                    continue;
                }
                let promise = entry.promise.clone();
                if !entry.cancel_requested {
                    entry.cancel_requested = true;
                    let target = entry.request;
                    self.queue.push_back(Queued::Cancel { target });
                }
                return CancelPlan::Sent(promise);
            }
        }

        let queued = self.queue.iter().position(|queued| {
            matches!(queued, Queued::Request { promise, .. } if promise.ptr_eq(target))
        });
        if let Some(Queued::Request { promise, .. }) = queued.and_then(|pos| self.queue.remove(pos)) {
            return CancelPlan::Unsent(promise);
        }

        CancelPlan::Rejected(Error::NotPending(request.message_id))
    }

    /// Empties every table and returns the promises that were still waiting: pending and queued requests and break
    /// registrations. Buffered break notifications are dropped.
    fn drain_outstanding(&mut self) -> Vec<Promise<C::Reply>> {
        let mut promises: Vec<_> = self.pending.drain().map(|(_, entry)| entry.promise).collect();
        promises.extend(self.queue.drain(..).filter_map(|queued| match queued {
            Queued::Request { promise, .. } => Some(promise),
            Queued::Cancel { .. } => None,
        }));
        promises.extend(self.breaks.drain().map(|(_, registration)| registration.promise));
        self.orphans.clear();
        promises
    }

    fn route(&mut self, message: Incoming<C::Reply>, max_orphans: usize) -> Result<Route<C::Reply>> {
        let header = message.header;

        let key = header
            .async_id
            .map(CorrelationKey::Async)
            .filter(|key| self.pending.contains_key(key))
            .or_else(|| {
                let key = CorrelationKey::Message(header.message_id);
                self.pending.contains_key(&key).then_some(key)
            });

        if let Some(mut entry) = key.and_then(|key| self.pending.remove(&key)) {
            return Ok(match header.disposition {
                Disposition::AsyncPending => {
                    if let (Some(async_id), None) = (header.async_id, entry.request.async_id) {
                        entry.request.async_id = Some(async_id);
                        entry.promise.set_request(entry.request);
                    }
                    let rekeyed = entry
                        .request
                        .async_id
                        .map_or(CorrelationKey::Message(entry.request.message_id), CorrelationKey::Async);
                    let promise = entry.promise.clone();
                    self.pending.insert(rekeyed, entry);
                    Route::Interim(promise, message.body)
                }
                Disposition::Final => {
                    if entry.cancel_requested {
                        trace!(message_id = %entry.request.message_id, "reply arrived ahead of the cancel");
                    }
                    Route::Settle(entry.promise, Outcome::Fulfilled(message.body))
                }
                Disposition::Failed(status) => Route::Settle(
                    entry.promise,
                    Outcome::Failed(Error::Status {
                        message_id: entry.request.message_id,
                        status,
                    }),
                ),
                Disposition::CancelAck => Route::Settle(entry.promise, Outcome::Cancelled),
            });
        }

        let Some(token) = header.break_token else {
            return Err(Error::Unroutable {
                message_id: header.message_id,
            });
        };

        if let Some(registration) = self.breaks.get(&token) {
            return Ok(Route::Break {
                promise: registration.promise.clone(),
                ack: registration.ack.clone(),
                message,
            });
        }

        if self.orphans.len() >= max_orphans {
            return Err(Error::UnclaimedBreak {
                token,
                buffered: self.orphans.len(),
            });
        }
        self.orphans.push_back(message);
        Ok(Route::Buffered(token))
    }
}

struct Shared<C: Codec> {
    token: Token,
    me: Weak<Shared<C>>,
    codec: C,
    peer_addr: SocketAddr,
    max_frame_size: usize,
    max_orphan_breaks: usize,
    execution: Execution,
    io: Arc<Mutex<Io>>,
    state: Mutex<State<C>>,
    background: Mutex<Vec<Promise<()>>>,
    loop_handle: Mutex<Option<LoopHandle>>,
    connecting: AtomicBool,
    closed: AtomicBool,
    wants_write: AtomicBool,
    read_scheduled: AtomicBool,
    read_pending: AtomicBool,
}

/// A multiplexed client connection. Cloning yields another handle to the same connection.
///
/// The connection stays registered with its [`EventLoop`](crate::EventLoop) until it is closed, either explicitly
/// with [`close`](Connection::close) or by a connection-level failure.
pub struct Connection<C: Codec> {
    shared: Arc<Shared<C>>,
}

impl<C: Codec> Clone for Connection<C> {
    fn clone(&self) -> Self {
        Connection {
            shared: self.shared.clone(),
        }
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl<C: Codec> Connection<C> {
    /// Starts a non-blocking connect to `addr`.
    ///
    /// Operations may be submitted right away; they are written once the event loop sees the connect complete.
    pub fn connect(
        addr: SocketAddr,
        codec: C,
        config: &EngineConfig,
        execution: Execution,
    ) -> Result<Self> {
        let transport = TcpTransport::connect(addr)?;
        Ok(Self::with_transport(transport, codec, config, execution))
    }

    /// Wraps an already connected socket.
    pub fn from_stream(
        stream: std::net::TcpStream,
        codec: C,
        config: &EngineConfig,
        execution: Execution,
    ) -> Result<Self> {
        let transport = TcpTransport::from_std(stream)?;
        Ok(Self::with_transport(transport, codec, config, execution))
    }

    fn with_transport(
        transport: TcpTransport,
        codec: C,
        config: &EngineConfig,
        execution: Execution,
    ) -> Self {
        let token = Token(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
        let connecting = transport.is_connecting();
        let peer_addr = transport.peer_addr();
        debug!(connection = token.0, %peer_addr, offload = execution.is_offload(), "connection created");

        let io = Io {
            transport,
            assembler: FrameAssembler::new(config.max_frame_size),
            send_buf: BytesMut::new(),
            scratch: vec![0; config.read_chunk.max(1)],
        };

        let shared = Arc::new_cyclic(|me| Shared {
            token,
            me: me.clone(),
            codec,
            peer_addr,
            max_frame_size: config.max_frame_size,
            max_orphan_breaks: config.max_orphan_breaks,
            execution,
            io: Arc::new(Mutex::new(io)),
            state: Mutex::new(State::new()),
            background: Mutex::new(Vec::new()),
            loop_handle: Mutex::new(None),
            connecting: AtomicBool::new(connecting),
            closed: AtomicBool::new(false),
            wants_write: AtomicBool::new(false),
            read_scheduled: AtomicBool::new(false),
            read_pending: AtomicBool::new(false),
        });
        Connection { shared }
    }
}

// ============================================================================
// Operations
// ============================================================================

impl<C: Codec> Connection<C> {
    /// Submits a batch of operations, returning one promise per operation in the same order.
    ///
    /// Fails with the sticky error if the connection has already failed or been closed.
    pub fn submit<I>(&self, ops: I) -> Result<Vec<Promise<C::Reply>>>
    where
        I: IntoIterator<Item = Operation<C>>,
    {
        let shared = &self.shared;
        let mut promises = Vec::new();
        let mut unsent = Vec::new();
        let mut mirrors = Vec::new();
        let mut rejected = Vec::new();
        let mut queued_any = false;

        {
            let mut state = shared.state.lock();
            if let Some(err) = &state.sticky {
                return Err(err.clone());
            }

            for op in ops {
                match op {
                    Operation::Request(body) => {
                        let request = state.next_request();
                        let promise = Promise::for_request(request);
                        trace!(connection = shared.token.0, message_id = %request.message_id, "request queued");
                        state.queue.push_back(Queued::Request {
                            request,
                            body,
                            promise: promise.clone(),
                        });
                        promises.push(promise);
                        queued_any = true;
                    }
                    Operation::Cancel(target) => {
                        let promise = Promise::new();
                        match state.plan_cancel(&target) {
                            CancelPlan::Sent(target) => {
                                debug!(connection = shared.token.0, request = ?target.request(), "cancel queued");
                                mirrors.push((target, promise.clone()));
                                queued_any = true;
                            }
                            CancelPlan::Unsent(target) => {
                                debug!(connection = shared.token.0, request = ?target.request(), "cancelled before send");
                                unsent.push(target.clone());
                                mirrors.push((target, promise.clone()));
                            }
                            CancelPlan::Rejected(err) => {
                                debug!(connection = shared.token.0, %err, "cancel rejected");
                                rejected.push((promise.clone(), err));
                            }
                        }
                        promises.push(promise);
                    }
                }
            }
        }

        for target in unsent {
            target.cancel();
        }
        for (target, cancel) in mirrors {
            target.add_continuation(move |outcome| {
                cancel.settle(outcome.clone());
            });
        }
        for (promise, err) in rejected {
            promise.fail(err);
        }

        if queued_any {
            shared.schedule_flush();
        }
        Ok(promises)
    }

    /// Submits a single request.
    pub fn call(&self, request: C::Request) -> Result<Promise<C::Reply>> {
        self.submit_one(Operation::Request(request))
    }

    /// Cancels the request behind `target`. The returned promise settles with whatever `target` settles with.
    pub fn cancel(&self, target: &Promise<C::Reply>) -> Result<Promise<C::Reply>> {
        self.submit_one(Operation::Cancel(target.clone()))
    }

    fn submit_one(&self, op: Operation<C>) -> Result<Promise<C::Reply>> {
        self.submit([op])?
            .pop()
            .ok_or_else(|| Error::invalid_state("submit returned no promise"))
    }

    /// Registers interest in break notifications for `token`.
    ///
    /// The returned promise completes with the first notification. Notifications that arrived before the
    /// registration are replayed immediately. Registering a token again replaces the previous registration and
    /// cancels its promise.
    pub fn register_break(&self, token: BreakToken) -> Result<Promise<C::Reply>> {
        self.shared.register_break(token, None)
    }

    /// Like [`register_break`](Self::register_break), additionally calling `ack` for every notification.
    pub fn register_break_with_ack<F>(&self, token: BreakToken, ack: F) -> Result<Promise<C::Reply>>
    where
        F: Fn(&Incoming<C::Reply>) + Send + Sync + 'static,
    {
        self.shared.register_break(token, Some(Arc::new(ack)))
    }

    /// Removes the registration for `token`, cancelling its promise if no notification has arrived. Returns `false`
    /// if there was none.
    pub fn unregister_break(&self, token: BreakToken) -> bool {
        let removed = self.shared.state.lock().breaks.remove(&token);
        match removed {
            Some(registration) => {
                registration.promise.cancel();
                true
            }
            None => false,
        }
    }

    /// Returns the first background failure (an offloaded flush or read) not reported yet.
    ///
    /// Such failures have already failed the connection; this surfaces them on the caller's thread even if nobody
    /// was watching a promise when they happened.
    pub fn raise_errors(&self) -> Result<()> {
        let mut background = self.shared.background.lock();
        background.retain(|job| !matches!(job.outcome(), Some(Outcome::Fulfilled(()) | Outcome::Cancelled)));
        let failed = background
            .iter()
            .position(|job| matches!(job.outcome(), Some(Outcome::Failed(_))));
        match failed.map(|pos| background.remove(pos).outcome()) {
            Some(Some(Outcome::Failed(err))) => Err(err),
            _ => Ok(()),
        }
    }

    /// Closes the connection. Every promise still pending fails with [`Error::ConnectionClosed`] and later
    /// submissions fail fast.
    pub fn close(&self) {
        self.shared.fail(Error::ConnectionClosed);
    }
}

// ============================================================================
// Introspection
// ============================================================================

impl<C: Codec> Connection<C> {
    /// Token the connection is registered with.
    pub fn token(&self) -> Token {
        self.shared.token
    }

    /// Process-unique connection id.
    pub fn id(&self) -> usize {
        self.shared.token.0
    }

    /// Address of the server.
    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    /// Sent requests awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Operations not written yet.
    pub fn queued_count(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Whether the connection has been closed or has failed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Whether the connect is still in progress.
    pub fn is_connecting(&self) -> bool {
        self.shared.connecting.load(Ordering::Acquire)
    }

    /// The error latched when the connection closed or failed.
    pub fn sticky_error(&self) -> Option<Error> {
        self.shared.state.lock().sticky.clone()
    }

    /// How socket work is executed.
    pub fn execution(&self) -> &Execution {
        &self.shared.execution
    }

    /// The connection as an event-loop endpoint.
    pub fn endpoint(&self) -> Arc<dyn Endpoint> {
        self.shared.clone()
    }
}

impl<C: Codec> fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("peer_addr", &self.peer_addr())
            .field("closed", &self.is_closed())
            .field("execution", &self.shared.execution)
            .finish()
    }
}

// ============================================================================
// Socket work
// ============================================================================

/// Clears the read-scheduled flag when a read job ends, unwinding included.
struct ReadScheduled<'a>(&'a AtomicBool);

impl Drop for ReadScheduled<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<C: Codec> Shared<C> {
    fn schedule_flush(&self) {
        if self.connecting.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire) {
            return;
        }
        let Some(this) = self.me.upgrade() else {
            return;
        };
        let job = self
            .execution
            .run(&self.io, move |mut io: MutexGuard<'_, Io>| {
                let result = this.flush(&mut io);
                drop(io);
                this.settle_io_result(result)
            });
        self.track(job);
    }

    fn request_read(&self) {
        self.read_pending.store(true, Ordering::SeqCst);
        if self.read_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(this) = self.me.upgrade() else {
            self.read_scheduled.store(false, Ordering::SeqCst);
            return;
        };
        let job = self
            .execution
            .run(&self.io, move |io: MutexGuard<'_, Io>| this.read_and_dispatch(io));
        self.track(job);
    }

    fn read_and_dispatch(&self, mut io: MutexGuard<'_, Io>) -> Result<()> {
        let scheduled = ReadScheduled(&self.read_scheduled);
        self.read_pending.store(false, Ordering::SeqCst);
        let (messages, status) = if self.closed.load(Ordering::Acquire) {
            (Vec::new(), Ok(()))
        } else {
            self.read(&mut io)
        };
        drop(io);

        let mut result = status;
        for message in messages {
            if let Err(err) = self.dispatch(message) {
                result = Err(err);
                break;
            }
        }
        let result = self.settle_io_result(result);

        drop(scheduled);
        if self.read_pending.load(Ordering::SeqCst) && !self.closed.load(Ordering::Acquire) {
            self.request_read();
        }
        result
    }

    /// Moves the outbound queue into the pending map, encodes it and writes as much as the socket takes.
    fn flush(&self, io: &mut Io) -> Result<()> {
        if io.transport.is_connecting() {
            return Ok(());
        }

        let batch: Vec<Queued<C>> = {
            let mut state = self.state.lock();
            if state.sticky.is_some() {
                return Ok(());
            }
            let batch: Vec<_> = state.queue.drain(..).collect();
            for queued in &batch {
                if let Queued::Request {
                    request, promise, ..
                } = queued
                {
                    state.pending.insert(
                        CorrelationKey::Message(request.message_id),
                        PendingEntry::sent(promise.clone(), *request),
                    );
                }
            }
            batch
        };

        for queued in &batch {
            let outgoing = match queued {
                Queued::Request { request, body, .. } => Outgoing {
                    message_id: request.message_id,
                    async_id: None,
                    body: Body::Request(body),
                },
                Queued::Cancel { target } => Outgoing {
                    message_id: target.message_id,
                    async_id: target.async_id,
                    body: Body::Cancel,
                },
            };
            let len = encode_frame(&mut io.send_buf, self.max_frame_size, |dst| {
                self.codec.encode(&outgoing, dst)
            })?;
            trace!(connection = self.token.0, message_id = %outgoing.message_id, len, "frame encoded");
        }

        self.write_buffered(io)
    }

    fn write_buffered(&self, io: &mut Io) -> Result<()> {
        while !io.send_buf.is_empty() {
            match io.transport.send(&io.send_buf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => io.send_buf.advance(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    trace!(connection = self.token.0, remaining = io.send_buf.len(), "socket full");
                    if !self.wants_write.swap(true, Ordering::AcqRel) {
                        self.wake_loop();
                    }
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.wants_write.store(false, Ordering::Release);
        Ok(())
    }

    /// Reads until the socket would block, returning every decoded message and how reading ended.
    fn read(&self, io: &mut Io) -> (Vec<Incoming<C::Reply>>, Result<()>) {
        let mut messages = Vec::new();
        let status = loop {
            match io.transport.recv(&mut io.scratch) {
                Ok(0) => break Err(Error::ConnectionClosed),
                Ok(n) => {
                    io.assembler.extend(&io.scratch[..n]);
                    if let Err(err) = self.decode_frames(&mut io.assembler, &mut messages) {
                        break Err(err);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => break Err(err.into()),
            }
        };
        (messages, status)
    }

    fn decode_frames(
        &self,
        assembler: &mut FrameAssembler,
        messages: &mut Vec<Incoming<C::Reply>>,
    ) -> Result<()> {
        while let Some(frame) = assembler.next_frame()? {
            let decoded = self.codec.decode(&frame)?;
            trace!(connection = self.token.0, len = frame.len(), messages = decoded.len(), "frame decoded");
            messages.extend(decoded);
        }
        Ok(())
    }

    fn dispatch(&self, message: Incoming<C::Reply>) -> Result<()> {
        let header: ReplyHeader = message.header;
        let route = {
            let mut state = self.state.lock();
            if state.sticky.is_some() {
                return Ok(());
            }
            state.route(message, self.max_orphan_breaks)?
        };

        match route {
            Route::Settle(promise, outcome) => {
                debug!(
                    connection = self.token.0,
                    message_id = %header.message_id,
                    disposition = ?header.disposition,
                    "reply dispatched"
                );
                promise.settle(outcome);
            }
            Route::Interim(promise, body) => {
                debug!(
                    connection = self.token.0,
                    message_id = %header.message_id,
                    async_id = ?header.async_id,
                    "operation continues asynchronously"
                );
                promise.update_interim(body);
            }
            Route::Break {
                promise,
                ack,
                message,
            } => {
                debug!(connection = self.token.0, token = ?message.header.break_token, "break notification");
                deliver_break(&promise, ack.as_ref(), &message);
            }
            Route::Buffered(token) => {
                warn!(connection = self.token.0, %token, "break notification for an unregistered token buffered");
            }
        }
        Ok(())
    }

    fn register_break(
        &self,
        token: BreakToken,
        ack: Option<BreakAck<C::Reply>>,
    ) -> Result<Promise<C::Reply>> {
        let promise = Promise::new();
        let (replaced, replay) = {
            let mut state = self.state.lock();
            if let Some(err) = &state.sticky {
                return Err(err.clone());
            }
            let replaced = state.breaks.insert(
                token,
                BreakRegistration {
                    promise: promise.clone(),
                    ack: ack.clone(),
                },
            );
            let (replay, keep): (VecDeque<_>, VecDeque<_>) = state
                .orphans
                .drain(..)
                .partition(|message| message.header.break_token == Some(token));
            state.orphans = keep;
            (replaced, replay)
        };

        if let Some(previous) = replaced {
            previous.promise.cancel();
        }
        if !replay.is_empty() {
            debug!(connection = self.token.0, %token, replayed = replay.len(), "replaying buffered break notifications");
        }
        for message in &replay {
            deliver_break(&promise, ack.as_ref(), message);
        }
        Ok(promise)
    }

    /// Routes a failed socket step and decides whether it counts as a background failure.
    ///
    /// Orderly closes are not failures; transient conditions are not even closes.
    fn settle_io_result(&self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_transient() => Ok(()),
            Err(err) => {
                let orderly = err.is_orderly_close();
                route_failure(self, err.clone());
                if orderly {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    fn track(&self, job: Promise<()>) {
        if matches!(job.outcome(), Some(Outcome::Fulfilled(()))) {
            return;
        }

        let me = self.me.clone();
        job.add_continuation(move |outcome| {
            let cause = match outcome {
                Outcome::Cancelled => Error::PoolShutdown,
                Outcome::Failed(err) if err.class() == ErrorClass::Offload => err.clone(),
                _ => return,
            };
            if let Some(shared) = me.upgrade() {
                shared.fail(cause);
            }
        });

        let mut background = self.background.lock();
        background.retain(|job| !matches!(job.outcome(), Some(Outcome::Fulfilled(()) | Outcome::Cancelled)));
        background.push(job);
    }

    fn wake_loop(&self) {
        if let Some(handle) = self.loop_handle.lock().as_ref() {
            handle.wake();
        }
    }

    /// Fails the connection: latches `cause`, fails everything still pending with [`Error::ConnectionClosed`] and
    /// shuts the socket down. Only the first call has an effect.
    fn fail(&self, cause: Error) {
        let promises = {
            let mut state = self.state.lock();
            if state.sticky.is_some() {
                return;
            }
            state.sticky = Some(cause.clone());
            self.closed.store(true, Ordering::Release);
            state.drain_outstanding()
        };

        if cause.is_orderly_close() {
            info!(connection = self.token.0, peer_addr = %self.peer_addr, failed = promises.len(), "connection closed");
        } else {
            error!(connection = self.token.0, peer_addr = %self.peer_addr, %cause, failed = promises.len(), "connection failed");
        }

        for promise in promises {
            promise.fail(Error::ConnectionClosed);
        }

        let mut io = self.io.lock();
        if let Err(err) = io.transport.shutdown() {
            debug!(connection = self.token.0, %err, "shutdown failed");
        }
        io.assembler.clear();
        io.send_buf.clear();
        drop(io);

        self.wants_write.store(false, Ordering::Release);
        self.wake_loop();
    }
}

impl<C: Codec> Drop for Shared<C> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.sticky.is_some() {
            return;
        }
        state.sticky = Some(Error::ConnectionClosed);
        let promises = state.drain_outstanding();
        if !promises.is_empty() {
            debug!(connection = self.token.0, failed = promises.len(), "connection dropped with operations outstanding");
        }
        for promise in promises {
            promise.fail(Error::ConnectionClosed);
        }
    }
}

fn deliver_break<R: Clone>(promise: &Promise<R>, ack: Option<&BreakAck<R>>, message: &Incoming<R>) {
    promise.complete(message.body.clone());
    if let Some(ack) = ack {
        ack(message);
    }
}

// ============================================================================
// Event loop callbacks
// ============================================================================

impl<C: Codec> Endpoint for Shared<C> {
    fn token(&self) -> Token {
        self.token
    }

    fn attach(&self, poller: &mut dyn Poller, interest: Interest) -> io::Result<()> {
        let mut io = self.io.lock();
        poller.register(io.transport.source(), self.token, interest)
    }

    fn reattach(&self, poller: &mut dyn Poller, interest: Interest) -> io::Result<()> {
        let mut io = self.io.lock();
        poller.reregister(io.transport.source(), self.token, interest)
    }

    fn detach(&self, poller: &mut dyn Poller) -> io::Result<()> {
        let mut io = self.io.lock();
        poller.deregister(io.transport.source(), self.token)
    }

    fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }

    fn wants_write(&self) -> bool {
        self.wants_write.load(Ordering::Acquire)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn handle_connect(&self) -> Result<bool> {
        let connected = self.io.lock().transport.finish_connect()?;
        if connected {
            self.connecting.store(false, Ordering::Release);
            self.schedule_flush();
        }
        Ok(connected)
    }

    fn handle_read(&self) -> Result<()> {
        if !self.is_closed() {
            self.request_read();
        }
        Ok(())
    }

    fn handle_write(&self) -> Result<()> {
        self.schedule_flush();
        Ok(())
    }

    fn handle_close(&self) {
        self.fail(Error::ConnectionClosed);
    }

    fn handle_error(&self, err: Error) {
        self.fail(err);
    }

    fn bind_loop(&self, handle: &LoopHandle) {
        *self.loop_handle.lock() = Some(handle.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AsyncId, CodecError};

    struct NullCodec;

    impl Codec for NullCodec {
        type Request = ();
        type Reply = u32;

        fn encode(&self, _: &Outgoing<'_, ()>, _: &mut BytesMut) -> Result<(), CodecError> {
            Ok(())
        }

        fn decode(&self, _: &[u8]) -> Result<Vec<Incoming<u32>>, CodecError> {
            Ok(Vec::new())
        }
    }

    fn reply(message_id: u64, disposition: Disposition, body: u32) -> Incoming<u32> {
        Incoming {
            header: ReplyHeader {
                disposition,
                ..ReplyHeader::reply(MessageId(message_id))
            },
            body,
        }
    }

    fn sent(state: &mut State<NullCodec>) -> Promise<u32> {
        let request = state.next_request();
        let promise = Promise::for_request(request);
        state.pending.insert(
            CorrelationKey::Message(request.message_id),
            PendingEntry::sent(promise.clone(), request),
        );
        promise
    }

    #[test]
    fn async_reply_rekeys_without_losing_the_promise() {
        let mut state = State::<NullCodec>::new();
        let promise = sent(&mut state);

        let mut interim = reply(0, Disposition::AsyncPending, 1);
        interim.header.async_id = Some(AsyncId(77));
        let route = state.route(interim, 0).unwrap();
        assert!(matches!(route, Route::Interim(_, 1)));
        assert!(state.pending.contains_key(&CorrelationKey::Async(AsyncId(77))));
        assert!(!state.pending.contains_key(&CorrelationKey::Message(MessageId(0))));
        assert_eq!(promise.request().unwrap().async_id, Some(AsyncId(77)));

        let mut last = reply(0, Disposition::Final, 2);
        last.header.async_id = Some(AsyncId(77));
        match state.route(last, 0).unwrap() {
            Route::Settle(settled, Outcome::Fulfilled(2)) => assert!(settled.ptr_eq(&promise)),
            _ => panic!("final reply under the async id should settle the promise"),
        }
        assert!(state.pending.is_empty());
    }

    #[test]
    fn failure_status_is_an_operation_error() {
        let mut state = State::<NullCodec>::new();
        sent(&mut state);
        match state.route(reply(0, Disposition::Failed(0xC000_0034), 0), 0).unwrap() {
            Route::Settle(_, Outcome::Failed(err)) => assert_eq!(
                err,
                Error::Status {
                    message_id: MessageId(0),
                    status: 0xC000_0034
                }
            ),
            _ => panic!("expected a failed settlement"),
        }
    }

    #[test]
    fn unmatched_reply_is_unroutable() {
        let mut state = State::<NullCodec>::new();
        assert!(matches!(
            state.route(reply(5, Disposition::Final, 0), 4),
            Err(Error::Unroutable { message_id: MessageId(5) })
        ));
    }

    #[test]
    fn orphan_breaks_are_bounded() {
        let mut state = State::<NullCodec>::new();
        let token = BreakToken([1; 16]);
        let notification = || Incoming {
            header: ReplyHeader::break_notification(token),
            body: 0,
        };

        assert!(matches!(state.route(notification(), 2), Ok(Route::Buffered(_))));
        assert!(matches!(state.route(notification(), 2), Ok(Route::Buffered(_))));
        assert!(matches!(
            state.route(notification(), 2),
            Err(Error::UnclaimedBreak { buffered: 2, .. })
        ));
    }

    #[test]
    fn cancel_plan_prefers_async_then_message_then_queue() {
        let mut state = State::<NullCodec>::new();
        let sent_promise = sent(&mut state);
        assert!(matches!(state.plan_cancel(&sent_promise), CancelPlan::Sent(_)));
        assert!(state.pending[&CorrelationKey::Message(MessageId(0))].cancel_requested);
        assert!(matches!(state.queue.back(), Some(Queued::Cancel { .. })));

        let request = state.next_request();
        let queued = Promise::for_request(request);
        state.queue.push_back(Queued::Request {
            request,
            body: (),
            promise: queued.clone(),
        });
        assert!(matches!(state.plan_cancel(&queued), CancelPlan::Unsent(_)));
        assert!(state
            .queue
            .iter()
            .all(|queued| matches!(queued, Queued::Cancel { .. })));

        let stranger = Promise::for_request(RequestRef::new(MessageId(99)));
        assert!(matches!(
            state.plan_cancel(&stranger),
            CancelPlan::Rejected(Error::NotPending(MessageId(99)))
        ));
    }

    #[test]
    fn break_notifications_route_by_registration_token() {
        let mut state = State::<NullCodec>::new();
        sent(&mut state);
        let token = BreakToken([5; 16]);
        let registration = Promise::new();
        state.breaks.insert(
            token,
            BreakRegistration {
                promise: registration.clone(),
                ack: None,
            },
        );

        let notification = Incoming {
            header: ReplyHeader::break_notification(token),
            body: 9,
        };
        match state.route(notification, 0).unwrap() {
            Route::Break { promise, message, .. } => {
                assert!(promise.ptr_eq(&registration));
                assert_eq!(message.body, 9);
            }
            _ => panic!("a registered token should route to its registration"),
        }
        assert_eq!(state.pending.len(), 1);
        assert_eq!(state.breaks.len(), 1);
    }

    #[test]
    fn repeated_cancel_queues_a_single_frame() {
        let mut state = State::<NullCodec>::new();
        let promise = sent(&mut state);

        let first = state.plan_cancel(&promise);
        let second = state.plan_cancel(&promise);
        assert!(matches!(first, CancelPlan::Sent(ref target) if target.ptr_eq(&promise)));
        assert!(matches!(second, CancelPlan::Sent(ref target) if target.ptr_eq(&promise)));
        assert_eq!(state.queue.len(), 1);
    }

    #[test]
    fn drain_outstanding_empties_every_table() {
        let mut state = State::<NullCodec>::new();
        let sent_promise = sent(&mut state);
        let request = state.next_request();
        let queued = Promise::for_request(request);
        state.queue.push_back(Queued::Request {
            request,
            body: (),
            promise: queued.clone(),
        });
        state.queue.push_back(Queued::Cancel { target: request });
        let registration = Promise::new();
        state.breaks.insert(
            BreakToken([2; 16]),
            BreakRegistration {
                promise: registration.clone(),
                ack: None,
            },
        );
        state.orphans.push_back(Incoming {
            header: ReplyHeader::break_notification(BreakToken([3; 16])),
            body: 0,
        });

        let drained = state.drain_outstanding();
        assert_eq!(drained.len(), 3);
        for promise in [&sent_promise, &queued, &registration] {
            assert!(drained.iter().any(|drained| drained.ptr_eq(promise)));
        }
        assert!(state.pending.is_empty() && state.queue.is_empty());
        assert!(state.breaks.is_empty() && state.orphans.is_empty());
    }

    #[test]
    fn dropping_the_last_handle_fails_outstanding_promises() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let conn = Connection::from_stream(stream, NullCodec, &EngineConfig::default(), Execution::Inline).unwrap();

        let registration = conn.register_break(BreakToken([4; 16])).unwrap();
        let pending = {
            let mut state = conn.shared.state.lock();
            sent(&mut state)
        };
        drop(conn);

        assert_eq!(pending.outcome(), Some(Outcome::Failed(Error::ConnectionClosed)));
        assert_eq!(registration.outcome(), Some(Outcome::Failed(Error::ConnectionClosed)));
    }
}
