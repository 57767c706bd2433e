#![allow(dead_code)]
//! Shared fixtures: a small binary codec and a scripted peer on a loopback socket.
//!
//! Every frame payload carries one message laid out as
//! `message_id: u64 | async_id: u64 | kind: u8 | status: u32 | token: [u8; 16] | body`, all big endian. An async id of
//! zero means "none".

use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use bytes::{BufMut, BytesMut};
use smbmux::{
    codec::{
        AsyncId, Body, BreakToken, Codec, CodecError, Disposition, Incoming, MessageId, Outgoing,
        ReplyHeader,
    },
    Backend, Connection, EngineConfig, Error, EventLoop, Execution,
};

pub const HEADER_LEN: usize = 8 + 8 + 1 + 4 + 16;
pub const BUDGET: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "smbmux=warn".into()),
        )
        .with_test_writer()
        .try_init();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    Final = 0,
    AsyncPending = 1,
    Failed = 2,
    CancelAck = 3,
    Break = 4,
    Request = 5,
    Cancel = 6,
}

impl Kind {
    fn from_u8(raw: u8) -> Option<Kind> {
        Some(match raw {
            0 => Kind::Final,
            1 => Kind::AsyncPending,
            2 => Kind::Failed,
            3 => Kind::CancelAck,
            4 => Kind::Break,
            5 => Kind::Request,
            6 => Kind::Cancel,
            _ => return None,
        })
    }
}

/// One message as it appears on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Wire {
    pub message_id: u64,
    pub async_id: u64,
    pub kind: Kind,
    pub status: u32,
    pub token: [u8; 16],
    pub body: Vec<u8>,
}

impl Wire {
    pub fn reply(message_id: u64, body: &[u8]) -> Self {
        Wire {
            message_id,
            async_id: 0,
            kind: Kind::Final,
            status: 0,
            token: [0; 16],
            body: body.to_vec(),
        }
    }

    pub fn interim(message_id: u64, async_id: u64, body: &[u8]) -> Self {
        Wire {
            async_id,
            kind: Kind::AsyncPending,
            ..Wire::reply(message_id, body)
        }
    }

    pub fn failed(message_id: u64, status: u32) -> Self {
        Wire {
            kind: Kind::Failed,
            status,
            ..Wire::reply(message_id, b"")
        }
    }

    pub fn cancel_ack(message_id: u64) -> Self {
        Wire {
            kind: Kind::CancelAck,
            ..Wire::reply(message_id, b"")
        }
    }

    pub fn break_notification(token: [u8; 16], body: &[u8]) -> Self {
        Wire {
            kind: Kind::Break,
            token,
            ..Wire::reply(u64::MAX, body)
        }
    }

    pub fn write_payload(&self, dst: &mut BytesMut) {
        dst.put_u64(self.message_id);
        dst.put_u64(self.async_id);
        dst.put_u8(self.kind as u8);
        dst.put_u32(self.status);
        dst.put_slice(&self.token);
        dst.put_slice(&self.body);
    }

    /// Payload with its length prefix.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut payload = BytesMut::new();
        self.write_payload(&mut payload);
        let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&payload);
        frame
    }

    pub fn parse(payload: &[u8]) -> Result<Wire, CodecError> {
        if payload.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN,
                available: payload.len(),
            });
        }
        let u64_at = |at: usize| {
            let mut raw = [0; 8];
            raw.copy_from_slice(&payload[at..at + 8]);
            u64::from_be_bytes(raw)
        };
        let kind = Kind::from_u8(payload[16])
            .ok_or_else(|| CodecError::Malformed(format!("kind {}", payload[16]).into()))?;
        let mut status = [0; 4];
        status.copy_from_slice(&payload[17..21]);
        let mut token = [0; 16];
        token.copy_from_slice(&payload[21..37]);
        Ok(Wire {
            message_id: u64_at(0),
            async_id: u64_at(8),
            kind,
            status: u32::from_be_bytes(status),
            token,
            body: payload[HEADER_LEN..].to_vec(),
        })
    }
}

/// Client side of the test protocol.
#[derive(Clone, Copy, Debug, Default)]
pub struct TestCodec;

impl Codec for TestCodec {
    type Request = Vec<u8>;
    type Reply = Vec<u8>;

    fn encode(&self, msg: &Outgoing<'_, Vec<u8>>, dst: &mut BytesMut) -> Result<(), CodecError> {
        let (kind, body) = match msg.body {
            Body::Request(body) => (Kind::Request, body.clone()),
            Body::Cancel => (Kind::Cancel, Vec::new()),
        };
        Wire {
            message_id: msg.message_id.0,
            async_id: msg.async_id.map_or(0, |id| id.0),
            kind,
            status: 0,
            token: [0; 16],
            body,
        }
        .write_payload(dst);
        Ok(())
    }

    fn decode(&self, frame: &[u8]) -> Result<Vec<Incoming<Vec<u8>>>, CodecError> {
        let wire = Wire::parse(frame)?;
        let header = match wire.kind {
            Kind::Break => ReplyHeader::break_notification(BreakToken(wire.token)),
            Kind::Final | Kind::AsyncPending | Kind::Failed | Kind::CancelAck => ReplyHeader {
                message_id: MessageId(wire.message_id),
                async_id: (wire.async_id != 0).then_some(AsyncId(wire.async_id)),
                break_token: None,
                disposition: match wire.kind {
                    Kind::AsyncPending => Disposition::AsyncPending,
                    Kind::Failed => Disposition::Failed(wire.status),
                    Kind::CancelAck => Disposition::CancelAck,
                    _ => Disposition::Final,
                },
            },
            Kind::Request | Kind::Cancel => {
                return Err(CodecError::Malformed("client-bound frame carries a request".into()))
            }
        };
        Ok(vec![Incoming {
            header,
            body: wire.body,
        }])
    }
}

/// [`TestCodec`] that panics decoding a `boom` body and refuses to encode an `unencodable` request.
#[derive(Clone, Copy, Debug, Default)]
pub struct FaultyCodec;

impl Codec for FaultyCodec {
    type Request = Vec<u8>;
    type Reply = Vec<u8>;

    fn encode(&self, msg: &Outgoing<'_, Vec<u8>>, dst: &mut BytesMut) -> Result<(), CodecError> {
        if matches!(&msg.body, Body::Request(body) if body.as_slice() == b"unencodable") {
            return Err(CodecError::Malformed("request cannot be encoded".into()));
        }
        TestCodec.encode(msg, dst)
    }

    fn decode(&self, frame: &[u8]) -> Result<Vec<Incoming<Vec<u8>>>, CodecError> {
        let messages = TestCodec.decode(frame)?;
        if messages.iter().any(|message| message.body == b"boom") {
            panic!("codec blew up on a reply body");
        }
        Ok(messages)
    }
}

/// The server end of one accepted connection.
#[derive(Debug)]
pub struct Peer {
    stream: TcpStream,
}

impl Peer {
    /// Blocks until the next frame arrives.
    pub fn read(&mut self) -> io::Result<Wire> {
        let mut prefix = [0; 4];
        self.stream.read_exact(&mut prefix)?;
        let mut payload = vec![0; u32::from_be_bytes(prefix) as usize];
        self.stream.read_exact(&mut payload)?;
        Wire::parse(&payload).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    pub fn read_n(&mut self, n: usize) -> io::Result<Vec<Wire>> {
        (0..n).map(|_| self.read()).collect()
    }

    pub fn send(&mut self, messages: &[Wire]) -> io::Result<()> {
        let bytes: Vec<u8> = messages.iter().flat_map(Wire::to_frame).collect();
        self.stream.write_all(&bytes)
    }

    /// Writes `messages` split into `chunks` pieces at offsets that ignore frame boundaries.
    pub fn send_chunked(&mut self, messages: &[Wire], chunks: usize) -> io::Result<()> {
        let bytes: Vec<u8> = messages.iter().flat_map(Wire::to_frame).collect();
        let step = bytes.len().div_ceil(chunks).max(1);
        for piece in bytes.chunks(step) {
            self.stream.write_all(piece)?;
            self.stream.flush()?;
            thread::sleep(Duration::from_millis(20));
        }
        Ok(())
    }

    /// Returns `true` if nothing arrives within `window`.
    pub fn is_silent_for(&mut self, window: Duration) -> io::Result<bool> {
        self.stream.set_read_timeout(Some(window))?;
        let mut byte = [0; 1];
        let silent = match self.stream.read(&mut byte) {
            Ok(0) => true,
            Ok(_) => false,
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => true,
            Err(err) => return Err(err),
        };
        self.stream.set_read_timeout(Some(BUDGET))?;
        Ok(silent)
    }

    /// Blocks until the client closes its end.
    pub fn wait_for_eof(&mut self) -> io::Result<()> {
        let mut sink = Vec::new();
        self.stream.read_to_end(&mut sink).map(|_| ())
    }
}

/// Accepts one connection on a loopback port and hands it to `script` on a new thread.
pub fn serve<F>(script: F) -> (SocketAddr, JoinHandle<io::Result<()>>)
where
    F: FnOnce(Peer) -> io::Result<()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept()?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(BUDGET))?;
        script(Peer { stream })
    });
    (addr, handle)
}

/// Every backend paired with both execution modes.
pub fn matrix(config: &EngineConfig) -> Vec<(Backend, Execution)> {
    let mut setups = Vec::new();
    for &backend in Backend::ALL {
        setups.push((backend, Execution::Inline));
        setups.push((backend, Execution::offload(config).unwrap()));
    }
    setups
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        workers: 2,
        poll_timeout: Duration::from_millis(10),
        worker_wait: Duration::from_millis(20),
        scan_interval: Duration::from_millis(1),
        ..EngineConfig::default()
    }
}

/// Connects to `addr` and registers the connection with a fresh loop on `backend`.
pub fn connect(
    addr: SocketAddr,
    backend: Backend,
    execution: Execution,
    config: &EngineConfig,
) -> (EventLoop, Connection<TestCodec>) {
    connect_with(addr, TestCodec, backend, execution, config)
}

pub fn connect_with<C: Codec>(
    addr: SocketAddr,
    codec: C,
    backend: Backend,
    execution: Execution,
    config: &EngineConfig,
) -> (EventLoop, Connection<C>) {
    let mut event_loop = EventLoop::with_backend(backend, config).unwrap();
    let conn = Connection::connect(addr, codec, config, execution).unwrap();
    event_loop.register(&conn).unwrap();
    (event_loop, conn)
}

/// Polls [`Connection::raise_errors`] until a background failure surfaces.
pub fn next_background_error<C: Codec>(conn: &Connection<C>) -> Error {
    let deadline = Instant::now() + BUDGET;
    loop {
        match conn.raise_errors() {
            Err(err) => return err,
            Ok(()) if Instant::now() < deadline => thread::sleep(Duration::from_millis(5)),
            Ok(()) => panic!("no background failure surfaced within {BUDGET:?}"),
        }
    }
}
