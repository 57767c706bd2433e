//! The codec collaborator and the identifiers the engine correlates on.
//!
//! The engine never looks at command payloads. A [`Codec`] turns outgoing operations into frame payloads and frame
//! payloads back into [`Incoming`] messages, and each incoming message exposes a [`ReplyHeader`] with everything the
//! multiplexer needs: the primary [`MessageId`], an optional [`AsyncId`] assigned by an async-processing reply, an
//! optional [`BreakToken`] for unsolicited break notifications, and the [`Disposition`] of the reply.

use std::{borrow::Cow, fmt};

use bytes::BytesMut;
use thiserror::Error;

/// Primary identifier assigned to a request when it is submitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Identifier carried by unsolicited server messages such as break notifications.
    pub const UNSOLICITED: MessageId = MessageId(u64::MAX);
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier assigned by the server in an async-processing reply. The final reply arrives under this id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsyncId(pub u64);

impl fmt::Display for AsyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "async:{}", self.0)
    }
}

/// Capability token (lease key or oplock handle) that break notifications are keyed by.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakToken(pub [u8; 16]);

impl fmt::Debug for BreakToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BreakToken({self})")
    }
}

impl fmt::Display for BreakToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Key of the pending map: the identifier a reply to an outstanding request is matched by.
///
/// Break notifications are matched by [`BreakToken`] against break registrations instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    /// Primary request identifier.
    Message(MessageId),
    /// Re-keyed identifier from an async-processing reply.
    Async(AsyncId),
}

/// Identifies the request a promise belongs to, as far as the engine knows it right now.
///
/// The async id is filled in once the server re-keys the request with an async-processing reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestRef {
    /// Primary identifier assigned at submit time.
    pub message_id: MessageId,
    /// Async identifier, once assigned by the server.
    pub async_id: Option<AsyncId>,
}

impl RequestRef {
    /// Creates a reference to a request that has not been re-keyed.
    pub fn new(message_id: MessageId) -> Self {
        RequestRef {
            message_id,
            async_id: None,
        }
    }
}

/// What an incoming message means for the operation it correlates with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// A final, successful reply.
    Final,
    /// The server is still working on the request; the final reply will arrive under the async id.
    AsyncPending,
    /// A final reply carrying a failure status.
    Failed(u32),
    /// The server acknowledged a cancel; the operation will not complete.
    CancelAck,
}

/// The correlation-relevant part of an incoming message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplyHeader {
    /// Primary identifier of the request this answers, or [`MessageId::UNSOLICITED`].
    pub message_id: MessageId,
    /// Async identifier, if the server assigned one.
    pub async_id: Option<AsyncId>,
    /// Break token, for unsolicited break notifications.
    pub break_token: Option<BreakToken>,
    /// Outcome the message reports.
    pub disposition: Disposition,
}

impl ReplyHeader {
    /// Header of a final reply to `message_id`.
    pub fn reply(message_id: MessageId) -> Self {
        ReplyHeader {
            message_id,
            async_id: None,
            break_token: None,
            disposition: Disposition::Final,
        }
    }

    /// Header of an unsolicited break notification for `token`.
    pub fn break_notification(token: BreakToken) -> Self {
        ReplyHeader {
            message_id: MessageId::UNSOLICITED,
            async_id: None,
            break_token: Some(token),
            disposition: Disposition::Final,
        }
    }
}

/// A decoded message handed to the multiplexer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Incoming<R> {
    /// Correlation header.
    pub header: ReplyHeader,
    /// Command-specific payload, opaque to the engine.
    pub body: R,
}

/// Payload of an outgoing message.
#[derive(Debug)]
pub enum Body<'a, R> {
    /// A regular request.
    Request(&'a R),
    /// A protocol-level cancel for the request identified by the surrounding [`Outgoing`].
    Cancel,
}

/// A message ready to be encoded.
#[derive(Debug)]
pub struct Outgoing<'a, R> {
    /// For requests, the assigned id. For cancels, the id of the request being cancelled.
    pub message_id: MessageId,
    /// For cancels of a re-keyed request, its async id.
    pub async_id: Option<AsyncId>,
    /// Payload.
    pub body: Body<'a, R>,
}

/// Encodes outgoing operations and decodes incoming frames.
///
/// Both functions are treated as pure. An error from either is fatal to the connection.
pub trait Codec: Send + Sync + 'static {
    /// Request payload submitted by callers.
    type Request: Send + 'static;
    /// Reply payload delivered through promises. Settled replies are shared between every handle of a promise, so
    /// they must be `Sync` as well.
    type Reply: Clone + Send + Sync + 'static;

    /// Appends the payload of one frame for `msg` to `dst`. The engine adds the length prefix.
    fn encode(&self, msg: &Outgoing<'_, Self::Request>, dst: &mut BytesMut) -> Result<(), CodecError>;

    /// Decodes one frame payload into the messages it carries.
    fn decode(&self, frame: &[u8]) -> Result<Vec<Incoming<Self::Reply>>, CodecError>;
}

/// Error returned by a [`Codec`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The frame ended before the message did.
    #[error("truncated message: needed {needed} bytes, had {available}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        available: usize,
    },
    /// The frame is not a valid message.
    #[error("malformed message: {0}")]
    Malformed(Cow<'static, str>),
    /// The codec cannot encode this operation.
    #[error("unsupported operation: {0}")]
    Unsupported(Cow<'static, str>),
}
