//! Defines error handling constructs for smbmux.
//!
//! Every layer of the engine reports failures through the single [`Error`] type. Errors are `Clone` because the same
//! connection-level failure is latched on the connection (the *sticky* error) and handed to every promise that was
//! still waiting when it happened.
//!
//! Errors fall into the classes described by [`ErrorClass`]:
//! - transient socket conditions are never surfaced, the event loop simply re-arms;
//! - orderly-close conditions close the connection without treating it as a failure;
//! - framing errors (unroutable replies, codec failures, oversized frames) are fatal to the connection;
//! - operation errors (a failure status from the server) only fail the promise they belong to;
//! - offload errors come from the worker pool and are delivered through the owning promise.

use std::{borrow::Cow, io, sync::Arc};

use thiserror::Error;

use crate::codec::{BreakToken, CodecError, MessageId};

/// Result type used throughout smbmux.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error produced by the engine or delivered through a [`Promise`](crate::Promise).
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// An I/O error from the socket or the readiness poller.
    #[error("io error: {0}")]
    Io(Arc<io::Error>),
    /// The connection was closed while the operation was outstanding, or before it was submitted.
    #[error("connection closed")]
    ConnectionClosed,
    /// The codec collaborator failed to encode or decode a message.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// A length prefix announced a frame larger than the configured maximum.
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Announced payload size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
    /// A reply matched neither a pending operation nor a break registration.
    #[error("no pending operation matches message {message_id}")]
    Unroutable {
        /// The primary identifier carried by the reply.
        message_id: MessageId,
    },
    /// Too many break notifications arrived for tokens nobody has registered yet.
    #[error("break notification for unregistered token {token} dropped, {buffered} already waiting")]
    UnclaimedBreak {
        /// Token of the notification that could not be buffered.
        token: BreakToken,
        /// Number of notifications already buffered.
        buffered: usize,
    },
    /// The server completed the operation with a failure status.
    #[error("message {message_id} failed with status {status:#010x}")]
    Status {
        /// Identifier of the failed operation.
        message_id: MessageId,
        /// Protocol status code.
        status: u32,
    },
    /// Waiting on a promise timed out.
    #[error("timed out waiting for completion")]
    Timeout,
    /// The promise was cancelled.
    #[error("operation cancelled")]
    Cancelled,
    /// A cancel was requested for an operation that is neither queued nor awaiting a reply.
    #[error("message {0} is not pending")]
    NotPending(MessageId),
    /// A work item panicked on a pool worker.
    #[error("worker panicked: {0}")]
    WorkerPanicked(String),
    /// The worker pool was shut down before the work item ran.
    #[error("thread pool shut down")]
    PoolShutdown,
    /// An API was used in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(Cow<'static, str>),
}

/// Broad classification of an [`Error`], used to decide how far it propagates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Would-block, interrupted or connect-in-progress. Not an error, re-arm and poll again.
    Transient,
    /// The peer went away (reset, not connected, shutdown, aborted). Close the connection in an orderly fashion.
    OrderlyClose,
    /// Unroutable reply, decode failure or oversized frame. Fatal to the connection.
    Framing,
    /// The server reported a failure for a single operation. Never escalates to the connection.
    Operation,
    /// A failure inside the worker pool, delivered through the owning promise.
    Offload,
    /// Caller-side outcomes: timeouts, cancellation and API misuse.
    Caller,
    /// Any other socket or poller failure. Fatal to the connection.
    Fatal,
}

impl Error {
    /// Returns the class this error belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Io(err) => classify_io(err),
            Error::ConnectionClosed => ErrorClass::OrderlyClose,
            Error::Codec(_)
            | Error::FrameTooLarge { .. }
            | Error::Unroutable { .. }
            | Error::UnclaimedBreak { .. } => ErrorClass::Framing,
            Error::Status { .. } => ErrorClass::Operation,
            Error::WorkerPanicked(_) | Error::PoolShutdown => ErrorClass::Offload,
            Error::Timeout | Error::Cancelled | Error::NotPending(_) | Error::InvalidState(_) => {
                ErrorClass::Caller
            }
        }
    }

    /// Returns `true` if the error means the peer closed the connection rather than something going wrong.
    pub fn is_orderly_close(&self) -> bool {
        self.class() == ErrorClass::OrderlyClose
    }

    /// Returns `true` for would-block style conditions which only mean "try again later".
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub(crate) fn invalid_state(msg: impl Into<Cow<'static, str>>) -> Self {
        Error::InvalidState(msg.into())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::Io(a), Error::Io(b)) => a.kind() == b.kind(),
            (Error::ConnectionClosed, Error::ConnectionClosed)
            | (Error::Timeout, Error::Timeout)
            | (Error::Cancelled, Error::Cancelled)
            | (Error::PoolShutdown, Error::PoolShutdown) => true,
            (Error::Codec(a), Error::Codec(b)) => a == b,
            (
                Error::FrameTooLarge { size, max },
                Error::FrameTooLarge {
                    size: size2,
                    max: max2,
                },
            ) => size == size2 && max == max2,
            (Error::Unroutable { message_id: a }, Error::Unroutable { message_id: b }) => a == b,
            (
                Error::UnclaimedBreak { token, buffered },
                Error::UnclaimedBreak {
                    token: token2,
                    buffered: buffered2,
                },
            ) => token == token2 && buffered == buffered2,
            (
                Error::Status { message_id, status },
                Error::Status {
                    message_id: message_id2,
                    status: status2,
                },
            ) => message_id == message_id2 && status == status2,
            (Error::NotPending(a), Error::NotPending(b)) => a == b,
            (Error::WorkerPanicked(a), Error::WorkerPanicked(b)) => a == b,
            (Error::InvalidState(a), Error::InvalidState(b)) => a == b,
            _ => false,
        }
    }
}

/// Classifies a raw socket error.
pub(crate) fn classify_io(err: &io::Error) -> ErrorClass {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => return ErrorClass::Transient,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => return ErrorClass::OrderlyClose,
        _ => {}
    }

    #[cfg(unix)]
    {
        match err.raw_os_error() {
            Some(libc::EINPROGRESS) | Some(libc::EALREADY) => return ErrorClass::Transient,
            Some(libc::ESHUTDOWN) => return ErrorClass::OrderlyClose,
            _ => {}
        }
    }

    ErrorClass::Fatal
}
