//! Socket readiness notification.
//!
//! A [`Poller`] watches registered sockets and reports [`Readiness`] events. Three backends are provided and are
//! behaviourally interchangeable from the point of view of the [`EventLoop`](crate::EventLoop):
//!
//! - [`MioPoller`]: the OS readiness queue (epoll, kqueue) through `mio`. Edge-triggered.
//! - [`PollTablePoller`]: a `poll(2)` table rebuilt on every pass. Level-triggered. Unix only.
//! - [`ScanPoller`]: a fallback that needs no readiness API at all. It reports every registered socket as readable
//!   on every pass and derives writability from the registered interest, sleeping between passes.
//!
//! The backend is chosen once with [`Backend::probe`] and injected into the event loop. There is no process-wide
//! poller.

use std::{fmt, io, sync::Arc, time::Duration};

use mio::{net::TcpStream, Interest, Token};
use tracing::warn;

use crate::config::EngineConfig;

mod mio_poller;
#[cfg(unix)]
mod poll_table;
mod scan;

pub use mio_poller::MioPoller;
#[cfg(unix)]
pub use poll_table::PollTablePoller;
pub use scan::ScanPoller;

/// Token reserved for the poller's own wake-up source.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

/// A readiness event for one registered socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Readiness {
    /// Token the socket was registered with.
    pub token: Token,
    /// Data (or EOF) can be read.
    pub readable: bool,
    /// The socket accepts writes. For a connecting socket this signals connect completion.
    pub writable: bool,
    /// The socket has a pending error.
    pub error: bool,
    /// The peer hung up one or both directions.
    pub hangup: bool,
}

impl Readiness {
    /// A readable-only event, as reported by the scanning backend.
    pub fn readable(token: Token) -> Self {
        Readiness {
            token,
            readable: true,
            writable: false,
            error: false,
            hangup: false,
        }
    }
}

/// Interrupts a blocked [`Poller::poll`] from another thread.
pub trait Wake: Send + Sync {
    /// Wakes the poller. Waking an already woken poller is not an error.
    fn wake(&self) -> io::Result<()>;
}

impl Wake for mio::Waker {
    fn wake(&self) -> io::Result<()> {
        mio::Waker::wake(self)
    }
}

/// A socket readiness backend.
pub trait Poller: Send {
    /// Short backend name, for logs.
    fn name(&self) -> &'static str;

    /// Starts watching `socket` under `token`.
    fn register(&mut self, socket: &mut TcpStream, token: Token, interest: Interest) -> io::Result<()>;

    /// Changes the interest of an already registered socket.
    fn reregister(&mut self, socket: &mut TcpStream, token: Token, interest: Interest) -> io::Result<()>;

    /// Stops watching `socket`.
    fn deregister(&mut self, socket: &mut TcpStream, token: Token) -> io::Result<()>;

    /// Waits up to `timeout` (forever for `None`) and appends readiness events to `events`.
    ///
    /// Wake-ups through [`Poller::waker`] are reported as a [`WAKE_TOKEN`] event or not at all.
    fn poll(&mut self, events: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()>;

    /// Handle used to interrupt `poll` from other threads.
    fn waker(&self) -> Arc<dyn Wake>;
}

impl fmt::Debug for dyn Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller").field("backend", &self.name()).finish()
    }
}

/// Available readiness backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// OS readiness queue through `mio`.
    Mio,
    /// `poll(2)` table.
    #[cfg(unix)]
    PollTable,
    /// Portable scanning fallback.
    Scan,
}

impl Backend {
    /// Every backend compiled for this platform, best first.
    #[cfg(unix)]
    pub const ALL: &'static [Backend] = &[Backend::Mio, Backend::PollTable, Backend::Scan];

    /// Every backend compiled for this platform, best first.
    #[cfg(not(unix))]
    pub const ALL: &'static [Backend] = &[Backend::Mio, Backend::Scan];

    /// Creates a poller for this backend.
    pub fn create(self, config: &EngineConfig) -> io::Result<Box<dyn Poller>> {
        Ok(match self {
            Backend::Mio => Box::new(MioPoller::new(config.event_capacity)?),
            #[cfg(unix)]
            Backend::PollTable => Box::new(PollTablePoller::new()?),
            Backend::Scan => Box::new(ScanPoller::new(config.scan_interval)),
        })
    }

    /// Picks the best backend the platform supports, falling back one step at a time.
    ///
    /// The scanning backend cannot fail, so probing always yields a poller.
    pub fn probe(config: &EngineConfig) -> Box<dyn Poller> {
        for backend in Backend::ALL {
            match backend.create(config) {
                Ok(poller) => return poller,
                Err(err) => warn!(?backend, %err, "readiness backend unavailable, trying the next one"),
            }
        }
        Box::new(ScanPoller::new(config.scan_interval))
    }
}
