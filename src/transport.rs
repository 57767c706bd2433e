//! Socket ownership and raw non-blocking I/O.

use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
};

use mio::net::TcpStream;
use tracing::{debug, info, trace};

/// One non-blocking TCP socket, possibly still connecting.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer_addr: SocketAddr,
    connecting: bool,
}

// ============================================================================
// Constructors
// ============================================================================

impl TcpTransport {
    /// Starts a non-blocking connect to `addr`. The connect completes once the poller reports the socket writable
    /// and [`finish_connect`](Self::finish_connect) returns `true`.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%addr, %err, "could not disable nagle on connecting socket");
        }
        info!(peer_addr = %addr, "initiating connection");
        Ok(TcpTransport {
            stream,
            peer_addr: addr,
            connecting: true,
        })
    }

    /// Adopts an already connected socket, switching it to non-blocking mode.
    pub fn from_std(stream: std::net::TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        Ok(TcpTransport {
            stream: TcpStream::from_std(stream),
            peer_addr,
            connecting: false,
        })
    }
}

// ============================================================================
// Connect completion
// ============================================================================

impl TcpTransport {
    /// Returns `true` until the non-blocking connect has completed.
    pub fn is_connecting(&self) -> bool {
        self.connecting
    }

    /// Checks whether a pending connect has finished.
    ///
    /// Returns `Ok(true)` once connected (and on every later call), `Ok(false)` while the connect is still in
    /// progress, and the socket error if the connect failed.
    pub fn finish_connect(&mut self) -> io::Result<bool> {
        if !self.connecting {
            return Ok(true);
        }

        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }

        match self.stream.peer_addr() {
            Ok(addr) => {
                self.connecting = false;
                if let Err(err) = self.stream.set_nodelay(true) {
                    debug!(peer_addr = %addr, %err, "could not disable nagle");
                }
                info!(peer_addr = %addr, local_addr = ?self.stream.local_addr().ok(), "connection established");
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            #[cfg(unix)]
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

// ============================================================================
// Data Operations
// ============================================================================

impl TcpTransport {
    /// Reads whatever is available. `Ok(0)` means the peer closed its side.
    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stream.read(buf)?;
        trace!(peer_addr = %self.peer_addr, len = n, "recv");
        Ok(n)
    }

    /// Writes as much of `buf` as the socket accepts right now.
    pub fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.stream.write(buf)?;
        trace!(peer_addr = %self.peer_addr, len = n, "send");
        Ok(n)
    }

    /// Shuts down both directions. A socket that is already disconnected is not an error.
    pub fn shutdown(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err),
            _ => Ok(()),
        }
    }

    /// Address the socket connects to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Local address, once bound.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub(crate) fn source(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}
