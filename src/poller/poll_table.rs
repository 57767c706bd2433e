use std::{
    collections::HashMap,
    fmt, io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::Arc,
    time::Duration,
};

use mio::{net::TcpStream, Interest, Token};
use tracing::trace;

use super::{Poller, Readiness, Wake, WAKE_TOKEN};

/// Level-triggered readiness through a `poll(2)` table.
///
/// Wake-ups use a non-blocking self-pipe whose read end is always the first entry of the table.
pub struct PollTablePoller {
    sockets: HashMap<Token, (RawFd, Interest)>,
    table: Vec<libc::pollfd>,
    tokens: Vec<Token>,
    wake_read: OwnedFd,
    waker: Arc<PipeWaker>,
}

impl PollTablePoller {
    /// Creates an empty table and its wake-up pipe.
    pub fn new() -> io::Result<Self> {
        let (wake_read, wake_write) = nonblocking_pipe()?;
        Ok(PollTablePoller {
            sockets: HashMap::new(),
            table: Vec::new(),
            tokens: Vec::new(),
            wake_read,
            waker: Arc::new(PipeWaker { write: wake_write }),
        })
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: `buf` is valid for `buf.len()` bytes and the descriptor is owned by `self`.
            let n = unsafe {
                libc::read(
                    self.wake_read.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl fmt::Debug for PollTablePoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollTablePoller")
            .field("sockets", &self.sockets)
            .field("wake_read", &self.wake_read)
            .finish_non_exhaustive()
    }
}

impl Poller for PollTablePoller {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn register(&mut self, socket: &mut TcpStream, token: Token, interest: Interest) -> io::Result<()> {
        if self.sockets.contains_key(&token) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "token already registered",
            ));
        }
        self.sockets.insert(token, (socket.as_raw_fd(), interest));
        Ok(())
    }

    fn reregister(&mut self, socket: &mut TcpStream, token: Token, interest: Interest) -> io::Result<()> {
        match self.sockets.get_mut(&token) {
            Some(entry) => {
                *entry = (socket.as_raw_fd(), interest);
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "token not registered")),
        }
    }

    fn deregister(&mut self, _socket: &mut TcpStream, token: Token) -> io::Result<()> {
        match self.sockets.remove(&token) {
            Some(_) => Ok(()),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "token not registered")),
        }
    }

    fn poll(&mut self, out: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        self.table.clear();
        self.tokens.clear();

        self.table.push(libc::pollfd {
            fd: self.wake_read.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        self.tokens.push(WAKE_TOKEN);

        for (token, (fd, interest)) in &self.sockets {
            let mut events = 0;
            if interest.is_readable() {
                events |= libc::POLLIN;
            }
            if interest.is_writable() {
                events |= libc::POLLOUT;
            }
            self.table.push(libc::pollfd {
                fd: *fd,
                events,
                revents: 0,
            });
            self.tokens.push(*token);
        }

        let timeout_ms = match timeout {
            None => -1,
            Some(timeout) => {
                let ms = timeout.as_millis() + u128::from(timeout.subsec_nanos() % 1_000_000 != 0);
                ms.min(i32::MAX as u128) as libc::c_int
            }
        };

        // SAFETY: `table` is a valid, exclusively borrowed array of `table.len()` pollfd entries.
        let ready = unsafe {
            libc::poll(
                self.table.as_mut_ptr(),
                self.table.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if ready < 0 {
            return Err(io::Error::last_os_error());
        }
        if ready == 0 {
            return Ok(());
        }

        for (entry, token) in self.table.iter().zip(&self.tokens) {
            if entry.revents == 0 {
                continue;
            }
            if *token == WAKE_TOKEN {
                self.drain_wake_pipe();
                out.push(Readiness::readable(WAKE_TOKEN));
                continue;
            }
            trace!(?token, revents = entry.revents, "poll event");
            out.push(Readiness {
                token: *token,
                readable: entry.revents & libc::POLLIN != 0,
                writable: entry.revents & libc::POLLOUT != 0,
                error: entry.revents & (libc::POLLERR | libc::POLLNVAL) != 0,
                hangup: entry.revents & libc::POLLHUP != 0,
            });
        }
        Ok(())
    }

    fn waker(&self) -> Arc<dyn Wake> {
        self.waker.clone()
    }
}

#[derive(Debug)]
struct PipeWaker {
    write: OwnedFd,
}

impl Wake for PipeWaker {
    fn wake(&self) -> io::Result<()> {
        let byte = 1u8;
        // SAFETY: writes one byte from a live stack value to a descriptor owned by `self`.
        let n = unsafe { libc::write(self.write.as_raw_fd(), (&byte as *const u8).cast(), 1) };
        if n < 0 {
            let err = io::Error::last_os_error();
            // A full pipe already guarantees a pending wake-up.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }
}

fn nonblocking_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [-1; 2];
    // SAFETY: `fds` has room for the two descriptors `pipe` writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `pipe` succeeded, so both descriptors are open and owned by nobody else.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    for fd in [read.as_raw_fd(), write.as_raw_fd()] {
        // SAFETY: `fd` is an open descriptor owned by this function.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok((read, write))
}
