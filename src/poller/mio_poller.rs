use std::{io, sync::Arc, time::Duration};

use mio::{net::TcpStream, Events, Interest, Poll, Token, Waker};
use tracing::trace;

use super::{Poller, Readiness, Wake, WAKE_TOKEN};

/// Edge-triggered readiness through the OS queue (epoll, kqueue).
#[derive(Debug)]
pub struct MioPoller {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
}

impl MioPoller {
    /// Creates the OS queue, reporting at most `capacity` events per pass.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(MioPoller {
            poll,
            events: Events::with_capacity(capacity.max(1)),
            waker,
        })
    }
}

impl Poller for MioPoller {
    fn name(&self) -> &'static str {
        "mio"
    }

    fn register(&mut self, socket: &mut TcpStream, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().register(socket, token, interest)
    }

    fn reregister(&mut self, socket: &mut TcpStream, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().reregister(socket, token, interest)
    }

    fn deregister(&mut self, socket: &mut TcpStream, _token: Token) -> io::Result<()> {
        self.poll.registry().deregister(socket)
    }

    fn poll(&mut self, out: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        self.poll.poll(&mut self.events, timeout)?;
        for event in self.events.iter() {
            trace!(token = ?event.token(), readable = event.is_readable(), writable = event.is_writable(), "mio event");
            out.push(Readiness {
                token: event.token(),
                readable: event.is_readable(),
                writable: event.is_writable(),
                error: event.is_error(),
                hangup: event.is_read_closed() || event.is_write_closed(),
            });
        }
        Ok(())
    }

    fn waker(&self) -> Arc<dyn Wake> {
        self.waker.clone()
    }
}
