use std::{collections::HashMap, io, sync::Arc, time::Duration};

use mio::{net::TcpStream, Interest, Token};
use parking_lot::{Condvar, Mutex};

use super::{Poller, Readiness, Wake, WAKE_TOKEN};

/// Portable fallback that needs no OS readiness API.
///
/// Every pass sleeps for the scan interval (or until woken), then reports all registered sockets as readable. Sockets
/// registered with write interest, which includes every socket whose connect is still in progress, are also
/// reported writable; the owner finds out whether the connect actually finished by asking the socket. Reads on
/// sockets without data simply return would-block.
#[derive(Debug)]
pub struct ScanPoller {
    sockets: HashMap<Token, Interest>,
    interval: Duration,
    signal: Arc<ScanSignal>,
}

impl ScanPoller {
    /// Creates a scanner sleeping `interval` between passes.
    pub fn new(interval: Duration) -> Self {
        ScanPoller {
            sockets: HashMap::new(),
            interval,
            signal: Arc::new(ScanSignal::default()),
        }
    }
}

impl Poller for ScanPoller {
    fn name(&self) -> &'static str {
        "scan"
    }

    fn register(&mut self, _socket: &mut TcpStream, token: Token, interest: Interest) -> io::Result<()> {
        self.sockets.insert(token, interest);
        Ok(())
    }

    fn reregister(&mut self, _socket: &mut TcpStream, token: Token, interest: Interest) -> io::Result<()> {
        self.sockets.insert(token, interest);
        Ok(())
    }

    fn deregister(&mut self, _socket: &mut TcpStream, token: Token) -> io::Result<()> {
        self.sockets.remove(&token);
        Ok(())
    }

    fn poll(&mut self, out: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        let slice = timeout.map_or(self.interval, |timeout| timeout.min(self.interval));
        if self.signal.sleep(slice) {
            out.push(Readiness::readable(WAKE_TOKEN));
        }

        for (token, interest) in &self.sockets {
            out.push(Readiness {
                token: *token,
                readable: true,
                writable: interest.is_writable(),
                error: false,
                hangup: false,
            });
        }
        Ok(())
    }

    fn waker(&self) -> Arc<dyn Wake> {
        self.signal.clone()
    }
}

#[derive(Debug, Default)]
struct ScanSignal {
    woken: Mutex<bool>,
    cond: Condvar,
}

impl ScanSignal {
    /// Sleeps for `slice` unless woken. Returns whether a wake-up was consumed.
    fn sleep(&self, slice: Duration) -> bool {
        let mut woken = self.woken.lock();
        if !*woken {
            self.cond.wait_for(&mut woken, slice);
        }
        std::mem::take(&mut *woken)
    }
}

impl Wake for ScanSignal {
    fn wake(&self) -> io::Result<()> {
        *self.woken.lock() = true;
        self.cond.notify_one();
        Ok(())
    }
}
