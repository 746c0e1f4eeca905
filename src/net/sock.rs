//! Non-blocking socket layer.
//!
//! Every operation either completes immediately or reports which readiness
//! direction the caller must wait for. Nothing here ever blocks; readiness
//! waits go through the reactor via [`NbSocket::await_ready`].

use crate::error::{DiscoveryError, Result};
use crate::net::{Direction, IoStep};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::io::{Interest, Ready};

/// Result of polling an in-progress connect.
#[derive(Debug)]
pub enum ConnectState {
    Connected,
    Failed(io::Error),
}

/// A non-blocking TCP socket registered with the tokio reactor.
///
/// The descriptor is shared behind an `Arc` so a TLS session can wrap the
/// same fd for its transport while the check keeps waiting readiness here.
pub struct NbSocket {
    fd: Arc<AsyncFd<Socket>>,
}

impl NbSocket {
    /// Start a non-blocking connect to `addr`, optionally binding the given
    /// source IP first. An in-progress connect is not an error; poll
    /// [`Self::poll_connect_result`] after the socket becomes writable.
    pub fn connect(addr: SocketAddr, source_ip: Option<IpAddr>) -> Result<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(|e| {
            // EMFILE/ENFILE here means the concurrency budget is wrong
            DiscoveryError::Resource(format!("cannot create socket: {}", e))
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|e| DiscoveryError::Network(e.to_string()))?;

        if let Some(ip) = source_ip {
            let bind_addr = SocketAddr::new(ip, 0);
            socket
                .bind(&bind_addr.into())
                .map_err(|e| DiscoveryError::Network(format!("cannot bind {}: {}", ip, e)))?;
        }

        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                return Err(DiscoveryError::Network(format!(
                    "cannot connect to {}: {}",
                    addr, e
                )))
            }
        }

        let fd = AsyncFd::with_interest(socket, Interest::READABLE | Interest::WRITABLE)
            .map_err(|e| DiscoveryError::Resource(format!("cannot register socket: {}", e)))?;

        Ok(Self { fd: Arc::new(fd) })
    }

    /// Read `SO_ERROR` after the socket signalled writable.
    pub fn poll_connect_result(&self) -> ConnectState {
        match self.fd.get_ref().take_error() {
            Ok(None) => ConnectState::Connected,
            Ok(Some(e)) => ConnectState::Failed(e),
            Err(e) => ConnectState::Failed(e),
        }
    }

    /// Attempt one send. Partial writes are reported as `Done(n)`.
    pub fn try_send(&self, buf: &[u8]) -> Result<IoStep> {
        loop {
            match self.fd.get_ref().send(buf) {
                Ok(n) => return Ok(IoStep::Done(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(IoStep::Retry(Direction::Write))
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(DiscoveryError::Network(e.to_string())),
            }
        }
    }

    /// Attempt one recv into `buf`. A zero-length read is an orderly close.
    pub fn try_recv(&self, buf: &mut [u8]) -> Result<IoStep> {
        let mut uninit: Vec<MaybeUninit<u8>> = vec![MaybeUninit::uninit(); buf.len()];
        loop {
            match self.fd.get_ref().recv(&mut uninit) {
                Ok(0) => return Ok(IoStep::Closed),
                Ok(n) => {
                    for i in 0..n {
                        buf[i] = unsafe { uninit[i].assume_init() };
                    }
                    return Ok(IoStep::Done(n));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(IoStep::Retry(Direction::Read))
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(DiscoveryError::Network(e.to_string())),
            }
        }
    }

    /// Wait for readiness in `dir` for at most `dur`. Returns `None` when the
    /// timer fires first. Cached readiness for `dir` is cleared on wake, so
    /// callers must retry their operation until it reports `Retry` before
    /// waiting on the same direction again. Readiness for the other direction
    /// is left untouched.
    pub async fn await_ready(&self, dir: Direction, dur: Duration) -> io::Result<Option<Direction>> {
        let (interest, ready) = match dir {
            Direction::Read => (Interest::READABLE, Ready::READABLE),
            Direction::Write => (Interest::WRITABLE, Ready::WRITABLE),
        };
        match tokio::time::timeout(dur, self.fd.ready(interest)).await {
            Err(_) => Ok(None),
            Ok(Ok(mut guard)) => {
                guard.clear_ready_matching(ready);
                Ok(Some(dir))
            }
            Ok(Err(e)) => Err(e),
        }
    }

    /// A cloneable blocking-free transport over the same descriptor, suitable
    /// for handing to the TLS layer.
    pub fn transport(&self) -> SockTransport {
        SockTransport(Arc::clone(&self.fd))
    }
}

/// `io::Read`/`io::Write` view of an [`NbSocket`] that surfaces `WouldBlock`
/// instead of ever blocking. This is what the TLS session reads and writes.
pub struct SockTransport(Arc<AsyncFd<Socket>>);

impl io::Read for SockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut uninit: Vec<MaybeUninit<u8>> = vec![MaybeUninit::uninit(); buf.len()];
        let n = self.0.get_ref().recv(&mut uninit)?;
        for i in 0..n {
            buf[i] = unsafe { uninit[i].assume_init() };
        }
        Ok(n)
    }
}

impl io::Write for SockTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.get_ref().send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
