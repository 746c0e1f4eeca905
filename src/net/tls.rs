//! TLS session adapter over the non-blocking socket layer.
//!
//! openssl's WANT_READ/WANT_WRITE results carry exactly the readiness
//! direction the reactor has to re-arm, so every operation here returns
//! either progress or a [`Direction`] to wait on. An orderly close-notify
//! after the handshake is EOF, not an error; a close mid-handshake is.

use crate::error::{DiscoveryError, Result};
use crate::net::sock::SockTransport;
use crate::net::{Direction, IoStep};
use openssl::ssl::{
    ErrorCode, HandshakeError, MidHandshakeSslStream, SslConnector, SslMethod, SslStream,
    SslVerifyMode,
};

/// Build the connector shared by all HTTPS checks of one worker.
///
/// Discovery probes unknown hosts, so peer verification is off; the goal is
/// classifying the service, not authenticating it.
pub fn connector() -> Result<SslConnector> {
    let mut builder = SslConnector::builder(SslMethod::tls())?;
    builder.set_verify(SslVerifyMode::NONE);
    Ok(builder.build())
}

/// Result of starting or resuming a handshake.
pub enum HandshakeStep {
    Done(TlsSession),
    /// Suspended mid-handshake; resume after the given readiness fires.
    Pending(MidHandshakeSslStream<SockTransport>, Direction),
}

fn want_direction(err: &openssl::ssl::Error) -> Direction {
    if err.code() == ErrorCode::WANT_WRITE {
        Direction::Write
    } else {
        Direction::Read
    }
}

fn handshake_outcome(
    res: std::result::Result<SslStream<SockTransport>, HandshakeError<SockTransport>>,
) -> Result<HandshakeStep> {
    match res {
        Ok(stream) => Ok(HandshakeStep::Done(TlsSession { stream })),
        Err(HandshakeError::WouldBlock(mid)) => {
            let dir = want_direction(mid.error());
            Ok(HandshakeStep::Pending(mid, dir))
        }
        Err(HandshakeError::Failure(mid)) => {
            Err(DiscoveryError::Tls(mid.error().to_string()))
        }
        Err(HandshakeError::SetupFailure(e)) => Err(DiscoveryError::Tls(e.to_string())),
    }
}

/// Start a client handshake on `transport`.
pub fn begin_handshake(
    connector: &SslConnector,
    host: &str,
    transport: SockTransport,
) -> Result<HandshakeStep> {
    let mut config = connector.configure()?;
    config.set_use_server_name_indication(false);
    config.set_verify_hostname(false);
    handshake_outcome(config.connect(host, transport))
}

/// Resume a handshake previously suspended on readiness.
pub fn resume_handshake(mid: MidHandshakeSslStream<SockTransport>) -> Result<HandshakeStep> {
    handshake_outcome(mid.handshake())
}

/// An established TLS session speaking the same try/retry step contract as
/// the plain socket.
pub struct TlsSession {
    stream: SslStream<SockTransport>,
}

impl TlsSession {
    pub fn try_read(&mut self, buf: &mut [u8]) -> Result<IoStep> {
        match self.stream.ssl_read(buf) {
            Ok(0) => Ok(IoStep::Closed),
            Ok(n) => Ok(IoStep::Done(n)),
            Err(e) => match e.code() {
                ErrorCode::WANT_READ => Ok(IoStep::Retry(Direction::Read)),
                ErrorCode::WANT_WRITE => Ok(IoStep::Retry(Direction::Write)),
                ErrorCode::ZERO_RETURN => Ok(IoStep::Closed),
                // EOF without close-notify: the peer is done sending either way.
                ErrorCode::SYSCALL if e.io_error().is_none() => Ok(IoStep::Closed),
                _ => Err(DiscoveryError::Tls(e.to_string())),
            },
        }
    }

    pub fn try_write(&mut self, buf: &[u8]) -> Result<IoStep> {
        match self.stream.ssl_write(buf) {
            Ok(n) => Ok(IoStep::Done(n)),
            Err(e) => match e.code() {
                ErrorCode::WANT_READ => Ok(IoStep::Retry(Direction::Read)),
                ErrorCode::WANT_WRITE => Ok(IoStep::Retry(Direction::Write)),
                ErrorCode::ZERO_RETURN => Ok(IoStep::Closed),
                _ => Err(DiscoveryError::Tls(e.to_string())),
            },
        }
    }
}
