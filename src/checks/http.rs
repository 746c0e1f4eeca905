//! HTTP and HTTPS checks: connect, optionally run a TLS handshake, send a
//! minimal GET, accept anything that answers with an HTTP status line.

use crate::checks::{CheckCore, CheckEvent, Directive, SendBuf};
use crate::error::DiscoveryError;
use crate::net::sock::SockTransport;
use crate::net::tls::{self, HandshakeStep, TlsSession};
use crate::net::{Direction, IoStep};
use bytes::BytesMut;
use openssl::ssl::{MidHandshakeSslStream, SslConnector};

const MAX_RESPONSE_HEAD: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Init,
    ConnectWait,
    TlsWait,
    Send,
    Recv,
    Done,
}

enum Transport {
    Plain,
    Tls(TlsSession),
}

pub struct HttpCheck {
    core: CheckCore,
    tls_enabled: bool,
    connector: Option<SslConnector>,
    step: Step,
    transport: Transport,
    handshake: Option<MidHandshakeSslStream<SockTransport>>,
    request: SendBuf,
    buf: BytesMut,
}

impl HttpCheck {
    pub(crate) fn new(core: CheckCore, tls_enabled: bool, connector: Option<SslConnector>) -> Self {
        // IPv6 literals are bracketed in a Host header (RFC 9112 host form).
        let host = match core.target.ip() {
            std::net::IpAddr::V6(ip) => format!("[{}]", ip),
            ip => ip.to_string(),
        };
        let request = format!(
            "GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            host
        );
        Self {
            core,
            tls_enabled,
            connector,
            step: Step::Init,
            transport: Transport::Plain,
            handshake: None,
            request: SendBuf::new(request.into_bytes()),
            buf: BytesMut::new(),
        }
    }

    pub(crate) fn core(&self) -> &CheckCore {
        &self.core
    }

    pub(crate) fn core_mut(&mut self) -> &mut CheckCore {
        &mut self.core
    }

    pub(crate) fn into_core(self) -> CheckCore {
        self.core
    }

    pub(crate) fn advance(&mut self, event: CheckEvent) -> Directive {
        match (self.step, event) {
            (Step::Init, CheckEvent::Start) => {
                self.step = Step::ConnectWait;
                self.core.connect_start()
            }
            (Step::ConnectWait, CheckEvent::Writable) => {
                if !self.core.connect_finish() {
                    self.step = Step::Done;
                    return Directive::Stop;
                }
                if self.tls_enabled {
                    self.start_handshake()
                } else {
                    self.step = Step::Send;
                    self.flush_request()
                }
            }
            (Step::TlsWait, CheckEvent::Readable) | (Step::TlsWait, CheckEvent::Writable) => {
                match self.handshake.take() {
                    Some(mid) => self.handle_handshake(tls::resume_handshake(mid)),
                    None => {
                        // No suspended handshake; this should never happen.
                        log::error!("TLS wait without a handshake for {}", self.core.target);
                        self.step = Step::Done;
                        self.core
                            .fail(DiscoveryError::Protocol("internal state lost".into()))
                    }
                }
            }
            (Step::Send, CheckEvent::Writable) | (Step::Send, CheckEvent::Readable) => {
                self.flush_request()
            }
            (Step::Recv, CheckEvent::Readable) | (Step::Recv, CheckEvent::Writable) => {
                self.on_recv()
            }
            (step, event) => {
                log::error!(
                    "HTTP check for {}: unexpected event {:?} in step {:?}",
                    self.core.target,
                    event,
                    step
                );
                self.step = Step::Done;
                self.core
                    .fail(DiscoveryError::Protocol("unexpected event".into()))
            }
        }
    }

    fn start_handshake(&mut self) -> Directive {
        let connector = match self.connector.clone() {
            Some(connector) => connector,
            None => {
                self.step = Step::Done;
                return self.core.fail(DiscoveryError::Config(
                    "TLS support was not initialized".into(),
                ));
            }
        };
        let transport = match self.core.sock.as_ref() {
            Some(sock) => sock.transport(),
            None => {
                self.step = Step::Done;
                return self
                    .core
                    .fail(DiscoveryError::Protocol("handshake without a socket".into()));
            }
        };
        let host = self.core.target.ip().to_string();
        self.handle_handshake(tls::begin_handshake(&connector, &host, transport))
    }

    fn handle_handshake(&mut self, step: crate::Result<HandshakeStep>) -> Directive {
        match step {
            Ok(HandshakeStep::Done(session)) => {
                self.transport = Transport::Tls(session);
                self.step = Step::Send;
                self.flush_request()
            }
            Ok(HandshakeStep::Pending(mid, dir)) => {
                self.handshake = Some(mid);
                self.step = Step::TlsWait;
                match dir {
                    Direction::Read => Directive::Read,
                    Direction::Write => Directive::Write,
                }
            }
            Err(e) => {
                self.step = Step::Done;
                self.core.fail(e)
            }
        }
    }

    fn flush_request(&mut self) -> Directive {
        loop {
            if self.request.is_done() {
                self.step = Step::Recv;
                return Directive::Read;
            }
            let step = match &mut self.transport {
                Transport::Plain => match self.core.sock.as_ref() {
                    Some(sock) => sock.try_send(self.request.remaining()),
                    None => Err(DiscoveryError::Protocol("send without a socket".into())),
                },
                Transport::Tls(session) => session.try_write(self.request.remaining()),
            };
            match step {
                Ok(IoStep::Done(n)) => self.request.consume(n),
                Ok(IoStep::Retry(dir)) => {
                    self.step = Step::Send;
                    return match dir {
                        Direction::Read => Directive::Read,
                        Direction::Write => Directive::Write,
                    };
                }
                Ok(IoStep::Closed) => {
                    self.step = Step::Done;
                    return self
                        .core
                        .fail(DiscoveryError::Network("connection closed".into()));
                }
                Err(e) => {
                    self.step = Step::Done;
                    return self.core.fail(e);
                }
            }
        }
    }

    fn on_recv(&mut self) -> Directive {
        let mut tmp = [0u8; 2048];
        loop {
            let step = match &mut self.transport {
                Transport::Plain => match self.core.sock.as_ref() {
                    Some(sock) => sock.try_recv(&mut tmp),
                    None => Err(DiscoveryError::Protocol("recv without a socket".into())),
                },
                Transport::Tls(session) => session.try_read(&mut tmp),
            };
            match step {
                Ok(IoStep::Done(n)) => {
                    self.buf.extend_from_slice(&tmp[..n]);
                    if self.buf.len() >= 5 && !self.buf.starts_with(b"HTTP/") {
                        self.step = Step::Done;
                        return self
                            .core
                            .fail(DiscoveryError::Protocol("not an HTTP response".into()));
                    }
                    if self.buf.len() > MAX_RESPONSE_HEAD {
                        self.step = Step::Done;
                        return self
                            .core
                            .fail(DiscoveryError::Protocol("response head too long".into()));
                    }
                    if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                        let line = &self.buf[..pos];
                        let line = match line.last() {
                            Some(b'\r') => &line[..line.len() - 1],
                            _ => line,
                        };
                        let status = String::from_utf8_lossy(line).to_string();
                        self.step = Step::Done;
                        return self.core.succeed(status);
                    }
                }
                Ok(IoStep::Retry(dir)) => {
                    return match dir {
                        Direction::Read => Directive::Read,
                        Direction::Write => Directive::Write,
                    }
                }
                Ok(IoStep::Closed) => {
                    self.step = Step::Done;
                    // A truncated head without a status line is not HTTP.
                    return self.core.fail(DiscoveryError::Protocol(
                        "connection closed before a status line".into(),
                    ));
                }
                Err(e) => {
                    self.step = Step::Done;
                    return self.core.fail(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[test]
    fn test_request_line_and_host_header() {
        let addr: SocketAddr = "192.0.2.9:80".parse().unwrap();
        let check = HttpCheck::new(CheckCore::new(addr, 3, None), false, None);
        let request = String::from_utf8(check.request.remaining().to_vec()).unwrap();
        assert!(request.starts_with("GET / HTTP/1.1\r\n"));
        assert!(request.contains("Host: 192.0.2.9\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_ipv6_host_header_is_bracketed() {
        let addr: SocketAddr = "[2001:db8::1]:80".parse().unwrap();
        let check = HttpCheck::new(CheckCore::new(addr, 3, None), false, None);
        let request = String::from_utf8(check.request.remaining().to_vec()).unwrap();
        assert!(request.contains("Host: [2001:db8::1]\r\n"));
    }

    #[test]
    fn test_https_without_connector_is_config_error() {
        let addr: SocketAddr = "192.0.2.9:443".parse().unwrap();
        let mut check = HttpCheck::new(CheckCore::new(addr, 3, None), true, None);
        // Drive the handshake entry directly; the connect steps need a peer.
        let directive = check.start_handshake();
        assert_eq!(directive, Directive::Stop);
        let out = check.into_core().into_outcome();
        assert!(matches!(out.error, Some(DiscoveryError::Config(_))));
    }
}
