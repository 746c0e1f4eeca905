//! Protocol check state machines.
//!
//! Every check is an explicit state machine advanced by the reactor:
//! `advance(event)` consumes one readiness event and answers with the next
//! directive. The canonical shape is
//! `Init -> ConnectWait -> [TlsWait] -> Send -> Recv -> [ResolveReverse] -> Stop`;
//! protocols skip the states they do not need. A timeout event is terminal in
//! any state.

pub mod agent;
pub mod http;
pub mod snmp;
pub mod tcpsvc;
pub mod telnet;

use crate::error::DiscoveryError;
use crate::net::sock::{ConnectState, NbSocket};
use crate::net::{IoStep, ServiceStatus, ServiceType};
use openssl::ssl::SslConnector;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

pub use snmp::{NullSnmpProbe, SnmpProbe, SnmpV3Security};

/// Event delivered to a check by the reactor.
#[derive(Debug)]
pub enum CheckEvent {
    /// First event after the task was admitted; no readiness attached.
    Start,
    Readable,
    Writable,
    /// The per-step timer fired; terminal in every state.
    Timeout,
    /// Reverse resolution finished (empty string when it failed).
    ReverseResolved(String),
}

/// What the check needs next from the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Re-arm read readiness with a fresh step timeout.
    Read,
    /// Re-arm write readiness with a fresh step timeout.
    Write,
    /// Terminal; collect the outcome.
    Stop,
    /// Run the best-effort reverse DNS lookup, then deliver the result.
    ResolveReverse,
}

/// One (ip, port, check) probe handed to a worker's reactor.
#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub dcheckid: u64,
    /// Host to probe; IP literals take the same resolution path as names.
    pub address: String,
    pub port: u16,
    pub service: ServiceType,
    /// Agent item key or SNMP OID, depending on the service.
    pub key: String,
    pub snmp_community: String,
    pub snmpv3: Option<SnmpV3Security>,
    pub timeout: Duration,
}

/// Terminal result of one probe, handed back through the reactor.
///
/// Exactly one of the two holds: an up service carries a value and no error,
/// a down service carries an error classification and no value.
#[derive(Debug)]
pub struct CheckOutcome {
    pub dcheckid: u64,
    pub ip: IpAddr,
    pub port: u16,
    pub status: ServiceStatus,
    pub value: String,
    pub dnsname: String,
    pub error: Option<DiscoveryError>,
}

/// State shared by all socket-driven checks: the target, the live socket and
/// the accumulated outcome. Owned exclusively by the driving future; moved
/// into the outcome exactly once at the terminal state.
pub(crate) struct CheckCore {
    pub target: SocketAddr,
    pub dcheckid: u64,
    pub source_ip: Option<IpAddr>,
    pub sock: Option<NbSocket>,
    up: bool,
    value: String,
    error: Option<DiscoveryError>,
    pub dnsname: String,
}

impl CheckCore {
    pub fn new(target: SocketAddr, dcheckid: u64, source_ip: Option<IpAddr>) -> Self {
        Self {
            target,
            dcheckid,
            source_ip,
            sock: None,
            up: false,
            value: String::new(),
            error: None,
            dnsname: String::new(),
        }
    }

    /// Kick off the non-blocking connect. On failure the check is already
    /// terminal.
    pub fn connect_start(&mut self) -> Directive {
        match NbSocket::connect(self.target, self.source_ip) {
            Ok(sock) => {
                self.sock = Some(sock);
                Directive::Write
            }
            Err(e) => self.fail(e),
        }
    }

    /// Resolve the pending connect after write readiness fired.
    pub fn connect_finish(&mut self) -> bool {
        match self.sock.as_ref() {
            Some(sock) => match sock.poll_connect_result() {
                ConnectState::Connected => true,
                ConnectState::Failed(e) => {
                    self.fail(DiscoveryError::Network(format!(
                        "cannot connect to {}: {}",
                        self.target, e
                    )));
                    false
                }
            },
            None => {
                // Unknown state; this should never happen.
                log::error!("connect completion without a socket for {}", self.target);
                self.fail(DiscoveryError::Protocol("internal state lost".into()));
                false
            }
        }
    }

    /// Push as much of `buf` as the socket accepts. `Ok(true)` means the
    /// buffer is fully flushed; `Ok(false)` means write readiness is needed.
    pub fn push_send(&self, buf: &mut SendBuf) -> crate::Result<bool> {
        let sock = self
            .sock
            .as_ref()
            .ok_or_else(|| DiscoveryError::Protocol("send without a socket".into()))?;
        while !buf.is_done() {
            match sock.try_send(buf.remaining())? {
                IoStep::Done(n) => buf.consume(n),
                IoStep::Retry(_) => return Ok(false),
                IoStep::Closed => {
                    return Err(DiscoveryError::Network("connection closed".into()))
                }
            }
        }
        Ok(true)
    }

    pub fn fail(&mut self, err: DiscoveryError) -> Directive {
        self.up = false;
        self.error = Some(err);
        Directive::Stop
    }

    pub fn fail_timeout(&mut self) -> Directive {
        self.fail(DiscoveryError::Timeout)
    }

    /// Mark the service up and move on to reverse resolution.
    pub fn succeed(&mut self, value: String) -> Directive {
        self.up = true;
        self.value = value;
        self.error = None;
        Directive::ResolveReverse
    }

    pub fn is_up(&self) -> bool {
        self.up
    }

    pub fn into_outcome(self) -> CheckOutcome {
        let status = if self.up && self.error.is_none() {
            ServiceStatus::Up
        } else {
            ServiceStatus::Down
        };
        CheckOutcome {
            dcheckid: self.dcheckid,
            ip: self.target.ip(),
            port: self.target.port(),
            status,
            value: if status.is_up() { self.value } else { String::new() },
            dnsname: self.dnsname,
            error: self.error,
        }
    }
}

/// Outgoing payload with a send cursor, so partial writes resume where they
/// stopped.
pub(crate) struct SendBuf {
    data: Vec<u8>,
    pos: usize,
}

impl SendBuf {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn is_done(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub fn consume(&mut self, n: usize) {
        self.pos += n;
    }
}

/// Dispatch over the closed set of socket-driven protocol checks.
///
/// The set of protocols is fixed, so an enum with exhaustive matches beats
/// trait objects here: adding a protocol fails loudly everywhere it matters.
pub enum ProtocolCheck {
    TcpService(tcpsvc::TcpServiceCheck),
    Telnet(telnet::TelnetCheck),
    Agent(agent::AgentCheck),
    Http(http::HttpCheck),
}

impl ProtocolCheck {
    /// Build the state machine for `req` against the resolved `addr`.
    ///
    /// SNMP services never reach this; they run through the [`SnmpProbe`]
    /// capability instead of a socket state machine.
    pub fn build(
        req: &CheckRequest,
        addr: SocketAddr,
        source_ip: Option<IpAddr>,
        tls: Option<SslConnector>,
    ) -> Self {
        let core = CheckCore::new(addr, req.dcheckid, source_ip);
        match req.service {
            ServiceType::Telnet => ProtocolCheck::Telnet(telnet::TelnetCheck::new(core)),
            ServiceType::Agent => ProtocolCheck::Agent(agent::AgentCheck::new(core, &req.key)),
            ServiceType::Http => ProtocolCheck::Http(http::HttpCheck::new(core, false, None)),
            ServiceType::Https => ProtocolCheck::Http(http::HttpCheck::new(core, true, tls)),
            other => ProtocolCheck::TcpService(tcpsvc::TcpServiceCheck::new(core, other)),
        }
    }

    /// Advance the state machine by one event.
    pub fn advance(&mut self, event: CheckEvent) -> Directive {
        match event {
            // Terminal in every state.
            CheckEvent::Timeout => self.core_mut().fail_timeout(),
            CheckEvent::ReverseResolved(name) => {
                self.core_mut().dnsname = name;
                Directive::Stop
            }
            other => match self {
                ProtocolCheck::TcpService(c) => c.advance(other),
                ProtocolCheck::Telnet(c) => c.advance(other),
                ProtocolCheck::Agent(c) => c.advance(other),
                ProtocolCheck::Http(c) => c.advance(other),
            },
        }
    }

    /// Terminate the check with `err` regardless of its current state. Used
    /// by the reactor when the readiness machinery itself fails.
    pub(crate) fn fail(&mut self, err: DiscoveryError) -> Directive {
        self.core_mut().fail(err)
    }

    /// The live socket to wait readiness on. Queried again after every
    /// directive because a check may swap descriptors mid-flight.
    pub fn socket(&self) -> Option<&NbSocket> {
        self.core().sock.as_ref()
    }

    pub fn target_ip(&self) -> IpAddr {
        self.core().target.ip()
    }

    pub fn into_outcome(self) -> CheckOutcome {
        match self {
            ProtocolCheck::TcpService(c) => c.into_core().into_outcome(),
            ProtocolCheck::Telnet(c) => c.into_core().into_outcome(),
            ProtocolCheck::Agent(c) => c.into_core().into_outcome(),
            ProtocolCheck::Http(c) => c.into_core().into_outcome(),
        }
    }

    fn core(&self) -> &CheckCore {
        match self {
            ProtocolCheck::TcpService(c) => c.core(),
            ProtocolCheck::Telnet(c) => c.core(),
            ProtocolCheck::Agent(c) => c.core(),
            ProtocolCheck::Http(c) => c.core(),
        }
    }

    fn core_mut(&mut self) -> &mut CheckCore {
        match self {
            ProtocolCheck::TcpService(c) => c.core_mut(),
            ProtocolCheck::Telnet(c) => c.core_mut(),
            ProtocolCheck::Agent(c) => c.core_mut(),
            ProtocolCheck::Http(c) => c.core_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_buf_cursor() {
        let mut buf = SendBuf::new(b"abcdef".to_vec());
        assert!(!buf.is_done());
        assert_eq!(buf.remaining(), b"abcdef");
        buf.consume(4);
        assert_eq!(buf.remaining(), b"ef");
        buf.consume(2);
        assert!(buf.is_done());
    }

    #[test]
    fn test_outcome_exactly_one_of_value_or_error() {
        let addr: SocketAddr = "192.0.2.1:22".parse().unwrap();

        let mut core = CheckCore::new(addr, 7, None);
        core.succeed("banner".into());
        let up = core.into_outcome();
        assert!(up.status.is_up());
        assert_eq!(up.value, "banner");
        assert!(up.error.is_none());

        let mut core = CheckCore::new(addr, 7, None);
        core.fail(DiscoveryError::Timeout);
        let down = core.into_outcome();
        assert!(!down.status.is_up());
        assert!(down.value.is_empty());
        assert!(down.error.is_some());
    }

    #[test]
    fn test_io_failure_keeps_its_class() {
        let addr: SocketAddr = "192.0.2.1:80".parse().unwrap();
        let core = CheckCore::new(addr, 1, None);
        let mut check = ProtocolCheck::Telnet(telnet::TelnetCheck::new(core));
        let err = std::io::Error::new(std::io::ErrorKind::Other, "descriptor gone");
        assert_eq!(check.fail(DiscoveryError::Io(err)), Directive::Stop);
        let out = check.into_outcome();
        assert!(!out.status.is_up());
        assert!(matches!(out.error, Some(DiscoveryError::Io(_))));
    }

    #[test]
    fn test_timeout_terminal_in_any_state() {
        let addr: SocketAddr = "192.0.2.1:23".parse().unwrap();
        let core = CheckCore::new(addr, 1, None);
        let mut check = ProtocolCheck::Telnet(telnet::TelnetCheck::new(core));
        assert_eq!(check.advance(CheckEvent::Timeout), Directive::Stop);
        let out = check.into_outcome();
        assert!(matches!(out.error, Some(DiscoveryError::Timeout)));
    }
}
