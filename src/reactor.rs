//! Per-worker reactor.
//!
//! One reactor lives inside each worker's current-thread runtime and drives
//! the in-flight checks cooperatively. Admission always goes through async
//! name resolution; every state transition re-arms readiness with a fresh
//! full step timeout. The reactor has no result semantics, it only hands
//! terminal outcomes back to the caller.

use crate::checks::{CheckEvent, CheckOutcome, CheckRequest, Directive, ProtocolCheck, SnmpProbe};
use crate::error::DiscoveryError;
use crate::net::{dns, Direction, ServiceStatus};
use futures::future::LocalBoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use openssl::ssl::SslConnector;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

pub struct Reactor {
    concurrency_max: usize,
    source_ip: Option<IpAddr>,
    tls: Option<SslConnector>,
    snmp: Arc<dyn SnmpProbe>,
    inflight: FuturesUnordered<LocalBoxFuture<'static, CheckOutcome>>,
}

impl Reactor {
    pub fn new(
        concurrency_max: usize,
        source_ip: Option<IpAddr>,
        tls: Option<SslConnector>,
        snmp: Arc<dyn SnmpProbe>,
    ) -> Self {
        Self {
            concurrency_max: concurrency_max.max(1),
            source_ip,
            tls,
            snmp,
            inflight: FuturesUnordered::new(),
        }
    }

    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    pub fn snmp(&self) -> &dyn SnmpProbe {
        self.snmp.as_ref()
    }

    pub fn at_capacity(&self) -> bool {
        self.inflight.len() >= self.concurrency_max
    }

    /// Admit one check. The caller is responsible for blocking on
    /// [`Self::run_one_iteration`] first when the reactor is at capacity.
    pub fn add_task(&mut self, req: CheckRequest) {
        let fut = if req.service.is_snmp() {
            drive_snmp(Arc::clone(&self.snmp), req).boxed_local()
        } else {
            drive_socket(req, self.source_ip, self.tls.clone()).boxed_local()
        };
        self.inflight.push(fut);
    }

    /// Run until one in-flight check reaches its terminal state.
    pub async fn run_one_iteration(&mut self) -> Option<CheckOutcome> {
        self.inflight.next().await
    }
}

async fn drive_socket(
    req: CheckRequest,
    source_ip: Option<IpAddr>,
    tls: Option<SslConnector>,
) -> CheckOutcome {
    let resolved = tokio::time::timeout(req.timeout, dns::resolve(&req.address, req.port)).await;
    let addr = match resolved {
        Ok(Ok(addr)) => addr,
        Ok(Err(e)) => return unresolved_outcome(&req, source_ip, e),
        Err(_) => {
            return unresolved_outcome(&req, source_ip, DiscoveryError::Dns(req.address.clone()))
        }
    };
    let check = ProtocolCheck::build(&req, addr, source_ip, tls);
    drive(check, req.timeout).await
}

/// Resolution failed: the state machine still sees one synthetic
/// timeout-class event so the terminal path is uniform, then the outcome is
/// reclassified as a DNS failure.
fn unresolved_outcome(
    req: &CheckRequest,
    source_ip: Option<IpAddr>,
    err: DiscoveryError,
) -> CheckOutcome {
    let placeholder = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), req.port);
    let mut check = ProtocolCheck::build(req, placeholder, source_ip, None);
    let _ = check.advance(CheckEvent::Timeout);
    let mut out = check.into_outcome();
    out.error = Some(err);
    out
}

async fn drive(mut check: ProtocolCheck, step_timeout: Duration) -> CheckOutcome {
    let mut event = CheckEvent::Start;
    loop {
        match check.advance(event) {
            Directive::Stop => break,
            Directive::ResolveReverse => {
                let ip = check.target_ip();
                let name = tokio::time::timeout(step_timeout, dns::reverse_lookup(ip))
                    .await
                    .unwrap_or_default();
                event = CheckEvent::ReverseResolved(name);
            }
            directive => {
                let dir = match directive {
                    Directive::Read => Direction::Read,
                    _ => Direction::Write,
                };
                // The descriptor is queried again on every step because a
                // check may replace its socket mid-flight.
                let waited = match check.socket() {
                    Some(sock) => sock.await_ready(dir, step_timeout).await,
                    None => {
                        // This should never happen.
                        log::error!("readiness wait without a socket");
                        break;
                    }
                };
                event = match waited {
                    Ok(Some(Direction::Read)) => CheckEvent::Readable,
                    Ok(Some(Direction::Write)) => CheckEvent::Writable,
                    Ok(None) => CheckEvent::Timeout,
                    Err(e) => {
                        // A broken readiness wait is an I/O failure, not a
                        // silent peer; keep the classes apart.
                        log::warn!("readiness wait failed: {}", e);
                        check.fail(DiscoveryError::Io(e));
                        break;
                    }
                };
            }
        }
    }
    check.into_outcome()
}

async fn drive_snmp(probe: Arc<dyn SnmpProbe>, req: CheckRequest) -> CheckOutcome {
    let (status, value, error) = match tokio::time::timeout(req.timeout, probe.get(&req)).await {
        Ok(Ok(value)) => (ServiceStatus::Up, value, None),
        Ok(Err(e)) => (ServiceStatus::Down, String::new(), Some(e)),
        Err(_) => (ServiceStatus::Down, String::new(), Some(DiscoveryError::Timeout)),
    };
    let ip = req
        .address
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let dnsname = if status.is_up() {
        tokio::time::timeout(req.timeout, dns::reverse_lookup(ip))
            .await
            .unwrap_or_default()
    } else {
        String::new()
    };
    CheckOutcome {
        dcheckid: req.dcheckid,
        ip,
        port: req.port,
        status,
        value,
        dnsname,
        error,
    }
}
