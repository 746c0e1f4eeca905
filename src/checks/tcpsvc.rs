//! Generic TCP service checks: connect, read the greeting, validate it
//! against the expected protocol, optionally answer (SSH banner echo, SMTP
//! QUIT) before declaring the service up.

use crate::checks::{CheckCore, CheckEvent, Directive, SendBuf};
use crate::error::DiscoveryError;
use crate::net::{IoStep, ServiceType};
use bytes::BytesMut;

/// Greetings larger than this are not a service we recognize.
const MAX_GREETING: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Init,
    ConnectWait,
    Recv,
    SendExtra,
    Done,
}

enum Verdict {
    Up(String),
    /// Valid greeting, but the protocol wants one reply before we hang up.
    UpAfterSend { value: String, payload: Vec<u8> },
    NeedMore,
    Down(String),
}

pub struct TcpServiceCheck {
    core: CheckCore,
    service: ServiceType,
    step: Step,
    buf: BytesMut,
    extra: SendBuf,
    pending_value: String,
}

impl TcpServiceCheck {
    pub(crate) fn new(core: CheckCore, service: ServiceType) -> Self {
        Self {
            core,
            service,
            step: Step::Init,
            buf: BytesMut::new(),
            extra: SendBuf::empty(),
            pending_value: String::new(),
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
                if self.service == ServiceType::Tcp {
                    // A completed handshake is the whole check.
                    self.step = Step::Done;
                    return self.core.succeed(String::new());
                }
                self.step = Step::Recv;
                Directive::Read
            }
            (Step::Recv, CheckEvent::Readable) => self.on_recv(),
            (Step::SendExtra, CheckEvent::Writable) => self.flush_extra(),
            (step, event) => {
                // Unknown transition; this should never happen.
                log::error!(
                    "{} check for {}: unexpected event {:?} in step {:?}",
                    self.service.name(),
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

    fn on_recv(&mut self) -> Directive {
        let mut tmp = [0u8; 2048];
        loop {
            let step = match self.core.sock.as_ref() {
                Some(sock) => sock.try_recv(&mut tmp),
                None => Err(DiscoveryError::Protocol("recv without a socket".into())),
            };
            match step {
                Ok(IoStep::Done(n)) => {
                    self.buf.extend_from_slice(&tmp[..n]);
                    if self.buf.len() > MAX_GREETING {
                        self.step = Step::Done;
                        return self
                            .core
                            .fail(DiscoveryError::Protocol("greeting too long".into()));
                    }
                    match validate_greeting(self.service, &self.buf) {
                        Verdict::Up(value) => {
                            self.step = Step::Done;
                            return self.core.succeed(value);
                        }
                        Verdict::UpAfterSend { value, payload } => {
                            self.pending_value = value;
                            self.extra = SendBuf::new(payload);
                            self.step = Step::SendExtra;
                            return self.flush_extra();
                        }
                        Verdict::Down(msg) => {
                            self.step = Step::Done;
                            return self.core.fail(DiscoveryError::Protocol(msg));
                        }
                        Verdict::NeedMore => continue,
                    }
                }
                Ok(IoStep::Retry(_)) => return Directive::Read,
                Ok(IoStep::Closed) => {
                    self.step = Step::Done;
                    // The peer is gone; whatever arrived decides the verdict.
                    return match validate_greeting(self.service, &self.buf) {
                        Verdict::Up(value) | Verdict::UpAfterSend { value, .. } => {
                            self.core.succeed(value)
                        }
                        _ => self.core.fail(DiscoveryError::Protocol(
                            "connection closed before a valid greeting".into(),
                        )),
                    };
                }
                Err(e) => {
                    self.step = Step::Done;
                    return self.core.fail(e);
                }
            }
        }
    }

    fn flush_extra(&mut self) -> Directive {
        match self.core.push_send(&mut self.extra) {
            Ok(true) => {
                self.step = Step::Done;
                let value = std::mem::take(&mut self.pending_value);
                self.core.succeed(value)
            }
            Ok(false) => {
                self.step = Step::SendExtra;
                Directive::Write
            }
            Err(e) => {
                self.step = Step::Done;
                self.core.fail(e)
            }
        }
    }
}

fn first_line(buf: &[u8]) -> Option<&[u8]> {
    buf.iter()
        .position(|&b| b == b'\n')
        .map(|pos| trim_cr(&buf[..pos]))
}

fn trim_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

fn validate_greeting(service: ServiceType, buf: &[u8]) -> Verdict {
    match service {
        ServiceType::Ssh => validate_ssh(buf),
        ServiceType::Smtp => validate_smtp(buf),
        ServiceType::Ftp => validate_prefix(buf, &[b"220"]),
        ServiceType::Pop => validate_prefix(buf, &[b"+OK"]),
        ServiceType::Imap => validate_prefix(buf, &[b"* OK"]),
        ServiceType::Nntp => validate_prefix(buf, &[b"200", b"201"]),
        other => {
            log::error!("no greeting validator for {}", other.name());
            Verdict::Down("unsupported service".into())
        }
    }
}

/// `SSH-<major>.<minor>-...` followed by our own banner echoed back with the
/// version the server offered.
fn validate_ssh(buf: &[u8]) -> Verdict {
    let line = match first_line(buf) {
        Some(line) => line,
        // RFC 4253 caps the identification string at 255 bytes.
        None if buf.len() > 255 => return Verdict::Down("SSH banner too long".into()),
        None => return Verdict::NeedMore,
    };
    let text = String::from_utf8_lossy(line);
    let version = match text.strip_prefix("SSH-") {
        Some(rest) => rest.split('-').next().unwrap_or(""),
        None => return Verdict::Down(format!("not an SSH greeting: \"{}\"", text)),
    };
    let (major, minor) = match version.split_once('.') {
        Some((maj, min))
            if !maj.is_empty()
                && !min.is_empty()
                && maj.bytes().all(|b| b.is_ascii_digit())
                && min.bytes().all(|b| b.is_ascii_digit()) =>
        {
            (maj, min)
        }
        _ => return Verdict::Down(format!("malformed SSH version: \"{}\"", text)),
    };
    Verdict::UpAfterSend {
        value: text.to_string(),
        payload: format!("SSH-{}.{}-deimos\r\n", major, minor).into_bytes(),
    }
}

/// `220` greeting, possibly multiline (`220-...` continuation lines), then a
/// polite QUIT.
fn validate_smtp(buf: &[u8]) -> Verdict {
    let mut rest = buf;
    loop {
        let pos = match rest.iter().position(|&b| b == b'\n') {
            Some(pos) => pos,
            None => return Verdict::NeedMore,
        };
        let line = trim_cr(&rest[..pos]);
        if !line.starts_with(b"220") {
            return Verdict::Down(format!(
                "SMTP greeting rejected: \"{}\"",
                String::from_utf8_lossy(line)
            ));
        }
        if line.get(3) == Some(&b'-') {
            // Continuation; the final line of the greeting is still coming.
            rest = &rest[pos + 1..];
            continue;
        }
        return Verdict::UpAfterSend {
            value: String::from_utf8_lossy(line).to_string(),
            payload: b"QUIT\r\n".to_vec(),
        };
    }
}

fn validate_prefix(buf: &[u8], prefixes: &[&[u8]]) -> Verdict {
    let line = match first_line(buf) {
        Some(line) => line,
        None if buf.len() > 512 => return Verdict::Down("greeting too long".into()),
        None => return Verdict::NeedMore,
    };
    if prefixes.iter().any(|p| line.starts_with(p)) {
        Verdict::Up(String::from_utf8_lossy(line).to_string())
    } else {
        Verdict::Down(format!(
            "greeting rejected: \"{}\"",
            String::from_utf8_lossy(line)
        ))
    }
}
