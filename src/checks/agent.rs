//! Agent check: one JSON request line, one JSON reply line.
//!
//! The wire tags (`request`, `data`, `response`, `value`, `error`) are part
//! of the protocol and must not be renamed.

use crate::checks::{CheckCore, CheckEvent, Directive, SendBuf};
use crate::error::DiscoveryError;
use crate::net::IoStep;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};

/// A reply line longer than this is not an agent.
const MAX_REPLY: usize = 64 * 1024;

#[derive(Serialize)]
struct AgentRequest<'a> {
    request: &'a str,
    data: Vec<AgentRequestItem<'a>>,
}

#[derive(Serialize)]
struct AgentRequestItem<'a> {
    key: &'a str,
}

#[derive(Deserialize)]
struct AgentReply {
    response: String,
    #[serde(default)]
    data: Vec<AgentReplyItem>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct AgentReplyItem {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Init,
    ConnectWait,
    Send,
    Recv,
    Done,
}

pub struct AgentCheck {
    core: CheckCore,
    step: Step,
    request: SendBuf,
    buf: BytesMut,
}

impl AgentCheck {
    pub(crate) fn new(core: CheckCore, key: &str) -> Self {
        let request = AgentRequest {
            request: "agent.check",
            data: vec![AgentRequestItem { key }],
        };
        // Serializing two flat structs of strings cannot fail.
        let mut line = serde_json::to_vec(&request).unwrap_or_default();
        line.push(b'\n');
        Self {
            core,
            step: Step::Init,
            request: SendBuf::new(line),
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
                self.step = Step::Send;
                self.flush_request()
            }
            (Step::Send, CheckEvent::Writable) => self.flush_request(),
            (Step::Recv, CheckEvent::Readable) => self.on_recv(),
            (step, event) => {
                log::error!(
                    "agent check for {}: unexpected event {:?} in step {:?}",
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

    fn flush_request(&mut self) -> Directive {
        match self.core.push_send(&mut self.request) {
            Ok(true) => {
                self.step = Step::Recv;
                Directive::Read
            }
            Ok(false) => {
                self.step = Step::Send;
                Directive::Write
            }
            Err(e) => {
                self.step = Step::Done;
                self.core.fail(e)
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
                    if self.buf.len() > MAX_REPLY {
                        self.step = Step::Done;
                        return self
                            .core
                            .fail(DiscoveryError::Protocol("agent reply too long".into()));
                    }
                    if self.buf.contains(&b'\n') {
                        self.step = Step::Done;
                        return self.conclude();
                    }
                }
                Ok(IoStep::Retry(_)) => return Directive::Read,
                Ok(IoStep::Closed) => {
                    self.step = Step::Done;
                    // Some agents reply and close without a trailing newline.
                    return self.conclude();
                }
                Err(e) => {
                    self.step = Step::Done;
                    return self.core.fail(e);
                }
            }
        }
    }

    fn conclude(&mut self) -> Directive {
        let line = match self.buf.iter().position(|&b| b == b'\n') {
            Some(pos) => &self.buf[..pos],
            None => &self.buf[..],
        };
        if line.is_empty() {
            return self
                .core
                .fail(DiscoveryError::Protocol("empty agent reply".into()));
        }
        let reply: AgentReply = match serde_json::from_slice(line) {
            Ok(reply) => reply,
            Err(e) => {
                return self
                    .core
                    .fail(DiscoveryError::Protocol(format!("bad agent reply: {}", e)))
            }
        };
        if reply.response != "success" {
            let detail = reply.error.unwrap_or_else(|| "unknown reason".into());
            return self
                .core
                .fail(DiscoveryError::Protocol(format!("agent refused: {}", detail)));
        }
        match reply.data.into_iter().next() {
            Some(item) => {
                if let Some(err) = item.error {
                    return self
                        .core
                        .fail(DiscoveryError::Protocol(format!("item failed: {}", err)));
                }
                self.core.succeed(item.value.unwrap_or_default())
            }
            None => self
                .core
                .fail(DiscoveryError::Protocol("agent reply carried no data".into())),
        }
    }
}
