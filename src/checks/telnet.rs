//! Telnet check: connect, answer the server's option negotiation (RFC 854
//! subset), declare the service up once negotiation or ordinary data shows a
//! live Telnet endpoint.

use crate::checks::{CheckCore, CheckEvent, Directive, SendBuf};
use crate::error::DiscoveryError;
use crate::net::IoStep;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
/// Suppress-go-ahead, the one option we affirm.
const OPT_SGA: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Init,
    ConnectWait,
    Recv,
    SendReply,
    Done,
}

pub struct TelnetCheck {
    core: CheckCore,
    step: Step,
    /// Partial IAC command window carried across reads (0 to 2 pending
    /// bytes; a command is at most IAC + verb + option).
    window: Vec<u8>,
    reply: SendBuf,
    queued: Vec<u8>,
    answered: bool,
    got_data: bool,
}

impl TelnetCheck {
    pub(crate) fn new(core: CheckCore) -> Self {
        Self {
            core,
            step: Step::Init,
            window: Vec::with_capacity(3),
            reply: SendBuf::empty(),
            queued: Vec::new(),
            answered: false,
            got_data: false,
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
                self.step = Step::Recv;
                Directive::Read
            }
            (Step::Recv, CheckEvent::Readable) => self.on_recv(),
            (Step::SendReply, CheckEvent::Writable) => self.flush_reply(),
            (step, event) => {
                log::error!(
                    "Telnet check for {}: unexpected event {:?} in step {:?}",
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
        let mut tmp = [0u8; 1024];
        loop {
            let step = match self.core.sock.as_ref() {
                Some(sock) => sock.try_recv(&mut tmp),
                None => Err(DiscoveryError::Protocol("recv without a socket".into())),
            };
            match step {
                Ok(IoStep::Done(n)) => {
                    for &b in &tmp[..n] {
                        self.feed(b);
                    }
                }
                Ok(IoStep::Retry(_)) => break,
                Ok(IoStep::Closed) => {
                    self.step = Step::Done;
                    return if self.answered || self.got_data {
                        self.core.succeed(String::new())
                    } else {
                        self.core.fail(DiscoveryError::Protocol(
                            "connection closed before negotiation".into(),
                        ))
                    };
                }
                Err(e) => {
                    self.step = Step::Done;
                    return self.core.fail(e);
                }
            }
        }
        if !self.queued.is_empty() {
            self.reply = SendBuf::new(std::mem::take(&mut self.queued));
            self.step = Step::SendReply;
            return self.flush_reply();
        }
        if self.got_data {
            self.step = Step::Done;
            return self.core.succeed(String::new());
        }
        Directive::Read
    }

    fn flush_reply(&mut self) -> Directive {
        match self.core.push_send(&mut self.reply) {
            Ok(true) => {
                if self.answered || self.got_data {
                    self.step = Step::Done;
                    self.core.succeed(String::new())
                } else {
                    self.step = Step::Recv;
                    Directive::Read
                }
            }
            Ok(false) => {
                self.step = Step::SendReply;
                Directive::Write
            }
            Err(e) => {
                self.step = Step::Done;
                self.core.fail(e)
            }
        }
    }

    /// Feed one received byte through the negotiation window.
    fn feed(&mut self, b: u8) {
        if self.window.is_empty() {
            if b == IAC {
                self.window.push(b);
            } else {
                self.got_data = true;
            }
            return;
        }

        if self.window.len() == 1 {
            match b {
                // IAC IAC is an escaped data byte.
                IAC => {
                    self.window.clear();
                    self.got_data = true;
                }
                WILL | WONT | DO | DONT => self.window.push(b),
                // Other commands take no option byte and get no answer.
                _ => self.window.clear(),
            }
            return;
        }

        let verb = self.window[1];
        let opt = b;
        let answer = match verb {
            DO if opt == OPT_SGA => WILL,
            DO => WONT,
            DONT => WONT,
            WILL if opt == OPT_SGA => DO,
            WILL => DONT,
            WONT => DONT,
            _ => {
                // Window only ever holds the four verbs above.
                log::error!("Telnet negotiation window corrupted: verb {}", verb);
                self.window.clear();
                return;
            }
        };
        self.queued.extend_from_slice(&[IAC, answer, opt]);
        self.answered = true;
        self.window.clear();
    }
}
