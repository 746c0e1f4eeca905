//! Network primitives: service tables, non-blocking sockets, TLS, DNS.

pub mod dns;
pub mod sock;
pub mod tls;

use serde::{Deserialize, Serialize};

/// Readiness direction a suspended check is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Outcome of a single non-blocking I/O attempt.
#[derive(Debug)]
pub enum IoStep {
    /// Bytes were transferred.
    Done(usize),
    /// The operation would block; re-arm readiness in the given direction.
    Retry(Direction),
    /// The peer closed the connection in an orderly way.
    Closed,
}

/// Service types a discovery check can probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceType {
    /// Native agent check (JSON line protocol)
    Agent,
    /// SNMPv1 get
    SnmpV1,
    /// SNMPv2c get
    SnmpV2c,
    /// SNMPv3 get
    SnmpV3,
    /// SSH banner exchange
    Ssh,
    /// SMTP greeting
    Smtp,
    /// FTP greeting
    Ftp,
    /// HTTP status line
    Http,
    /// HTTP over TLS
    Https,
    /// POP3 greeting
    Pop,
    /// NNTP greeting
    Nntp,
    /// IMAP greeting
    Imap,
    /// Telnet option negotiation
    Telnet,
    /// Bare TCP connect
    Tcp,
}

impl ServiceType {
    /// Get the name of the service type
    pub fn name(&self) -> &'static str {
        match self {
            ServiceType::Agent => "agent",
            ServiceType::SnmpV1 => "SNMPv1",
            ServiceType::SnmpV2c => "SNMPv2c",
            ServiceType::SnmpV3 => "SNMPv3",
            ServiceType::Ssh => "SSH",
            ServiceType::Smtp => "SMTP",
            ServiceType::Ftp => "FTP",
            ServiceType::Http => "HTTP",
            ServiceType::Https => "HTTPS",
            ServiceType::Pop => "POP",
            ServiceType::Nntp => "NNTP",
            ServiceType::Imap => "IMAP",
            ServiceType::Telnet => "Telnet",
            ServiceType::Tcp => "TCP",
        }
    }

    /// Check if this service is probed through the SNMP capability
    pub fn is_snmp(&self) -> bool {
        matches!(
            self,
            ServiceType::SnmpV1 | ServiceType::SnmpV2c | ServiceType::SnmpV3
        )
    }

    /// Check if this service wraps its stream in TLS
    pub fn uses_tls(&self) -> bool {
        matches!(self, ServiceType::Https)
    }

    /// Default port probed when a check carries no explicit port list
    pub fn default_port(&self) -> u16 {
        match self {
            ServiceType::Agent => 10050,
            ServiceType::SnmpV1 | ServiceType::SnmpV2c | ServiceType::SnmpV3 => 161,
            ServiceType::Ssh => 22,
            ServiceType::Smtp => 25,
            ServiceType::Ftp => 21,
            ServiceType::Http => 80,
            ServiceType::Https => 443,
            ServiceType::Pop => 110,
            ServiceType::Nntp => 119,
            ServiceType::Imap => 143,
            ServiceType::Telnet => 23,
            ServiceType::Tcp => 0,
        }
    }
}

impl std::str::FromStr for ServiceType {
    type Err = crate::DiscoveryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "agent" => Ok(ServiceType::Agent),
            "snmpv1" | "snmp" => Ok(ServiceType::SnmpV1),
            "snmpv2c" | "snmpv2" => Ok(ServiceType::SnmpV2c),
            "snmpv3" => Ok(ServiceType::SnmpV3),
            "ssh" => Ok(ServiceType::Ssh),
            "smtp" => Ok(ServiceType::Smtp),
            "ftp" => Ok(ServiceType::Ftp),
            "http" => Ok(ServiceType::Http),
            "https" => Ok(ServiceType::Https),
            "pop" | "pop3" => Ok(ServiceType::Pop),
            "nntp" => Ok(ServiceType::Nntp),
            "imap" => Ok(ServiceType::Imap),
            "telnet" => Ok(ServiceType::Telnet),
            "tcp" => Ok(ServiceType::Tcp),
            other => Err(crate::DiscoveryError::Config(format!(
                "unknown service type \"{}\"",
                other
            ))),
        }
    }
}

/// Up/down classification of one probed service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    Up,
    Down,
}

impl ServiceStatus {
    pub fn is_up(&self) -> bool {
        matches!(self, ServiceStatus::Up)
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Up => write!(f, "up"),
            ServiceStatus::Down => write!(f, "down"),
        }
    }
}
