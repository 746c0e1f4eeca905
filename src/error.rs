//! Error handling for the discovery engine.
//!
//! Every per-check failure is folded into the check's result as a "down"
//! service entry; these error values classify the failure, they are never a
//! side channel around the completion path.

use thiserror::Error;

/// Main error type for discovery operations
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timed out")]
    Timeout,

    #[error("cannot resolve \"{0}\"")]
    Dns(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("resource limit reached: {0}")]
    Resource(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DiscoveryError {
    /// Short classification tag used in logs and rule error strings.
    pub fn kind(&self) -> &'static str {
        match self {
            DiscoveryError::Network(_) => "network",
            DiscoveryError::Timeout => "timeout",
            DiscoveryError::Dns(_) => "dns",
            DiscoveryError::Protocol(_) => "protocol",
            DiscoveryError::Tls(_) => "tls",
            DiscoveryError::Config(_) => "config",
            DiscoveryError::Resource(_) => "resource",
            DiscoveryError::Io(_) => "io",
        }
    }

    /// Timeouts and connection failures are the expected outcome of probing
    /// hosts that are not there; everything else is worth a louder log line.
    pub fn is_expected_down(&self) -> bool {
        matches!(
            self,
            DiscoveryError::Network(_) | DiscoveryError::Timeout | DiscoveryError::Dns(_)
        )
    }
}

impl From<tokio::time::error::Elapsed> for DiscoveryError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        DiscoveryError::Timeout
    }
}

impl From<openssl::error::ErrorStack> for DiscoveryError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        DiscoveryError::Tls(e.to_string())
    }
}

/// Result type alias for discovery operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;
