//! Deimos - asynchronous network discovery engine
//!
//! Sweeps IP ranges with protocol-aware service checks and aggregates
//! per-host results. A bounded pool of worker threads runs one
//! single-threaded reactor each; every check is a resumable state machine
//! driven by socket readiness, so a worker keeps hundreds of probes in
//! flight without blocking.

pub mod checks;
pub mod config;
pub mod error;
pub mod manager;
pub mod net;
pub mod queue;
pub mod range;
pub mod reactor;
pub mod results;
pub mod worker;

// Re-export commonly used types
pub use checks::{CheckOutcome, CheckRequest, SnmpProbe, SnmpV3Security};
pub use config::DiscoveryConfig;
pub use error::{DiscoveryError, Result};
pub use manager::DiscoveryManager;
pub use net::{ServiceStatus, ServiceType};
pub use range::{parse_port_list, DiscoveryCheck, DiscoveryRule, IpRange, PortRange};
pub use results::{DiscoveryResult, ServiceEntry};
