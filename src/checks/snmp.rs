//! SNMP as an async capability.
//!
//! SNMP checks do not run through the socket state machines; they are
//! delegated to an [`SnmpProbe`] implementation owned by the worker pool.
//! The default [`NullSnmpProbe`] reports SNMP support as absent, so every
//! SNMP check resolves to a down service with a config-class error.

use crate::checks::CheckRequest;
use crate::error::{DiscoveryError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// SNMPv3 security parameters carried by a discovery check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnmpV3Security {
    pub security_name: String,
    pub context_name: String,
    /// 0 = noAuthNoPriv, 1 = authNoPriv, 2 = authPriv.
    pub security_level: u8,
    pub auth_passphrase: String,
    pub priv_passphrase: String,
}

/// Pluggable SNMP get capability.
#[async_trait]
pub trait SnmpProbe: Send + Sync {
    /// Fetch the OID named by `req.key` from `req.address:req.port`.
    async fn get(&self, req: &CheckRequest) -> Result<String>;

    /// Drop any cached SNMPv3 engine IDs. Called once per finished range
    /// that dispatched v3 checks, because rediscovered hosts may have been
    /// re-provisioned with new engines.
    fn clear_engine_cache(&self) {}
}

/// Probe used when no SNMP backend is wired in.
pub struct NullSnmpProbe;

#[async_trait]
impl SnmpProbe for NullSnmpProbe {
    async fn get(&self, req: &CheckRequest) -> Result<String> {
        Err(DiscoveryError::Config(format!(
            "support for {} checks was not compiled in",
            req.service.name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ServiceType;
    use std::time::Duration;

    fn snmp_request() -> CheckRequest {
        CheckRequest {
            dcheckid: 5,
            address: "192.0.2.1".into(),
            port: 161,
            service: ServiceType::SnmpV2c,
            key: "1.3.6.1.2.1.1.1.0".into(),
            snmp_community: "public".into(),
            snmpv3: None,
            timeout: Duration::from_secs(3),
        }
    }

    #[test]
    fn test_null_probe_reports_missing_support() {
        let probe = NullSnmpProbe;
        let err = tokio_test::block_on(probe.get(&snmp_request())).unwrap_err();
        assert_eq!(err.kind(), "config");
        assert!(err.to_string().contains("was not compiled in"));
    }

    #[test]
    fn test_engine_cache_hook_is_optional() {
        NullSnmpProbe.clear_engine_cache();
    }
}
