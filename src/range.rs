//! Discovery rules, checks, and the lazy (ip, port, check) cursor.
//!
//! Ranges are iterated lazily in ip-major order: every check of the rule, in
//! configured order, runs against the current IP before the cursor moves on.
//! A /16 range is never materialized.

use crate::checks::SnmpV3Security;
use crate::error::{DiscoveryError, Result};
use crate::net::ServiceType;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

/// Inclusive port span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub from: u16,
    pub to: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self { from: port, to: port }
    }

    pub fn count(&self) -> u64 {
        u64::from(self.to) - u64::from(self.from) + 1
    }
}

impl std::str::FromStr for PortRange {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        let parse_port = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| DiscoveryError::Config(format!("invalid port \"{}\"", p)))
        };
        let range = match s.split_once('-') {
            Some((from, to)) => Self {
                from: parse_port(from)?,
                to: parse_port(to)?,
            },
            None => Self::single(parse_port(s)?),
        };
        if range.from == 0 || range.from > range.to {
            return Err(DiscoveryError::Config(format!(
                "invalid port range \"{}\"",
                s
            )));
        }
        Ok(range)
    }
}

/// Parse a comma-separated port list like `21,22,8000-8010`.
pub fn parse_port_list(s: &str) -> Result<Vec<PortRange>> {
    let ranges: Result<Vec<_>> = s.split(',').map(|part| part.trim().parse()).collect();
    let ranges = ranges?;
    if ranges.is_empty() {
        return Err(DiscoveryError::Config("empty port list".into()));
    }
    Ok(ranges)
}

/// One IP range of a rule: CIDR block or inclusive address span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpRange {
    Cidr(IpNetwork),
    Span { from: IpAddr, to: IpAddr },
}

fn ip_key(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn ip_from_key(template: IpAddr, key: u128) -> IpAddr {
    match template {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::from(key as u32)),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(key)),
    }
}

impl IpRange {
    fn bounds(&self) -> (IpAddr, IpAddr) {
        match self {
            IpRange::Cidr(IpNetwork::V4(net)) => {
                (IpAddr::V4(net.network()), IpAddr::V4(net.broadcast()))
            }
            IpRange::Cidr(IpNetwork::V6(net)) => {
                let start = u128::from(net.network());
                let hosts = 128 - u32::from(net.prefix());
                let end = if hosts == 128 {
                    u128::MAX
                } else {
                    start + ((1u128 << hosts) - 1)
                };
                (IpAddr::V6(net.network()), IpAddr::V6(Ipv6Addr::from(end)))
            }
            IpRange::Span { from, to } => (*from, *to),
        }
    }

    pub fn first(&self) -> Option<IpAddr> {
        let (from, to) = self.bounds();
        (ip_key(from) <= ip_key(to)).then_some(from)
    }

    pub fn next_after(&self, ip: IpAddr) -> Option<IpAddr> {
        let (_, to) = self.bounds();
        let next = ip_key(ip).checked_add(1)?;
        (next <= ip_key(to)).then(|| ip_from_key(ip, next))
    }

    pub fn volume(&self) -> u64 {
        let (from, to) = self.bounds();
        let span = ip_key(to).saturating_sub(ip_key(from)) + 1;
        u64::try_from(span).unwrap_or(u64::MAX)
    }
}

impl std::str::FromStr for IpRange {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.contains('/') {
            let net: IpNetwork = s
                .parse()
                .map_err(|_| DiscoveryError::Config(format!("invalid network \"{}\"", s)))?;
            return Ok(IpRange::Cidr(net));
        }
        if let Some((left, right)) = s.split_once('-') {
            let from: IpAddr = left
                .trim()
                .parse()
                .map_err(|_| DiscoveryError::Config(format!("invalid address \"{}\"", left)))?;
            // Accept both a full address and the last-octet shorthand
            // (192.168.1.1-254).
            let to: IpAddr = match right.trim().parse::<IpAddr>() {
                Ok(ip) => ip,
                Err(_) => match from {
                    IpAddr::V4(v4) => {
                        let last: u8 = right.trim().parse().map_err(|_| {
                            DiscoveryError::Config(format!("invalid range end \"{}\"", right))
                        })?;
                        let mut octets = v4.octets();
                        octets[3] = last;
                        IpAddr::V4(Ipv4Addr::from(octets))
                    }
                    IpAddr::V6(_) => {
                        return Err(DiscoveryError::Config(format!(
                            "invalid range end \"{}\"",
                            right
                        )))
                    }
                },
            };
            if from.is_ipv4() != to.is_ipv4() || ip_key(from) > ip_key(to) {
                return Err(DiscoveryError::Config(format!("invalid range \"{}\"", s)));
            }
            return Ok(IpRange::Span { from, to });
        }
        let ip: IpAddr = s
            .parse()
            .map_err(|_| DiscoveryError::Config(format!("invalid address \"{}\"", s)))?;
        Ok(IpRange::Span { from: ip, to: ip })
    }
}

/// One service check of a rule: what to probe and with which parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryCheck {
    pub dcheckid: u64,
    pub service: ServiceType,
    pub ports: Vec<PortRange>,
    /// Agent item key or SNMP OID.
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub snmp_community: String,
    #[serde(default)]
    pub snmpv3: Option<SnmpV3Security>,
    /// Per-step timeout in milliseconds.
    pub timeout_ms: u64,
}

impl DiscoveryCheck {
    pub fn new(dcheckid: u64, service: ServiceType) -> Self {
        Self {
            dcheckid,
            service,
            ports: vec![PortRange::single(service.default_port())],
            key: String::new(),
            snmp_community: String::new(),
            snmpv3: None,
            timeout_ms: 3000,
        }
    }

    pub fn with_ports(mut self, ports: Vec<PortRange>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn port_count(&self) -> u64 {
        self.ports.iter().map(|r| r.count()).sum()
    }
}

/// A discovery rule: ranges to sweep and checks to run on every address.
#[derive(Debug, Clone)]
pub struct DiscoveryRule {
    pub druleid: u64,
    pub name: String,
    pub ip_ranges: Vec<IpRange>,
    pub checks: Vec<DiscoveryCheck>,
    /// The check whose result identifies the host downstream.
    pub unique_dcheckid: u64,
}

impl DiscoveryRule {
    pub fn new(druleid: u64, name: impl Into<String>) -> Self {
        Self {
            druleid,
            name: name.into(),
            ip_ranges: Vec::new(),
            checks: Vec::new(),
            unique_dcheckid: 0,
        }
    }

    pub fn with_range(mut self, range: IpRange) -> Self {
        self.ip_ranges.push(range);
        self
    }

    pub fn with_check(mut self, check: DiscoveryCheck) -> Self {
        if self.unique_dcheckid == 0 {
            self.unique_dcheckid = check.dcheckid;
        }
        self.checks.push(check);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.ip_ranges.is_empty() {
            return Err(DiscoveryError::Config(format!(
                "rule \"{}\" has no IP ranges",
                self.name
            )));
        }
        if self.checks.is_empty() {
            return Err(DiscoveryError::Config(format!(
                "rule \"{}\" has no checks",
                self.name
            )));
        }
        Ok(())
    }

    /// Number of individual probes per address.
    pub fn checks_per_ip(&self) -> u64 {
        self.checks.iter().map(|c| c.port_count()).sum()
    }

    pub fn ip_volume(&self) -> u64 {
        self.ip_ranges.iter().map(|r| r.volume()).sum()
    }

    pub fn total_checks(&self) -> u64 {
        self.ip_volume().saturating_mul(self.checks_per_ip())
    }

    /// Iterate all addresses of the rule in range order.
    pub fn iter_ips(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.ip_ranges.iter().flat_map(|range| {
            let mut next = range.first();
            std::iter::from_fn(move || {
                let ip = next?;
                next = range.next_after(ip);
                Some(ip)
            })
        })
    }
}

/// Position yielded by the cursor: one probe to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckAddress {
    pub ip: IpAddr,
    pub port: u16,
    pub check_idx: usize,
}

/// Resumable cursor over a rule in ip-major, check-order, port-order.
pub struct RangeCursor {
    rule: Arc<DiscoveryRule>,
    range_idx: usize,
    ip: Option<IpAddr>,
    check_idx: usize,
    port_range_idx: usize,
    next_port: Option<u16>,
}

impl RangeCursor {
    pub fn new(rule: Arc<DiscoveryRule>) -> Self {
        Self {
            rule,
            range_idx: 0,
            ip: None,
            check_idx: 0,
            port_range_idx: 0,
            next_port: None,
        }
    }
}

impl Iterator for RangeCursor {
    type Item = CheckAddress;

    fn next(&mut self) -> Option<CheckAddress> {
        loop {
            if self.ip.is_none() {
                while self.range_idx < self.rule.ip_ranges.len() {
                    if let Some(ip) = self.rule.ip_ranges[self.range_idx].first() {
                        self.ip = Some(ip);
                        break;
                    }
                    self.range_idx += 1;
                }
                self.ip?;
                self.check_idx = 0;
                self.port_range_idx = 0;
                self.next_port = None;
            }
            let ip = self.ip?;

            if self.check_idx < self.rule.checks.len() {
                let check = &self.rule.checks[self.check_idx];
                if self.port_range_idx < check.ports.len() {
                    let range = check.ports[self.port_range_idx];
                    let port = self.next_port.unwrap_or(range.from);
                    if port < range.to {
                        self.next_port = Some(port + 1);
                    } else {
                        self.next_port = None;
                        self.port_range_idx += 1;
                    }
                    return Some(CheckAddress {
                        ip,
                        port,
                        check_idx: self.check_idx,
                    });
                }
                self.port_range_idx = 0;
                self.check_idx += 1;
                continue;
            }

            // All checks done for this address; step the IP.
            self.check_idx = 0;
            self.port_range_idx = 0;
            self.next_port = None;
            match self.rule.ip_ranges[self.range_idx].next_after(ip) {
                Some(next) => self.ip = Some(next),
                None => {
                    self.range_idx += 1;
                    self.ip = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rule_with(ranges: &[&str], checks: Vec<DiscoveryCheck>) -> Arc<DiscoveryRule> {
        let mut rule = DiscoveryRule::new(1, "test");
        for r in ranges {
            rule = rule.with_range(r.parse().unwrap());
        }
        for c in checks {
            rule = rule.with_check(c);
        }
        Arc::new(rule)
    }

    #[test]
    fn test_port_list_parsing() {
        let ports = parse_port_list("21,22,8000-8010").unwrap();
        assert_eq!(ports.len(), 3);
        assert_eq!(ports[2], PortRange { from: 8000, to: 8010 });
        assert!(parse_port_list("80-20").is_err());
        assert!(parse_port_list("0").is_err());
        assert!(parse_port_list("http").is_err());
    }

    #[test]
    fn test_ip_range_parsing() {
        let cidr: IpRange = "192.0.2.0/30".parse().unwrap();
        assert_eq!(cidr.volume(), 4);

        let span: IpRange = "192.0.2.1-192.0.2.9".parse().unwrap();
        assert_eq!(span.volume(), 9);

        let shorthand: IpRange = "192.0.2.1-9".parse().unwrap();
        assert_eq!(shorthand, span);

        let single: IpRange = "192.0.2.7".parse().unwrap();
        assert_eq!(single.volume(), 1);

        assert!("192.0.2.9-192.0.2.1".parse::<IpRange>().is_err());
        assert!("not-an-ip".parse::<IpRange>().is_err());
    }

    #[test]
    fn test_cursor_ip_major_order() {
        let rule = rule_with(
            &["192.0.2.1-192.0.2.2"],
            vec![
                DiscoveryCheck::new(10, ServiceType::Ssh),
                DiscoveryCheck::new(11, ServiceType::Http)
                    .with_ports(vec![PortRange { from: 80, to: 81 }]),
            ],
        );
        let items: Vec<_> = RangeCursor::new(rule.clone()).collect();
        let expect: Vec<(&str, u16, usize)> = vec![
            ("192.0.2.1", 22, 0),
            ("192.0.2.1", 80, 1),
            ("192.0.2.1", 81, 1),
            ("192.0.2.2", 22, 0),
            ("192.0.2.2", 80, 1),
            ("192.0.2.2", 81, 1),
        ];
        assert_eq!(items.len(), rule.total_checks() as usize);
        for (item, (ip, port, check_idx)) in items.iter().zip(expect) {
            assert_eq!(item.ip.to_string(), ip);
            assert_eq!(item.port, port);
            assert_eq!(item.check_idx, check_idx);
        }
    }

    #[test]
    fn test_cursor_spans_multiple_ranges() {
        let rule = rule_with(
            &["192.0.2.250-192.0.2.251", "198.51.100.0/31"],
            vec![DiscoveryCheck::new(1, ServiceType::Tcp)
                .with_ports(vec![PortRange::single(80)])],
        );
        let ips: Vec<_> = RangeCursor::new(rule)
            .map(|item| item.ip.to_string())
            .collect();
        assert_eq!(
            ips,
            vec!["192.0.2.250", "192.0.2.251", "198.51.100.0", "198.51.100.1"]
        );
    }

    #[test]
    fn test_ipv6_range() {
        let range: IpRange = "2001:db8::/126".parse().unwrap();
        assert_eq!(range.volume(), 4);
        let first = range.first().unwrap();
        assert_eq!(first.to_string(), "2001:db8::");
        let second = range.next_after(first).unwrap();
        assert_eq!(second.to_string(), "2001:db8::1");
    }

    proptest! {
        #[test]
        fn prop_cursor_count_matches_volume(
            base in 0u32..0xffff_ff00u32,
            len in 0u32..32,
            ports_a in 1u16..64,
            ports_b in 1u16..64,
        ) {
            let from = IpAddr::V4(Ipv4Addr::from(base));
            let to = IpAddr::V4(Ipv4Addr::from(base + len));
            let rule = Arc::new(
                DiscoveryRule::new(1, "prop")
                    .with_range(IpRange::Span { from, to })
                    .with_check(
                        DiscoveryCheck::new(1, ServiceType::Tcp).with_ports(vec![PortRange {
                            from: 1000,
                            to: 1000 + ports_a,
                        }]),
                    )
                    .with_check(
                        DiscoveryCheck::new(2, ServiceType::Tcp).with_ports(vec![PortRange {
                            from: 2000,
                            to: 2000 + ports_b,
                        }]),
                    ),
            );
            let items: Vec<_> = RangeCursor::new(rule.clone()).collect();
            prop_assert_eq!(items.len() as u64, rule.total_checks());

            // ip-major: the sequence of IPs is non-decreasing.
            for pair in items.windows(2) {
                prop_assert!(ip_key(pair[0].ip) <= ip_key(pair[1].ip));
            }
        }
    }
}
