//! Result aggregation shared by all workers.
//!
//! Workers accumulate per-IP results locally and merge them into the store
//! in batches; the manager drains completed IPs downstream. The store tracks
//! how many checks each (rule, ip) pair still owes, so a partially flushed
//! IP is not drained early.

use crate::net::ServiceStatus;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;

/// Cap on how many results one drain call hands downstream.
pub const BATCH_RESULTS_MAX: usize = 1000;

/// One probed service of a discovered host.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceEntry {
    pub dcheckid: u64,
    pub port: u16,
    pub status: ServiceStatus,
    pub value: String,
}

/// Accumulated discovery state of one (rule, ip) pair.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryResult {
    pub druleid: u64,
    pub ip: IpAddr,
    /// First non-empty reverse-resolved name wins.
    pub dnsname: String,
    pub unique_dcheckid: u64,
    /// Unix timestamp of the first observation.
    pub clock: i64,
    pub services: Vec<ServiceEntry>,
    /// How many checks have been folded into this result so far.
    pub processed_checks: u64,
}

impl DiscoveryResult {
    pub fn new(druleid: u64, ip: IpAddr, unique_dcheckid: u64) -> Self {
        Self {
            druleid,
            ip,
            dnsname: String::new(),
            unique_dcheckid,
            clock: chrono::Utc::now().timestamp(),
            services: Vec::new(),
            processed_checks: 0,
        }
    }

    /// Insert or overwrite the service keyed by (dcheckid, port), so merging
    /// the same batch twice cannot duplicate entries.
    pub fn upsert_service(&mut self, entry: ServiceEntry) {
        match self
            .services
            .iter_mut()
            .find(|s| s.dcheckid == entry.dcheckid && s.port == entry.port)
        {
            Some(existing) => *existing = entry,
            None => self.services.push(entry),
        }
    }

    pub fn merge_dnsname(&mut self, dnsname: &str) {
        if self.dnsname.is_empty() && !dnsname.is_empty() {
            self.dnsname = dnsname.to_string();
        }
    }
}

/// Cross-worker store: merged results plus the per-IP completeness counters.
#[derive(Default)]
pub struct ResultsStore {
    results: HashMap<(u64, IpAddr), DiscoveryResult>,
    /// Checks still owed per (rule, ip); 0 or absent means complete.
    incomplete: HashMap<(u64, IpAddr), u64>,
}

impl ResultsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Record how many checks each address of a pushed rule owes.
    pub fn register_counts(
        &mut self,
        druleid: u64,
        ips: impl Iterator<Item = IpAddr>,
        checks_per_ip: u64,
    ) {
        for ip in ips {
            *self.incomplete.entry((druleid, ip)).or_insert(0) += checks_per_ip;
        }
    }

    fn decrease_count(&mut self, druleid: u64, ip: IpAddr, n: u64) {
        if let Some(count) = self.incomplete.get_mut(&(druleid, ip)) {
            *count = count.saturating_sub(n);
        }
    }

    /// Merge a worker's local batch.
    ///
    /// Without `force`, only IPs whose local result already carries every
    /// expected check are merged; the rest stay in `batch` for the next
    /// flush. With `force`, everything is merged. Merged entries are removed
    /// from `batch`.
    pub fn partrange_merge(
        &mut self,
        batch: &mut Vec<DiscoveryResult>,
        expected_per_ip: u64,
        force: bool,
    ) {
        let mut i = 0;
        while i < batch.len() {
            if !force && batch[i].processed_checks != expected_per_ip {
                i += 1;
                continue;
            }
            let src = batch.swap_remove(i);
            self.decrease_count(src.druleid, src.ip, src.processed_checks);
            match self.results.entry((src.druleid, src.ip)) {
                std::collections::hash_map::Entry::Occupied(mut slot) => {
                    let dst = slot.get_mut();
                    dst.merge_dnsname(&src.dnsname);
                    dst.processed_checks += src.processed_checks;
                    for service in src.services {
                        dst.upsert_service(service);
                    }
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(src);
                }
            }
        }
    }

    /// Drain results downstream, up to [`BATCH_RESULTS_MAX`] per call.
    ///
    /// Without `force`, only IPs with no checks still owed are drained. The
    /// boolean reports whether more drainable results remain.
    pub fn drain_complete(&mut self, force: bool) -> (Vec<DiscoveryResult>, bool) {
        let mut ready: Vec<(u64, IpAddr)> = self
            .results
            .keys()
            .filter(|key| force || self.incomplete.get(key).copied().unwrap_or(0) == 0)
            .copied()
            .collect();
        // Deterministic drain order for stable batching.
        ready.sort();
        let more = ready.len() > BATCH_RESULTS_MAX;
        ready.truncate(BATCH_RESULTS_MAX);

        let mut drained = Vec::with_capacity(ready.len());
        for key in ready {
            self.incomplete.remove(&key);
            if let Some(result) = self.results.remove(&key) {
                drained.push(result);
            }
        }
        drained.sort_by_key(|r| (r.druleid, r.ip));
        (drained, more)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn local_result(druleid: u64, addr: &str, processed: u64) -> DiscoveryResult {
        let mut result = DiscoveryResult::new(druleid, ip(addr), 1);
        result.processed_checks = processed;
        result
    }

    fn up_entry(dcheckid: u64, port: u16, value: &str) -> ServiceEntry {
        ServiceEntry {
            dcheckid,
            port,
            status: ServiceStatus::Up,
            value: value.into(),
        }
    }

    #[test]
    fn test_incomplete_results_stay_in_batch() {
        let mut store = ResultsStore::new();
        store.register_counts(1, vec![ip("192.0.2.1")].into_iter(), 4);

        let mut batch = vec![local_result(1, "192.0.2.1", 2)];
        store.partrange_merge(&mut batch, 4, false);
        assert_eq!(batch.len(), 1);
        assert!(store.is_empty());

        batch[0].processed_checks = 4;
        store.partrange_merge(&mut batch, 4, false);
        assert!(batch.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_force_merges_partial_results() {
        let mut store = ResultsStore::new();
        store.register_counts(1, vec![ip("192.0.2.1")].into_iter(), 4);

        let mut batch = vec![local_result(1, "192.0.2.1", 1)];
        store.partrange_merge(&mut batch, 4, true);
        assert!(batch.is_empty());
        assert_eq!(store.len(), 1);

        // 3 checks still owed, so a plain drain skips the IP.
        let (drained, _) = store.drain_complete(false);
        assert!(drained.is_empty());
        let (drained, _) = store.drain_complete(true);
        assert_eq!(drained.len(), 1);
    }

    #[test]
    fn test_remerge_is_idempotent() {
        let mut store = ResultsStore::new();
        store.register_counts(1, vec![ip("192.0.2.1")].into_iter(), 2);

        let mut first = local_result(1, "192.0.2.1", 2);
        first.upsert_service(up_entry(10, 22, "SSH-2.0-OpenSSH"));
        first.upsert_service(up_entry(11, 80, "HTTP/1.1 200 OK"));

        let mut batch = vec![first.clone()];
        store.partrange_merge(&mut batch, 2, false);
        let mut batch = vec![first];
        store.partrange_merge(&mut batch, 2, true);

        let (drained, _) = store.drain_complete(true);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].services.len(), 2);
    }

    #[test]
    fn test_first_nonempty_dnsname_wins() {
        let mut store = ResultsStore::new();
        store.register_counts(1, vec![ip("192.0.2.1")].into_iter(), 2);

        let mut a = local_result(1, "192.0.2.1", 1);
        a.dnsname = "".into();
        let mut batch = vec![a];
        store.partrange_merge(&mut batch, 2, true);

        let mut b = local_result(1, "192.0.2.1", 1);
        b.dnsname = "host-a.example".into();
        let mut batch = vec![b];
        store.partrange_merge(&mut batch, 2, true);

        let mut c = local_result(1, "192.0.2.1", 0);
        c.dnsname = "host-b.example".into();
        let mut batch = vec![c];
        store.partrange_merge(&mut batch, 2, true);

        let (drained, _) = store.drain_complete(true);
        assert_eq!(drained[0].dnsname, "host-a.example");
    }

    #[test]
    fn test_drain_separates_rules_and_reports_more() {
        let mut store = ResultsStore::new();
        store.register_counts(1, vec![ip("192.0.2.1"), ip("192.0.2.2")].into_iter(), 1);

        let mut batch = vec![
            local_result(1, "192.0.2.1", 1),
            local_result(1, "192.0.2.2", 1),
        ];
        store.partrange_merge(&mut batch, 1, false);

        let (drained, more) = store.drain_complete(false);
        assert_eq!(drained.len(), 2);
        assert!(!more);
        assert!(store.is_empty());
    }
}
