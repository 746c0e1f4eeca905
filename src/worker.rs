//! Worker pool.
//!
//! Each worker is an OS thread with its own current-thread runtime and
//! reactor. A worker takes one cursor chunk off the next queued job,
//! requeues the job while positions remain so other workers sweep the same
//! rule concurrently, and keeps the reactor filled up to the per-worker cap.
//! Results accumulate in per-IP buckets local to the worker and are merged
//! into the shared store in rate-limited batches, with one forced merge at
//! the end of every chunk.

use crate::checks::{CheckOutcome, CheckRequest, SnmpProbe};
use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, Result};
use crate::net::tls;
use crate::queue::DiscoveryQueue;
use crate::range::{CheckAddress, DiscoveryRule};
use crate::reactor::Reactor;
use crate::results::{DiscoveryResult, ResultsStore, ServiceEntry};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Spawn the worker threads. Each registers itself with the queue once its
/// runtime is up, so the caller can wait for the pool to be ready.
pub fn spawn_workers(
    config: &DiscoveryConfig,
    queue: Arc<DiscoveryQueue>,
    store: Arc<Mutex<ResultsStore>>,
    snmp: Arc<dyn SnmpProbe>,
    stop: CancellationToken,
) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(config.workers);
    for worker_id in 0..config.workers {
        let queue = Arc::clone(&queue);
        let store = Arc::clone(&store);
        let snmp = Arc::clone(&snmp);
        let stop = stop.clone();
        let config = config.clone();
        let handle = std::thread::Builder::new()
            .name(format!("discoverer-{}", worker_id))
            .spawn(move || worker_entry(worker_id, &config, &queue, &store, snmp, &stop))
            .map_err(|e| DiscoveryError::Resource(format!("cannot spawn worker: {}", e)))?;
        handles.push(handle);
    }
    Ok(handles)
}

fn worker_entry(
    worker_id: usize,
    config: &DiscoveryConfig,
    queue: &DiscoveryQueue,
    store: &Mutex<ResultsStore>,
    snmp: Arc<dyn SnmpProbe>,
    stop: &CancellationToken,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("worker {}: cannot build runtime: {}", worker_id, e);
            return;
        }
    };

    // A broken TLS stack only disables HTTPS checks, the worker still runs.
    let tls = match tls::connector() {
        Ok(connector) => Some(connector),
        Err(e) => {
            log::warn!("worker {}: TLS unavailable: {}", worker_id, e);
            None
        }
    };

    queue.register_worker();
    log::debug!("worker {} started", worker_id);

    while let Some(job) = queue.pop_wait() {
        let (chunk, remaining) = job.take_chunk(queue.checks_per_worker_max);
        if remaining {
            // Leave the rest of the rule for whichever worker is free next.
            queue.push(Arc::clone(&job));
        }
        if chunk.is_empty() {
            continue;
        }
        if stop.is_cancelled() {
            // Discard without probing; the pending counter still settles.
            queue.pending_sub(chunk.len() as u64);
            continue;
        }

        let mut reactor = Reactor::new(
            queue.checks_per_worker_max,
            config.source_ip,
            tls.clone(),
            Arc::clone(&snmp),
        );
        log::debug!(
            "worker {}: rule \"{}\", chunk of {} checks",
            worker_id,
            job.rule.name,
            chunk.len()
        );
        if let Err(e) = runtime.block_on(net_check_range(
            &job.rule,
            chunk,
            &mut reactor,
            queue,
            store,
            stop,
            config,
        )) {
            log::warn!("worker {}: rule \"{}\" failed: {}", worker_id, job.rule.name, e);
            queue.push_error(
                job.rule.druleid,
                format!("\"{}\" checks failed: {}", job.rule.name, e),
            );
        }
    }

    queue.deregister_worker();
    log::debug!("worker {} stopped", worker_id);
}

/// Sweep one cursor chunk: dispatch every (ip, port, check) position through
/// the reactor and merge the outcomes. The stop token is honored between
/// addresses, never in the middle of one, so a started address always
/// finishes its checks. A resource-class failure aborts the chunk and is
/// reported against the rule.
async fn net_check_range(
    rule: &Arc<DiscoveryRule>,
    chunk: Vec<CheckAddress>,
    reactor: &mut Reactor,
    queue: &DiscoveryQueue,
    store: &Mutex<ResultsStore>,
    stop: &CancellationToken,
    config: &DiscoveryConfig,
) -> Result<()> {
    let checks_per_ip = rule.checks_per_ip();
    let flush_delay = config.flush_delay();
    let batch_size = queue.checks_per_worker_max as u64;
    let chunk_total = chunk.len() as u64;

    let mut local: HashMap<IpAddr, DiscoveryResult> = HashMap::new();
    let mut current_ip: Option<IpAddr> = None;
    let mut completed: u64 = 0;
    let mut accounted: u64 = 0;
    let mut snmpv3_seen = false;
    let mut fatal: Option<DiscoveryError> = None;
    let mut last_flush = Instant::now();

    for item in chunk {
        if current_ip != Some(item.ip) {
            if stop.is_cancelled() {
                log::debug!("rule \"{}\": stopping before {}", rule.name, item.ip);
                break;
            }
            current_ip = Some(item.ip);
        }

        while reactor.at_capacity() {
            match reactor.run_one_iteration().await {
                Some(outcome) => {
                    if let Some(err) = fold_outcome(&mut local, rule, outcome) {
                        fatal.get_or_insert(err);
                    }
                    completed += 1;
                }
                None => break,
            }
        }
        if fatal.is_some() {
            break;
        }

        let check = &rule.checks[item.check_idx];
        if check.snmpv3.is_some() {
            snmpv3_seen = true;
        }
        local
            .entry(item.ip)
            .or_insert_with(|| DiscoveryResult::new(rule.druleid, item.ip, rule.unique_dcheckid));
        reactor.add_task(CheckRequest {
            dcheckid: check.dcheckid,
            address: item.ip.to_string(),
            port: item.port,
            service: check.service,
            key: check.key.clone(),
            snmp_community: check.snmp_community.clone(),
            snmpv3: check.snmpv3.clone(),
            timeout: check.timeout(),
        });

        if completed - accounted >= batch_size {
            queue.pending_sub(completed - accounted);
            accounted = completed;
        }
        if last_flush.elapsed() >= flush_delay {
            flush_local(store, &mut local, checks_per_ip, false);
            last_flush = Instant::now();
        }
    }

    while let Some(outcome) = reactor.run_one_iteration().await {
        if let Some(err) = fold_outcome(&mut local, rule, outcome) {
            fatal.get_or_insert(err);
        }
        completed += 1;
    }

    if snmpv3_seen {
        reactor.snmp().clear_engine_cache();
    }

    flush_local(store, &mut local, checks_per_ip, true);

    // One final decrement covers both the folded tail and, after an early
    // stop or abort, the checks that were never dispatched; the chunk's
    // share of the pending count always settles.
    queue.pending_sub(chunk_total - accounted);

    match fatal {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Fold one outcome into the local buckets. Returns the error when it is
/// resource-class: running out of descriptors means the concurrency budget
/// is wrong, which is a rule-level failure rather than per-host noise.
fn fold_outcome(
    local: &mut HashMap<IpAddr, DiscoveryResult>,
    rule: &DiscoveryRule,
    outcome: CheckOutcome,
) -> Option<DiscoveryError> {
    let bucket = local
        .entry(outcome.ip)
        .or_insert_with(|| DiscoveryResult::new(rule.druleid, outcome.ip, rule.unique_dcheckid));
    bucket.processed_checks += 1;
    bucket.merge_dnsname(&outcome.dnsname);
    if outcome.status.is_up() {
        bucket.upsert_service(ServiceEntry {
            dcheckid: outcome.dcheckid,
            port: outcome.port,
            status: outcome.status,
            value: outcome.value,
        });
        return None;
    }
    match outcome.error {
        Some(err @ DiscoveryError::Resource(_)) => Some(err),
        Some(error) if error.is_expected_down() => {
            log::debug!("{}:{} down: {}", outcome.ip, outcome.port, error);
            None
        }
        Some(error) => {
            log::warn!("{}:{} check failed: {}", outcome.ip, outcome.port, error);
            None
        }
        None => None,
    }
}

fn flush_local(
    store: &Mutex<ResultsStore>,
    local: &mut HashMap<IpAddr, DiscoveryResult>,
    checks_per_ip: u64,
    force: bool,
) {
    if local.is_empty() {
        return;
    }
    let mut batch: Vec<DiscoveryResult> = local.drain().map(|(_, result)| result).collect();
    {
        let mut store = store.lock().unwrap_or_else(|e| e.into_inner());
        store.partrange_merge(&mut batch, checks_per_ip, force);
    }
    // Whatever the store did not take yet goes back into the local buckets.
    for result in batch {
        local.insert(result.ip, result);
    }
}
