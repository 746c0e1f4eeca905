//! Discovery manager: owns the queue, the worker pool and the results store.

use crate::checks::{NullSnmpProbe, SnmpProbe};
use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, Result};
use crate::queue::{DiscoveryJob, DiscoveryQueue, RuleError};
use crate::range::DiscoveryRule;
use crate::results::{DiscoveryResult, ResultsStore};
use crate::worker;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// The engine's front door: push rules in, drain results out.
pub struct DiscoveryManager {
    config: DiscoveryConfig,
    queue: Arc<DiscoveryQueue>,
    store: Arc<Mutex<ResultsStore>>,
    workers: Vec<JoinHandle<()>>,
    stop: CancellationToken,
}

impl DiscoveryManager {
    /// Start the pool without SNMP support; SNMP checks report that the
    /// capability is missing instead of probing.
    pub fn new(config: DiscoveryConfig) -> Result<Self> {
        Self::with_snmp_probe(config, Arc::new(NullSnmpProbe))
    }

    /// Start the pool with a caller-provided SNMP capability.
    pub fn with_snmp_probe(config: DiscoveryConfig, snmp: Arc<dyn SnmpProbe>) -> Result<Self> {
        config.validate()?;
        let queue = Arc::new(DiscoveryQueue::new(config.effective_concurrency()));
        let store = Arc::new(Mutex::new(ResultsStore::new()));
        let stop = CancellationToken::new();

        let workers = worker::spawn_workers(
            &config,
            Arc::clone(&queue),
            Arc::clone(&store),
            snmp,
            stop.clone(),
        )?;

        // Wait for every worker's runtime to come up before accepting rules.
        let deadline = Instant::now() + STARTUP_TIMEOUT;
        while queue.registered_workers() < config.workers {
            if Instant::now() > deadline {
                stop.cancel();
                queue.shutdown();
                return Err(DiscoveryError::Resource(format!(
                    "only {} of {} workers started within {:?}",
                    queue.registered_workers(),
                    config.workers,
                    STARTUP_TIMEOUT
                )));
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        log::info!(
            "discovery pool ready: {} workers, {} checks per worker",
            config.workers,
            queue.checks_per_worker_max
        );
        Ok(Self {
            config,
            queue,
            store,
            workers,
            stop,
        })
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Queue one rule sweep. The expected check counts are registered before
    /// the job becomes visible to workers, so partial merges can never drain
    /// an address early.
    pub fn push_rule(&self, rule: DiscoveryRule) -> Result<()> {
        rule.validate()?;
        let rule = Arc::new(rule);
        {
            let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
            store.register_counts(rule.druleid, rule.iter_ips(), rule.checks_per_ip());
        }
        self.queue.pending_add(rule.total_checks());
        self.queue.push(Arc::new(DiscoveryJob::new(rule)));
        Ok(())
    }

    /// Checks issued and not yet folded back into the store.
    pub fn pending_checks(&self) -> u64 {
        self.queue.pending_checks()
    }

    /// Hand completed results downstream; `force` also drains addresses with
    /// checks still owed. The boolean reports whether another call would
    /// yield more.
    pub fn drain_results(&self, force: bool) -> (Vec<DiscoveryResult>, bool) {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.drain_complete(force)
    }

    /// Errors recorded against rules whose sweep failed outright.
    pub fn rule_errors(&self) -> Vec<RuleError> {
        self.queue.take_errors()
    }

    /// Signal the pool to stop. Workers finish the address they are on,
    /// flush, and exit.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Stop the pool and wait for every worker to exit.
    pub fn shutdown(mut self) {
        self.stop.cancel();
        self.queue.shutdown();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("worker panicked during shutdown");
            }
        }
    }
}

impl Drop for DiscoveryManager {
    fn drop(&mut self) {
        self.stop.cancel();
        self.queue.shutdown();
    }
}
