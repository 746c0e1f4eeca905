//! Configuration for the discovery engine.

use crate::error::{DiscoveryError, Result};
use rlimit::Resource;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Hard ceiling on concurrent checks per worker.
pub const CHECKS_PER_WORKER_MAX: usize = 1000;

/// Default interval between partial result flushes, in seconds.
pub const FLUSH_DELAY_SECS: u64 = 5;

/// Discovery engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Number of worker threads.
    pub workers: usize,

    /// Concurrent checks per worker; 0 derives a value from the fd limit.
    pub checks_per_worker_max: usize,

    /// Seconds between partial result flushes.
    pub flush_delay_secs: u64,

    /// Default per-step check timeout in milliseconds.
    pub default_timeout_ms: u64,

    /// Optional source address to bind outgoing probes to.
    pub source_ip: Option<IpAddr>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            checks_per_worker_max: 0,
            flush_delay_secs: FLUSH_DELAY_SECS,
            default_timeout_ms: 3000,
            source_ip: None,
        }
    }
}

impl DiscoveryConfig {
    /// Set the number of worker threads
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the per-worker in-flight cap
    pub fn with_concurrency(mut self, checks_per_worker_max: usize) -> Self {
        self.checks_per_worker_max = checks_per_worker_max;
        self
    }

    /// Set the partial flush interval
    pub fn with_flush_delay(mut self, secs: u64) -> Self {
        self.flush_delay_secs = secs;
        self
    }

    /// Set the default per-step timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the source address for outgoing probes
    pub fn with_source_ip(mut self, source_ip: Option<IpAddr>) -> Self {
        self.source_ip = source_ip;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(DiscoveryError::Config("workers must be at least 1".into()));
        }
        if self.default_timeout_ms == 0 {
            return Err(DiscoveryError::Config("timeout must be non-zero".into()));
        }
        if self.checks_per_worker_max > CHECKS_PER_WORKER_MAX {
            return Err(DiscoveryError::Config(format!(
                "checks_per_worker_max above the {} ceiling",
                CHECKS_PER_WORKER_MAX
            )));
        }
        Ok(())
    }

    /// Get the default timeout as Duration
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Get the partial flush interval as Duration
    pub fn flush_delay(&self) -> Duration {
        Duration::from_secs(self.flush_delay_secs)
    }

    /// The per-worker in-flight cap actually used: the configured value, or
    /// 3/5 of the soft fd limit split across workers when unset.
    pub fn effective_concurrency(&self) -> usize {
        if self.checks_per_worker_max != 0 {
            return self.checks_per_worker_max.min(CHECKS_PER_WORKER_MAX);
        }
        derive_concurrency_from_fd_limit(self.workers)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DiscoveryError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            DiscoveryError::Config(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default_config() -> Self {
        let home_dir = dirs::home_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let config_path = home_dir.join(".deimos.toml");
        if config_path.exists() {
            match Self::from_toml_file(&config_path) {
                Ok(config) => return config,
                Err(e) => log::warn!("ignoring {}: {}", config_path.display(), e),
            }
        }
        Self::default()
    }
}

fn derive_concurrency_from_fd_limit(workers: usize) -> usize {
    let workers = workers.max(1) as u64;
    match Resource::NOFILE.get() {
        Ok((soft, _hard)) => {
            // Leave 2/5 of the descriptors to the rest of the process.
            let budget = soft / 5 * 3 / workers;
            (budget as usize).clamp(1, CHECKS_PER_WORKER_MAX)
        }
        Err(e) => {
            log::warn!("cannot read fd limit, using a conservative cap: {}", e);
            64
        }
    }
}
