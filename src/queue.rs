//! Shared work queue between the manager and the worker pool.
//!
//! Workers are OS threads that block between jobs, so the queue is a plain
//! mutex/condvar pair rather than an async channel; everything inside a
//! worker stays on its own reactor. Critical sections are short and never
//! span I/O.
//!
//! A job is a whole rule sweep, but workers never own one outright: each pop
//! takes one cursor chunk and requeues the job while positions remain, so a
//! large range is swept by as many workers as are free.

use crate::range::{CheckAddress, DiscoveryRule, RangeCursor};
use std::collections::VecDeque;
use std::iter::Peekable;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// One queued rule sweep, chunked down by however many workers pop it.
pub struct DiscoveryJob {
    pub rule: Arc<DiscoveryRule>,
    cursor: Mutex<Peekable<RangeCursor>>,
}

impl DiscoveryJob {
    pub fn new(rule: Arc<DiscoveryRule>) -> Self {
        let cursor = RangeCursor::new(Arc::clone(&rule)).peekable();
        Self {
            rule,
            cursor: Mutex::new(cursor),
        }
    }

    /// Take the next chunk of at least `max` positions, extended to the end
    /// of the last started address so one IP is never split across workers.
    /// The boolean reports whether the cursor still holds more positions.
    pub fn take_chunk(&self, max: usize) -> (Vec<CheckAddress>, bool) {
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        let mut chunk: Vec<CheckAddress> = Vec::new();
        while let Some(&next) = cursor.peek() {
            if chunk.len() >= max && chunk.last().map(|p| p.ip) != Some(next.ip) {
                break;
            }
            chunk.push(next);
            cursor.next();
        }
        let remaining = cursor.peek().is_some();
        (chunk, remaining)
    }
}

/// Error recorded against a rule whose range driver failed outright.
#[derive(Debug, Clone)]
pub struct RuleError {
    pub druleid: u64,
    pub message: String,
}

struct QueueState {
    jobs: VecDeque<Arc<DiscoveryJob>>,
    /// Checks issued to the pool and not yet folded into the results store.
    pending_checks: u64,
    registered_workers: usize,
    errors: Vec<RuleError>,
    shutdown: bool,
}

pub struct DiscoveryQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    /// In-flight cap each worker's reactor honors.
    pub checks_per_worker_max: usize,
}

impl DiscoveryQueue {
    pub fn new(checks_per_worker_max: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                pending_checks: 0,
                registered_workers: 0,
                errors: Vec::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
            checks_per_worker_max: checks_per_worker_max.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A poisoned queue mutex only means a worker panicked mid-push; the
        // counters are still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, job: Arc<DiscoveryJob>) {
        let mut state = self.lock();
        state.jobs.push_back(job);
        drop(state);
        self.cond.notify_one();
    }

    /// Block until a job is available or the queue shuts down.
    pub fn pop_wait(&self) -> Option<Arc<DiscoveryJob>> {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(job) = state.jobs.pop_front() {
                return Some(job);
            }
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn queued_jobs(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn pending_add(&self, n: u64) {
        self.lock().pending_checks += n;
    }

    /// Batched decrement from the workers' completion folds.
    pub fn pending_sub(&self, n: u64) {
        let mut state = self.lock();
        if state.pending_checks < n {
            // The counter never goes negative; this should never happen.
            log::error!(
                "pending check counter underflow: {} - {}",
                state.pending_checks,
                n
            );
            state.pending_checks = 0;
        } else {
            state.pending_checks -= n;
        }
    }

    pub fn pending_checks(&self) -> u64 {
        self.lock().pending_checks
    }

    pub fn register_worker(&self) {
        self.lock().registered_workers += 1;
    }

    pub fn deregister_worker(&self) {
        let mut state = self.lock();
        state.registered_workers = state.registered_workers.saturating_sub(1);
    }

    pub fn registered_workers(&self) -> usize {
        self.lock().registered_workers
    }

    pub fn push_error(&self, druleid: u64, message: String) {
        self.lock().errors.push(RuleError { druleid, message });
    }

    pub fn take_errors(&self) -> Vec<RuleError> {
        std::mem::take(&mut self.lock().errors)
    }

    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.cond.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ServiceType;
    use crate::range::{DiscoveryCheck, DiscoveryRule, PortRange};

    fn rule(druleid: u64, range: &str, checks: usize) -> Arc<DiscoveryRule> {
        let mut rule = DiscoveryRule::new(druleid, "test").with_range(range.parse().unwrap());
        for i in 0..checks {
            rule = rule.with_check(
                DiscoveryCheck::new(i as u64 + 1, ServiceType::Tcp)
                    .with_ports(vec![PortRange::single(80 + i as u16)]),
            );
        }
        Arc::new(rule)
    }

    fn job() -> Arc<DiscoveryJob> {
        Arc::new(DiscoveryJob::new(rule(1, "192.0.2.1", 1)))
    }

    #[test]
    fn test_push_pop() {
        let queue = DiscoveryQueue::new(10);
        queue.push(job());
        assert_eq!(queue.queued_jobs(), 1);
        let popped = queue.pop_wait().unwrap();
        assert_eq!(popped.rule.druleid, 1);
        assert_eq!(queue.queued_jobs(), 0);
    }

    #[test]
    fn test_shutdown_wakes_waiters() {
        let queue = Arc::new(DiscoveryQueue::new(10));
        let waiter = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.pop_wait().is_none())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        queue.shutdown();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_pending_counter_batches() {
        let queue = DiscoveryQueue::new(10);
        queue.pending_add(256);
        queue.pending_sub(10);
        queue.pending_sub(10);
        assert_eq!(queue.pending_checks(), 236);
        queue.pending_sub(236);
        assert_eq!(queue.pending_checks(), 0);
        // Underflow clamps instead of wrapping.
        queue.pending_sub(5);
        assert_eq!(queue.pending_checks(), 0);
    }

    #[test]
    fn test_chunks_are_disjoint_and_cover_the_rule() {
        let rule = rule(1, "192.0.2.0/24", 1);
        let job = DiscoveryJob::new(Arc::clone(&rule));

        let mut positions = Vec::new();
        loop {
            let (chunk, remaining) = job.take_chunk(10);
            if chunk.is_empty() {
                assert!(!remaining);
                break;
            }
            positions.extend(chunk.into_iter().map(|p| (p.ip, p.port, p.check_idx)));
        }
        assert_eq!(positions.len() as u64, rule.total_checks());
        let unchunked = positions.len();
        positions.sort();
        positions.dedup();
        assert_eq!(positions.len(), unchunked);
    }

    #[test]
    fn test_chunk_never_splits_an_address() {
        // Two addresses, three checks each; a cap of 2 must still hand out
        // whole addresses.
        let job = DiscoveryJob::new(rule(1, "192.0.2.1-192.0.2.2", 3));

        let (first, remaining) = job.take_chunk(2);
        assert!(remaining);
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|p| p.ip.to_string() == "192.0.2.1"));

        let (second, remaining) = job.take_chunk(2);
        assert!(!remaining);
        assert_eq!(second.len(), 3);
        assert!(second.iter().all(|p| p.ip.to_string() == "192.0.2.2"));
    }

    #[test]
    fn test_requeued_job_is_shared_between_pops() {
        let queue = DiscoveryQueue::new(10);
        queue.push(Arc::new(DiscoveryJob::new(rule(1, "192.0.2.0/28", 1))));

        // First worker takes a chunk and requeues the job.
        let popped = queue.pop_wait().unwrap();
        let (first, remaining) = popped.take_chunk(4);
        assert!(remaining);
        queue.push(Arc::clone(&popped));

        // Second pop sees the same job and continues where the first left off.
        let again = queue.pop_wait().unwrap();
        let (second, _) = again.take_chunk(4);
        assert_eq!(first.len(), 4);
        assert_eq!(second.len(), 4);
        assert!(first.iter().all(|p| !second.contains(p)));
    }

    #[test]
    fn test_worker_registration() {
        let queue = DiscoveryQueue::new(10);
        queue.register_worker();
        queue.register_worker();
        assert_eq!(queue.registered_workers(), 2);
        queue.deregister_worker();
        assert_eq!(queue.registered_workers(), 1);
    }
}
