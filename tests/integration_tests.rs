//! End-to-end tests for the discovery manager against localhost.

use deimos::{
    DiscoveryCheck, DiscoveryConfig, DiscoveryManager, DiscoveryRule, PortRange, ServiceType,
};
use std::net::TcpListener;
use std::time::{Duration, Instant};

fn manager(workers: usize, concurrency: usize) -> DiscoveryManager {
    DiscoveryManager::new(
        DiscoveryConfig::default()
            .with_workers(workers)
            .with_concurrency(concurrency)
            .with_timeout(Duration::from_millis(1500)),
    )
    .expect("pool should start")
}

fn wait_pending_zero(manager: &DiscoveryManager, deadline: Duration) -> bool {
    let start = Instant::now();
    while manager.pending_checks() > 0 {
        if start.elapsed() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    true
}

#[test]
fn test_sweep_reports_every_address() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let manager = manager(2, 16);
    let rule = DiscoveryRule::new(1, "loopback sweep")
        .with_range("127.0.0.1-127.0.0.4".parse().unwrap())
        .with_check(
            DiscoveryCheck::new(10, ServiceType::Tcp).with_ports(vec![PortRange::single(port)]),
        );
    assert_eq!(rule.total_checks(), 4);

    manager.push_rule(rule).unwrap();
    assert!(wait_pending_zero(&manager, Duration::from_secs(30)));

    let (results, more) = manager.drain_results(true);
    assert!(!more);
    assert_eq!(results.len(), 4);
    for result in &results {
        assert_eq!(result.druleid, 1);
        assert_eq!(result.processed_checks, 1);
    }
    // Only the address with a listener carries an up service.
    let up: Vec<_> = results.iter().filter(|r| !r.services.is_empty()).collect();
    assert_eq!(up.len(), 1);
    assert_eq!(up[0].ip.to_string(), "127.0.0.1");
    assert_eq!(up[0].services[0].port, port);

    assert!(manager.rule_errors().is_empty());
    manager.shutdown();
}

#[test]
fn test_completed_addresses_drain_without_force() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let manager = manager(1, 8);
    let rule = DiscoveryRule::new(2, "single address")
        .with_range("127.0.0.1".parse().unwrap())
        .with_check(
            DiscoveryCheck::new(20, ServiceType::Tcp).with_ports(vec![PortRange::single(port)]),
        )
        .with_check(
            DiscoveryCheck::new(21, ServiceType::Tcp).with_ports(vec![PortRange::single(port)]),
        );

    manager.push_rule(rule).unwrap();
    assert!(wait_pending_zero(&manager, Duration::from_secs(30)));

    // Both checks done, so a plain drain is enough.
    let (results, _) = manager.drain_results(false);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].processed_checks, 2);
    assert_eq!(results[0].services.len(), 2);
    assert_eq!(results[0].unique_dcheckid, 20);
    manager.shutdown();
}

#[test]
fn test_stop_mid_range_still_settles_pending() {
    let manager = manager(1, 8);
    // Large enough that the sweep cannot finish before the stop signal.
    let rule = DiscoveryRule::new(3, "interrupted sweep")
        .with_range("127.0.1.0/24".parse().unwrap())
        .with_check(
            DiscoveryCheck::new(30, ServiceType::Tcp).with_ports(vec![PortRange::single(1)]),
        );
    let total = rule.total_checks();
    assert_eq!(total, 256);

    manager.push_rule(rule).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    manager.stop();

    // The worker finishes the address it is on, flushes, and the pending
    // counter settles at zero even though most checks never ran.
    assert!(wait_pending_zero(&manager, Duration::from_secs(60)));

    let (results, _) = manager.drain_results(true);
    assert!(results.len() as u64 <= total);
    manager.shutdown();
}

#[test]
fn test_full_class_c_sweep_under_small_cap() {
    let manager = manager(1, 10);
    let rule = DiscoveryRule::new(4, "class c sweep")
        .with_range("127.0.2.0/24".parse().unwrap())
        .with_check(
            DiscoveryCheck::new(40, ServiceType::Tcp).with_ports(vec![PortRange::single(1)]),
        );
    assert_eq!(rule.total_checks(), 256);

    manager.push_rule(rule).unwrap();
    assert!(wait_pending_zero(&manager, Duration::from_secs(60)));

    // Every address produced a result despite only 10 checks in flight.
    let mut merged = 0;
    loop {
        let (results, more) = manager.drain_results(false);
        merged += results.len();
        for result in &results {
            assert_eq!(result.processed_checks, 1);
        }
        if !more {
            break;
        }
    }
    assert_eq!(merged, 256);
    manager.shutdown();
}

#[test]
fn test_two_rules_keep_separate_results() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let manager = manager(2, 8);
    for druleid in [10, 11] {
        let rule = DiscoveryRule::new(druleid, format!("rule {}", druleid))
            .with_range("127.0.0.1".parse().unwrap())
            .with_check(
                DiscoveryCheck::new(druleid * 100, ServiceType::Tcp)
                    .with_ports(vec![PortRange::single(port)]),
            );
        manager.push_rule(rule).unwrap();
    }
    assert!(wait_pending_zero(&manager, Duration::from_secs(30)));

    let (results, _) = manager.drain_results(true);
    assert_eq!(results.len(), 2);
    let mut ids: Vec<u64> = results.iter().map(|r| r.druleid).collect();
    ids.sort();
    assert_eq!(ids, vec![10, 11]);
    manager.shutdown();
}
