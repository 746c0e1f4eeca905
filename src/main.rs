use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use std::time::Duration;

use deimos::{
    parse_port_list, DiscoveryCheck, DiscoveryConfig, DiscoveryManager, DiscoveryRule, IpRange,
    PortRange, ServiceType,
};

fn build_cli() -> Command {
    Command::new("deimos")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Asynchronous network discovery engine")
        .arg(
            Arg::new("range")
                .help("IP range to sweep (CIDR, span, or single address)")
                .required(true)
                .num_args(1..),
        )
        .arg(
            Arg::new("check")
                .short('c')
                .long("check")
                .help("Service check to run against every address")
                .value_parser([
                    "agent", "ssh", "smtp", "ftp", "http", "https", "pop", "nntp", "imap",
                    "telnet", "tcp", "snmpv1", "snmpv2c", "snmpv3",
                ])
                .action(ArgAction::Append)
                .default_values(["tcp"]),
        )
        .arg(
            Arg::new("ports")
                .short('p')
                .long("ports")
                .help("Port list for every check, e.g. 21,22,8000-8010"),
        )
        .arg(
            Arg::new("key")
                .short('k')
                .long("key")
                .help("Agent item key or SNMP OID")
                .default_value("system.uname"),
        )
        .arg(
            Arg::new("workers")
                .short('w')
                .long("workers")
                .help("Worker threads (default: CPU count)")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("concurrency")
                .long("concurrency")
                .help("Concurrent checks per worker (default: derived from the fd limit)")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .long("timeout-ms")
                .help("Per-step check timeout in milliseconds")
                .value_parser(clap::value_parser!(u64))
                .default_value("3000"),
        )
        .arg(
            Arg::new("source-ip")
                .long("source-ip")
                .help("Source address to bind outgoing probes to"),
        )
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let matches = build_cli().get_matches();

    let timeout = Duration::from_millis(*matches.get_one::<u64>("timeout").unwrap_or(&3000));
    let mut config = DiscoveryConfig::load_default_config().with_timeout(timeout);
    if let Some(&workers) = matches.get_one::<usize>("workers") {
        config = config.with_workers(workers);
    }
    if let Some(&cap) = matches.get_one::<usize>("concurrency") {
        config = config.with_concurrency(cap);
    }
    if let Some(source) = matches.get_one::<String>("source-ip") {
        let ip = source
            .parse()
            .with_context(|| format!("invalid source address \"{}\"", source))?;
        config = config.with_source_ip(Some(ip));
    }

    let ports: Option<Vec<PortRange>> = match matches.get_one::<String>("ports") {
        Some(list) => Some(parse_port_list(list)?),
        None => None,
    };

    let mut rule = DiscoveryRule::new(1, "cli");
    let ranges = matches
        .get_many::<String>("range")
        .context("at least one range is required")?;
    for range in ranges {
        let range: IpRange = range.parse()?;
        rule = rule.with_range(range);
    }
    let key = matches
        .get_one::<String>("key")
        .cloned()
        .unwrap_or_default();
    let checks = matches
        .get_many::<String>("check")
        .context("at least one check is required")?;
    for (idx, name) in checks.enumerate() {
        let service: ServiceType = name.parse()?;
        let mut check = DiscoveryCheck::new(idx as u64 + 1, service)
            .with_key(key.clone())
            .with_timeout(timeout);
        match &ports {
            Some(ports) => check = check.with_ports(ports.clone()),
            None if service.default_port() == 0 => {
                anyhow::bail!("{} checks need an explicit --ports list", service.name())
            }
            None => {}
        }
        rule = rule.with_check(check);
    }

    let manager = DiscoveryManager::new(config).context("cannot start the worker pool")?;
    manager
        .push_rule(rule)
        .context("cannot queue the discovery rule")?;

    while manager.pending_checks() > 0 {
        std::thread::sleep(Duration::from_millis(100));
    }

    for error in manager.rule_errors() {
        eprintln!("rule {}: {}", error.druleid, error.message);
    }

    loop {
        let (results, more) = manager.drain_results(true);
        for result in &results {
            println!("{}", serde_json::to_string_pretty(result)?);
        }
        if !more {
            break;
        }
    }

    manager.shutdown();
    Ok(())
}
