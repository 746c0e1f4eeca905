//! Protocol check tests against scripted localhost servers.
//!
//! Each test spawns a one-shot server thread that plays the peer's side of
//! the protocol, then drives the check through a reactor and inspects the
//! terminal outcome.

use deimos::checks::{CheckRequest, NullSnmpProbe};
use deimos::reactor::Reactor;
use deimos::{DiscoveryError, ServiceType};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

fn serve_once<F>(f: F) -> SocketAddr
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            f(stream);
        }
    });
    addr
}

fn request(addr: SocketAddr, service: ServiceType, timeout: Duration) -> CheckRequest {
    CheckRequest {
        dcheckid: 1,
        address: addr.ip().to_string(),
        port: addr.port(),
        service,
        key: "system.uname".into(),
        snmp_community: String::new(),
        snmpv3: None,
        timeout,
    }
}

fn run_check(addr: SocketAddr, service: ServiceType, timeout: Duration) -> deimos::CheckOutcome {
    tokio_test::block_on(async {
        let mut reactor = Reactor::new(4, None, None, Arc::new(NullSnmpProbe));
        reactor.add_task(request(addr, service, timeout));
        reactor.run_one_iteration().await.unwrap()
    })
}

#[test]
fn test_ssh_banner_exchange() {
    let (tx, rx) = mpsc::channel();
    let addr = serve_once(move |mut stream| {
        stream.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").unwrap();
        let mut echo = vec![0u8; b"SSH-2.0-deimos\r\n".len()];
        stream.read_exact(&mut echo).unwrap();
        tx.send(echo).unwrap();
    });

    let out = run_check(addr, ServiceType::Ssh, Duration::from_secs(3));
    assert!(out.status.is_up(), "error: {:?}", out.error);
    assert_eq!(out.value, "SSH-2.0-OpenSSH_9.6");

    let echo = rx.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(echo, b"SSH-2.0-deimos\r\n");
}

#[test]
fn test_smtp_multiline_greeting_and_quit() {
    let (tx, rx) = mpsc::channel();
    let addr = serve_once(move |mut stream| {
        stream
            .write_all(b"220-mail.example.com ESMTP\r\n220 ready\r\n")
            .unwrap();
        let mut quit = vec![0u8; 6];
        stream.read_exact(&mut quit).unwrap();
        tx.send(quit).unwrap();
    });

    let out = run_check(addr, ServiceType::Smtp, Duration::from_secs(3));
    assert!(out.status.is_up(), "error: {:?}", out.error);
    assert_eq!(out.value, "220 ready");
    assert_eq!(rx.recv_timeout(Duration::from_secs(3)).unwrap(), b"QUIT\r\n");
}

#[test]
fn test_smtp_rejection_is_protocol_error() {
    let addr = serve_once(|mut stream| {
        let _ = stream.write_all(b"554 go away\r\n");
    });

    let out = run_check(addr, ServiceType::Smtp, Duration::from_secs(3));
    assert!(!out.status.is_up());
    assert!(out.value.is_empty());
    assert!(matches!(out.error, Some(DiscoveryError::Protocol(_))));
}

#[test]
fn test_ftp_greeting_then_close() {
    let addr = serve_once(|mut stream| {
        let _ = stream.write_all(b"220 ftp.example.com ready\r\n");
    });

    let out = run_check(addr, ServiceType::Ftp, Duration::from_secs(3));
    assert!(out.status.is_up(), "error: {:?}", out.error);
    assert_eq!(out.value, "220 ftp.example.com ready");
}

#[test]
fn test_telnet_negotiation_split_across_writes() {
    const IAC: u8 = 255;
    const DO: u8 = 253;
    const WILL: u8 = 251;
    const SGA: u8 = 3;

    let (tx, rx) = mpsc::channel();
    let addr = serve_once(move |mut stream| {
        // The option request arrives in two segments.
        stream.write_all(&[IAC, DO]).unwrap();
        stream.flush().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        stream.write_all(&[SGA]).unwrap();
        let mut reply = [0u8; 3];
        stream.read_exact(&mut reply).unwrap();
        tx.send(reply).unwrap();
    });

    let out = run_check(addr, ServiceType::Telnet, Duration::from_secs(3));
    assert!(out.status.is_up(), "error: {:?}", out.error);
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(3)).unwrap(),
        [IAC, WILL, SGA]
    );
}

#[test]
fn test_agent_json_exchange() {
    let (tx, rx) = mpsc::channel();
    let addr = serve_once(move |mut stream| {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while stream.read_exact(&mut byte).is_ok() {
            line.push(byte[0]);
            if byte[0] == b'\n' {
                break;
            }
        }
        tx.send(line).unwrap();
        stream
            .write_all(b"{\"response\":\"success\",\"data\":[{\"value\":\"Linux\"}]}\n")
            .unwrap();
    });

    let out = run_check(addr, ServiceType::Agent, Duration::from_secs(3));
    assert!(out.status.is_up(), "error: {:?}", out.error);
    assert_eq!(out.value, "Linux");

    let line = rx.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(
        String::from_utf8(line).unwrap(),
        "{\"request\":\"agent.check\",\"data\":[{\"key\":\"system.uname\"}]}\n"
    );
}

#[test]
fn test_http_status_line() {
    let addr = serve_once(|mut stream| {
        let mut head = [0u8; 512];
        let _ = stream.read(&mut head);
        let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
    });

    let out = run_check(addr, ServiceType::Http, Duration::from_secs(3));
    assert!(out.status.is_up(), "error: {:?}", out.error);
    assert_eq!(out.value, "HTTP/1.1 200 OK");
}

#[test]
fn test_non_http_answer_is_protocol_error() {
    let addr = serve_once(|mut stream| {
        let mut head = [0u8; 512];
        let _ = stream.read(&mut head);
        let _ = stream.write_all(b"NOT AN HTTP SERVER\r\n");
    });

    let out = run_check(addr, ServiceType::Http, Duration::from_secs(3));
    assert!(!out.status.is_up());
    assert!(matches!(out.error, Some(DiscoveryError::Protocol(_))));
}

#[test]
fn test_unreachable_peer_is_down_in_connect_wait() {
    // TEST-NET-1 is not routed; the connect either hangs until the step
    // timer fires or dies with a network error, never anything louder.
    let addr: SocketAddr = "192.0.2.1:80".parse().unwrap();
    let out = run_check(addr, ServiceType::Http, Duration::from_millis(400));
    assert!(!out.status.is_up());
    assert!(out.value.is_empty());
    let err = out.error.expect("down outcome must carry an error");
    assert!(err.is_expected_down(), "unexpected class: {:?}", err);
}

#[test]
fn test_silent_peer_times_out() {
    let (tx, rx) = mpsc::channel::<()>();
    let addr = serve_once(move |_stream| {
        // Keep the connection open but never write the banner.
        let _ = rx.recv_timeout(Duration::from_secs(10));
    });

    let out = run_check(addr, ServiceType::Ssh, Duration::from_millis(400));
    assert!(!out.status.is_up());
    assert!(matches!(out.error, Some(DiscoveryError::Timeout)));
    drop(tx);
}
