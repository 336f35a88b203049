//! Tunnel discovery and teardown against real local processes.
//!
//! A reachable ssh endpoint is not available here, so these tests spawn
//! impostor processes whose command lines look exactly like a forwarding
//! ssh client and drive the discovery path against them.

#![cfg(unix)]
#![allow(clippy::expect_used)]

use std::net::TcpListener;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use vdesk::Error;
use vdesk::tunnel::{TunnelSpec, ensure_tunnel, find_existing};

/// Spawn a process whose command line matches what a forwarding ssh client
/// for `spec` would show. `/bin/sh` runs the sleep; `arg0` makes it present
/// itself as ssh, and the forwarding flags ride along as unused positional
/// parameters. The two-command script keeps the shell resident instead of
/// exec-replacing itself with sleep, so the command line stays intact.
fn forwarding_impostor(spec: &TunnelSpec) -> Child {
    let forward = format!("{}:localhost:{}", spec.local_port, spec.remote_port);
    let port = spec.ssh_port.to_string();
    let destination = format!("{}@{}", spec.user, spec.host);
    Command::new("/bin/sh")
        .arg0("ssh")
        .args([
            "-c",
            "sleep 30; true",
            "sh",
            "-N",
            "-L",
            forward.as_str(),
            "-p",
            port.as_str(),
            destination.as_str(),
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn impostor")
}

#[test]
fn test_matching_process_is_reused_not_respawned() {
    let spec = TunnelSpec::new(18472, 8000, 22, "agent", "203.0.113.77");
    let mut child = forwarding_impostor(&spec);
    thread::sleep(Duration::from_millis(200));

    let tunnel = ensure_tunnel(&spec, None).expect("adopt the running forwarder");
    assert!(tunnel.is_reused());
    assert_eq!(tunnel.pid(), child.id());
    assert_eq!(tunnel.local_port(), 18472);

    // A different local port is a different tunnel.
    let other = TunnelSpec::new(18473, 8000, 22, "agent", "203.0.113.77");
    assert!(find_existing(&other).is_none());

    // Closing an adopted tunnel terminates the process instead of leaving
    // it behind.
    tunnel.close();
    let status = child.wait().expect("wait for impostor");
    assert!(!status.success());
    assert!(find_existing(&spec).is_none());
}

#[test]
fn test_second_caller_shares_the_same_process() {
    let spec = TunnelSpec::new(18474, 8000, 22, "agent", "203.0.113.78");
    let mut child = forwarding_impostor(&spec);
    thread::sleep(Duration::from_millis(200));

    let first = ensure_tunnel(&spec, None).expect("first caller");
    let second = ensure_tunnel(&spec, None).expect("second caller");
    assert!(first.is_reused());
    assert!(second.is_reused());
    assert_eq!(first.pid(), second.pid());

    second.close();
    let status = child.wait().expect("wait for impostor");
    assert!(!status.success());
    drop(first);
}

#[test]
fn test_dead_endpoint_fails_within_grace() {
    // A port that was just bound and released: connecting to it is refused
    // immediately, whether or not an ssh binary is installed.
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let ssh_port = listener.local_addr().expect("addr").port();
    drop(listener);

    let spec = TunnelSpec::new(18475, 8000, ssh_port, "agent", "127.0.0.1");
    match ensure_tunnel(&spec, None) {
        Err(Error::TunnelFailed { host, .. }) => assert_eq!(host, "127.0.0.1"),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("no listener must mean no tunnel"),
    }
}
