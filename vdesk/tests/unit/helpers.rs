//! Shared fixtures for unit tests.

#![allow(dead_code)]
#![allow(clippy::expect_used)]

use std::io::{Read, Write};
use std::net::TcpListener;
use std::time::Duration;

use tempfile::TempDir;
use vdesk::health::ProbePolicy;
use vdesk::{Context, DesktopInstance, InstanceStatus, ProviderKind, ProviderRef};

// ── State directories ────────────────────────────────────────────────────────

/// A context rooted in a throwaway directory. Keep the [`TempDir`] alive for
/// the duration of the test; dropping it deletes the state underneath.
pub fn temp_context() -> (TempDir, Context) {
    let dir = TempDir::new().expect("create temp dir");
    let ctx = Context::with_root(dir.path().to_path_buf()).expect("open context");
    (dir, ctx)
}

// ── Readiness endpoints ──────────────────────────────────────────────────────

pub const HEALTH_OK: &str = "HTTP/1.1 200 OK\r\ncontent-length: 15\r\n\r\n{\"status\":\"ok\"}";

/// Serve `response` to exactly one connection on an ephemeral loopback port.
pub fn serve_once(response: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();
    std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(response.as_bytes());
        }
    });
    port
}

/// A loopback port with nothing listening on it.
pub fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

/// A probe policy that gives up after a single attempt, so failure paths
/// finish instantly.
pub fn one_shot_probe() -> ProbePolicy {
    ProbePolicy {
        attempts: 1,
        delay: Duration::from_millis(0),
    }
}

// ── Records ──────────────────────────────────────────────────────────────────

/// A stored desktop record as a backend would persist it; callers override
/// the fields their scenario cares about.
pub fn instance_record(name: &str, kind: ProviderKind) -> DesktopInstance {
    DesktopInstance {
        id: format!("id-{name}"),
        name: name.to_string(),
        owner_id: None,
        addr: "203.0.113.1".to_string(),
        status: InstanceStatus::Running,
        created: chrono::Utc::now(),
        cpu: vdesk::provider::DEFAULT_CPU,
        memory_gb: vdesk::provider::DEFAULT_MEMORY_GB,
        disk: vdesk::provider::DEFAULT_DISK.to_string(),
        image: None,
        provider: ProviderRef::bare(kind),
        reserved_ip: false,
        requires_proxy: true,
        ssh_port: vdesk::instance::DEFAULT_SSH_PORT,
        agentd_port: vdesk::instance::DEFAULT_AGENTD_PORT,
        vnc_port: None,
        vnc_port_https: None,
        basic_auth_user: None,
        basic_auth_password: None,
        key_pair_name: None,
        resource_name: None,
        namespace: None,
        ttl: None,
        metadata: std::collections::BTreeMap::new(),
    }
}
