//! Shared mock backends for unit tests.
//!
//! The cloud APIs are mocked with `mockall` so each test states exactly the
//! calls it expects; the container runtime is a scripted command runner that
//! the provider under test and the assertions share.

#![allow(dead_code)]
#![allow(clippy::expect_used)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::rc::Rc;

use mockall::mock;
use vdesk::Result;
use vdesk::provider::hetzner::{self, HetznerApi};
use vdesk::provider::scaleway::{self, ScalewayApi};
use vdesk::runner::{CommandOutput, CommandRunner};

// ── Cloud APIs ───────────────────────────────────────────────────────────────

mock! {
    pub ScalewayCloud {}

    impl ScalewayApi for ScalewayCloud {
        fn create_server(&self, req: &scaleway::CreateServerRequest) -> Result<scaleway::Server>;
        fn set_cloud_init(&self, server_id: &str, user_data: &str) -> Result<()>;
        fn server_action(&self, server_id: &str, action: &str) -> Result<()>;
        fn get_server(&self, server_id: &str) -> Result<scaleway::Server>;
        fn list_servers(&self) -> Result<Vec<scaleway::Server>>;
        fn ensure_ssh_key(&self, name: &str, public_key: &str) -> Result<()>;
        fn ensure_security_group(&self) -> Result<String>;
        fn reserve_ip(&self, server_id: &str) -> Result<String>;
    }
}

mock! {
    pub HetznerCloud {}

    impl HetznerApi for HetznerCloud {
        fn create_server(&self, req: &hetzner::CreateServerRequest) -> Result<hetzner::Server>;
        fn server_action(&self, server_id: u64, action: &str) -> Result<()>;
        fn delete_server(&self, server_id: u64) -> Result<()>;
        fn get_server(&self, server_id: u64) -> Result<hetzner::Server>;
        fn list_servers(&self) -> Result<Vec<hetzner::Server>>;
        fn ensure_ssh_key(&self, name: &str, public_key: &str) -> Result<()>;
        fn ensure_firewall(&self) -> Result<u64>;
        fn reserve_primary_ip(&self, server_id: u64, name: &str) -> Result<String>;
    }
}

pub fn hetzner_server(id: u64, name: &str, status: &str, addr: &str) -> hetzner::Server {
    hetzner::Server {
        id,
        name: name.to_string(),
        status: status.to_string(),
        public_net: hetzner::PublicNet {
            ipv4: Some(hetzner::Ipv4 {
                ip: addr.to_string(),
            }),
        },
        labels: BTreeMap::new(),
    }
}

pub fn scaleway_server(id: &str, name: &str, state: &str, addr: &str) -> scaleway::Server {
    scaleway::Server {
        id: id.to_string(),
        name: name.to_string(),
        state: state.to_string(),
        public_ip: Some(scaleway::PublicIp {
            id: format!("ip-{id}"),
            address: addr.to_string(),
        }),
        tags: vec!["provisioner=vdesk".to_string()],
    }
}

// ── Container runtime ────────────────────────────────────────────────────────

/// Canned `docker` CLI. Answers every subcommand successfully and records the
/// full argv of each call; clones share state so a test can keep a handle
/// after handing the runner to the provider.
#[derive(Clone, Default)]
pub struct ScriptedDocker {
    state: Rc<DockerState>,
}

#[derive(Default)]
struct DockerState {
    calls: RefCell<Vec<String>>,
    ps_stdout: RefCell<String>,
}

impl ScriptedDocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every invocation so far, one space-joined argv per element.
    pub fn calls(&self) -> Vec<String> {
        self.state.calls.borrow().clone()
    }

    /// What the next `docker ps` prints on stdout.
    pub fn set_ps(&self, stdout: &str) {
        *self.state.ps_stdout.borrow_mut() = stdout.to_string();
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

impl CommandRunner for ScriptedDocker {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput> {
        let rendered: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        self.state
            .calls
            .borrow_mut()
            .push(format!("{program} {}", rendered.join(" ")));
        match rendered.first().map(String::as_str) {
            Some("network") => Ok(ok("")),
            Some("run") => Ok(ok("f00dcafe\n")),
            Some("inspect") => Ok(ok("true\n")),
            Some("rm") => Ok(ok("")),
            Some("ps") => Ok(ok(&self.state.ps_stdout.borrow())),
            other => panic!("unscripted docker call: {other:?}"),
        }
    }

    fn run_with_stdin(
        &self,
        program: &str,
        _args: &[OsString],
        _stdin: &str,
    ) -> Result<CommandOutput> {
        panic!("unexpected stdin invocation of {program}");
    }

    fn spawn_detached(&self, program: &str, _args: &[OsString]) -> Result<u32> {
        panic!("unexpected detached spawn of {program}");
    }
}
