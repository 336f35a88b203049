//! Local Docker backend.
//!
//! Desktops run as containers on a dedicated bridge network, with the
//! agent and VNC ports published on free local ports. Containers carry
//! labels so refresh can list exactly the resources this tool owns. No SSH
//! key material is involved; the desktop is reachable on `localhost`
//! directly (`requires_proxy = false`).

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::health::ProbePolicy;
use crate::home::Context;
use crate::instance::{DesktopInstance, InstanceStatus, ProviderKind, ProviderRef, generate_id};
use crate::provider::{
    CreateRequest, DesktopProvider, RefreshSummary, ensure_name_available, finish_delete,
    persist_running, probe_direct, reconcile, resolve_name,
};
use crate::runner::{CommandRunner, ProcessRunner, os_args, require_success};
use crate::util::find_open_port;

const DOCKER: &str = "docker";
const NETWORK: &str = "vdesk";
const DEFAULT_IMAGE: &str = "vdesk/desktop:latest";
const PROVISIONER_LABEL: &str = "vdesk.provisioner=vdesk";
const NAME_LABEL: &str = "vdesk.name";

const CONTAINER_AGENTD: u16 = 8000;
const CONTAINER_VNC: u16 = 3000;
const CONTAINER_VNC_HTTPS: u16 = 3001;

const RUN_WAIT_ATTEMPTS: u32 = 10;
const RUN_WAIT_DELAY: Duration = Duration::from_secs(1);

/// Host-side ports the container's fixed ports are published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DockerPorts {
    pub agentd: u16,
    pub vnc: u16,
    pub vnc_https: u16,
}

impl DockerPorts {
    #[must_use]
    pub fn pick() -> Option<Self> {
        Some(Self {
            agentd: find_open_port(8000, 9000)?,
            vnc: find_open_port(3000, 4000)?,
            vnc_https: find_open_port(3100, 4100)?,
        })
    }
}

pub struct DockerProvider<R: CommandRunner = ProcessRunner> {
    ctx: Context,
    runner: R,
    policy: ProbePolicy,
    ports: Option<DockerPorts>,
}

impl DockerProvider<ProcessRunner> {
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        Self::with_runner(ctx, ProcessRunner)
    }

    /// Reconstruct a provider from stored connection configuration.
    ///
    /// # Errors
    ///
    /// Infallible today; `Result` keeps the constructor uniform across
    /// backends.
    pub fn from_data(ctx: Context, _provider: &ProviderRef) -> Result<Self> {
        Ok(Self::new(ctx))
    }
}

impl<R: CommandRunner> DockerProvider<R> {
    #[must_use]
    pub fn with_runner(ctx: Context, runner: R) -> Self {
        Self {
            ctx,
            runner,
            policy: ProbePolicy::default(),
            ports: None,
        }
    }

    #[must_use]
    pub fn with_probe_policy(mut self, policy: ProbePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Pin the published ports instead of picking free ones.
    #[must_use]
    pub fn with_ports(mut self, ports: DockerPorts) -> Self {
        self.ports = Some(ports);
        self
    }

    fn provision_err(&self, name: &str, reason: String) -> Error {
        Error::ProvisionFailed {
            name: name.to_string(),
            provider: self.kind(),
            reason,
        }
    }

    fn ensure_network(&self) -> Result<()> {
        let inspect = self
            .runner
            .run(DOCKER, &os_args(&["network", "inspect", NETWORK]))?;
        if inspect.is_success() {
            return Ok(());
        }
        let created = self
            .runner
            .run(DOCKER, &os_args(&["network", "create", NETWORK]))?;
        require_success(DOCKER, created).map(|_| ())
    }

    fn container_running(&self, name: &str) -> Result<bool> {
        let output = self.runner.run(
            DOCKER,
            &os_args(&["inspect", "-f", "{{.State.Running}}", name]),
        )?;
        Ok(output.is_success() && output.stdout.trim() == "true")
    }

    fn remove_container(&self, name: &str) -> Result<()> {
        let output = self.runner.run(DOCKER, &os_args(&["rm", "-f", name]))?;
        require_success(DOCKER, output).map(|_| ())
    }
}

/// One `docker ps --format '{{json .}}'` line, reduced to what refresh needs.
#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "State")]
    state: String,
}

fn map_state(state: &str) -> InstanceStatus {
    match state {
        "running" => InstanceStatus::Running,
        "created" | "restarting" => InstanceStatus::Creating,
        "paused" | "exited" => InstanceStatus::Stopped,
        _ => InstanceStatus::Error,
    }
}

impl<R: CommandRunner> DesktopProvider for DockerProvider<R> {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Docker
    }

    fn context(&self) -> &Context {
        &self.ctx
    }

    fn create(&self, req: CreateRequest) -> Result<DesktopInstance> {
        if req.reserve_ip {
            return Err(Error::NotSupported {
                op: "reserve_ip",
                provider: ProviderKind::Docker,
            });
        }
        if req.ssh_key_pair.is_some() {
            return Err(Error::NotSupported {
                op: "ssh_key_pair",
                provider: ProviderKind::Docker,
            });
        }
        let name = resolve_name(&req)?;
        ensure_name_available(&self.ctx, self.kind(), &name, req.owner_id.as_deref())?;

        self.ensure_network()
            .map_err(|e| self.provision_err(&name, e.to_string()))?;
        let ports = match self.ports {
            Some(ports) => ports,
            None => DockerPorts::pick().ok_or_else(|| {
                self.provision_err(&name, "no free local ports to publish".to_string())
            })?,
        };
        let image = req.image.clone().unwrap_or_else(|| DEFAULT_IMAGE.to_string());

        let agentd_map = format!("{}:{CONTAINER_AGENTD}", ports.agentd);
        let vnc_map = format!("{}:{CONTAINER_VNC}", ports.vnc);
        let vnc_https_map = format!("{}:{CONTAINER_VNC_HTTPS}", ports.vnc_https);
        let name_label = format!("{NAME_LABEL}={name}");
        let mut args: Vec<&str> = vec![
            "run", "-d", "--name", &name, "--network", NETWORK, "--label", PROVISIONER_LABEL,
            "--label", &name_label, "-p", &agentd_map, "-p", &vnc_map, "-p", &vnc_https_map,
        ];
        let tag_labels: Vec<String> = req.tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
        for label in &tag_labels {
            args.push("--label");
            args.push(label);
        }
        args.push(&image);
        let output = self.runner.run(DOCKER, &os_args(&args))?;
        require_success(DOCKER, output).map_err(|e| self.provision_err(&name, e.to_string()))?;

        let mut running = false;
        for _ in 0..RUN_WAIT_ATTEMPTS {
            if self.container_running(&name)? {
                running = true;
                break;
            }
            std::thread::sleep(RUN_WAIT_DELAY);
        }
        if !running {
            let _ = self.remove_container(&name);
            return Err(self.provision_err(&name, "container never entered running state".to_string()));
        }

        let base_url = format!("http://localhost:{}", ports.agentd);
        if let Err(e) = probe_direct(&name, self.kind(), self.policy, &base_url) {
            // Keep no half-started desktop around.
            let _ = self.remove_container(&name);
            return Err(e);
        }

        let instance = DesktopInstance {
            id: req.id.clone().unwrap_or_else(generate_id),
            name: name.clone(),
            owner_id: req.owner_id.clone(),
            addr: "localhost".to_string(),
            status: InstanceStatus::Creating,
            created: chrono::Utc::now(),
            cpu: req.cpu,
            memory_gb: req.memory_gb,
            disk: req.disk.clone(),
            image: Some(image),
            provider: self.to_data(),
            reserved_ip: false,
            requires_proxy: false,
            ssh_port: crate::instance::DEFAULT_SSH_PORT,
            agentd_port: ports.agentd,
            vnc_port: Some(ports.vnc),
            vnc_port_https: Some(ports.vnc_https),
            basic_auth_user: None,
            basic_auth_password: None,
            key_pair_name: None,
            resource_name: Some(name),
            namespace: None,
            ttl: req.ttl,
            metadata: req.metadata,
        };
        persist_running(&self.ctx, instance)
    }

    fn delete(&self, name: &str, owner_id: Option<&str>, force: bool) -> Result<()> {
        let instance = self.get(name, owner_id)?;
        let container = instance.resource_name.as_deref().unwrap_or(&instance.name);
        let outcome = self.remove_container(container);
        crate::provider::deprovision_guard(force, name, outcome)?;
        finish_delete(&self.ctx, &instance)
    }

    fn refresh(&self) -> Result<RefreshSummary> {
        let output = self.runner.run(
            DOCKER,
            &os_args(&[
                "ps", "-a", "--filter", &format!("label={PROVISIONER_LABEL}"), "--format",
                "{{json .}}",
            ]),
        )?;
        let output = require_success(DOCKER, output)?;
        let mut live = Vec::new();
        for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<PsLine>(line) {
                Ok(ps) => live.push(reconcile::LiveResource {
                    resource_name: ps.names,
                    addr: "localhost".to_string(),
                    status: map_state(&ps.state),
                }),
                Err(e) => tracing::warn!(error = %e, "unparseable container listing line"),
            }
        }
        reconcile::run(&self.ctx.instances(), self.kind(), &live)
    }

    fn to_data(&self) -> ProviderRef {
        ProviderRef::bare(ProviderKind::Docker)
    }
}
