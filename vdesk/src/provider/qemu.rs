//! Local QEMU backend.
//!
//! Each desktop is one `qemu-system-x86_64` process booted from a qcow2
//! overlay over a shared base image, configured on first boot through a
//! cloud-init seed ISO. Guest ports are forwarded to free local ports, so
//! the desktop is reachable on `localhost` without a tunnel
//! (`requires_proxy = false`). The VM process is tracked by pid.

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::health::ProbePolicy;
use crate::home::Context;
use crate::instance::{DesktopInstance, InstanceStatus, ProviderKind, ProviderRef, generate_id};
use crate::provider::{
    CreateRequest, DesktopProvider, RefreshSummary, cloud_init_user_data, deprovision_guard,
    ensure_name_available, finish_delete, persist_running, probe_direct, reconcile,
    resolve_disk_gb, resolve_key_pair, resolve_name,
};
use crate::runner::{CommandRunner, ProcessRunner, os_args, require_success};
use crate::tunnel::{process_alive, terminate_pid};
use crate::util::find_open_port;

const QEMU_BIN: &str = "qemu-system-x86_64";
const QEMU_IMG: &str = "qemu-img";
const GENISOIMAGE: &str = "genisoimage";

const DEFAULT_BASE_IMAGE: &str = "vdesk-base.qcow2";
const PID_KEY: &str = "pid";

const GUEST_SSH: u16 = 22;
const GUEST_AGENTD: u16 = 8000;
const GUEST_VNC: u16 = 6080;

/// Host-side ports the guest's fixed ports are forwarded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QemuPorts {
    pub ssh: u16,
    pub agentd: u16,
    pub vnc: u16,
}

impl QemuPorts {
    /// Find a free host port for each forward.
    #[must_use]
    pub fn pick() -> Option<Self> {
        Some(Self {
            ssh: find_open_port(2222, 2322)?,
            agentd: find_open_port(8000, 9000)?,
            vnc: find_open_port(6080, 6180)?,
        })
    }
}

pub struct QemuProvider<R: CommandRunner = ProcessRunner> {
    ctx: Context,
    runner: R,
    policy: ProbePolicy,
    ports: Option<QemuPorts>,
}

impl QemuProvider<ProcessRunner> {
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

impl<R: CommandRunner> QemuProvider<R> {
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

    /// Pin the host-side forwards instead of picking free ports.
    #[must_use]
    pub fn with_ports(mut self, ports: QemuPorts) -> Self {
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

    fn base_image(&self, req: &CreateRequest) -> PathBuf {
        match &req.image {
            Some(path) => PathBuf::from(path),
            None => self.ctx.home().images_dir().join(DEFAULT_BASE_IMAGE),
        }
    }
}

fn instance_pid(instance: &DesktopInstance) -> Option<u32> {
    instance.metadata.get(PID_KEY).and_then(|p| p.parse().ok())
}

impl<R: CommandRunner> DesktopProvider for QemuProvider<R> {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Qemu
    }

    fn context(&self) -> &Context {
        &self.ctx
    }

    fn create(&self, req: CreateRequest) -> Result<DesktopInstance> {
        if req.reserve_ip {
            return Err(Error::NotSupported {
                op: "reserve_ip",
                provider: ProviderKind::Qemu,
            });
        }
        let name = resolve_name(&req)?;
        ensure_name_available(&self.ctx, self.kind(), &name, req.owner_id.as_deref())?;

        let base = self.base_image(&req);
        if !base.exists() {
            return Err(
                self.provision_err(&name, format!("base image '{}' not found", base.display()))
            );
        }
        let disk_gb = resolve_disk_gb(&req, &name, self.kind())?;
        let pair = resolve_key_pair(&self.ctx, &req, &name)?;

        let vm_dir = self.ctx.home().vm_dir(&name);
        std::fs::create_dir_all(&vm_dir).map_err(|e| Error::store(&vm_dir, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&vm_dir, std::fs::Permissions::from_mode(0o700))
                .map_err(|e| Error::store(&vm_dir, e))?;
        }

        // Copy-on-write overlay so the base image is never touched.
        let base_s = base.display().to_string();
        let overlay = vm_dir.join("disk.qcow2");
        let overlay_s = overlay.display().to_string();
        let size = format!("{disk_gb}G");
        let output = self.runner.run(
            QEMU_IMG,
            &os_args(&[
                "create", "-f", "qcow2", "-b", &base_s, "-F", "qcow2", &overlay_s, &size,
            ]),
        )?;
        require_success(QEMU_IMG, output).map_err(|e| self.provision_err(&name, e.to_string()))?;

        let user_data = vm_dir.join("user-data");
        std::fs::write(&user_data, cloud_init_user_data(&pair.public_key))
            .map_err(|e| Error::store(&user_data, e))?;
        let meta_data = vm_dir.join("meta-data");
        std::fs::write(&meta_data, format!("instance-id: {name}\nlocal-hostname: {name}\n"))
            .map_err(|e| Error::store(&meta_data, e))?;

        let seed = vm_dir.join("cidata.iso");
        let seed_s = seed.display().to_string();
        let user_data_s = user_data.display().to_string();
        let meta_data_s = meta_data.display().to_string();
        let output = self.runner.run(
            GENISOIMAGE,
            &os_args(&[
                "-output", &seed_s, "-volid", "cidata", "-joliet", "-rock", &user_data_s,
                &meta_data_s,
            ]),
        )?;
        require_success(GENISOIMAGE, output)
            .map_err(|e| self.provision_err(&name, e.to_string()))?;

        let ports = match self.ports {
            Some(ports) => ports,
            None => QemuPorts::pick().ok_or_else(|| {
                self.provision_err(
                    &name,
                    "no free local ports for the ssh/agentd/vnc forwards".to_string(),
                )
            })?,
        };

        let memory = format!("{}M", u64::from(req.memory_gb) * 1024);
        let smp = req.cpu.to_string();
        let drive = format!("file={overlay_s},format=qcow2,if=virtio");
        let netdev = format!(
            "user,id=net0,hostfwd=tcp::{}-:{GUEST_SSH},hostfwd=tcp::{}-:{GUEST_AGENTD},hostfwd=tcp::{}-:{GUEST_VNC}",
            ports.ssh, ports.agentd, ports.vnc
        );
        let pid = self
            .runner
            .spawn_detached(
                QEMU_BIN,
                &os_args(&[
                    "-name", &name, "-machine", "accel=kvm:tcg", "-m", &memory, "-smp", &smp,
                    "-drive", &drive, "-cdrom", &seed_s, "-netdev", &netdev, "-device",
                    "virtio-net-pci,netdev=net0", "-display", "none",
                ]),
            )
            .map_err(|e| self.provision_err(&name, e.to_string()))?;
        tracing::debug!(name, pid, ssh = ports.ssh, agentd = ports.agentd, "vm booted");

        let base_url = format!("http://localhost:{}", ports.agentd);
        if let Err(e) = probe_direct(&name, self.kind(), self.policy, &base_url) {
            // The VM never became ready; stop it and scrap its directory.
            terminate_pid(pid);
            let _ = std::fs::remove_dir_all(&vm_dir);
            return Err(e);
        }

        let mut metadata = req.metadata.clone();
        metadata.insert(PID_KEY.to_string(), pid.to_string());
        let instance = DesktopInstance {
            id: req.id.clone().unwrap_or_else(generate_id),
            name,
            owner_id: req.owner_id.clone(),
            addr: "localhost".to_string(),
            status: InstanceStatus::Creating,
            created: chrono::Utc::now(),
            cpu: req.cpu,
            memory_gb: req.memory_gb,
            disk: req.disk.clone(),
            image: Some(base_s),
            provider: self.to_data(),
            reserved_ip: false,
            requires_proxy: false,
            ssh_port: ports.ssh,
            agentd_port: ports.agentd,
            vnc_port: Some(ports.vnc),
            vnc_port_https: None,
            basic_auth_user: None,
            basic_auth_password: None,
            key_pair_name: Some(pair.name),
            resource_name: None,
            namespace: None,
            ttl: req.ttl,
            metadata,
        };
        persist_running(&self.ctx, instance)
    }

    fn delete(&self, name: &str, owner_id: Option<&str>, force: bool) -> Result<()> {
        let instance = self.get(name, owner_id)?;
        if let Some(pid) = instance_pid(&instance) {
            terminate_pid(pid);
        }
        let vm_dir = self.ctx.home().vm_dir(&instance.name);
        let outcome = match std::fs::remove_dir_all(&vm_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::store(&vm_dir, e)),
        };
        deprovision_guard(force, name, outcome)?;
        finish_delete(&self.ctx, &instance)
    }

    fn refresh(&self) -> Result<RefreshSummary> {
        // The process table is the backend truth: a record whose pid is gone
        // has no VM behind it any more.
        let live: Vec<reconcile::LiveResource> = self
            .list()?
            .into_iter()
            .filter_map(|record| {
                let pid = instance_pid(&record)?;
                process_alive(pid).then(|| reconcile::LiveResource {
                    resource_name: record
                        .resource_name
                        .clone()
                        .unwrap_or_else(|| record.name.clone()),
                    addr: record.addr.clone(),
                    status: InstanceStatus::Running,
                })
            })
            .collect();
        reconcile::run(&self.ctx.instances(), self.kind(), &live)
    }

    fn to_data(&self) -> ProviderRef {
        ProviderRef::bare(ProviderKind::Qemu)
    }
}
