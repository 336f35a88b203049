//! The provider abstraction: one lifecycle contract over five backends.
//!
//! A provider owns every backend-specific step (sizing, boot, readiness,
//! teardown) behind the same operations with the same error behavior, so
//! callers can request a disposable desktop without caring which backend
//! fulfills it. `get`/`list` answer from the local record store only;
//! `refresh` is the one operation that consults backend truth.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::health::{ProbePolicy, check_health, wait_until_ready};
use crate::home::Context;
use crate::instance::{
    DesktopInstance, InstanceStatus, ProviderKind, ProviderRef, generate_instance_name,
    validate_instance_name,
};
use crate::keys::SshKeyPair;
use crate::tunnel::{TunnelSpec, ensure_tunnel};
use crate::util::find_open_port;

pub mod docker;
pub mod hetzner;
pub mod kube;
pub mod qemu;
pub mod reconcile;
pub mod scaleway;

pub use reconcile::RefreshSummary;

/// Default shape of a requested desktop.
pub const DEFAULT_CPU: u16 = 2;
pub const DEFAULT_MEMORY_GB: u32 = 4;
pub const DEFAULT_DISK: &str = "30gb";

/// Remote account the control agent runs under; also the tunnel login user.
pub const AGENT_USER: &str = "agent";

/// Local port range probed when a transient tunnel needs an endpoint.
const TUNNEL_PORT_RANGE: (u16, u16) = (8000, 9000);

/// Everything `create` accepts. Unset fields fall back to provider
/// defaults; an unset `name` gets a generated one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub name: Option<String>,
    pub image: Option<String>,
    pub cpu: u16,
    pub memory_gb: u32,
    pub disk: String,
    /// Labels applied to the backend resource where the backend has them.
    pub tags: BTreeMap<String, String>,
    pub reserve_ip: bool,
    /// Name of an existing key pair to use instead of generating one.
    pub ssh_key_pair: Option<String>,
    pub owner_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Caller-chosen record id; generated when unset.
    pub id: Option<String>,
    /// Advisory lifetime in seconds, recorded on the instance.
    pub ttl: Option<u64>,
}

impl Default for CreateRequest {
    fn default() -> Self {
        Self {
            name: None,
            image: None,
            cpu: DEFAULT_CPU,
            memory_gb: DEFAULT_MEMORY_GB,
            disk: DEFAULT_DISK.to_string(),
            tags: BTreeMap::new(),
            reserve_ip: false,
            ssh_key_pair: None,
            owner_id: None,
            metadata: BTreeMap::new(),
            id: None,
            ttl: None,
        }
    }
}

impl CreateRequest {
    /// Request with an explicit name and defaults for everything else.
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }
}

/// One backend behind the uniform lifecycle contract.
pub trait DesktopProvider {
    /// The wire tag of this backend.
    fn kind(&self) -> ProviderKind;

    /// The context this provider was built over.
    fn context(&self) -> &Context;

    /// Provision a desktop, block until its control API answers healthy,
    /// persist and return the record.
    ///
    /// # Errors
    ///
    /// `NameConflict` before any remote call if the name is taken,
    /// `ProvisionFailed` on backend rejection, `ReadinessTimeout` when the
    /// health probe exhausts its attempts (no record is persisted then).
    fn create(&self, req: CreateRequest) -> Result<DesktopInstance>;

    /// Deprovision remotely, reap auto-generated key pairs, remove the
    /// local record. With `force`, remote failures downgrade to a warning
    /// so the record is removed regardless.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown name; remote failures unless `force`.
    fn delete(&self, name: &str, owner_id: Option<&str>, force: bool) -> Result<()>;

    /// Power the remote machine on and wait for readiness again.
    ///
    /// # Errors
    ///
    /// `NotSupported` on backends whose instances have no stopped state.
    fn start(&self, name: &str, owner_id: Option<&str>) -> Result<()> {
        let _ = (name, owner_id);
        Err(Error::NotSupported {
            op: "start",
            provider: self.kind(),
        })
    }

    /// Power the remote machine off, keeping the record.
    ///
    /// # Errors
    ///
    /// `NotSupported` on backends whose instances have no stopped state.
    fn stop(&self, name: &str, owner_id: Option<&str>) -> Result<()> {
        let _ = (name, owner_id);
        Err(Error::NotSupported {
            op: "stop",
            provider: self.kind(),
        })
    }

    /// Look up one instance in the local store. Never contacts the backend.
    ///
    /// # Errors
    ///
    /// `NotFound` when no record of this provider's kind matches.
    fn get(&self, name: &str, owner_id: Option<&str>) -> Result<DesktopInstance> {
        self.context()
            .instances()
            .find_named(name, owner_id)?
            .filter(|i| i.provider.kind == self.kind())
            .ok_or_else(|| Error::instance_not_found(name))
    }

    /// Every stored instance of this provider's kind. Never contacts the
    /// backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn list(&self) -> Result<Vec<DesktopInstance>> {
        Ok(self
            .context()
            .instances()
            .load()?
            .into_iter()
            .filter(|i| i.provider.kind == self.kind())
            .collect())
    }

    /// Reconcile stored records against live backend truth (see
    /// [`reconcile`]). Backend wins; records for vanished resources are
    /// removed, drifted `addr`/`status` overwritten unless the address is
    /// reserved.
    ///
    /// # Errors
    ///
    /// Only a failure to list the backend aborts the pass.
    fn refresh(&self) -> Result<RefreshSummary>;

    /// Serialize this provider's connection configuration.
    fn to_data(&self) -> ProviderRef;
}

impl std::fmt::Debug for dyn DesktopProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DesktopProvider")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

/// Build the provider a stored [`ProviderRef`] points at.
///
/// # Errors
///
/// Returns [`Error::Credentials`] when a cloud backend's token is missing
/// from the environment, or an error if `args` cannot be decoded.
pub fn provider_from_ref(ctx: &Context, provider: &ProviderRef) -> Result<Box<dyn DesktopProvider>> {
    match provider.kind {
        ProviderKind::Scaleway => Ok(Box::new(scaleway::ScalewayProvider::from_data(
            ctx.clone(),
            provider,
        )?)),
        ProviderKind::Hetzner => Ok(Box::new(hetzner::HetznerProvider::from_data(
            ctx.clone(),
            provider,
        )?)),
        ProviderKind::Qemu => Ok(Box::new(qemu::QemuProvider::from_data(ctx.clone(), provider)?)),
        ProviderKind::Docker => Ok(Box::new(docker::DockerProvider::from_data(
            ctx.clone(),
            provider,
        )?)),
        ProviderKind::Kube => Ok(Box::new(kube::KubeProvider::from_data(ctx.clone(), provider)?)),
    }
}

// ── Shared create/delete plumbing ────────────────────────────────────────────

/// Validate the requested name or generate one.
pub(crate) fn resolve_name(req: &CreateRequest) -> Result<String> {
    match &req.name {
        Some(name) => {
            validate_instance_name(name)?;
            Ok(name.clone())
        }
        None => Ok(generate_instance_name()),
    }
}

/// Fail with [`Error::NameConflict`] when `name` is already stored for this
/// owner. Runs before any remote call.
pub(crate) fn ensure_name_available(
    ctx: &Context,
    kind: ProviderKind,
    name: &str,
    owner_id: Option<&str>,
) -> Result<()> {
    if ctx.instances().find_named(name, owner_id)?.is_some() {
        return Err(Error::NameConflict {
            name: name.to_string(),
            provider: kind,
        });
    }
    Ok(())
}

/// The key pair `create` should install: a caller-supplied one must already
/// exist; otherwise a fresh pair is generated and tagged for the instance.
pub(crate) fn resolve_key_pair(
    ctx: &Context,
    req: &CreateRequest,
    instance_name: &str,
) -> Result<SshKeyPair> {
    match req.ssh_key_pair.as_deref() {
        Some(key_name) => ctx.keys().get(key_name, req.owner_id.as_deref()),
        None => ctx
            .keys()
            .generate_for_instance(instance_name, req.owner_id.as_deref()),
    }
}

/// Cloud-init document creating the agent login user with the generated
/// public key and passwordless sudo. The desktop image itself ships the
/// control agent; first boot only has to make the machine reachable.
pub(crate) fn cloud_init_user_data(public_key: &str) -> String {
    let lines = [
        "#cloud-config".to_string(),
        "users:".to_string(),
        format!("  - name: {AGENT_USER}"),
        "    ssh_authorized_keys:".to_string(),
        format!("      - {public_key}"),
        "    sudo: ['ALL=(ALL) NOPASSWD:ALL']".to_string(),
        "    groups: ['sudo']".to_string(),
        "    shell: /bin/bash".to_string(),
    ];
    let mut doc = lines.join("\n");
    doc.push('\n');
    doc
}

/// Parse a disk size string like `"30gb"` or `"1tb"` into whole gigabytes.
fn parse_disk_gb(disk: &str) -> std::result::Result<u32, String> {
    let lower = disk.trim().to_ascii_lowercase();
    let (digits, scale) = if let Some(d) = lower.strip_suffix("gb") {
        (d, 1)
    } else if let Some(d) = lower.strip_suffix("tb") {
        (d, 1000)
    } else {
        return Err(format!("unrecognized disk size '{disk}'"));
    };
    digits
        .trim()
        .parse::<u32>()
        .ok()
        .and_then(|n| n.checked_mul(scale))
        .ok_or_else(|| format!("unrecognized disk size '{disk}'"))
}

/// Requested disk size in gigabytes, or a provisioning failure when the
/// request carries a malformed size.
pub(crate) fn resolve_disk_gb(req: &CreateRequest, name: &str, kind: ProviderKind) -> Result<u32> {
    parse_disk_gb(&req.disk).map_err(|reason| Error::ProvisionFailed {
        name: name.to_string(),
        provider: kind,
        reason,
    })
}

/// Readiness wait over a transient SSH tunnel per attempt.
///
/// Each attempt picks a free local port, opens a tunnel to the instance's
/// control port, issues one health call, and tears the tunnel down whatever
/// the outcome.
pub(crate) fn probe_via_tunnel(
    name: &str,
    kind: ProviderKind,
    policy: ProbePolicy,
    host: &str,
    ssh_port: u16,
    agentd_port: u16,
    private_key: Option<&str>,
) -> Result<()> {
    wait_until_ready(name, kind, policy, || {
        let Some(local_port) = find_open_port(TUNNEL_PORT_RANGE.0, TUNNEL_PORT_RANGE.1) else {
            tracing::warn!(name, "no free local port for probe tunnel");
            return false;
        };
        let spec = TunnelSpec::new(local_port, agentd_port, ssh_port, AGENT_USER, host);
        match ensure_tunnel(&spec, private_key) {
            Ok(tunnel) => {
                let healthy = check_health(&format!("http://localhost:{local_port}"));
                tunnel.close();
                healthy
            }
            Err(e) => {
                tracing::debug!(name, error = %e, "probe tunnel attempt failed");
                false
            }
        }
    })
}

/// Direct readiness wait for backends whose control port is locally
/// reachable.
pub(crate) fn probe_direct(
    name: &str,
    kind: ProviderKind,
    policy: ProbePolicy,
    base_url: &str,
) -> Result<()> {
    wait_until_ready(name, kind, policy, || check_health(base_url))
}

/// Apply `force` semantics to a remote deprovisioning outcome.
pub(crate) fn deprovision_guard(force: bool, name: &str, outcome: Result<()>) -> Result<()> {
    match outcome {
        Ok(()) => Ok(()),
        Err(e) if force => {
            tracing::warn!(name, error = %e, "remote deprovision failed; removing local record anyway");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Shared tail of every `delete`: reap generated key pairs, drop the record.
pub(crate) fn finish_delete(ctx: &Context, instance: &DesktopInstance) -> Result<()> {
    ctx.keys().delete_generated_for(&instance.name)?;
    ctx.instances().remove(&instance.id)?;
    tracing::info!(name = %instance.name, provider = %instance.provider.kind, "instance deleted");
    Ok(())
}

/// Persist the freshly provisioned, probed instance as `running`.
pub(crate) fn persist_running(ctx: &Context, mut instance: DesktopInstance) -> Result<DesktopInstance> {
    instance.status = InstanceStatus::Running;
    ctx.instances().upsert(&instance)?;
    tracing::info!(name = %instance.name, addr = %instance.addr, provider = %instance.provider.kind, "instance ready");
    Ok(instance)
}
