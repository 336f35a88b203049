//! Scaleway Instances backend.
//!
//! Servers are provisioned through the zonal Instances REST API with an
//! account-level SSH key and a default inbound-SSH security group. The
//! control agent is installed by the image; cloud-init only has to create
//! the login user and authorize the generated key. Instances are only
//! reachable through the tunnel subsystem (`requires_proxy = true`).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Error, Result};
use crate::health::ProbePolicy;
use crate::home::Context;
use crate::instance::{
    DEFAULT_AGENTD_PORT, DEFAULT_SSH_PORT, DesktopInstance, InstanceStatus, ProviderKind,
    ProviderRef, generate_id,
};
use crate::provider::{
    CreateRequest, DesktopProvider, RefreshSummary, cloud_init_user_data, deprovision_guard,
    ensure_name_available, finish_delete, persist_running, probe_via_tunnel, reconcile,
    resolve_disk_gb, resolve_key_pair, resolve_name,
};

const API_BASE: &str = "https://api.scaleway.com/instance/v1/zones";
const IAM_BASE: &str = "https://api.scaleway.com/iam/v1alpha1";
const DEFAULT_ZONE: &str = "fr-par-1";
const DEFAULT_IMAGE: &str = "ubuntu_jammy";
const SECURITY_GROUP: &str = "vdesk-default";
const PROVISIONER_TAG: &str = "provisioner=vdesk";

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const POLL_ATTEMPTS: u32 = 60;

/// Connection configuration carried in `ProviderRef.args`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalewayArgs {
    #[serde(default = "default_zone")]
    pub zone: String,
    pub project_id: String,
}

fn default_zone() -> String {
    DEFAULT_ZONE.to_string()
}

// ── API surface ──────────────────────────────────────────────────────────────

/// One Scaleway server, reduced to the fields the lifecycle needs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub public_ip: Option<PublicIp>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PublicIp {
    pub id: String,
    pub address: String,
}

/// What `create` sends to the Instances API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub commercial_type: String,
    pub image: String,
    pub project: String,
    pub security_group: String,
    pub tags: Vec<String>,
    pub volumes: serde_json::Value,
}

/// The slice of the Scaleway API the provider consumes. Tests substitute a
/// canned implementation.
pub trait ScalewayApi {
    /// # Errors
    /// Propagates transport and API failures.
    fn create_server(&self, req: &CreateServerRequest) -> Result<Server>;
    /// # Errors
    /// Propagates transport and API failures.
    fn set_cloud_init(&self, server_id: &str, user_data: &str) -> Result<()>;
    /// # Errors
    /// Propagates transport and API failures.
    fn server_action(&self, server_id: &str, action: &str) -> Result<()>;
    /// # Errors
    /// Propagates transport and API failures.
    fn get_server(&self, server_id: &str) -> Result<Server>;
    /// # Errors
    /// Propagates transport and API failures.
    fn list_servers(&self) -> Result<Vec<Server>>;
    /// Register `public_key` under `name` unless it already exists.
    ///
    /// # Errors
    /// Propagates transport and API failures.
    fn ensure_ssh_key(&self, name: &str, public_key: &str) -> Result<()>;
    /// Ensure the inbound-SSH security group exists; returns its id.
    ///
    /// # Errors
    /// Propagates transport and API failures.
    fn ensure_security_group(&self) -> Result<String>;
    /// Allocate a flexible IP bound to `server_id`; returns its address.
    ///
    /// # Errors
    /// Propagates transport and API failures.
    fn reserve_ip(&self, server_id: &str) -> Result<String>;
}

/// ureq-backed client against the real API.
pub struct ScalewayHttp {
    base: String,
    secret_key: String,
    project_id: String,
}

impl ScalewayHttp {
    #[must_use]
    pub fn new(zone: &str, project_id: &str, secret_key: &str) -> Self {
        Self {
            base: format!("{API_BASE}/{zone}"),
            secret_key: secret_key.to_string(),
            project_id: project_id.to_string(),
        }
    }

    fn get(&self, url: &str, context: &str) -> Result<serde_json::Value> {
        let resp = ureq::get(url)
            .set("X-Auth-Token", &self.secret_key)
            .call()
            .map_err(|e| http_error(context, e))?;
        resp.into_json().map_err(|e| Error::http(context, e))
    }

    fn post(&self, url: &str, body: serde_json::Value, context: &str) -> Result<serde_json::Value> {
        let resp = ureq::post(url)
            .set("X-Auth-Token", &self.secret_key)
            .send_json(body)
            .map_err(|e| http_error(context, e))?;
        resp.into_json().map_err(|e| Error::http(context, e))
    }
}

fn http_error(context: &str, e: ureq::Error) -> Error {
    match e {
        ureq::Error::Status(code, resp) => {
            let body = resp.into_string().unwrap_or_default();
            Error::http(context, format!("HTTP {code}: {}", body.trim()))
        }
        other => Error::http(context, other),
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value, context: &str) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::http(context, e))
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: Server,
}

#[derive(Deserialize)]
struct ServerListEnvelope {
    servers: Vec<Server>,
}

impl ScalewayApi for ScalewayHttp {
    fn create_server(&self, req: &CreateServerRequest) -> Result<Server> {
        let body = serde_json::to_value(req).map_err(|e| Error::http("encoding server", e))?;
        let value = self.post(&format!("{}/servers", self.base), body, "creating server")?;
        decode::<ServerEnvelope>(value, "creating server").map(|e| e.server)
    }

    fn set_cloud_init(&self, server_id: &str, user_data: &str) -> Result<()> {
        let url = format!("{}/servers/{server_id}/user_data/cloud-init", self.base);
        ureq::request("PATCH", &url)
            .set("X-Auth-Token", &self.secret_key)
            .set("Content-Type", "text/plain")
            .send_string(user_data)
            .map_err(|e| http_error("setting cloud-init", e))?;
        Ok(())
    }

    fn server_action(&self, server_id: &str, action: &str) -> Result<()> {
        self.post(
            &format!("{}/servers/{server_id}/action", self.base),
            json!({ "action": action }),
            action,
        )?;
        Ok(())
    }

    fn get_server(&self, server_id: &str) -> Result<Server> {
        let value = self.get(
            &format!("{}/servers/{server_id}", self.base),
            "fetching server",
        )?;
        decode::<ServerEnvelope>(value, "fetching server").map(|e| e.server)
    }

    fn list_servers(&self) -> Result<Vec<Server>> {
        let url = format!("{}/servers?project={}", self.base, self.project_id);
        let value = self.get(&url, "listing servers")?;
        decode::<ServerListEnvelope>(value, "listing servers").map(|e| e.servers)
    }

    fn ensure_ssh_key(&self, name: &str, public_key: &str) -> Result<()> {
        let listed = self.get(
            &format!("{IAM_BASE}/ssh-keys?name={name}&project_id={}", self.project_id),
            "listing ssh keys",
        )?;
        let exists = listed
            .get("ssh_keys")
            .and_then(serde_json::Value::as_array)
            .is_some_and(|keys| !keys.is_empty());
        if exists {
            return Ok(());
        }
        self.post(
            &format!("{IAM_BASE}/ssh-keys"),
            json!({ "name": name, "public_key": public_key, "project_id": self.project_id }),
            "registering ssh key",
        )?;
        Ok(())
    }

    fn ensure_security_group(&self) -> Result<String> {
        let listed = self.get(
            &format!("{}/security_groups?name={SECURITY_GROUP}", self.base),
            "listing security groups",
        )?;
        if let Some(id) = listed
            .get("security_groups")
            .and_then(serde_json::Value::as_array)
            .and_then(|groups| groups.first())
            .and_then(|g| g.get("id"))
            .and_then(serde_json::Value::as_str)
        {
            return Ok(id.to_string());
        }

        let created = self.post(
            &format!("{}/security_groups", self.base),
            json!({
                "name": SECURITY_GROUP,
                "description": "vdesk default desktop sg",
                "project": self.project_id,
                "stateful": true,
                "inbound_default_policy": "drop",
                "outbound_default_policy": "accept",
            }),
            "creating security group",
        )?;
        let id = created
            .get("security_group")
            .and_then(|g| g.get("id"))
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| Error::http("creating security group", "no id in response"))?
            .to_string();

        self.post(
            &format!("{}/security_groups/{id}/rules", self.base),
            json!({
                "protocol": "TCP",
                "direction": "inbound",
                "action": "accept",
                "ip_range": "0.0.0.0/0",
                "dest_port_from": DEFAULT_SSH_PORT,
            }),
            "adding ssh rule",
        )?;
        Ok(id)
    }

    fn reserve_ip(&self, server_id: &str) -> Result<String> {
        let created = self.post(
            &format!("{}/ips", self.base),
            json!({ "project": self.project_id, "server": server_id }),
            "reserving ip",
        )?;
        created
            .get("ip")
            .and_then(|ip| ip.get("address"))
            .and_then(serde_json::Value::as_str)
            .map(String::from)
            .ok_or_else(|| Error::http("reserving ip", "no address in response"))
    }
}

// ── Provider ─────────────────────────────────────────────────────────────────

/// Scaleway rendition of the desktop lifecycle.
pub struct ScalewayProvider<A: ScalewayApi = ScalewayHttp> {
    ctx: Context,
    api: A,
    args: ScalewayArgs,
    policy: ProbePolicy,
}

impl ScalewayProvider<ScalewayHttp> {
    /// Reconstruct a provider from stored connection configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Credentials`] when `SCW_SECRET_KEY` (or, absent from
    /// `args`, `SCW_DEFAULT_PROJECT_ID`) is not set.
    pub fn from_data(ctx: Context, provider: &ProviderRef) -> Result<Self> {
        let mut args: ScalewayArgs = match serde_json::from_value(provider.args.clone()) {
            Ok(args) => args,
            // Older refs carry no project; fall back to the environment.
            Err(_) => ScalewayArgs {
                zone: default_zone(),
                project_id: String::new(),
            },
        };
        if args.project_id.is_empty() {
            args.project_id = std::env::var("SCW_DEFAULT_PROJECT_ID").map_err(|_| {
                Error::Credentials {
                    provider: ProviderKind::Scaleway,
                    var: "SCW_DEFAULT_PROJECT_ID",
                }
            })?;
        }
        let secret_key = std::env::var("SCW_SECRET_KEY").map_err(|_| Error::Credentials {
            provider: ProviderKind::Scaleway,
            var: "SCW_SECRET_KEY",
        })?;
        let api = ScalewayHttp::new(&args.zone, &args.project_id, &secret_key);
        Ok(Self::with_api(ctx, args, api))
    }
}

impl<A: ScalewayApi> ScalewayProvider<A> {
    /// Provider over an explicit API implementation (used in tests).
    #[must_use]
    pub fn with_api(ctx: Context, args: ScalewayArgs, api: A) -> Self {
        Self {
            ctx,
            api,
            args,
            policy: ProbePolicy::default(),
        }
    }

    #[must_use]
    pub fn with_probe_policy(mut self, policy: ProbePolicy) -> Self {
        self.policy = policy;
        self
    }

    fn provision_err(&self, name: &str, e: &Error) -> Error {
        Error::ProvisionFailed {
            name: name.to_string(),
            provider: self.kind(),
            reason: e.to_string(),
        }
    }

    /// Poll the server until it reports `target` state, bounded.
    fn wait_for_state(&self, name: &str, server_id: &str, target: &str) -> Result<Server> {
        for _ in 1..=POLL_ATTEMPTS {
            let server = self.api.get_server(server_id)?;
            if server.state == target {
                return Ok(server);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Err(Error::ProvisionFailed {
            name: name.to_string(),
            provider: ProviderKind::Scaleway,
            reason: format!("server never reached state '{target}'"),
        })
    }

    fn private_key_for(&self, instance: &DesktopInstance) -> Result<String> {
        let key_name = instance
            .key_pair_name
            .as_deref()
            .ok_or_else(|| Error::TunnelFailed {
                host: instance.addr.clone(),
                reason: "instance has no key pair".to_string(),
            })?;
        let pair = self.ctx.keys().get(key_name, instance.owner_id.as_deref())?;
        self.ctx.keys().private_key(&pair)
    }
}

fn map_state(state: &str) -> InstanceStatus {
    match state {
        "running" => InstanceStatus::Running,
        "starting" => InstanceStatus::Creating,
        "stopping" | "stopped" | "stopped in place" => InstanceStatus::Stopped,
        _ => InstanceStatus::Error,
    }
}

/// Pick a commercial type covering (cpu, memory).
#[must_use]
pub fn commercial_type(cpu: u16, memory_gb: u32) -> &'static str {
    if cpu <= 2 {
        if memory_gb <= 2 {
            "DEV1-S"
        } else if memory_gb <= 4 {
            "DEV1-M"
        } else {
            "DEV1-L"
        }
    } else if cpu <= 4 {
        if memory_gb <= 8 {
            "DEV1-L"
        } else if memory_gb <= 16 {
            "GP1-XS"
        } else {
            "GP1-S"
        }
    } else {
        "GP1-S"
    }
}

impl<A: ScalewayApi> DesktopProvider for ScalewayProvider<A> {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Scaleway
    }

    fn context(&self) -> &Context {
        &self.ctx
    }

    fn create(&self, req: CreateRequest) -> Result<DesktopInstance> {
        let name = resolve_name(&req)?;
        ensure_name_available(&self.ctx, self.kind(), &name, req.owner_id.as_deref())?;

        let pair = resolve_key_pair(&self.ctx, &req, &name)?;
        let private_key = self.ctx.keys().private_key(&pair)?;
        let image = req.image.clone().unwrap_or_else(|| DEFAULT_IMAGE.to_string());
        let disk_gb = resolve_disk_gb(&req, &name, self.kind())?;

        self.api
            .ensure_ssh_key(&pair.name, &pair.public_key)
            .map_err(|e| self.provision_err(&name, &e))?;
        let security_group = self
            .api
            .ensure_security_group()
            .map_err(|e| self.provision_err(&name, &e))?;

        let mut tags = vec![PROVISIONER_TAG.to_string(), format!("name={name}")];
        tags.extend(req.tags.iter().map(|(k, v)| format!("{k}={v}")));

        let create = CreateServerRequest {
            name: name.clone(),
            commercial_type: commercial_type(req.cpu, req.memory_gb).to_string(),
            image: image.clone(),
            project: self.args.project_id.clone(),
            security_group,
            tags,
            volumes: json!({
                "0": { "size": u64::from(disk_gb) * 1_000_000_000_u64, "volume_type": "l_ssd" }
            }),
        };
        let server = self
            .api
            .create_server(&create)
            .map_err(|e| self.provision_err(&name, &e))?;

        self.api
            .set_cloud_init(&server.id, &cloud_init_user_data(&pair.public_key))
            .and_then(|()| self.api.server_action(&server.id, "poweron"))
            .map_err(|e| self.provision_err(&name, &e))?;

        let running = self.wait_for_state(&name, &server.id, "running")?;
        let mut addr = running
            .public_ip
            .as_ref()
            .map(|ip| ip.address.clone())
            .unwrap_or_default();
        if req.reserve_ip {
            addr = self
                .api
                .reserve_ip(&server.id)
                .map_err(|e| self.provision_err(&name, &e))?;
        }
        if addr.is_empty() {
            return Err(self.provision_err(
                &name,
                &Error::http("fetching server", "server has no public address"),
            ));
        }

        probe_via_tunnel(
            &name,
            self.kind(),
            self.policy,
            &addr,
            DEFAULT_SSH_PORT,
            DEFAULT_AGENTD_PORT,
            Some(&private_key),
        )?;

        let instance = DesktopInstance {
            id: req.id.clone().unwrap_or_else(generate_id),
            name,
            owner_id: req.owner_id.clone(),
            addr,
            status: InstanceStatus::Creating,
            created: chrono::Utc::now(),
            cpu: req.cpu,
            memory_gb: req.memory_gb,
            disk: req.disk.clone(),
            image: Some(image),
            provider: self.to_data(),
            reserved_ip: req.reserve_ip,
            requires_proxy: true,
            ssh_port: DEFAULT_SSH_PORT,
            agentd_port: DEFAULT_AGENTD_PORT,
            vnc_port: None,
            vnc_port_https: None,
            basic_auth_user: None,
            basic_auth_password: None,
            key_pair_name: Some(pair.name),
            resource_name: Some(server.id),
            namespace: None,
            ttl: req.ttl,
            metadata: req.metadata,
        };
        persist_running(&self.ctx, instance)
    }

    fn delete(&self, name: &str, owner_id: Option<&str>, force: bool) -> Result<()> {
        let instance = self.get(name, owner_id)?;
        if let Some(server_id) = &instance.resource_name {
            let outcome = self.api.server_action(server_id, "terminate");
            deprovision_guard(force, name, outcome)?;
        }
        finish_delete(&self.ctx, &instance)
    }

    fn start(&self, name: &str, owner_id: Option<&str>) -> Result<()> {
        let mut instance = self.get(name, owner_id)?;
        let server_id = instance
            .resource_name
            .clone()
            .ok_or_else(|| self.provision_err(name, &Error::http("start", "no backing server")))?;
        let private_key = self.private_key_for(&instance)?;

        self.api
            .server_action(&server_id, "poweron")
            .map_err(|e| self.provision_err(name, &e))?;
        let running = self.wait_for_state(name, &server_id, "running")?;

        // A non-reserved address can change across a stop/start cycle.
        if !instance.reserved_ip {
            if let Some(ip) = &running.public_ip {
                instance.addr = ip.address.clone();
            }
        }
        probe_via_tunnel(
            name,
            self.kind(),
            self.policy,
            &instance.addr,
            instance.ssh_port,
            instance.agentd_port,
            Some(&private_key),
        )?;
        instance.status = InstanceStatus::Running;
        self.ctx.instances().upsert(&instance)?;
        Ok(())
    }

    fn stop(&self, name: &str, owner_id: Option<&str>) -> Result<()> {
        let mut instance = self.get(name, owner_id)?;
        let server_id = instance
            .resource_name
            .clone()
            .ok_or_else(|| self.provision_err(name, &Error::http("stop", "no backing server")))?;
        self.api
            .server_action(&server_id, "poweroff")
            .map_err(|e| self.provision_err(name, &e))?;
        self.wait_for_state(name, &server_id, "stopped")?;
        instance.status = InstanceStatus::Stopped;
        self.ctx.instances().upsert(&instance)?;
        Ok(())
    }

    fn refresh(&self) -> Result<RefreshSummary> {
        let live: Vec<reconcile::LiveResource> = self
            .api
            .list_servers()?
            .into_iter()
            .map(|server| reconcile::LiveResource {
                resource_name: server.id.clone(),
                addr: server
                    .public_ip
                    .as_ref()
                    .map(|ip| ip.address.clone())
                    .unwrap_or_default(),
                status: map_state(&server.state),
            })
            .collect();
        reconcile::run(&self.ctx.instances(), self.kind(), &live)
    }

    fn to_data(&self) -> ProviderRef {
        ProviderRef::new(
            ProviderKind::Scaleway,
            serde_json::to_value(&self.args).unwrap_or_else(|_| serde_json::Value::Null),
        )
    }
}
