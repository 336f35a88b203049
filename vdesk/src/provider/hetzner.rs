//! Hetzner Cloud backend.
//!
//! Close cousin of the Scaleway backend with Hetzner's API shapes: servers
//! boot straight from `POST /servers` with cloud-init inline, sizing picks a
//! `cx` shared-vCPU type, and the inbound-SSH firewall is attached at
//! creation. Desktops are tunnel-only (`requires_proxy = true`).

use std::collections::BTreeMap;
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
    resolve_key_pair, resolve_name,
};

const API_BASE: &str = "https://api.hetzner.cloud/v1";
const DEFAULT_LOCATION: &str = "nbg1";
const DEFAULT_IMAGE: &str = "ubuntu-22.04";
const FIREWALL_NAME: &str = "vdesk-default";
const PROVISIONER_LABEL: (&str, &str) = ("provisioner", "vdesk");

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const POLL_ATTEMPTS: u32 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HetznerArgs {
    #[serde(default = "default_location")]
    pub location: String,
}

fn default_location() -> String {
    DEFAULT_LOCATION.to_string()
}

// ── API surface ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Server {
    pub id: u64,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub public_net: PublicNet,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PublicNet {
    #[serde(default)]
    pub ipv4: Option<Ipv4>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Ipv4 {
    pub ip: String,
}

impl Server {
    fn addr(&self) -> String {
        self.public_net
            .ipv4
            .as_ref()
            .map(|v| v.ip.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub server_type: String,
    pub image: String,
    pub location: String,
    pub ssh_keys: Vec<String>,
    pub firewalls: Vec<FirewallRef>,
    pub labels: BTreeMap<String, String>,
    pub user_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirewallRef {
    pub firewall: u64,
}

/// The slice of the Hetzner Cloud API the provider consumes.
pub trait HetznerApi {
    /// # Errors
    /// Propagates transport and API failures.
    fn create_server(&self, req: &CreateServerRequest) -> Result<Server>;
    /// # Errors
    /// Propagates transport and API failures.
    fn server_action(&self, server_id: u64, action: &str) -> Result<()>;
    /// # Errors
    /// Propagates transport and API failures.
    fn delete_server(&self, server_id: u64) -> Result<()>;
    /// # Errors
    /// Propagates transport and API failures.
    fn get_server(&self, server_id: u64) -> Result<Server>;
    /// # Errors
    /// Propagates transport and API failures.
    fn list_servers(&self) -> Result<Vec<Server>>;
    /// # Errors
    /// Propagates transport and API failures.
    fn ensure_ssh_key(&self, name: &str, public_key: &str) -> Result<()>;
    /// Ensure the inbound-SSH firewall exists; returns its id.
    ///
    /// # Errors
    /// Propagates transport and API failures.
    fn ensure_firewall(&self) -> Result<u64>;
    /// Allocate a primary IP bound to `server_id`; returns its address.
    ///
    /// # Errors
    /// Propagates transport and API failures.
    fn reserve_primary_ip(&self, server_id: u64, name: &str) -> Result<String>;
}

pub struct HetznerHttp {
    token: String,
}

impl HetznerHttp {
    #[must_use]
    pub fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
        }
    }

    fn get(&self, url: &str, context: &str) -> Result<serde_json::Value> {
        let resp = ureq::get(url)
            .set("Authorization", &format!("Bearer {}", self.token))
            .call()
            .map_err(|e| http_error(context, e))?;
        resp.into_json().map_err(|e| Error::http(context, e))
    }

    fn post(&self, url: &str, body: serde_json::Value, context: &str) -> Result<serde_json::Value> {
        let resp = ureq::post(url)
            .set("Authorization", &format!("Bearer {}", self.token))
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

#[derive(Deserialize)]
struct ServerEnvelope {
    server: Server,
}

#[derive(Deserialize)]
struct ServerListEnvelope {
    servers: Vec<Server>,
}

impl HetznerApi for HetznerHttp {
    fn create_server(&self, req: &CreateServerRequest) -> Result<Server> {
        let body = serde_json::to_value(req).map_err(|e| Error::http("encoding server", e))?;
        let value = self.post(&format!("{API_BASE}/servers"), body, "creating server")?;
        serde_json::from_value::<ServerEnvelope>(value)
            .map(|e| e.server)
            .map_err(|e| Error::http("creating server", e))
    }

    fn server_action(&self, server_id: u64, action: &str) -> Result<()> {
        self.post(
            &format!("{API_BASE}/servers/{server_id}/actions/{action}"),
            json!({}),
            action,
        )?;
        Ok(())
    }

    fn delete_server(&self, server_id: u64) -> Result<()> {
        ureq::delete(&format!("{API_BASE}/servers/{server_id}"))
            .set("Authorization", &format!("Bearer {}", self.token))
            .call()
            .map_err(|e| http_error("deleting server", e))?;
        Ok(())
    }

    fn get_server(&self, server_id: u64) -> Result<Server> {
        let value = self.get(&format!("{API_BASE}/servers/{server_id}"), "fetching server")?;
        serde_json::from_value::<ServerEnvelope>(value)
            .map(|e| e.server)
            .map_err(|e| Error::http("fetching server", e))
    }

    fn list_servers(&self) -> Result<Vec<Server>> {
        let url = format!(
            "{API_BASE}/servers?label_selector={}={}",
            PROVISIONER_LABEL.0, PROVISIONER_LABEL.1
        );
        let value = self.get(&url, "listing servers")?;
        serde_json::from_value::<ServerListEnvelope>(value)
            .map(|e| e.servers)
            .map_err(|e| Error::http("listing servers", e))
    }

    fn ensure_ssh_key(&self, name: &str, public_key: &str) -> Result<()> {
        let listed = self.get(&format!("{API_BASE}/ssh_keys?name={name}"), "listing ssh keys")?;
        let exists = listed
            .get("ssh_keys")
            .and_then(serde_json::Value::as_array)
            .is_some_and(|keys| !keys.is_empty());
        if exists {
            return Ok(());
        }
        self.post(
            &format!("{API_BASE}/ssh_keys"),
            json!({ "name": name, "public_key": public_key }),
            "registering ssh key",
        )?;
        Ok(())
    }

    fn ensure_firewall(&self) -> Result<u64> {
        let listed = self.get(
            &format!("{API_BASE}/firewalls?name={FIREWALL_NAME}"),
            "listing firewalls",
        )?;
        if let Some(id) = listed
            .get("firewalls")
            .and_then(serde_json::Value::as_array)
            .and_then(|fws| fws.first())
            .and_then(|fw| fw.get("id"))
            .and_then(serde_json::Value::as_u64)
        {
            return Ok(id);
        }
        let created = self.post(
            &format!("{API_BASE}/firewalls"),
            json!({
                "name": FIREWALL_NAME,
                "rules": [{
                    "direction": "in",
                    "protocol": "tcp",
                    "port": DEFAULT_SSH_PORT.to_string(),
                    "source_ips": ["0.0.0.0/0", "::/0"],
                }],
            }),
            "creating firewall",
        )?;
        created
            .get("firewall")
            .and_then(|fw| fw.get("id"))
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| Error::http("creating firewall", "no id in response"))
    }

    fn reserve_primary_ip(&self, server_id: u64, name: &str) -> Result<String> {
        let created = self.post(
            &format!("{API_BASE}/primary_ips"),
            json!({
                "name": format!("{name}-ip"),
                "type": "ipv4",
                "assignee_type": "server",
                "assignee_id": server_id,
                "auto_delete": false,
            }),
            "reserving primary ip",
        )?;
        created
            .get("primary_ip")
            .and_then(|ip| ip.get("ip"))
            .and_then(serde_json::Value::as_str)
            .map(String::from)
            .ok_or_else(|| Error::http("reserving primary ip", "no address in response"))
    }
}

// ── Provider ─────────────────────────────────────────────────────────────────

pub struct HetznerProvider<A: HetznerApi = HetznerHttp> {
    ctx: Context,
    api: A,
    args: HetznerArgs,
    policy: ProbePolicy,
}

impl HetznerProvider<HetznerHttp> {
    /// Reconstruct a provider from stored connection configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Credentials`] when `HCLOUD_TOKEN` is not set.
    pub fn from_data(ctx: Context, provider: &ProviderRef) -> Result<Self> {
        let args: HetznerArgs =
            serde_json::from_value(provider.args.clone()).unwrap_or_else(|_| HetznerArgs {
                location: default_location(),
            });
        let token = std::env::var("HCLOUD_TOKEN").map_err(|_| Error::Credentials {
            provider: ProviderKind::Hetzner,
            var: "HCLOUD_TOKEN",
        })?;
        Ok(Self::with_api(ctx, args, HetznerHttp::new(&token)))
    }
}

impl<A: HetznerApi> HetznerProvider<A> {
    #[must_use]
    pub fn with_api(ctx: Context, args: HetznerArgs, api: A) -> Self {
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

    fn server_id(&self, instance: &DesktopInstance) -> Result<u64> {
        instance
            .resource_name
            .as_deref()
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| {
                self.provision_err(&instance.name, &Error::http("server id", "no backing server"))
            })
    }

    fn wait_for_status(&self, name: &str, server_id: u64, target: &str) -> Result<Server> {
        for _ in 1..=POLL_ATTEMPTS {
            let server = self.api.get_server(server_id)?;
            if server.status == target {
                return Ok(server);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Err(Error::ProvisionFailed {
            name: name.to_string(),
            provider: ProviderKind::Hetzner,
            reason: format!("server never reached status '{target}'"),
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

fn map_status(status: &str) -> InstanceStatus {
    match status {
        "running" => InstanceStatus::Running,
        "initializing" | "starting" => InstanceStatus::Creating,
        "off" | "stopping" => InstanceStatus::Stopped,
        _ => InstanceStatus::Error,
    }
}

/// Pick a shared-vCPU server type covering (cpu, memory).
#[must_use]
pub fn server_type(cpu: u16, memory_gb: u32) -> &'static str {
    if cpu <= 2 && memory_gb <= 4 {
        "cx22"
    } else if cpu <= 4 && memory_gb <= 8 {
        "cx32"
    } else if cpu <= 8 && memory_gb <= 16 {
        "cx42"
    } else {
        "cx52"
    }
}

impl<A: HetznerApi> DesktopProvider for HetznerProvider<A> {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Hetzner
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

        self.api
            .ensure_ssh_key(&pair.name, &pair.public_key)
            .map_err(|e| self.provision_err(&name, &e))?;
        let firewall = self
            .api
            .ensure_firewall()
            .map_err(|e| self.provision_err(&name, &e))?;

        let mut labels = BTreeMap::new();
        labels.insert(PROVISIONER_LABEL.0.to_string(), PROVISIONER_LABEL.1.to_string());
        labels.extend(req.tags.clone());

        let create = CreateServerRequest {
            name: name.clone(),
            server_type: server_type(req.cpu, req.memory_gb).to_string(),
            image: image.clone(),
            location: self.args.location.clone(),
            ssh_keys: vec![pair.name.clone()],
            firewalls: vec![FirewallRef { firewall }],
            labels,
            user_data: cloud_init_user_data(&pair.public_key),
        };
        let server = self
            .api
            .create_server(&create)
            .map_err(|e| self.provision_err(&name, &e))?;

        let running = self.wait_for_status(&name, server.id, "running")?;
        let mut addr = running.addr();
        if req.reserve_ip {
            addr = self
                .api
                .reserve_primary_ip(server.id, &name)
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
            resource_name: Some(server.id.to_string()),
            namespace: None,
            ttl: req.ttl,
            metadata: req.metadata,
        };
        persist_running(&self.ctx, instance)
    }

    fn delete(&self, name: &str, owner_id: Option<&str>, force: bool) -> Result<()> {
        let instance = self.get(name, owner_id)?;
        if let Ok(server_id) = self.server_id(&instance) {
            let outcome = self.api.delete_server(server_id);
            deprovision_guard(force, name, outcome)?;
        }
        finish_delete(&self.ctx, &instance)
    }

    fn start(&self, name: &str, owner_id: Option<&str>) -> Result<()> {
        let mut instance = self.get(name, owner_id)?;
        let server_id = self.server_id(&instance)?;
        let private_key = self.private_key_for(&instance)?;

        self.api
            .server_action(server_id, "poweron")
            .map_err(|e| self.provision_err(name, &e))?;
        let running = self.wait_for_status(name, server_id, "running")?;

        // A non-reserved address can change across a stop/start cycle.
        if !instance.reserved_ip {
            let addr = running.addr();
            if !addr.is_empty() {
                instance.addr = addr;
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
        let server_id = self.server_id(&instance)?;
        self.api
            .server_action(server_id, "poweroff")
            .map_err(|e| self.provision_err(name, &e))?;
        self.wait_for_status(name, server_id, "off")?;
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
                resource_name: server.id.to_string(),
                addr: server.addr(),
                status: map_status(&server.status),
            })
            .collect();
        reconcile::run(&self.ctx.instances(), self.kind(), &live)
    }

    fn to_data(&self) -> ProviderRef {
        ProviderRef::new(
            ProviderKind::Hetzner,
            serde_json::to_value(&self.args).unwrap_or_else(|_| serde_json::Value::Null),
        )
    }
}
