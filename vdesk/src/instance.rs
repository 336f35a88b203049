//! Desktop instance domain types and pure validation functions.
//!
//! This module is intentionally free of I/O. All functions take data in and
//! return data out; mutation of persisted records happens in the providers
//! and the reconciler only.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::Record;

/// Default SSH port recorded on new instances.
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Default control-API (agentd) port recorded on new instances.
pub const DEFAULT_AGENTD_PORT: u16 = 8000;
/// Longest accepted instance name.
pub const MAX_NAME_LEN: usize = 60;

/// The backend that fulfils an instance.
///
/// Closed set: adding a provider means adding a variant and satisfying every
/// exhaustive match that stops compiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Scaleway,
    Hetzner,
    Qemu,
    Docker,
    Kube,
}

impl ProviderKind {
    /// All known kinds, in registry order.
    pub const ALL: [Self; 5] = [
        Self::Scaleway,
        Self::Hetzner,
        Self::Qemu,
        Self::Docker,
        Self::Kube,
    ];

    /// Wire value used in `ProviderRef.type` and persisted records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scaleway => "scaleway",
            Self::Hetzner => "hetzner",
            Self::Qemu => "qemu",
            Self::Docker => "docker",
            Self::Kube => "kube",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scaleway" => Ok(Self::Scaleway),
            "hetzner" => Ok(Self::Hetzner),
            "qemu" => Ok(Self::Qemu),
            "docker" => Ok(Self::Docker),
            "kube" => Ok(Self::Kube),
            other => Err(Error::UnknownProvider(other.to_string())),
        }
    }
}

/// Serialized provider connection configuration.
///
/// `args` is opaque to everything except the owning provider; the contract is
/// only that `from_data(to_data())` reconstructs an equivalent provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRef {
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    #[serde(default = "empty_args")]
    pub args: serde_json::Value,
}

impl ProviderRef {
    #[must_use]
    pub fn new(kind: ProviderKind, args: serde_json::Value) -> Self {
        Self { kind, args }
    }

    /// A reference with no connection arguments (local backends).
    #[must_use]
    pub fn bare(kind: ProviderKind) -> Self {
        Self::new(kind, empty_args())
    }
}

fn empty_args() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One provisioned desktop machine, persisted to the instance record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesktopInstance {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    /// Empty until the backend assigned an address.
    #[serde(default)]
    pub addr: String,
    pub status: InstanceStatus,
    pub created: DateTime<Utc>,
    pub cpu: u16,
    pub memory_gb: u32,
    pub disk: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub provider: ProviderRef,
    /// Statically assigned address that survives stop/start cycles.
    #[serde(default)]
    pub reserved_ip: bool,
    /// Reachable only through the tunnel subsystem.
    #[serde(default)]
    pub requires_proxy: bool,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_agentd_port")]
    pub agentd_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnc_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnc_port_https: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth_user: Option<String>,
    /// Encrypted at rest; decrypt through the context cipher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_pair_name: Option<String>,
    /// Backend-side resource identifier (server id, container id, pod name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Advisory lifetime in seconds, consumed by external sweepers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_agentd_port() -> u16 {
    DEFAULT_AGENTD_PORT
}

impl Record for DesktopInstance {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }
}

/// Validates an instance name.
///
/// Accepted: lowercase alphanumerics and hyphens, starting with an
/// alphanumeric, at most [`MAX_NAME_LEN`] characters.
///
/// # Errors
///
/// Returns [`Error::InvalidName`] describing the first violated rule.
pub fn validate_instance_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("longer than 60 characters"));
    }
    if !name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return Err(invalid("must start with a lowercase letter or digit"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid(
            "only lowercase letters, digits, and hyphens are allowed",
        ));
    }
    Ok(())
}

/// Generate an instance name: `desk-` followed by 6 lowercase hex characters.
#[must_use]
pub fn generate_instance_name() -> String {
    use rand::Rng;
    let n: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
    format!("desk-{n:06x}")
}

/// Generate an opaque record id.
#[must_use]
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
