//! vdesk: ephemeral remote desktops over interchangeable backends.
//!
//! One lifecycle contract ([`DesktopProvider`]) over five backends: Scaleway
//! and Hetzner Cloud servers, local QEMU VMs, local Docker containers, and
//! Kubernetes pods. Instance and key records live under a home directory
//! with secrets encrypted at rest; desktops that are not locally reachable
//! are reached through deduplicated SSH tunnels.

#![cfg_attr(test, allow(clippy::expect_used))]

pub mod crypto;
pub mod error;
pub mod health;
pub mod home;
pub mod instance;
pub mod keys;
pub mod provider;
pub mod runner;
pub mod store;
pub mod tunnel;
pub mod util;

pub use error::{Error, Result};
pub use home::Context;
pub use instance::{DesktopInstance, InstanceStatus, ProviderKind, ProviderRef};
pub use keys::SshKeyPair;
pub use provider::{CreateRequest, DesktopProvider, RefreshSummary, provider_from_ref};
pub use tunnel::{Tunnel, TunnelSpec, ensure_tunnel};
