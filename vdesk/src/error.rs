//! Typed errors for every lifecycle operation.
//!
//! One crate-wide enum so callers can match on failure cause without caring
//! which backend produced it; every variant names the instance or key pair
//! involved and, where it applies, the provider kind.

use std::path::PathBuf;

use thiserror::Error;

use crate::instance::ProviderKind;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// What an [`Error::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Instance,
    KeyPair,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instance => write!(f, "instance"),
            Self::KeyPair => write!(f, "key pair"),
        }
    }
}

/// Errors raised by providers, the tunnel manager, the key store, and the
/// record stores.
#[derive(Debug, Error)]
pub enum Error {
    #[error("an instance named '{name}' already exists ({provider})")]
    NameConflict { name: String, provider: ProviderKind },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: ResourceKind, name: String },

    #[error("{provider} failed to provision '{name}': {reason}")]
    ProvisionFailed {
        name: String,
        provider: ProviderKind,
        reason: String,
    },

    #[error("'{name}' did not answer its health probe after {attempts} attempts ({provider})")]
    ReadinessTimeout {
        name: String,
        provider: ProviderKind,
        attempts: u32,
    },

    #[error("tunnel to {host}: {reason}")]
    TunnelFailed { host: String, reason: String },

    #[error("{op} is not supported by the {provider} provider")]
    NotSupported {
        op: &'static str,
        provider: ProviderKind,
    },

    #[error("invalid instance name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("unknown provider type '{0}'")]
    UnknownProvider(String),

    #[error("crypto failure: {reason}")]
    CryptoFailed { reason: String },

    #[error("missing {provider} credentials: set {var}")]
    Credentials {
        provider: ProviderKind,
        var: &'static str,
    },

    #[error("store error at {path}: {reason}")]
    Store { path: PathBuf, reason: String },

    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{context}: {reason}")]
    Http { context: String, reason: String },
}

impl Error {
    /// Build an [`Error::Store`] from a path and any displayable cause.
    pub(crate) fn store(path: &std::path::Path, cause: impl std::fmt::Display) -> Self {
        Self::Store {
            path: path.to_path_buf(),
            reason: cause.to_string(),
        }
    }

    /// Build an [`Error::CryptoFailed`] from any displayable cause.
    pub(crate) fn crypto(cause: impl std::fmt::Display) -> Self {
        Self::CryptoFailed {
            reason: cause.to_string(),
        }
    }

    /// Build an [`Error::Http`] with a short call-site context.
    pub(crate) fn http(context: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::Http {
            context: context.into(),
            reason: cause.to_string(),
        }
    }

    pub(crate) fn instance_not_found(name: &str) -> Self {
        Self::NotFound {
            kind: ResourceKind::Instance,
            name: name.to_string(),
        }
    }

    pub(crate) fn key_not_found(name: &str) -> Self {
        Self::NotFound {
            kind: ResourceKind::KeyPair,
            name: name.to_string(),
        }
    }
}
