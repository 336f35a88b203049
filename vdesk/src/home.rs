//! Home directory layout and the process-wide context handle.
//!
//! All state a component needs (paths, stores, the resolved encryption
//! secret) is carried by an explicit [`Context`] built once at startup and
//! threaded into providers. Nothing in this crate reads mutable globals.

use std::path::{Path, PathBuf};

use crate::crypto::{self, Cipher};
use crate::error::{Error, Result};
use crate::instance::DesktopInstance;
use crate::keys::{KeyStore, SshKeyPair};
use crate::store::FileStore;

/// Environment variable overriding the home directory.
pub const HOME_ENV: &str = "VDESK_HOME";

const INSTANCES_FILE: &str = "instances.json";
const KEYS_FILE: &str = "keys.json";
const SECRET_FILE: &str = "secret.key";
const VMS_DIR: &str = "vms";
const IMAGES_DIR: &str = "images";

/// Filesystem layout under `~/.vdesk` (or `$VDESK_HOME`).
#[derive(Debug, Clone)]
pub struct DeskHome {
    root: PathBuf,
}

impl DeskHome {
    /// Resolve the home directory: `$VDESK_HOME` when set, else `~/.vdesk`.
    ///
    /// # Errors
    ///
    /// Returns an error if neither the override nor the user's home
    /// directory can be determined.
    pub fn new() -> Result<Self> {
        if let Ok(root) = std::env::var(HOME_ENV) {
            return Ok(Self::with_root(PathBuf::from(root)));
        }
        let home = dirs::home_dir().ok_or_else(|| {
            Error::store(Path::new("~"), "cannot determine home directory")
        })?;
        Ok(Self::with_root(home.join(".vdesk")))
    }

    /// Use an explicit root (used in tests).
    #[must_use]
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn instances_file(&self) -> PathBuf {
        self.root.join(INSTANCES_FILE)
    }

    #[must_use]
    pub fn keys_file(&self) -> PathBuf {
        self.root.join(KEYS_FILE)
    }

    #[must_use]
    pub fn secret_file(&self) -> PathBuf {
        self.root.join(SECRET_FILE)
    }

    /// Working directory for a local hypervisor VM.
    #[must_use]
    pub fn vm_dir(&self, name: &str) -> PathBuf {
        self.root.join(VMS_DIR).join(name)
    }

    /// Where local hypervisor base images live.
    #[must_use]
    pub fn images_dir(&self) -> PathBuf {
        self.root.join(IMAGES_DIR)
    }
}

/// Explicit handle object carrying everything providers need.
///
/// Cheap to clone; the encryption secret is resolved exactly once when the
/// context is built.
#[derive(Clone)]
pub struct Context {
    home: DeskHome,
    secret: [u8; 32],
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret.
        f.debug_struct("Context")
            .field("home", &self.home)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Build a context over the default home directory, resolving the
    /// encryption secret (env, then secret file, then generate-and-persist).
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined or the
    /// secret cannot be resolved or persisted.
    pub fn new() -> Result<Self> {
        Self::from_home(DeskHome::new()?)
    }

    /// Build a context rooted at an explicit directory (used in tests).
    ///
    /// # Errors
    ///
    /// Returns an error if the secret cannot be resolved or persisted.
    pub fn with_root(root: PathBuf) -> Result<Self> {
        Self::from_home(DeskHome::with_root(root))
    }

    fn from_home(home: DeskHome) -> Result<Self> {
        let secret = crypto::resolve_secret(&home.secret_file())?;
        Ok(Self { home, secret })
    }

    #[must_use]
    pub fn home(&self) -> &DeskHome {
        &self.home
    }

    /// Cipher bound to the resolved encryption secret.
    #[must_use]
    pub fn cipher(&self) -> Cipher {
        Cipher::new(self.secret)
    }

    /// The durable instance record store.
    #[must_use]
    pub fn instances(&self) -> FileStore<DesktopInstance> {
        FileStore::new(self.home.instances_file())
    }

    /// The durable SSH key pair record store.
    #[must_use]
    pub fn key_records(&self) -> FileStore<SshKeyPair> {
        FileStore::new(self.home.keys_file())
    }

    /// The key store service (generation, lookup, decrypt-on-demand).
    #[must_use]
    pub fn keys(&self) -> KeyStore {
        KeyStore::new(self.key_records(), self.cipher())
    }
}
