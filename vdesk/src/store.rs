//! Durable record stores.
//!
//! Each store is a single JSON file holding the full list of records.
//! Writes are atomic (temp file + rename) so a crash mid-save never leaves
//! a truncated store behind, and files are chmod 0600 because key records
//! carry encrypted private key material.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// A record that can live in a [`FileStore`].
pub trait Record {
    /// Stable unique identifier.
    fn id(&self) -> &str;
    /// Human-chosen name, unique within a store.
    fn name(&self) -> &str;
    /// Optional owning user.
    fn owner_id(&self) -> Option<&str>;
}

/// JSON-file-backed store for one record type.
pub struct FileStore<T> {
    path: PathBuf,
    _marker: PhantomData<T>,
}

impl<T> FileStore<T>
where
    T: Record + Serialize + DeserializeOwned + Clone,
{
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every record. A missing file is an empty store.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| Error::store(&self.path, format!("reading store: {e}")))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::store(&self.path, format!("parsing store: {e}")))
    }

    /// Replace the store contents with `records`.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be serialized or written.
    pub fn save(&self, records: &[T]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::store(parent, format!("creating directory: {e}")))?;
        }
        let content = serde_json::to_string_pretty(records)
            .map_err(|e| Error::store(&self.path, format!("serializing records: {e}")))?;

        // Atomic write via temp file then rename.
        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, &content)
            .map_err(|e| Error::store(&temp_path, format!("writing temp file: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| Error::store(&temp_path, format!("setting permissions: {e}")))?;
        }

        std::fs::rename(&temp_path, &self.path)
            .map_err(|e| Error::store(&self.path, format!("finalizing store: {e}")))?;
        Ok(())
    }

    /// Insert `record`, replacing any existing record with the same id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn upsert(&self, record: &T) -> Result<()> {
        let mut records = self.load()?;
        match records.iter_mut().find(|r| r.id() == record.id()) {
            Some(slot) => *slot = record.clone(),
            None => records.push(record.clone()),
        }
        self.save(&records)
    }

    /// Remove the record with `id`, returning it if it was present.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn remove(&self, id: &str) -> Result<Option<T>> {
        let mut records = self.load()?;
        let Some(pos) = records.iter().position(|r| r.id() == id) else {
            return Ok(None);
        };
        let removed = records.remove(pos);
        self.save(&records)?;
        Ok(Some(removed))
    }

    /// Find a record by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn find(&self, id: &str) -> Result<Option<T>> {
        Ok(self.load()?.into_iter().find(|r| r.id() == id))
    }

    /// Find a record by name, optionally scoped to an owner.
    ///
    /// Records without an owner are visible to every caller; owned records
    /// only match the same owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn find_named(&self, name: &str, owner_id: Option<&str>) -> Result<Option<T>> {
        Ok(self
            .load()?
            .into_iter()
            .find(|r| r.name() == name && owner_matches(r.owner_id(), owner_id)))
    }
}

fn owner_matches(record_owner: Option<&str>, caller: Option<&str>) -> bool {
    match record_owner {
        None => true,
        Some(owner) => caller == Some(owner),
    }
}
