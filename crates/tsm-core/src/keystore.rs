//! Persistence of the master key id

use crate::{Error, KeyId, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

/// Storage for the id of the master key.
///
/// Holds the id only, never key material.
pub trait KeyStore: Send + Sync {
    /// Previously saved key id, if any
    fn load(&self) -> Result<Option<KeyId>>;

    /// Persist a key id for later runs
    fn save(&self, key_id: &KeyId) -> Result<()>;
}

/// Key id stored as trimmed text in a local file
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyStore for FileKeyStore {
    fn load(&self) -> Result<Option<KeyId>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let id = contents.trim();
                if id.is_empty() {
                    return Err(Error::KeyStore(format!(
                        "Key file {} is empty",
                        self.path.display()
                    )));
                }
                info!(key_id = id, path = %self.path.display(), "Read key ID from file");
                Ok(Some(KeyId::new(id)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::KeyStore(format!(
                "Reading {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn save(&self, key_id: &KeyId) -> Result<()> {
        std::fs::write(&self.path, format!("{key_id}\n"))
            .map_err(|e| Error::KeyStore(format!("Writing {}: {e}", self.path.display())))?;
        info!(key_id = %key_id, path = %self.path.display(), "Saved key ID to file");
        Ok(())
    }
}

/// In-memory key store for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    key_id: Mutex<Option<KeyId>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(key_id: KeyId) -> Self {
        Self {
            key_id: Mutex::new(Some(key_id)),
        }
    }
}

impl KeyStore for MemoryKeyStore {
    fn load(&self) -> Result<Option<KeyId>> {
        let guard = self
            .key_id
            .lock()
            .map_err(|_| Error::KeyStore("key store lock poisoned".into()))?;
        Ok(guard.clone())
    }

    fn save(&self, key_id: &KeyId) -> Result<()> {
        let mut guard = self
            .key_id
            .lock()
            .map_err(|_| Error::KeyStore("key store lock poisoned".into()))?;
        *guard = Some(key_id.clone());
        Ok(())
    }
}

impl<S: KeyStore + ?Sized> KeyStore for std::sync::Arc<S> {
    fn load(&self) -> Result<Option<KeyId>> {
        (**self).load()
    }

    fn save(&self, key_id: &KeyId) -> Result<()> {
        (**self).save(key_id)
    }
}
