//! Mesh key management
//!
//! [`KeyManager`] owns the single in-memory copy of the mesh key and the
//! crypto capability that uses it. Installing a key is a one-shot operation;
//! replacing an installed key goes through [`KeyManager::rekey`].

use crate::crypto::{CryptoProvider, MeshKey};
use crate::error::{KeyError, Result};
use crate::storage::KEY_MESH_KEY;
use crate::traits::ByteStorage;
use tracing::{debug, info};

/// Holder of the mesh-wide symmetric key
pub struct KeyManager {
    crypto: Box<dyn CryptoProvider>,
    mesh_key: Option<MeshKey>,
    /// Successful installs and rekeys since construction
    installs: u32,
}

impl KeyManager {
    /// Create a key manager with no key installed
    pub fn new(crypto: Box<dyn CryptoProvider>) -> Self {
        Self {
            crypto,
            mesh_key: None,
            installs: 0,
        }
    }

    /// The crypto capability
    pub fn crypto(&self) -> &dyn CryptoProvider {
        self.crypto.as_ref()
    }

    /// Current mesh key, if any
    pub fn current_mesh_key(&self) -> Option<&MeshKey> {
        self.mesh_key.as_ref()
    }

    /// Check if a mesh key is installed
    pub fn has_mesh_key(&self) -> bool {
        self.mesh_key.is_some()
    }

    /// Install the mesh key; fails if one is already present
    pub fn install_mesh_key(&mut self, key: MeshKey) -> std::result::Result<(), KeyError> {
        if self.mesh_key.is_some() {
            return Err(KeyError::AlreadyInstalled);
        }
        self.mesh_key = Some(key);
        self.installs += 1;
        info!("mesh key installed");
        Ok(())
    }

    /// Replace the mesh key, returning the previous one
    pub fn rekey(&mut self, key: MeshKey) -> Option<MeshKey> {
        self.installs += 1;
        info!("mesh key replaced");
        self.mesh_key.replace(key)
    }

    /// Generate a fresh key without installing it
    pub fn generate_mesh_key(&self) -> MeshKey {
        self.crypto.generate_key()
    }

    /// Forget the mesh key
    pub fn clear(&mut self) {
        self.mesh_key = None;
    }

    /// Number of installs and rekeys so far
    pub fn install_count(&self) -> u32 {
        self.installs
    }

    /// Seal a payload under the mesh key
    pub fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.mesh_key.as_ref().ok_or(KeyError::Missing)?;
        Ok(self.crypto.seal(key, aad, plaintext)?)
    }

    /// Open a payload sealed under the mesh key
    pub fn open(&self, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
        let key = self.mesh_key.as_ref().ok_or(KeyError::Missing)?;
        Ok(self.crypto.open(key, aad, sealed)?)
    }

    /// Load the persisted key; a missing entry leaves the manager empty
    pub fn load(&mut self, storage: &dyn ByteStorage) -> Result<bool> {
        match storage.read_optional(KEY_MESH_KEY)? {
            Some(bytes) => {
                self.mesh_key = Some(MeshKey::from_slice(&bytes)?);
                debug!("mesh key loaded from storage");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Persist the key, or remove the stored copy when none is installed
    pub fn flush(&self, storage: &mut dyn ByteStorage) -> Result<()> {
        match &self.mesh_key {
            Some(key) => storage.write(KEY_MESH_KEY, key.as_bytes())?,
            None => storage.remove(KEY_MESH_KEY)?,
        }
        Ok(())
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("has_mesh_key", &self.has_mesh_key())
            .field("installs", &self.installs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SoftwareCrypto;
    use crate::error::MeshError;
    use crate::storage::MemoryStorage;

    fn manager() -> KeyManager {
        KeyManager::new(Box::new(SoftwareCrypto::new()))
    }

    #[test]
    fn test_install_once() {
        let mut keys = manager();
        assert!(keys.current_mesh_key().is_none());

        let key = keys.generate_mesh_key();
        keys.install_mesh_key(key.clone()).unwrap();
        assert_eq!(keys.current_mesh_key(), Some(&key));

        let other = keys.generate_mesh_key();
        assert_eq!(keys.install_mesh_key(other), Err(KeyError::AlreadyInstalled));
        assert_eq!(keys.current_mesh_key(), Some(&key));
        assert_eq!(keys.install_count(), 1);
    }

    #[test]
    fn test_rekey() {
        let mut keys = manager();
        let first = keys.generate_mesh_key();
        keys.install_mesh_key(first.clone()).unwrap();

        let second = keys.generate_mesh_key();
        assert_eq!(keys.rekey(second.clone()), Some(first));
        assert_eq!(keys.current_mesh_key(), Some(&second));
        assert_eq!(keys.install_count(), 2);
    }

    #[test]
    fn test_seal_requires_key() {
        let mut keys = manager();
        assert!(matches!(
            keys.seal(b"aad", b"data"),
            Err(MeshError::Key(KeyError::Missing))
        ));

        let key = keys.generate_mesh_key();
        keys.install_mesh_key(key).unwrap();
        let sealed = keys.seal(b"aad", b"data").unwrap();
        assert_eq!(keys.open(b"aad", &sealed).unwrap(), b"data");
    }

    #[test]
    fn test_load_and_flush() {
        let mut storage = MemoryStorage::new();
        let mut keys = manager();
        assert!(!keys.load(&storage).unwrap());

        let key = keys.generate_mesh_key();
        keys.install_mesh_key(key.clone()).unwrap();
        keys.flush(&mut storage).unwrap();

        let mut reloaded = manager();
        assert!(reloaded.load(&storage).unwrap());
        assert_eq!(reloaded.current_mesh_key(), Some(&key));

        reloaded.clear();
        reloaded.flush(&mut storage).unwrap();
        assert!(!storage.contains(KEY_MESH_KEY));
    }

    #[test]
    fn test_flush_propagates_storage_failure() {
        let mut storage = MemoryStorage::new();
        storage.set_fail_writes(true);
        let mut keys = manager();
        let key = keys.generate_mesh_key();
        keys.install_mesh_key(key).unwrap();
        assert!(matches!(keys.flush(&mut storage), Err(MeshError::Storage(_))));
    }
}
