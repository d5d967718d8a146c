//! In-memory storage and persisted key names

use crate::error::StorageError;
use crate::traits::ByteStorage;
use std::collections::HashMap;

/// Mesh key
pub const KEY_MESH_KEY: &str = "mk";

/// Inclusion state
pub const KEY_INCLUSION_STATE: &str = "is";

/// Routing table snapshot
pub const KEY_ROUTES: &str = "rt";

/// HashMap-backed [`ByteStorage`]
///
/// Survives a simulated reboot when the same instance is handed to a new
/// device. `fail_writes` makes every write fail, for exercising error paths.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    entries: HashMap<String, Vec<u8>>,
    fail_writes: bool,
}

impl MemoryStorage {
    /// Create empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Check whether `key` is present
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ByteStorage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.entries
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn write(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Failure(format!("write to {key} rejected")));
        }
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }
}
