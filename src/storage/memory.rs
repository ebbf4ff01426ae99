//! In-memory storage
//!
//! Ephemeral backend used by tests and throwaway deployments. Supports a
//! capacity limit and simple fault injection.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::types::{validate_path, Storage, StorageError};

#[derive(Default)]
struct Faults {
    /// Number of upcoming writes that fail with an I/O error
    failing_writes: u32,
    /// Prefixes whose deletion always fails
    failing_delete_prefixes: Vec<String>,
}

/// HashMap-style object store keyed by path
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    capacity: Mutex<Option<u64>>,
    faults: Mutex<Faults>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes once the stored bytes would exceed `capacity`
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            capacity: Mutex::new(Some(capacity)),
            ..Self::default()
        }
    }

    /// Change the capacity limit of a live store
    pub fn set_capacity(&self, capacity: Option<u64>) {
        *self.capacity.lock() = capacity;
    }

    /// Make the next `count` writes fail with a transient error
    pub fn fail_next_writes(&self, count: u32) {
        self.faults.lock().failing_writes = count;
    }

    /// Make every deletion touching `prefix` fail
    pub fn fail_deletes_under(&self, prefix: impl Into<String>) {
        self.faults.lock().failing_delete_prefixes.push(prefix.into());
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    pub fn stored_bytes(&self) -> u64 {
        self.objects.read().values().map(|v| v.len() as u64).sum()
    }

    /// Paths currently stored under `prefix`
    pub fn paths_under(&self, prefix: &str) -> Vec<String> {
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        self.objects
            .read()
            .keys()
            .filter(|k| k.starts_with(&dir))
            .cloned()
            .collect()
    }

    fn delete_blocked(&self, path: &str) -> bool {
        self.faults
            .lock()
            .failing_delete_prefixes
            .iter()
            .any(|p| path.starts_with(p.as_str()))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        validate_path(path)?;
        {
            let mut faults = self.faults.lock();
            if faults.failing_writes > 0 {
                faults.failing_writes -= 1;
                return Err(StorageError::Io(format!("injected write failure: {}", path)));
            }
        }

        let capacity = *self.capacity.lock();
        let mut objects = self.objects.write();
        if let Some(capacity) = capacity {
            let current: u64 = objects
                .iter()
                .filter(|(k, _)| k.as_str() != path)
                .map(|(_, v)| v.len() as u64)
                .sum();
            if current + bytes.len() as u64 > capacity {
                return Err(StorageError::Full(path.to_string()));
            }
        }
        objects.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        validate_path(path)?;
        self.objects
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn append(&self, path: &str, bytes: &[u8]) -> Result<u64, StorageError> {
        validate_path(path)?;
        {
            let mut faults = self.faults.lock();
            if faults.failing_writes > 0 {
                faults.failing_writes -= 1;
                return Err(StorageError::Io(format!("injected write failure: {}", path)));
            }
        }

        let capacity = *self.capacity.lock();
        let mut objects = self.objects.write();
        if let Some(capacity) = capacity {
            let current: u64 = objects.values().map(|v| v.len() as u64).sum();
            if current + bytes.len() as u64 > capacity {
                return Err(StorageError::Full(path.to_string()));
            }
        }
        let object = objects.entry(path.to_string()).or_default();
        object.extend_from_slice(bytes);
        Ok(object.len() as u64)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        validate_path(from)?;
        validate_path(to)?;
        let mut objects = self.objects.write();
        let bytes = objects
            .remove(from)
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        objects.insert(to.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        validate_path(path)?;
        if self.delete_blocked(path) {
            return Err(StorageError::Io(format!("injected delete failure: {}", path)));
        }
        self.objects.write().remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        validate_path(path)?;
        Ok(self.objects.read().contains_key(path))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        validate_path(prefix)?;
        if self.delete_blocked(prefix) {
            return Err(StorageError::Io(format!("injected delete failure: {}", prefix)));
        }
        let dir = format!("{}/", prefix);
        let mut objects = self.objects.write();
        let before = objects.len();
        objects.retain(|k, _| k != prefix && !k.starts_with(&dir));
        Ok(before - objects.len())
    }

    async fn list_children(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        validate_path(prefix)?;
        let dir = format!("{}/", prefix);
        let mut names: Vec<String> = self
            .objects
            .read()
            .keys()
            .filter_map(|k| k.strip_prefix(&dir))
            .filter_map(|rest| rest.split('/').next())
            .map(str::to_string)
            .collect();
        names.dedup();
        Ok(names)
    }
}
