//! Storage trait, errors and path layout

use async_trait::async_trait;

/// Backend failure modes
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage full: {0}")]
    Full(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Invalid storage path: {0}")]
    InvalidPath(String),
}

impl StorageError {
    /// Whether repeating the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout(_))
    }
}

/// Durable byte storage addressed by `/`-separated relative paths
///
/// A successful `write` is durable. `delete` of a missing path is not an error.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Append to the object at `path`, creating it if missing, and return its new length
    async fn append(&self, path: &str, bytes: &[u8]) -> Result<u64, StorageError>;

    /// Move an object, replacing whatever is at `to`
    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError>;

    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    /// Remove everything stored under `prefix`, returning the number of objects removed
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StorageError>;

    /// Names of the immediate children of `prefix` (objects and directories)
    async fn list_children(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

// ============================================================================
// Layout
// ============================================================================

/// Root of per-file chunk staging
pub const STAGING_ROOT: &str = "staging";

/// Root of assembled share files
pub const SHARES_ROOT: &str = "shares";

/// `staging/<token>`
pub fn staging_share_dir(token: &str) -> String {
    format!("{}/{}", STAGING_ROOT, token)
}

/// `staging/<token>/<file_id>`
pub fn staging_file_dir(token: &str, file_id: &str) -> String {
    format!("{}/{}/{}", STAGING_ROOT, token, file_id)
}

/// `staging/<token>/<file_id>/<index>.chunk`
pub fn chunk_path(token: &str, file_id: &str, chunk_index: u32) -> String {
    format!("{}/{:05}.chunk", staging_file_dir(token, file_id), chunk_index)
}

/// `staging/<token>/<file_id>/assembled`, the file being built from its chunks
pub fn assembly_path(token: &str, file_id: &str) -> String {
    format!("{}/assembled", staging_file_dir(token, file_id))
}

/// `shares/<token>`
pub fn share_dir(token: &str) -> String {
    format!("{}/{}", SHARES_ROOT, token)
}

/// `shares/<token>/<stored_name>`
pub fn stored_file_path(token: &str, stored_name: &str) -> String {
    format!("{}/{}", share_dir(token), stored_name)
}

/// Reject anything that could escape the storage root
pub fn validate_path(path: &str) -> Result<(), StorageError> {
    if path.is_empty() || path.starts_with('/') || path.contains('\\') || path.contains('\0') {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    if path
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(())
}
