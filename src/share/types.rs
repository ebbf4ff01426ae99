//! Share lifecycle types

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{RetryPolicy, StorageError};

// ============================================================================
// Constants
// ============================================================================

/// Default maximum chunk size: 16MB
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Default per-share quota: 20GB
pub const DEFAULT_MAX_SHARE_BYTES: u64 = 20 * 1024 * 1024 * 1024;

/// Default global quota: 100GB
pub const DEFAULT_MAX_TOTAL_BYTES: u64 = 100 * 1024 * 1024 * 1024;

/// Default share retention: 24 hours
pub const DEFAULT_RETENTION_HOURS: i64 = 24;

/// Longest accepted client file id
pub const MAX_FILE_ID_LEN: usize = 128;

// ============================================================================
// Configuration
// ============================================================================

/// Limits and timings consumed by the lifecycle core
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub max_chunk_size: u64,
    pub max_share_bytes: u64,
    pub max_total_bytes: u64,
    pub default_retention_hours: i64,
    /// Pending shares older than this are treated as abandoned
    pub orphan_grace: Duration,
    /// Delay between expiry and physical reclamation of files
    pub reclaim_grace: Duration,
    /// Expired and deleted records older than this are dropped
    pub purge_after: Duration,
    /// Base used to build recipient download links
    pub public_base_url: String,
    pub retry: RetryPolicy,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_share_bytes: DEFAULT_MAX_SHARE_BYTES,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
            default_retention_hours: DEFAULT_RETENTION_HOURS,
            orphan_grace: Duration::hours(24),
            reclaim_grace: Duration::zero(),
            purge_after: Duration::days(30),
            public_base_url: "http://localhost:3000".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl LifecycleConfig {
    pub fn download_url(&self, token: &str) -> String {
        format!("{}/download/{}", self.public_base_url.trim_end_matches('/'), token)
    }
}

// ============================================================================
// Share
// ============================================================================

/// Lifecycle state of a share
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareState {
    /// Accepting chunks
    Pending,
    /// Finalized and downloadable
    Active,
    /// Past its expiry; files may already be reclaimed
    Expired,
    /// Explicitly removed
    Deleted,
}

impl ShareState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for ShareState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the recipient notification triggered by finalize
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum NotificationStatus {
    /// Share not finalized yet
    NotRequested,
    /// Delivery in flight
    Queued,
    /// No recipient to notify
    Skipped,
    Sent {
        at: DateTime<Utc>,
    },
    Failed {
        at: DateTime<Utc>,
        error: String,
    },
}

/// One upload transaction behind one token
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Share {
    pub token: String,
    pub recipient_email: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: ShareState,
    /// When `state` last changed
    pub state_changed_at: DateTime<Utc>,
    pub files: Vec<FileEntry>,
    /// Staged plus assembled bytes charged against the quotas
    pub bytes_used: u64,
    /// Stored files have been physically removed
    pub files_reclaimed: bool,
    pub finalized_at: Option<DateTime<Utc>>,
    pub notification: NotificationStatus,
    /// When the last chunk was accepted
    #[serde(default)]
    pub last_chunk_at: Option<DateTime<Utc>>,

    /// Bytes reserved by chunk writes still in flight
    #[serde(skip)]
    pub(crate) in_flight_bytes: u64,
}

impl Share {
    pub(crate) fn new(
        token: String,
        recipient_email: String,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            token,
            recipient_email,
            created_at,
            expires_at,
            state: ShareState::Pending,
            state_changed_at: created_at,
            files: Vec::new(),
            bytes_used: 0,
            files_reclaimed: false,
            finalized_at: None,
            notification: NotificationStatus::NotRequested,
            last_chunk_at: None,
            in_flight_bytes: 0,
        }
    }

    pub fn file(&self, file_id: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.file_id == file_id)
    }

    pub(crate) fn file_mut(&mut self, file_id: &str) -> Option<&mut FileEntry> {
        self.files.iter_mut().find(|f| f.file_id == file_id)
    }

    /// Creation or the most recent chunk, whichever is later
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_chunk_at.unwrap_or(self.created_at)
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Files that are missing chunks or have not been assembled yet
    pub fn incomplete_files(&self) -> Vec<IncompleteFile> {
        self.files
            .iter()
            .filter(|f| !f.is_complete() || !f.is_assembled())
            .map(|f| IncompleteFile {
                file_id: f.file_id.clone(),
                stored_name: f.stored_name.clone(),
                missing_chunks: f.missing_chunks(),
            })
            .collect()
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }

    pub fn total_downloads(&self) -> u64 {
        self.files.iter().map(|f| f.download_count).sum()
    }

    /// Move to `state`, stamping the change time
    pub(crate) fn transition(&mut self, state: ShareState, now: DateTime<Utc>) {
        self.state = state;
        self.state_changed_at = now;
    }

    /// Lazily apply expiry. Returns true if the state changed.
    pub(crate) fn refresh_expiry(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == ShareState::Active && self.is_past_expiry(now) {
            self.transition(ShareState::Expired, now);
            return true;
        }
        false
    }

    /// Short token prefix for logs
    pub fn token_prefix(&self) -> &str {
        token_prefix(&self.token)
    }
}

pub(crate) fn token_prefix(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    &token[..end]
}

// ============================================================================
// File Entry
// ============================================================================

/// A file inside a share
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Client-chosen identifier, stable across chunks
    pub file_id: String,
    /// Unique within the share
    pub stored_name: String,
    pub original_name: String,
    /// Assembled size, zero until assembly
    pub size_bytes: u64,
    pub total_chunks: u32,
    /// Received chunk index -> staged byte length
    pub chunks_received: BTreeMap<u32, u64>,
    /// SHA-256 of the assembled file
    pub sha256: Option<String>,
    pub assembled_at: Option<DateTime<Utc>>,
    pub download_count: u64,
    pub last_downloaded_at: Option<DateTime<Utc>>,
}

impl FileEntry {
    pub(crate) fn new(file_id: String, stored_name: String, original_name: String, total_chunks: u32) -> Self {
        Self {
            file_id,
            stored_name,
            original_name,
            size_bytes: 0,
            total_chunks,
            chunks_received: BTreeMap::new(),
            sha256: None,
            assembled_at: None,
            download_count: 0,
            last_downloaded_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.chunks_received.len() == self.total_chunks as usize
    }

    pub fn is_assembled(&self) -> bool {
        self.assembled_at.is_some()
    }

    /// 1-based chunk indices not received yet
    pub fn missing_chunks(&self) -> Vec<u32> {
        (1..=self.total_chunks)
            .filter(|i| !self.chunks_received.contains_key(i))
            .collect()
    }

    /// Sum of the staged chunk lengths
    pub fn staged_bytes(&self) -> u64 {
        self.chunks_received.values().sum()
    }

    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        (self.chunks_received.len() as f64 / self.total_chunks as f64) * 100.0
    }
}

/// A file that blocks finalize
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncompleteFile {
    pub file_id: String,
    pub stored_name: String,
    pub missing_chunks: Vec<u32>,
}

// ============================================================================
// Operation Types
// ============================================================================

/// One chunk as received from a client
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub file_id: String,
    /// 1-based
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub original_name: String,
    pub payload: Vec<u8>,
}

/// Acknowledgement for a stored chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    pub file_id: String,
    pub stored_name: String,
    pub chunk_index: u32,
    pub chunks_received: usize,
    pub total_chunks: u32,
    /// Every chunk arrived and the file was assembled
    pub complete: bool,
}

/// Result of a successful finalize
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResult {
    pub token: String,
    pub state: ShareState,
    pub file_count: usize,
    pub total_bytes: u64,
    pub expires_at: DateTime<Utc>,
    pub download_url: String,
    pub notification: NotificationStatus,
}

/// Client-facing view of a share
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareStatus {
    pub token: String,
    pub recipient_email: String,
    pub state: ShareState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub files: Vec<FileStatus>,
    pub total_bytes: u64,
    pub download_count: u64,
    pub files_reclaimed: bool,
    pub notification: NotificationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStatus {
    pub file_id: String,
    pub stored_name: String,
    pub original_name: String,
    pub size_bytes: u64,
    pub chunks_received: usize,
    pub total_chunks: u32,
    pub progress: f64,
    pub complete: bool,
    pub sha256: Option<String>,
    pub download_count: u64,
    pub last_downloaded_at: Option<DateTime<Utc>>,
}

impl From<&FileEntry> for FileStatus {
    fn from(file: &FileEntry) -> Self {
        Self {
            file_id: file.file_id.clone(),
            stored_name: file.stored_name.clone(),
            original_name: file.original_name.clone(),
            size_bytes: file.size_bytes,
            chunks_received: file.chunks_received.len(),
            total_chunks: file.total_chunks,
            progress: file.progress(),
            complete: file.is_complete() && file.is_assembled(),
            sha256: file.sha256.clone(),
            download_count: file.download_count,
            last_downloaded_at: file.last_downloaded_at,
        }
    }
}

impl From<&Share> for ShareStatus {
    fn from(share: &Share) -> Self {
        Self {
            token: share.token.clone(),
            recipient_email: share.recipient_email.clone(),
            state: share.state,
            created_at: share.created_at,
            expires_at: share.expires_at,
            finalized_at: share.finalized_at,
            files: share.files.iter().map(FileStatus::from).collect(),
            total_bytes: share.total_size(),
            download_count: share.total_downloads(),
            files_reclaimed: share.files_reclaimed,
            notification: share.notification.clone(),
        }
    }
}

/// One page of shares, newest first
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharePage {
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub pages: usize,
    pub items: Vec<ShareStatus>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Lifecycle error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum ShareError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Incomplete upload: {} file(s) still missing data", .0.len())]
    IncompleteUpload(Vec<IncompleteFile>),

    #[error("Invalid retention: {0}")]
    InvalidRetention(String),

    #[error("Chunk too large: {size} bytes (max: {max})")]
    ChunkTooLarge { size: u64, max: u64 },

    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("Storage full: {0}")]
    StorageFull(String),

    #[error("Storage I/O error: {0}")]
    StorageIo(String),

    #[error("Share not available: {0}")]
    NotAvailable(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl ShareError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidState(_) => StatusCode::CONFLICT,
            Self::IncompleteUpload(_) => StatusCode::CONFLICT,
            Self::InvalidRetention(_) => StatusCode::BAD_REQUEST,
            Self::ChunkTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidChunk(_) => StatusCode::BAD_REQUEST,
            Self::StorageFull(_) => StatusCode::INSUFFICIENT_STORAGE,
            Self::StorageIo(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotAvailable(_) => StatusCode::GONE,
            Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::IncompleteUpload(_) => "INCOMPLETE_UPLOAD",
            Self::InvalidRetention(_) => "INVALID_RETENTION",
            Self::ChunkTooLarge { .. } => "CHUNK_TOO_LARGE",
            Self::InvalidChunk(_) => "INVALID_CHUNK",
            Self::StorageFull(_) => "STORAGE_FULL",
            Self::StorageIo(_) => "STORAGE_IO_ERROR",
            Self::NotAvailable(_) => "NOT_AVAILABLE",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
        }
    }

    /// The client may repeat the same request unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageIo(_))
    }
}

impl From<StorageError> for ShareError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Full(msg) => Self::StorageFull(msg),
            other => Self::StorageIo(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for ShareError {
    fn from(e: sqlx::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for ShareError {
    fn from(e: serde_json::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(total: u32, received: &[u32]) -> FileEntry {
        let mut file = FileEntry::new("f".into(), "a.bin".into(), "a.bin".into(), total);
        for i in received {
            file.chunks_received.insert(*i, 10);
        }
        file
    }

    #[test]
    fn test_missing_chunks_are_one_based() {
        let file = entry(4, &[1, 3]);
        assert_eq!(file.missing_chunks(), vec![2, 4]);
        assert!(!file.is_complete());
        assert_eq!(file.progress(), 50.0);
        assert_eq!(file.staged_bytes(), 20);
    }

    #[test]
    fn test_refresh_expiry_only_moves_active_shares() {
        let now = Utc::now();
        let mut share = Share::new("tok".into(), "a@b.c".into(), now, now + Duration::hours(1));

        assert!(!share.refresh_expiry(now + Duration::hours(2)));
        assert_eq!(share.state, ShareState::Pending);

        share.transition(ShareState::Active, now);
        assert!(!share.refresh_expiry(now + Duration::minutes(59)));
        assert!(share.refresh_expiry(now + Duration::hours(1)));
        assert_eq!(share.state, ShareState::Expired);
    }

    #[test]
    fn test_storage_errors_map_to_taxonomy() {
        assert!(matches!(
            ShareError::from(StorageError::Full("x".into())),
            ShareError::StorageFull(_)
        ));
        let err = ShareError::from(StorageError::Timeout("x".into()));
        assert!(matches!(err, ShareError::StorageIo(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_missing_storage_object_is_not_an_unknown_token() {
        let err = ShareError::from(StorageError::NotFound("staging/tok/f1/00001.chunk".into()));
        assert!(matches!(err, ShareError::StorageIo(_)));
        assert!(err.is_retryable());
        assert_eq!(err.code(), "STORAGE_IO_ERROR");
    }

    #[test]
    fn test_token_prefix() {
        assert_eq!(token_prefix("abcdefghijkl"), "abcdefgh");
        assert_eq!(token_prefix("abc"), "abc");
    }
}
