//! Share Registry
//!
//! Authoritative store of share records and their lifecycle transitions.
//!
//! Each share lives behind its own async mutex. Every state-changing
//! operation on a share holds that mutex for its whole duration, so shares
//! never contend with each other and a single share never loses updates. The
//! token map itself is only locked long enough to clone a handle.
//!
//! Mutations are built on a copy of the record, written through to the
//! repository when one is configured, and only then swapped in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::db::ShareRepository;
use crate::notify::{Notifier, NotifyError, ShareNotification};
use crate::storage::{self, RetryingStorage, Storage};

use super::names::NameResolver;
use super::token::generate_token;
use super::types::{
    token_prefix, FinalizeResult, LifecycleConfig, NotificationStatus, Share, ShareError,
    SharePage, ShareState, ShareStatus,
};

/// Upper bound on retention (10 years)
pub const MAX_RETENTION_HOURS: i64 = 24 * 365 * 10;

pub(crate) type ShareHandle = Arc<Mutex<Share>>;

// ============================================================================
// Share Registry
// ============================================================================

/// Owns every share record
#[derive(Clone)]
pub struct ShareRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    /// Share records indexed by token
    shares: RwLock<HashMap<String, ShareHandle>>,

    /// Backend for staged chunks and assembled files
    storage: RetryingStorage,

    clock: Arc<dyn Clock>,

    notifier: Arc<dyn Notifier>,

    /// Write-through persistence (None = memory only)
    repository: Option<ShareRepository>,

    config: LifecycleConfig,

    /// Bytes charged against the global quota, including in-flight reservations
    usage: AtomicU64,
}

impl ShareRegistry {
    /// Create an in-memory registry
    pub fn new(
        config: LifecycleConfig,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::build(config, storage, clock, notifier, None, Vec::new())
    }

    /// Create a registry backed by `repository`, loading every stored share
    pub async fn restore(
        config: LifecycleConfig,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        repository: ShareRepository,
    ) -> Result<Self, ShareError> {
        let shares = repository.load_all().await?;
        tracing::info!(count = shares.len(), "Loaded share records");
        Ok(Self::build(config, storage, clock, notifier, Some(repository), shares))
    }

    fn build(
        config: LifecycleConfig,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        repository: Option<ShareRepository>,
        shares: Vec<Share>,
    ) -> Self {
        let usage: u64 = shares.iter().map(|s| s.bytes_used).sum();
        let shares = shares
            .into_iter()
            .map(|s| (s.token.clone(), Arc::new(Mutex::new(s))))
            .collect();

        Self {
            inner: Arc::new(RegistryInner {
                shares: RwLock::new(shares),
                storage: RetryingStorage::new(storage, config.retry),
                clock,
                notifier,
                repository,
                config,
                usage: AtomicU64::new(usage),
            }),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.inner.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Bytes currently charged against the global quota
    pub fn usage_bytes(&self) -> u64 {
        self.inner.usage.load(Ordering::SeqCst)
    }

    pub fn share_count(&self) -> usize {
        self.inner.shares.read().len()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Issue a token for a new Pending share
    pub async fn create(&self, recipient_email: &str, retention_hours: i64) -> Result<String, ShareError> {
        if retention_hours <= 0 {
            return Err(ShareError::InvalidRetention(format!(
                "retention must be positive, got {} hours",
                retention_hours
            )));
        }
        if retention_hours > MAX_RETENTION_HOURS {
            return Err(ShareError::InvalidRetention(format!(
                "retention of {} hours exceeds the maximum of {}",
                retention_hours, MAX_RETENTION_HOURS
            )));
        }

        let now = self.now();
        let expires_at = now + Duration::hours(retention_hours);
        let recipient = recipient_email.trim().to_string();

        // 256-bit tokens; a collision would mean a broken RNG
        let mut token = generate_token();
        while self.inner.shares.read().contains_key(&token) {
            token = generate_token();
        }

        let share = Share::new(token.clone(), recipient, now, expires_at);
        self.persist(&share).await?;
        self.inner
            .shares
            .write()
            .insert(token.clone(), Arc::new(Mutex::new(share)));

        tracing::info!(
            token = %token_prefix(&token),
            retention_hours = retention_hours,
            expires_at = %expires_at,
            "Created share"
        );

        Ok(token)
    }

    /// Seal a Pending share whose files are all complete and notify the recipient
    pub async fn finalize(&self, token: &str) -> Result<FinalizeResult, ShareError> {
        let handle = self.handle(token)?;
        let mut share = handle.lock().await;
        let now = self.now();

        if share.state != ShareState::Pending {
            return Err(ShareError::InvalidState(format!(
                "cannot finalize a share that is {}",
                share.state
            )));
        }
        if share.is_past_expiry(now) {
            return Err(ShareError::NotFound(format!(
                "share {} has expired",
                share.token_prefix()
            )));
        }
        if share.files.is_empty() {
            return Err(ShareError::InvalidState("share has no files".into()));
        }

        let incomplete = share.incomplete_files();
        if !incomplete.is_empty() {
            tracing::debug!(
                token = %share.token_prefix(),
                incomplete = incomplete.len(),
                "Finalize rejected, files incomplete"
            );
            return Err(ShareError::IncompleteUpload(incomplete));
        }

        let mut next = share.clone();
        next.transition(ShareState::Active, now);
        next.finalized_at = Some(now);
        next.notification = if next.recipient_email.is_empty() {
            NotificationStatus::Skipped
        } else {
            NotificationStatus::Queued
        };
        self.commit(&mut share, next).await?;

        let result = FinalizeResult {
            token: share.token.clone(),
            state: share.state,
            file_count: share.files.len(),
            total_bytes: share.total_size(),
            expires_at: share.expires_at,
            download_url: self.inner.config.download_url(&share.token),
            notification: share.notification.clone(),
        };

        tracing::info!(
            token = %share.token_prefix(),
            files = result.file_count,
            bytes = result.total_bytes,
            "Share finalized"
        );

        if share.notification == NotificationStatus::Queued {
            let notification = self.notification_for(&share);
            drop(share);
            self.spawn_notification(notification);
        }

        Ok(result)
    }

    /// Current record regardless of state
    pub async fn lookup(&self, token: &str) -> Result<Share, ShareError> {
        let handle = self.handle(token)?;
        let mut share = handle.lock().await;
        self.apply_expiry(&mut share).await?;
        Ok(share.clone())
    }

    pub async fn status(&self, token: &str) -> Result<ShareStatus, ShareError> {
        let share = self.lookup(token).await?;
        Ok(ShareStatus::from(&share))
    }

    /// Bring an Expired share back with a later expiry
    pub async fn reactivate(&self, token: &str, new_expires_at: DateTime<Utc>) -> Result<Share, ShareError> {
        let handle = self.handle(token)?;
        let mut share = handle.lock().await;
        self.apply_expiry(&mut share).await?;
        let now = self.now();

        if share.state != ShareState::Expired {
            return Err(ShareError::InvalidState(format!(
                "only expired shares can be reactivated, share is {}",
                share.state
            )));
        }
        if share.files_reclaimed {
            return Err(ShareError::InvalidState(
                "share files were already reclaimed".into(),
            ));
        }
        if new_expires_at <= now {
            return Err(ShareError::InvalidRetention(format!(
                "new expiry {} is not in the future",
                new_expires_at
            )));
        }

        let mut next = share.clone();
        next.transition(ShareState::Active, now);
        next.expires_at = new_expires_at;
        self.commit(&mut share, next).await?;

        tracing::info!(
            token = %share.token_prefix(),
            expires_at = %new_expires_at,
            "Share reactivated"
        );

        Ok(share.clone())
    }

    /// Delete a share and its files; deleting twice is a no-op
    pub async fn delete(&self, token: &str) -> Result<(), ShareError> {
        let handle = self.handle(token)?;
        let mut share = handle.lock().await;

        if share.state == ShareState::Deleted {
            return Ok(());
        }

        let mut next = share.clone();
        next.transition(ShareState::Deleted, self.now());
        self.commit(&mut share, next).await?;

        // A failure here leaves files_reclaimed unset; the reaper retries
        match self.reclaim_files(&mut share).await {
            Ok(removed) => {
                tracing::info!(token = %share.token_prefix(), objects = removed, "Share deleted");
            }
            Err(e) => {
                tracing::warn!(
                    token = %share.token_prefix(),
                    error = %e,
                    "Share deleted, file removal deferred to the reaper"
                );
            }
        }

        Ok(())
    }

    /// Stored name the next upload of `original_name` would receive
    pub async fn resolve_name(&self, token: &str, original_name: &str) -> Result<String, ShareError> {
        let handle = self.handle(token)?;
        let share = handle.lock().await;
        Ok(NameResolver::resolve(&share, original_name))
    }

    /// Resend the notification for an Active share
    ///
    /// A new recipient replaces the old one and restarts the retention period.
    pub async fn renotify(&self, token: &str, recipient_email: Option<&str>) -> Result<ShareStatus, ShareError> {
        let handle = self.handle(token)?;
        let mut share = handle.lock().await;
        self.apply_expiry(&mut share).await?;
        let now = self.now();

        if share.state != ShareState::Active {
            return Err(ShareError::InvalidState(format!(
                "cannot notify for a share that is {}",
                share.state
            )));
        }

        let mut next = share.clone();
        if let Some(recipient) = recipient_email.map(str::trim).filter(|r| !r.is_empty()) {
            next.recipient_email = recipient.to_string();
            next.expires_at = now + Duration::hours(self.inner.config.default_retention_hours);
        }
        if next.recipient_email.is_empty() {
            return Err(ShareError::InvalidState("share has no recipient".into()));
        }
        next.notification = NotificationStatus::Queued;
        self.commit(&mut share, next).await?;

        let status = ShareStatus::from(&*share);
        let notification = self.notification_for(&share);
        drop(share);
        self.spawn_notification(notification);

        Ok(status)
    }

    /// Page through shares, newest first
    pub async fn list(&self, page: usize, per_page: usize) -> SharePage {
        let page = page.max(1);
        let per_page = per_page.clamp(1, 100);

        let mut statuses = Vec::new();
        for (_, handle) in self.handles() {
            let share = handle.lock().await;
            statuses.push(ShareStatus::from(&*share));
        }
        statuses.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = statuses.len();
        let items = statuses
            .into_iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .collect();

        SharePage {
            page,
            per_page,
            total,
            pages: total.div_ceil(per_page),
            items,
        }
    }

    // ========================================================================
    // Crate Internals
    // ========================================================================

    pub(crate) fn handle(&self, token: &str) -> Result<ShareHandle, ShareError> {
        self.inner
            .shares
            .read()
            .get(token)
            .cloned()
            .ok_or_else(|| ShareError::NotFound(format!("share {}", token_prefix(token))))
    }

    /// Snapshot of every handle
    pub(crate) fn handles(&self) -> Vec<(String, ShareHandle)> {
        self.inner
            .shares
            .read()
            .iter()
            .map(|(token, handle)| (token.clone(), handle.clone()))
            .collect()
    }

    pub(crate) fn contains(&self, token: &str) -> bool {
        self.inner.shares.read().contains_key(token)
    }

    pub(crate) fn storage(&self) -> &RetryingStorage {
        &self.inner.storage
    }

    pub(crate) async fn persist(&self, share: &Share) -> Result<(), ShareError> {
        if let Some(repository) = &self.inner.repository {
            repository.upsert(share).await?;
        }
        Ok(())
    }

    /// Persist `next` and swap it into `slot`
    pub(crate) async fn commit(&self, slot: &mut Share, next: Share) -> Result<(), ShareError> {
        self.persist(&next).await?;
        *slot = next;
        Ok(())
    }

    /// Move an Active share past its expiry to Expired
    pub(crate) async fn apply_expiry(&self, share: &mut Share) -> Result<bool, ShareError> {
        let now = self.now();
        if share.state != ShareState::Active || !share.is_past_expiry(now) {
            return Ok(false);
        }

        let mut next = share.clone();
        next.refresh_expiry(now);
        self.commit(share, next).await?;

        tracing::info!(
            token = %share.token_prefix(),
            expired_at = %share.expires_at,
            "Share expired"
        );
        Ok(true)
    }

    /// Remove the share's stored and staged bytes and release its quota
    pub(crate) async fn reclaim_files(&self, share: &mut Share) -> Result<usize, ShareError> {
        let storage = self.storage();
        let mut removed = storage.delete_prefix(&storage::share_dir(&share.token)).await?;
        removed += storage
            .delete_prefix(&storage::staging_share_dir(&share.token))
            .await?;

        let mut next = share.clone();
        self.release(next.bytes_used);
        next.bytes_used = 0;
        next.files_reclaimed = true;
        self.commit(share, next).await?;

        Ok(removed)
    }

    /// Drop records from memory and the repository
    pub(crate) async fn forget(&self, token: &str) -> Result<(), ShareError> {
        if let Some(repository) = &self.inner.repository {
            repository.remove(token).await?;
        }
        self.inner.shares.write().remove(token);
        Ok(())
    }

    /// Reserve `bytes` against the global quota
    pub(crate) fn try_reserve(&self, bytes: u64) -> bool {
        let max = self.inner.config.max_total_bytes;
        self.inner
            .usage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_add(bytes).filter(|total| *total <= max)
            })
            .is_ok()
    }

    pub(crate) fn release(&self, bytes: u64) {
        let _ = self
            .inner
            .usage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    fn notification_for(&self, share: &Share) -> ShareNotification {
        ShareNotification {
            token: share.token.clone(),
            recipient_email: share.recipient_email.clone(),
            download_url: self.inner.config.download_url(&share.token),
            file_count: share.files.len(),
            expires_at: share.expires_at,
        }
    }

    /// Deliver in the background and record the outcome on the share
    fn spawn_notification(&self, notification: ShareNotification) {
        let registry = self.clone();
        tokio::spawn(async move {
            let outcome = registry.inner.notifier.notify(&notification).await;
            registry.record_notification(&notification.token, outcome).await;
        });
    }

    async fn record_notification(&self, token: &str, outcome: Result<(), NotifyError>) {
        let now = self.now();
        let status = match outcome {
            Ok(()) => {
                tracing::info!(token = %token_prefix(token), "Recipient notified");
                NotificationStatus::Sent { at: now }
            }
            Err(e) => {
                tracing::warn!(token = %token_prefix(token), error = %e, "Recipient notification failed");
                NotificationStatus::Failed {
                    at: now,
                    error: e.to_string(),
                }
            }
        };

        let Ok(handle) = self.handle(token) else {
            return;
        };
        let mut share = handle.lock().await;
        let mut next = share.clone();
        next.notification = status;
        if let Err(e) = self.commit(&mut share, next).await {
            tracing::error!(token = %token_prefix(token), error = %e, "Failed to record notification outcome");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
