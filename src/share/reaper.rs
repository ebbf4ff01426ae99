//! Expiry Reaper
//!
//! Periodic sweep that expires shares, reclaims their files, abandons stale
//! uploads, drops old records and removes directories nothing refers to.
//! A failure on one share is recorded in the report and never stops the pass.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::storage::{self, Storage, SHARES_ROOT, STAGING_ROOT};

use super::registry::{ShareHandle, ShareRegistry};
use super::types::{token_prefix, ShareError, ShareState};

/// A share the sweep could not process
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepFailure {
    pub token: String,
    pub error: String,
}

/// What one sweep did
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Active shares moved to Expired
    pub expired: usize,
    /// Shares whose files were removed
    pub reclaimed: usize,
    /// Stale Pending shares cleaned up
    pub abandoned: usize,
    /// Unreferenced directories removed
    pub orphans_purged: usize,
    /// Records dropped entirely
    pub purged_records: usize,
    pub errors: Vec<SweepFailure>,
}

impl SweepReport {
    fn fail(&mut self, token: &str, error: impl ToString) {
        self.errors.push(SweepFailure {
            token: token.to_string(),
            error: error.to_string(),
        });
    }
}

/// Runs lifecycle sweeps against a registry
#[derive(Clone)]
pub struct ExpiryReaper {
    registry: ShareRegistry,
}

impl ExpiryReaper {
    pub fn new(registry: ShareRegistry) -> Self {
        Self { registry }
    }

    /// Sweep at the registry clock's current time
    pub async fn sweep(&self) -> SweepReport {
        let now = self.registry.now();
        self.sweep_at(now).await
    }

    /// Sweep as of `now`
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for (token, handle) in self.registry.handles() {
            if let Err(e) = self.sweep_share(&handle, now, &mut report).await {
                tracing::warn!(token = %token_prefix(&token), error = %e, "Sweep failed for share");
                report.fail(&token, e);
            }
        }

        self.purge_orphans(&mut report).await;

        if report.expired + report.reclaimed + report.abandoned + report.purged_records + report.orphans_purged > 0
            || !report.errors.is_empty()
        {
            tracing::info!(
                expired = report.expired,
                reclaimed = report.reclaimed,
                abandoned = report.abandoned,
                orphans = report.orphans_purged,
                purged = report.purged_records,
                errors = report.errors.len(),
                "Sweep complete"
            );
        }

        report
    }

    async fn sweep_share(
        &self,
        handle: &ShareHandle,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), ShareError> {
        let config = self.registry.config();
        let mut share = handle.lock().await;

        if share.state == ShareState::Active && share.is_past_expiry(now) {
            let mut next = share.clone();
            next.transition(ShareState::Expired, now);
            self.registry.commit(&mut share, next).await?;
            report.expired += 1;
            tracing::info!(token = %share.token_prefix(), "Share expired");
        }

        let state = share.state;
        match state {
            ShareState::Expired if !share.files_reclaimed => {
                if now >= share.expires_at + config.reclaim_grace {
                    let removed = self.registry.reclaim_files(&mut share).await?;
                    report.reclaimed += 1;
                    tracing::info!(token = %share.token_prefix(), objects = removed, "Reclaimed expired share");
                }
            }
            ShareState::Deleted if !share.files_reclaimed => {
                let removed = self.registry.reclaim_files(&mut share).await?;
                report.reclaimed += 1;
                tracing::info!(token = %share.token_prefix(), objects = removed, "Reclaimed deleted share");
            }
            ShareState::Pending if now >= share.last_activity() + config.orphan_grace => {
                let mut next = share.clone();
                next.transition(ShareState::Deleted, now);
                self.registry.commit(&mut share, next).await?;
                self.registry.reclaim_files(&mut share).await?;
                report.abandoned += 1;
                tracing::info!(token = %share.token_prefix(), "Abandoned stale upload");
            }
            _ => {}
        }

        let finished = matches!(share.state, ShareState::Expired | ShareState::Deleted);
        if finished && share.files_reclaimed && now >= share.state_changed_at + config.purge_after {
            let token = share.token.clone();
            drop(share);
            self.registry.forget(&token).await?;
            report.purged_records += 1;
            tracing::debug!(token = %token_prefix(&token), "Purged share record");
        }

        Ok(())
    }

    /// Remove staging directories of non-Pending shares and share directories without records
    async fn purge_orphans(&self, report: &mut SweepReport) {
        let storage = self.registry.storage();

        match storage.list_children(STAGING_ROOT).await {
            Ok(children) => {
                for token in children {
                    // Held across the delete so no chunk lands in between
                    let handle = self.registry.handle(&token).ok();
                    let share = match &handle {
                        Some(handle) => Some(handle.lock().await),
                        None => None,
                    };
                    if share.as_ref().is_some_and(|s| s.state == ShareState::Pending) {
                        continue;
                    }

                    match storage.delete_prefix(&storage::staging_share_dir(&token)).await {
                        Ok(_) => {
                            report.orphans_purged += 1;
                            tracing::debug!(token = %token_prefix(&token), "Removed orphaned staging directory");
                        }
                        Err(e) => report.fail(&token, e),
                    }
                }
            }
            Err(e) => report.fail(STAGING_ROOT, e),
        }

        match storage.list_children(SHARES_ROOT).await {
            Ok(children) => {
                for token in children.into_iter().filter(|t| !self.registry.contains(t)) {
                    match storage.delete_prefix(&storage::share_dir(&token)).await {
                        Ok(_) => {
                            report.orphans_purged += 1;
                            tracing::debug!(token = %token_prefix(&token), "Removed orphaned share directory");
                        }
                        Err(e) => report.fail(&token, e),
                    }
                }
            }
            Err(e) => report.fail(SHARES_ROOT, e),
        }
    }

    /// Sweep every `interval` until the task is aborted
    pub fn start(self, interval: StdDuration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let report = self.sweep().await;
                if !report.errors.is_empty() {
                    tracing::warn!(errors = report.errors.len(), "Sweep finished with errors");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::test_support::{build_registry, build_registry_with, chunk, test_config, upload_file, Harness};
    use crate::share::{ChunkAssembler, LifecycleConfig};
    use crate::notify::RecordingNotifier;
    use crate::clock::{Clock, ManualClock};
    use crate::storage::{MemoryStorage, Storage, StorageError};
    use tokio::sync::oneshot;
    use chrono::Duration;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sweep_expires_and_reclaims() {
        let Harness { registry, assembler, reaper, storage, clock, .. } = build_registry();
        let token = registry.create("a@example.com", 1).await.unwrap();
        upload_file(&assembler, &token, "f1", "a.txt", &[b"data"]).await;
        registry.finalize(&token).await.unwrap();

        let report = reaper.sweep().await;
        assert_eq!(report.expired, 0);

        clock.advance(Duration::hours(1) + Duration::seconds(1));
        let report = reaper.sweep().await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.reclaimed, 1);
        assert!(report.errors.is_empty());

        let share = registry.lookup(&token).await.unwrap();
        assert_eq!(share.state, ShareState::Expired);
        assert!(share.files_reclaimed);
        assert!(storage.paths_under(&storage::share_dir(&token)).is_empty());
        assert_eq!(registry.usage_bytes(), 0);

        assert!(matches!(
            registry.reactivate(&token, clock.now() + Duration::hours(1)).await,
            Err(ShareError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_reclaim_grace_allows_reactivation() {
        let config = LifecycleConfig {
            reclaim_grace: Duration::hours(6),
            ..test_config()
        };
        let Harness { registry, assembler, reaper, clock, downloads, .. } =
            build_registry_with(config, Arc::new(RecordingNotifier::new()));
        let token = registry.create("a@example.com", 1).await.unwrap();
        upload_file(&assembler, &token, "f1", "a.txt", &[b"data"]).await;
        registry.finalize(&token).await.unwrap();

        clock.advance(Duration::hours(2));
        let report = reaper.sweep().await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.reclaimed, 0);

        registry
            .reactivate(&token, clock.now() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(downloads.open_file(&token, "f1").await.unwrap().bytes, b"data");
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_the_pass() {
        let Harness { registry, assembler, reaper, storage, clock, .. } = build_registry();

        let mut tokens = Vec::new();
        for n in 0..3 {
            let token = registry.create("a@example.com", 1).await.unwrap();
            upload_file(&assembler, &token, "f1", &format!("{}.txt", n), &[b"data"]).await;
            registry.finalize(&token).await.unwrap();
            tokens.push(token);
        }
        storage.fail_deletes_under(storage::share_dir(&tokens[1]));

        clock.advance(Duration::hours(2));
        let report = reaper.sweep().await;
        assert_eq!(report.expired, 3);
        assert_eq!(report.reclaimed, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].token, tokens[1]);

        let stuck = registry.lookup(&tokens[1]).await.unwrap();
        assert_eq!(stuck.state, ShareState::Expired);
        assert!(!stuck.files_reclaimed);
        for token in [&tokens[0], &tokens[2]] {
            assert!(registry.lookup(token).await.unwrap().files_reclaimed);
        }
    }

    #[tokio::test]
    async fn test_failed_delete_is_retried_by_sweep() {
        let Harness { registry, assembler, reaper, storage, .. } = build_registry();
        let token = registry.create("a@example.com", 24).await.unwrap();
        upload_file(&assembler, &token, "f1", "a.txt", &[b"data"]).await;
        registry.finalize(&token).await.unwrap();

        storage.fail_deletes_under(storage::share_dir(&token));
        registry.delete(&token).await.unwrap();
        let share = registry.lookup(&token).await.unwrap();
        assert_eq!(share.state, ShareState::Deleted);
        assert!(!share.files_reclaimed);

        let report = reaper.sweep().await;
        assert_eq!(report.reclaimed, 0);
        assert_eq!(report.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_pending_share_kept_until_orphan_grace() {
        let Harness { registry, assembler, reaper, storage, clock, .. } = build_registry();
        let token = registry.create("a@example.com", 48).await.unwrap();
        assembler
            .receive_chunk(&token, chunk("f1", "a.bin", 1, 2, b"half"))
            .await
            .unwrap();

        clock.advance(Duration::hours(23));
        let report = reaper.sweep().await;
        assert_eq!(report.abandoned, 0);
        assert_eq!(report.orphans_purged, 0);
        assert!(!storage.paths_under(&storage::staging_share_dir(&token)).is_empty());

        clock.advance(Duration::hours(2));
        let report = reaper.sweep().await;
        assert_eq!(report.abandoned, 1);

        let share = registry.lookup(&token).await.unwrap();
        assert_eq!(share.state, ShareState::Deleted);
        assert!(storage.paths_under(&storage::staging_share_dir(&token)).is_empty());
        assert_eq!(registry.usage_bytes(), 0);
    }

    #[tokio::test]
    async fn test_orphaned_directories_removed() {
        let Harness { registry, reaper, storage, .. } = build_registry();
        let pending = registry.create("a@example.com", 24).await.unwrap();

        storage.write("shares/ghost/file.txt", b"x").await.unwrap();
        storage.write("staging/ghost/f1/00001.chunk", b"x").await.unwrap();
        storage
            .write(&storage::chunk_path(&pending, "f1", 1), b"x")
            .await
            .unwrap();

        let report = reaper.sweep().await;
        assert_eq!(report.orphans_purged, 2);
        assert!(!storage.exists("shares/ghost/file.txt").await.unwrap());
        assert!(!storage.exists("staging/ghost/f1/00001.chunk").await.unwrap());
        assert!(storage
            .exists(&storage::chunk_path(&pending, "f1", 1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_old_records_purged() {
        let Harness { registry, assembler, reaper, clock, .. } = build_registry();
        let token = registry.create("a@example.com", 1).await.unwrap();
        upload_file(&assembler, &token, "f1", "a.txt", &[b"data"]).await;
        registry.finalize(&token).await.unwrap();

        clock.advance(Duration::hours(2));
        reaper.sweep().await;
        assert_eq!(registry.share_count(), 1);

        clock.advance(Duration::days(31));
        let report = reaper.sweep().await;
        assert_eq!(report.purged_records, 1);
        assert!(matches!(
            registry.lookup(&token).await,
            Err(ShareError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_background_task_sweeps() {
        let Harness { registry, assembler, reaper, clock, .. } = build_registry();
        let token = registry.create("a@example.com", 1).await.unwrap();
        upload_file(&assembler, &token, "f1", "a.txt", &[b"data"]).await;
        registry.finalize(&token).await.unwrap();
        clock.advance(Duration::hours(2));

        let task = reaper.start(StdDuration::from_millis(20));
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        task.abort();

        let share = registry.lookup(&token).await.unwrap();
        assert_eq!(share.state, ShareState::Expired);
        assert!(share.files_reclaimed);
    }

    #[tokio::test]
    async fn test_active_upload_outlives_orphan_grace() {
        let Harness { registry, assembler, reaper, clock, .. } = build_registry();
        let token = registry.create("a@example.com", 72).await.unwrap();

        // Each chunk lands just inside the grace of the previous one
        for index in 1..=3 {
            assembler
                .receive_chunk(&token, chunk("f1", "a.bin", index, 4, b"part"))
                .await
                .unwrap();
            clock.advance(Duration::hours(23) + Duration::minutes(55));
            let report = reaper.sweep().await;
            assert_eq!(report.abandoned, 0);
            assert_eq!(report.orphans_purged, 0);
        }

        let receipt = assembler
            .receive_chunk(&token, chunk("f1", "a.bin", 4, 4, b"part"))
            .await
            .unwrap();
        assert!(receipt.complete);
        assert_eq!(
            registry.finalize(&token).await.unwrap().state,
            ShareState::Active
        );
    }

    #[tokio::test]
    async fn test_idle_upload_abandoned_after_last_chunk() {
        let Harness { registry, assembler, reaper, clock, .. } = build_registry();
        let token = registry.create("a@example.com", 72).await.unwrap();

        clock.advance(Duration::hours(20));
        assembler
            .receive_chunk(&token, chunk("f1", "a.bin", 1, 2, b"part"))
            .await
            .unwrap();

        clock.advance(Duration::hours(23));
        assert_eq!(reaper.sweep().await.abandoned, 0);

        clock.advance(Duration::hours(2));
        assert_eq!(reaper.sweep().await.abandoned, 1);
        assert_eq!(
            registry.lookup(&token).await.unwrap().state,
            ShareState::Deleted
        );
    }

    /// Pauses the first staging listing until the test lets it continue
    struct PausedListing {
        inner: MemoryStorage,
        entered: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
        resume: tokio::sync::Mutex<Option<oneshot::Receiver<()>>>,
    }

    #[async_trait::async_trait]
    impl Storage for PausedListing {
        async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
            self.inner.write(path, bytes).await
        }

        async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
            self.inner.read(path).await
        }

        async fn append(&self, path: &str, bytes: &[u8]) -> Result<u64, StorageError> {
            self.inner.append(path, bytes).await
        }

        async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
            self.inner.rename(from, to).await
        }

        async fn delete(&self, path: &str) -> Result<(), StorageError> {
            self.inner.delete(path).await
        }

        async fn exists(&self, path: &str) -> Result<bool, StorageError> {
            self.inner.exists(path).await
        }

        async fn delete_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
            self.inner.delete_prefix(prefix).await
        }

        async fn list_children(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
            if prefix == STAGING_ROOT {
                if let Some(entered) = self.entered.lock().take() {
                    let _ = entered.send(());
                }
                let resume = self.resume.lock().await.take();
                if let Some(resume) = resume {
                    let _ = resume.await;
                }
            }
            self.inner.list_children(prefix).await
        }
    }

    #[tokio::test]
    async fn test_staging_of_share_created_mid_sweep_survives() {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (resume_tx, resume_rx) = oneshot::channel();
        let storage = Arc::new(PausedListing {
            inner: MemoryStorage::new(),
            entered: parking_lot::Mutex::new(Some(entered_tx)),
            resume: tokio::sync::Mutex::new(Some(resume_rx)),
        });
        let registry = ShareRegistry::new(
            test_config(),
            storage,
            Arc::new(ManualClock::starting_now()),
            Arc::new(RecordingNotifier::new()),
        );
        let assembler = ChunkAssembler::new(registry.clone());
        let reaper = ExpiryReaper::new(registry.clone());

        let sweep = tokio::spawn(async move { reaper.sweep().await });
        entered_rx.await.unwrap();

        let token = registry.create("a@example.com", 24).await.unwrap();
        assembler
            .receive_chunk(&token, chunk("f1", "a.bin", 1, 2, b"first "))
            .await
            .unwrap();

        resume_tx.send(()).unwrap();
        let report = sweep.await.unwrap();
        assert_eq!(report.orphans_purged, 0);

        let receipt = assembler
            .receive_chunk(&token, chunk("f1", "a.bin", 2, 2, b"second"))
            .await
            .unwrap();
        assert!(receipt.complete);
        registry.finalize(&token).await.unwrap();
    }
}
