//! Chunk Assembler
//!
//! Accepts chunks for Pending shares and assembles each file once its last
//! chunk arrives.
//!
//! A chunk goes through three steps:
//! 1. admit: under the share lock, check state and quotas and reserve the bytes
//! 2. write: store the payload in staging without holding any lock
//! 3. settle: under the share lock again, mark the chunk received and, if the
//!    file is now complete, assemble it
//!
//! Chunks of different files in the same share therefore write in parallel,
//! while marking and assembly stay serialized per share.

use sha2::{Digest, Sha256};

use crate::storage::{self, Storage, StorageError};

use super::names::NameResolver;
use super::registry::ShareRegistry;
use super::types::{
    ChunkReceipt, ChunkUpload, FileEntry, Share, ShareError, ShareState, MAX_FILE_ID_LEN,
};

/// Upper bound on chunks per file
pub const MAX_TOTAL_CHUNKS: u32 = 100_000;

/// Receives chunks and assembles completed files
#[derive(Clone)]
pub struct ChunkAssembler {
    registry: ShareRegistry,
}

impl ChunkAssembler {
    pub fn new(registry: ShareRegistry) -> Self {
        Self { registry }
    }

    /// Store one chunk, assembling its file when it is the last missing one
    ///
    /// Resending a chunk is safe: the receipt is the same and nothing is
    /// counted twice.
    pub async fn receive_chunk(&self, token: &str, upload: ChunkUpload) -> Result<ChunkReceipt, ShareError> {
        let config = self.registry.config();
        validate_upload(&upload)?;

        let size = upload.payload.len() as u64;
        if size > config.max_chunk_size {
            return Err(ShareError::ChunkTooLarge {
                size,
                max: config.max_chunk_size,
            });
        }

        let handle = self.registry.handle(token)?;

        // Admit
        {
            let mut share = handle.lock().await;
            self.ensure_accepting(&share)?;

            if let Some(file) = share.file(&upload.file_id) {
                check_total(file, &upload)?;
                if file.is_complete() && file.is_assembled() {
                    return Ok(receipt(file, upload.chunk_index));
                }
            }

            let projected = share.bytes_used + share.in_flight_bytes + size;
            if projected > config.max_share_bytes {
                return Err(ShareError::StorageFull(format!(
                    "share quota of {} bytes exceeded",
                    config.max_share_bytes
                )));
            }
            if !self.registry.try_reserve(size) {
                return Err(ShareError::StorageFull(format!(
                    "global quota of {} bytes exceeded",
                    config.max_total_bytes
                )));
            }
            share.in_flight_bytes += size;
        }

        // Write
        let path = storage::chunk_path(token, &upload.file_id, upload.chunk_index);
        let written = self.registry.storage().write(&path, &upload.payload).await;

        // Settle
        let mut share = handle.lock().await;
        share.in_flight_bytes = share.in_flight_bytes.saturating_sub(size);

        if let Err(e) = written {
            self.registry.release(size);
            tracing::warn!(
                token = %share.token_prefix(),
                file_id = %upload.file_id,
                chunk = upload.chunk_index,
                error = %e,
                "Chunk write failed"
            );
            return Err(e.into());
        }

        // The share may have been finalized, deleted or expired during the write
        if let Err(e) = self.ensure_accepting(&share) {
            self.registry.release(size);
            self.discard(&path).await;
            return Err(e);
        }

        let mut next = share.clone();
        let file = match next.files.iter().position(|f| f.file_id == upload.file_id) {
            Some(position) => &mut next.files[position],
            None => {
                let stored_name = NameResolver::resolve(&next, &upload.original_name);
                next.files.push(FileEntry::new(
                    upload.file_id.clone(),
                    stored_name,
                    upload.original_name.clone(),
                    upload.total_chunks,
                ));
                let last = next.files.len() - 1;
                &mut next.files[last]
            }
        };

        if let Err(e) = check_total(file, &upload) {
            self.registry.release(size);
            self.discard(&path).await;
            return Err(e);
        }

        // A concurrent resend already completed and assembled this file
        if file.is_assembled() {
            let done = receipt(file, upload.chunk_index);
            self.registry.release(size);
            self.discard(&path).await;
            return Ok(done);
        }

        let previous = file.chunks_received.insert(upload.chunk_index, size);
        let complete = file.is_complete();
        let file_id = file.file_id.clone();

        if let Some(previous) = previous {
            next.bytes_used = next.bytes_used.saturating_sub(previous);
            self.registry.release(previous);
        }
        next.bytes_used += size;
        next.last_chunk_at = Some(self.registry.now());

        if let Err(e) = self.registry.commit(&mut share, next).await {
            // Quota accounting follows the committed record
            self.registry.release(size);
            if let Some(previous) = previous {
                self.registry.try_reserve(previous);
            }
            return Err(e);
        }

        tracing::debug!(
            token = %share.token_prefix(),
            file_id = %file_id,
            chunk = upload.chunk_index,
            total = upload.total_chunks,
            bytes = size,
            "Chunk stored"
        );

        if complete {
            self.assemble(&mut share, &file_id).await?;
        }

        match share.file(&file_id) {
            Some(file) => Ok(receipt(file, upload.chunk_index)),
            None => Err(ShareError::NotFound(format!("file {}", file_id))),
        }
    }

    /// Concatenate a complete file's chunks into its stored file
    ///
    /// Chunks are appended one at a time to a file in staging, which is then
    /// moved under the share's directory.
    async fn assemble(&self, share: &mut Share, file_id: &str) -> Result<(), ShareError> {
        let Some(file) = share.file(file_id).cloned() else {
            return Err(ShareError::NotFound(format!("file {}", file_id)));
        };
        let storage = self.registry.storage();
        let partial = storage::assembly_path(&share.token, file_id);

        // Leftover from an interrupted attempt
        storage.delete(&partial).await?;

        let expected = file.staged_bytes();
        let mut hasher = Sha256::new();
        let mut written = 0;
        let mut missing = Vec::new();

        for index in 1..=file.total_chunks {
            let path = storage::chunk_path(&share.token, file_id, index);
            if !missing.is_empty() {
                if !storage.exists(&path).await? {
                    missing.push(index);
                }
                continue;
            }
            match storage.read(&path).await {
                Ok(chunk) => {
                    hasher.update(&chunk);
                    written = storage.append(&partial, &chunk).await?;
                }
                Err(StorageError::NotFound(_)) => missing.push(index),
                Err(e) => return Err(e.into()),
            }
        }

        if !missing.is_empty() {
            self.discard(&partial).await;
            return self.forget_chunks(share, file_id, &missing).await;
        }

        if written != expected {
            tracing::error!(
                token = %share.token_prefix(),
                file_id = %file_id,
                expected = expected,
                actual = written,
                "Assembled size does not match staged chunks"
            );
            self.discard(&partial).await;
            return Err(ShareError::StorageIo(format!(
                "assembled {} bytes, expected {}",
                written, expected
            )));
        }

        storage
            .rename(&partial, &storage::stored_file_path(&share.token, &file.stored_name))
            .await?;

        let now = self.registry.now();
        let sha256 = hex::encode(hasher.finalize());

        let mut next = share.clone();
        if let Some(entry) = next.file_mut(file_id) {
            entry.size_bytes = written;
            entry.sha256 = Some(sha256.clone());
            entry.assembled_at = Some(now);
        }
        self.registry.commit(share, next).await?;

        tracing::info!(
            token = %share.token_prefix(),
            file_id = %file_id,
            stored_name = %file.stored_name,
            size = written,
            sha256 = %sha256,
            "File assembled"
        );

        let staging = storage::staging_file_dir(&share.token, file_id);
        if let Err(e) = storage.delete_prefix(&staging).await {
            tracing::warn!(
                token = %share.token_prefix(),
                file_id = %file_id,
                error = %e,
                "Failed to clear staged chunks"
            );
        }

        Ok(())
    }

    /// Unmark chunks whose staged data is gone so the client is asked to resend them
    async fn forget_chunks(&self, share: &mut Share, file_id: &str, missing: &[u32]) -> Result<(), ShareError> {
        let mut next = share.clone();
        let mut released = 0;
        if let Some(entry) = next.file_mut(file_id) {
            for index in missing {
                released += entry.chunks_received.remove(index).unwrap_or(0);
            }
        }
        next.bytes_used = next.bytes_used.saturating_sub(released);
        self.registry.commit(share, next).await?;
        self.registry.release(released);

        tracing::warn!(
            token = %share.token_prefix(),
            file_id = %file_id,
            missing = ?missing,
            "Staged chunks missing at assembly"
        );
        Ok(())
    }

    fn ensure_accepting(&self, share: &Share) -> Result<(), ShareError> {
        if share.state != ShareState::Pending {
            return Err(ShareError::InvalidState(format!(
                "share is {} and no longer accepts chunks",
                share.state
            )));
        }
        if share.is_past_expiry(self.registry.now()) {
            return Err(ShareError::NotFound(format!(
                "share {} has expired",
                share.token_prefix()
            )));
        }
        Ok(())
    }

    async fn discard(&self, path: &str) {
        if let Err(e) = self.registry.storage().delete(path).await {
            tracing::debug!(path = %path, error = %e, "Failed to discard chunk");
        }
    }
}

fn receipt(file: &FileEntry, chunk_index: u32) -> ChunkReceipt {
    ChunkReceipt {
        file_id: file.file_id.clone(),
        stored_name: file.stored_name.clone(),
        chunk_index,
        chunks_received: file.chunks_received.len(),
        total_chunks: file.total_chunks,
        complete: file.is_complete() && file.is_assembled(),
    }
}

fn check_total(file: &FileEntry, upload: &ChunkUpload) -> Result<(), ShareError> {
    if file.total_chunks != upload.total_chunks {
        return Err(ShareError::InvalidChunk(format!(
            "file {} has {} chunks, request says {}",
            file.file_id, file.total_chunks, upload.total_chunks
        )));
    }
    Ok(())
}

fn validate_upload(upload: &ChunkUpload) -> Result<(), ShareError> {
    let id = &upload.file_id;
    if id.is_empty() || id.len() > MAX_FILE_ID_LEN {
        return Err(ShareError::InvalidChunk(format!(
            "file id must be 1 to {} characters",
            MAX_FILE_ID_LEN
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ShareError::InvalidChunk(format!("invalid file id: {}", id)));
    }
    if upload.total_chunks == 0 || upload.total_chunks > MAX_TOTAL_CHUNKS {
        return Err(ShareError::InvalidChunk(format!(
            "total chunks must be 1 to {}",
            MAX_TOTAL_CHUNKS
        )));
    }
    if upload.chunk_index == 0 || upload.chunk_index > upload.total_chunks {
        return Err(ShareError::InvalidChunk(format!(
            "chunk index {} outside 1..={}",
            upload.chunk_index, upload.total_chunks
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::test_support::{build_registry, build_registry_with, chunk, upload_file, Harness};
    use crate::share::LifecycleConfig;
    use crate::notify::RecordingNotifier;
    use crate::storage::Storage;
    use chrono::Duration;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_single_chunk_file_assembles() {
        let Harness { registry, assembler, storage, .. } = build_registry();
        let token = registry.create("a@example.com", 24).await.unwrap();

        let receipt = assembler
            .receive_chunk(&token, chunk("f1", "notes.txt", 1, 1, b"hello"))
            .await
            .unwrap();
        assert!(receipt.complete);
        assert_eq!(receipt.stored_name, "notes.txt");

        let share = registry.lookup(&token).await.unwrap();
        let file = share.file("f1").unwrap();
        assert_eq!(file.size_bytes, 5);
        assert_eq!(
            file.sha256.as_deref(),
            Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
        assert_eq!(
            storage
                .read(&storage::stored_file_path(&token, "notes.txt"))
                .await
                .unwrap(),
            b"hello"
        );
        assert!(storage.paths_under(&storage::staging_share_dir(&token)).is_empty());
    }

    #[tokio::test]
    async fn test_resend_is_idempotent() {
        let Harness { registry, assembler, .. } = build_registry();
        let token = registry.create("a@example.com", 24).await.unwrap();

        let first = assembler
            .receive_chunk(&token, chunk("f1", "a.bin", 1, 2, b"abcd"))
            .await
            .unwrap();
        let second = assembler
            .receive_chunk(&token, chunk("f1", "a.bin", 1, 2, b"abcd"))
            .await
            .unwrap();

        assert_eq!(first.chunks_received, 1);
        assert_eq!(second.chunks_received, 1);
        assert!(!second.complete);

        let share = registry.lookup(&token).await.unwrap();
        assert_eq!(share.bytes_used, 4);
        assert_eq!(registry.usage_bytes(), 4);

        // Resending after completion is acknowledged as complete
        assembler
            .receive_chunk(&token, chunk("f1", "a.bin", 2, 2, b"efgh"))
            .await
            .unwrap();
        let again = assembler
            .receive_chunk(&token, chunk("f1", "a.bin", 2, 2, b"efgh"))
            .await
            .unwrap();
        assert!(again.complete);
        assert_eq!(registry.lookup(&token).await.unwrap().bytes_used, 8);
    }

    #[tokio::test]
    async fn test_arrival_order_does_not_matter() {
        let orders: [[u32; 3]; 6] = [
            [1, 2, 3],
            [1, 3, 2],
            [2, 1, 3],
            [2, 3, 1],
            [3, 1, 2],
            [3, 2, 1],
        ];
        let parts: [&[u8]; 3] = [b"first-", b"second-", b"third"];

        for order in orders {
            let Harness { registry, assembler, storage, .. } = build_registry();
            let token = registry.create("a@example.com", 24).await.unwrap();

            for index in order {
                assembler
                    .receive_chunk(&token, chunk("doc", "doc.txt", index, 3, parts[index as usize - 1]))
                    .await
                    .unwrap();
            }

            let stored = storage
                .read(&storage::stored_file_path(&token, "doc.txt"))
                .await
                .unwrap();
            assert_eq!(stored, b"first-second-third", "order {:?}", order);
        }
    }

    #[tokio::test]
    async fn test_parallel_chunks_all_recorded() {
        let Harness { registry, assembler, storage, .. } = build_registry();
        let token = registry.create("a@example.com", 24).await.unwrap();
        let total = 16u32;

        let mut tasks = Vec::new();
        for index in 1..=total {
            let assembler = assembler.clone();
            let token = token.clone();
            tasks.push(tokio::spawn(async move {
                assembler
                    .receive_chunk(&token, chunk("big", "big.bin", index, total, &[index as u8; 32]))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let share = registry.lookup(&token).await.unwrap();
        let file = share.file("big").unwrap();
        assert_eq!(file.chunks_received.len(), total as usize);
        assert!(file.is_assembled());
        assert_eq!(file.size_bytes, 32 * total as u64);

        let stored = storage
            .read(&storage::stored_file_path(&token, "big.bin"))
            .await
            .unwrap();
        for (i, block) in stored.chunks(32).enumerate() {
            assert!(block.iter().all(|b| *b == (i + 1) as u8));
        }
    }

    #[tokio::test]
    async fn test_parallel_files_get_distinct_names() {
        let Harness { registry, assembler, .. } = build_registry();
        let token = registry.create("a@example.com", 24).await.unwrap();

        let mut tasks = Vec::new();
        for n in 0..5 {
            let assembler = assembler.clone();
            let token = token.clone();
            tasks.push(tokio::spawn(async move {
                assembler
                    .receive_chunk(&token, chunk(&format!("f{}", n), "report.pdf", 1, 1, b"pdf"))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let share = registry.lookup(&token).await.unwrap();
        let mut names: Vec<_> = share.files.iter().map(|f| f.stored_name.clone()).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "report (1).pdf",
                "report (2).pdf",
                "report (3).pdf",
                "report (4).pdf",
                "report.pdf"
            ]
        );
    }

    #[tokio::test]
    async fn test_chunk_too_large() {
        let config = LifecycleConfig {
            max_chunk_size: 8,
            ..crate::share::test_support::test_config()
        };
        let Harness { registry, assembler, .. } =
            build_registry_with(config, Arc::new(RecordingNotifier::new()));
        let token = registry.create("a@example.com", 24).await.unwrap();

        let result = assembler
            .receive_chunk(&token, chunk("f1", "a.bin", 1, 1, &[0u8; 9]))
            .await;
        assert!(matches!(result, Err(ShareError::ChunkTooLarge { size: 9, max: 8 })));
        assert!(registry.lookup(&token).await.unwrap().files.is_empty());
    }

    #[tokio::test]
    async fn test_share_quota() {
        let config = LifecycleConfig {
            max_share_bytes: 10,
            ..crate::share::test_support::test_config()
        };
        let Harness { registry, assembler, .. } =
            build_registry_with(config, Arc::new(RecordingNotifier::new()));
        let token = registry.create("a@example.com", 24).await.unwrap();

        assembler
            .receive_chunk(&token, chunk("f1", "a.bin", 1, 2, &[1u8; 6]))
            .await
            .unwrap();
        let result = assembler
            .receive_chunk(&token, chunk("f1", "a.bin", 2, 2, &[1u8; 6]))
            .await;
        assert!(matches!(result, Err(ShareError::StorageFull(_))));

        let share = registry.lookup(&token).await.unwrap();
        assert_eq!(share.bytes_used, 6);
        assert_eq!(registry.usage_bytes(), 6);
    }

    #[tokio::test]
    async fn test_global_quota_spans_shares() {
        let config = LifecycleConfig {
            max_total_bytes: 10,
            ..crate::share::test_support::test_config()
        };
        let Harness { registry, assembler, .. } =
            build_registry_with(config, Arc::new(RecordingNotifier::new()));
        let a = registry.create("a@example.com", 24).await.unwrap();
        let b = registry.create("b@example.com", 24).await.unwrap();

        upload_file(&assembler, &a, "f1", "a.bin", &[&[0u8; 8]]).await;
        let result = assembler
            .receive_chunk(&b, chunk("f1", "b.bin", 1, 1, &[0u8; 4]))
            .await;
        assert!(matches!(result, Err(ShareError::StorageFull(_))));

        registry.delete(&a).await.unwrap();
        assembler
            .receive_chunk(&b, chunk("f1", "b.bin", 1, 1, &[0u8; 4]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_backend_full_surfaces_as_storage_full() {
        let Harness { registry, assembler, storage, .. } = build_registry();
        let token = registry.create("a@example.com", 24).await.unwrap();
        storage.set_capacity(Some(4));

        let result = assembler
            .receive_chunk(&token, chunk("f1", "a.bin", 1, 1, &[0u8; 16]))
            .await;
        assert!(matches!(result, Err(ShareError::StorageFull(_))));
        assert_eq!(registry.usage_bytes(), 0);
    }

    #[tokio::test]
    async fn test_transient_write_failure_is_retried() {
        let Harness { registry, assembler, storage, .. } = build_registry();
        let token = registry.create("a@example.com", 24).await.unwrap();
        storage.fail_next_writes(2);

        let receipt = assembler
            .receive_chunk(&token, chunk("f1", "a.bin", 1, 1, b"data"))
            .await
            .unwrap();
        assert!(receipt.complete);
    }

    #[tokio::test]
    async fn test_rejects_non_pending_share() {
        let Harness { registry, assembler, .. } = build_registry();
        let token = registry.create("a@example.com", 24).await.unwrap();
        upload_file(&assembler, &token, "f1", "a.bin", &[b"data"]).await;
        registry.finalize(&token).await.unwrap();

        let result = assembler
            .receive_chunk(&token, chunk("f2", "b.bin", 1, 1, b"late"))
            .await;
        assert!(matches!(result, Err(ShareError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_rejects_expired_pending_share() {
        let Harness { registry, assembler, clock, .. } = build_registry();
        let token = registry.create("a@example.com", 1).await.unwrap();
        clock.advance(Duration::hours(2));

        let result = assembler
            .receive_chunk(&token, chunk("f1", "a.bin", 1, 1, b"late"))
            .await;
        assert!(matches!(result, Err(ShareError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_invalid_chunks() {
        let Harness { registry, assembler, .. } = build_registry();
        let token = registry.create("a@example.com", 24).await.unwrap();

        for bad in [
            chunk("f1", "a.bin", 0, 2, b"x"),
            chunk("f1", "a.bin", 3, 2, b"x"),
            chunk("f1", "a.bin", 1, 0, b"x"),
            chunk("../etc", "a.bin", 1, 1, b"x"),
            chunk("", "a.bin", 1, 1, b"x"),
            chunk(&"x".repeat(MAX_FILE_ID_LEN + 1), "a.bin", 1, 1, b"x"),
        ] {
            let result = assembler.receive_chunk(&token, bad).await;
            assert!(matches!(result, Err(ShareError::InvalidChunk(_))));
        }

        assembler
            .receive_chunk(&token, chunk("f1", "a.bin", 1, 2, b"x"))
            .await
            .unwrap();
        let result = assembler
            .receive_chunk(&token, chunk("f1", "a.bin", 2, 3, b"x"))
            .await;
        assert!(matches!(result, Err(ShareError::InvalidChunk(_))));
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let Harness { assembler, .. } = build_registry();
        let result = assembler
            .receive_chunk("missing", chunk("f1", "a.bin", 1, 1, b"x"))
            .await;
        assert!(matches!(result, Err(ShareError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_lost_staged_chunk_is_requested_again() {
        let Harness { registry, assembler, storage, .. } = build_registry();
        let token = registry.create("a@example.com", 24).await.unwrap();

        assembler
            .receive_chunk(&token, chunk("f1", "a.bin", 1, 2, b"first "))
            .await
            .unwrap();
        storage
            .delete(&storage::chunk_path(&token, "f1", 1))
            .await
            .unwrap();

        let receipt = assembler
            .receive_chunk(&token, chunk("f1", "a.bin", 2, 2, b"second"))
            .await
            .unwrap();
        assert!(!receipt.complete);
        assert_eq!(receipt.chunks_received, 1);
        assert_eq!(registry.usage_bytes(), 6);

        match registry.finalize(&token).await {
            Err(ShareError::IncompleteUpload(files)) => {
                assert_eq!(files[0].missing_chunks, vec![1]);
            }
            other => panic!("expected IncompleteUpload, got {:?}", other),
        }

        let receipt = assembler
            .receive_chunk(&token, chunk("f1", "a.bin", 1, 2, b"first "))
            .await
            .unwrap();
        assert!(receipt.complete);
        registry.finalize(&token).await.unwrap();
    }

    #[tokio::test]
    async fn test_chunk_refreshes_last_activity() {
        let Harness { registry, assembler, clock, .. } = build_registry();
        let token = registry.create("a@example.com", 24).await.unwrap();
        let created = registry.lookup(&token).await.unwrap().created_at;
        assert_eq!(registry.lookup(&token).await.unwrap().last_activity(), created);

        clock.advance(Duration::hours(3));
        assembler
            .receive_chunk(&token, chunk("f1", "a.bin", 1, 2, b"x"))
            .await
            .unwrap();
        assert_eq!(
            registry.lookup(&token).await.unwrap().last_activity(),
            created + Duration::hours(3)
        );
    }

    #[tokio::test]
    async fn test_assembly_ignores_leftover_partial() {
        let Harness { registry, assembler, storage, .. } = build_registry();
        let token = registry.create("a@example.com", 24).await.unwrap();
        storage
            .write(&storage::assembly_path(&token, "f1"), b"stale bytes")
            .await
            .unwrap();

        upload_file(&assembler, &token, "f1", "a.txt", &[b"one ", b"two"]).await;
        let share = registry.lookup(&token).await.unwrap();
        assert_eq!(share.file("f1").unwrap().size_bytes, 7);

        assert_eq!(
            storage
                .read(&storage::stored_file_path(&token, "a.txt"))
                .await
                .unwrap(),
            b"one two"
        );
        assert!(storage.paths_under(&storage::staging_file_dir(&token, "f1")).is_empty());
    }
}
