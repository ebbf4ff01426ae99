//! Download tracking and file serving for Active shares

use std::io::{Cursor, Write};

use chrono::{DateTime, Utc};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::storage::{self, Storage, StorageError};

use super::registry::ShareRegistry;
use super::types::{FileEntry, Share, ShareError, ShareState};

/// A stored file ready to send
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub stored_name: String,
    pub content_type: String,
    pub sha256: Option<String>,
    pub bytes: Vec<u8>,
}

/// Every file of a share in one ZIP archive
#[derive(Debug, Clone)]
pub struct ShareBundle {
    pub filename: String,
    pub file_count: usize,
    pub bytes: Vec<u8>,
}

/// Serves files of Active shares and counts downloads
#[derive(Clone)]
pub struct DownloadTracker {
    registry: ShareRegistry,
}

impl DownloadTracker {
    pub fn new(registry: ShareRegistry) -> Self {
        Self { registry }
    }

    /// Count one download of `file_id`
    pub async fn record_download(&self, token: &str, file_id: &str) -> Result<FileEntry, ShareError> {
        let handle = self.registry.handle(token)?;
        let mut share = handle.lock().await;
        self.ensure_downloadable(&mut share).await?;
        if share.file(file_id).is_none() {
            return Err(ShareError::NotFound(format!("file {}", file_id)));
        }

        let now = self.registry.now();
        let mut next = share.clone();
        if let Some(file) = next.file_mut(file_id) {
            mark_downloaded(file, now);
        }
        self.registry.commit(&mut share, next).await?;

        let file = share
            .file(file_id)
            .cloned()
            .ok_or_else(|| ShareError::NotFound(format!("file {}", file_id)))?;

        tracing::debug!(
            token = %share.token_prefix(),
            file_id = %file_id,
            downloads = file.download_count,
            "Download recorded"
        );

        Ok(file)
    }

    /// Read a stored file and count the download
    pub async fn open_file(&self, token: &str, file_id: &str) -> Result<DownloadedFile, ShareError> {
        let file = {
            let handle = self.registry.handle(token)?;
            let mut share = handle.lock().await;
            self.ensure_downloadable(&mut share).await?;
            share
                .file(file_id)
                .cloned()
                .ok_or_else(|| ShareError::NotFound(format!("file {}", file_id)))?
        };

        let bytes = self.read_stored(token, &file.stored_name).await?;
        let file = self.record_download(token, file_id).await?;

        Ok(DownloadedFile {
            content_type: mime_guess::from_path(&file.stored_name)
                .first_or_octet_stream()
                .to_string(),
            stored_name: file.stored_name,
            sha256: file.sha256,
            bytes,
        })
    }

    /// Pack every file of the share into a ZIP archive, counting one download per file
    pub async fn open_bundle(&self, token: &str) -> Result<ShareBundle, ShareError> {
        let files = {
            let handle = self.registry.handle(token)?;
            let mut share = handle.lock().await;
            self.ensure_downloadable(&mut share).await?;
            share.files.clone()
        };

        let mut contents = Vec::with_capacity(files.len());
        for file in &files {
            let bytes = self.read_stored(token, &file.stored_name).await?;
            contents.push((file.stored_name.clone(), bytes));
        }

        let file_count = contents.len();
        let bytes = tokio::task::spawn_blocking(move || build_zip(contents))
            .await
            .map_err(|e| ShareError::StorageIo(format!("bundle task failed: {}", e)))??;

        // Count the whole bundle under one lock
        let handle = self.registry.handle(token)?;
        let mut share = handle.lock().await;
        self.ensure_downloadable(&mut share).await?;
        let now = self.registry.now();
        let mut next = share.clone();
        for file in next.files.iter_mut() {
            mark_downloaded(file, now);
        }
        self.registry.commit(&mut share, next).await?;

        tracing::info!(
            token = %share.token_prefix(),
            files = file_count,
            size = bytes.len(),
            "Bundle downloaded"
        );

        Ok(ShareBundle {
            filename: format!("share-{}.zip", share.token_prefix()),
            file_count,
            bytes,
        })
    }

    async fn ensure_downloadable(&self, share: &mut Share) -> Result<(), ShareError> {
        self.registry.apply_expiry(share).await?;
        match share.state {
            ShareState::Active => Ok(()),
            ShareState::Pending => Err(ShareError::NotAvailable(
                "share has not been finalized".into(),
            )),
            ShareState::Expired => Err(ShareError::NotAvailable("share has expired".into())),
            ShareState::Deleted => Err(ShareError::NotAvailable("share was deleted".into())),
        }
    }

    async fn read_stored(&self, token: &str, stored_name: &str) -> Result<Vec<u8>, ShareError> {
        let path = storage::stored_file_path(token, stored_name);
        match self.registry.storage().read(&path).await {
            Ok(bytes) => Ok(bytes),
            // Reclaimed between the state check and the read
            Err(StorageError::NotFound(_)) => Err(ShareError::NotAvailable(format!(
                "{} is no longer available",
                stored_name
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

fn mark_downloaded(file: &mut FileEntry, now: DateTime<Utc>) {
    file.download_count += 1;
    file.last_downloaded_at = Some(now);
}

fn build_zip(contents: Vec<(String, Vec<u8>)>) -> Result<Vec<u8>, ShareError> {
    let zip_error = |e: zip::result::ZipError| ShareError::StorageIo(format!("zip: {}", e));

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, bytes) in contents {
        writer.start_file(name, options).map_err(zip_error)?;
        writer
            .write_all(&bytes)
            .map_err(|e| ShareError::StorageIo(format!("zip: {}", e)))?;
    }

    let cursor = writer.finish().map_err(zip_error)?;
    Ok(cursor.into_inner())
}
