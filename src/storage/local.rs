//! Local filesystem storage

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::types::{validate_path, Storage, StorageError};

/// Filesystem-backed storage rooted at the upload folder
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        validate_path(path)?;
        Ok(path.split('/').fold(self.base_path.clone(), |acc, seg| acc.join(seg)))
    }
}

fn map_io(path: &str, e: std::io::Error) -> StorageError {
    // ENOSPC / EDQUOT
    if matches!(e.raw_os_error(), Some(28) | Some(122)) {
        return StorageError::Full(format!("{}: {}", path, e));
    }
    match e.kind() {
        std::io::ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
        _ => StorageError::Io(format!("{}: {}", path, e)),
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        use tokio::io::AsyncWriteExt;

        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(path, e))?;
        }

        // Write beside the target and rename so readers never see a torn file.
        // Stored names never start with a dot, so the temp name cannot collide.
        let tmp = temp_path(&target);
        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &target).await
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(map_io(path, e));
        }
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let target = self.resolve(path)?;
        tokio::fs::read(&target).await.map_err(|e| map_io(path, e))
    }

    async fn append(&self, path: &str, bytes: &[u8]) -> Result<u64, StorageError> {
        use tokio::io::AsyncWriteExt;

        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(path, e))?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&target)
            .await
            .map_err(|e| map_io(path, e))?;
        file.write_all(bytes).await.map_err(|e| map_io(path, e))?;
        file.sync_data().await.map_err(|e| map_io(path, e))?;
        let len = file.metadata().await.map_err(|e| map_io(path, e))?.len();
        Ok(len)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(to, e))?;
        }
        tokio::fs::rename(&source, &target)
            .await
            .map_err(|e| map_io(from, e))
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io(path, e)),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let target = self.resolve(path)?;
        tokio::fs::try_exists(&target)
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let target = self.resolve(prefix)?;
        let label = prefix.to_string();

        tokio::task::spawn_blocking(move || -> Result<usize, StorageError> {
            let meta = match std::fs::symlink_metadata(&target) {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
                Err(e) => return Err(map_io(&label, e)),
            };

            if meta.is_dir() {
                let count = count_files(&target).map_err(|e| map_io(&label, e))?;
                std::fs::remove_dir_all(&target).map_err(|e| map_io(&label, e))?;
                Ok(count)
            } else {
                std::fs::remove_file(&target).map_err(|e| map_io(&label, e))?;
                Ok(1)
            }
        })
        .await
        .map_err(|e| StorageError::Io(format!("delete task failed: {}", e)))?
    }

    async fn list_children(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let target = self.resolve(prefix)?;

        let mut entries = match tokio::fs::read_dir(&target).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(map_io(prefix, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| map_io(prefix, e))? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// `.<name>.<random>.tmp` in the target's directory, unique per write
fn temp_path(target: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::from(".");
    name.push(target.file_name().unwrap_or_default());
    name.push(format!(".{:016x}.tmp", rand::random::<u64>()));
    target.with_file_name(name)
}

fn count_files(dir: &Path) -> std::io::Result<usize> {
    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            count += count_files(&entry.path())?;
        } else {
            count += 1;
        }
    }
    Ok(count)
}
