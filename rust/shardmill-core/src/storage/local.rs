// rust/shardmill-core/src/storage/local.rs

//! Local filesystem remote store.
//!
//! Objects live at `<root>/<bucket>/<key>`. This backend serves single-host
//! runs and shared filesystems (NFS, Lustre) where several machines see the
//! same tree. Uploads are written to a hidden temp file first and then moved
//! into place, so readers never observe a partial object.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs;

use super::traits::{ObjectInfo, PutOutcome, RemoteStore};
use crate::error::{Result, ShardmillError};
use crate::layout::RemotePath;

/// Prefix of in-flight upload files; they are never listed.
const TEMP_PREFIX: &str = ".shardmill-tmp-";

/// Local filesystem remote store.
#[derive(Debug, Clone)]
pub struct LocalStore {
    /// Directory whose first-level children are buckets.
    root: PathBuf,
}

impl LocalStore {
    /// Creates a new `LocalStore`, creating the root directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|e| {
            ShardmillError::store_with_source(
                root.display().to_string(),
                "failed to create store root",
                e,
            )
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a remote path to its file location.
    fn resolve_path(&self, path: &RemotePath) -> PathBuf {
        let mut full = self.root.join(&path.bucket);
        for part in path.key.split('/').filter(|p| !p.is_empty()) {
            full.push(part);
        }
        full
    }

    fn io_error(path: &RemotePath, message: &str, error: std::io::Error) -> ShardmillError {
        if error.kind() == std::io::ErrorKind::NotFound {
            ShardmillError::not_found(path.to_string())
        } else {
            ShardmillError::store_with_source(path.to_string(), message, error)
        }
    }

    /// Writes `data` to a fresh temp file next to `target` and returns its path.
    async fn write_temp(&self, path: &RemotePath, target: &Path, data: &[u8]) -> Result<PathBuf> {
        let parent = target
            .parent()
            .ok_or_else(|| {
                ShardmillError::store(path.to_string(), "object has no parent directory")
            })?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Self::io_error(path, "failed to create parent directories", e))?;

        let temp = parent.join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()));
        fs::write(&temp, data)
            .await
            .map_err(|e| Self::io_error(path, "failed to write temp file", e))?;
        Ok(temp)
    }

    fn modified(meta: &std::fs::Metadata) -> DateTime<Utc> {
        meta.modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now())
    }
}

#[async_trait]
impl RemoteStore for LocalStore {
    async fn list(&self, prefix: &RemotePath) -> Result<Vec<ObjectInfo>> {
        let base = self.resolve_path(prefix);
        match fs::metadata(&base).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(Vec::new()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_error(prefix, "failed to read metadata", e)),
        }

        let bucket_root = self.root.join(&prefix.bucket);
        let mut objects = Vec::new();
        let mut pending = vec![base];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                // removed by a concurrent writer
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Self::io_error(prefix, "failed to read directory", e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Self::io_error(prefix, "failed to read directory entry", e))?
            {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with(TEMP_PREFIX) {
                    continue;
                }

                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| Self::io_error(prefix, "failed to read metadata", e))?;
                if meta.is_dir() {
                    pending.push(entry.path());
                    continue;
                }

                let Ok(relative) = entry.path().strip_prefix(&bucket_root).map(Path::to_path_buf)
                else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");

                objects.push(ObjectInfo {
                    key,
                    size: meta.len(),
                    last_modified: Self::modified(&meta),
                });
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn list_prefixes(&self, prefix: &RemotePath) -> Result<Vec<String>> {
        let base = self.resolve_path(prefix);
        let mut entries = match fs::read_dir(&base).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_error(prefix, "failed to read directory", e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_error(prefix, "failed to read directory entry", e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if let (true, Some(name)) = (is_dir, entry.file_name().to_str()) {
                names.push(name.to_string());
            }
        }

        names.sort();
        Ok(names)
    }

    async fn exists(&self, path: &RemotePath) -> Result<bool> {
        let full_path = self.resolve_path(path);
        match fs::metadata(&full_path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::io_error(path, "failed to check existence", e)),
        }
    }

    async fn head(&self, path: &RemotePath) -> Result<ObjectInfo> {
        let full_path = self.resolve_path(path);
        let meta = fs::metadata(&full_path)
            .await
            .map_err(|e| Self::io_error(path, "failed to read metadata", e))?;
        if !meta.is_file() {
            return Err(ShardmillError::not_found(path.to_string()));
        }
        Ok(ObjectInfo {
            key: path.key.clone(),
            size: meta.len(),
            last_modified: Self::modified(&meta),
        })
    }

    async fn get(&self, path: &RemotePath) -> Result<Bytes> {
        let full_path = self.resolve_path(path);
        let data = fs::read(&full_path)
            .await
            .map_err(|e| Self::io_error(path, "failed to read object", e))?;
        Ok(Bytes::from(data))
    }

    async fn put(&self, path: &RemotePath, data: Bytes) -> Result<()> {
        let full_path = self.resolve_path(path);
        let temp = self.write_temp(path, &full_path, &data).await?;

        if let Err(e) = fs::rename(&temp, &full_path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(Self::io_error(path, "failed to move object into place", e));
        }
        Ok(())
    }

    async fn put_if_absent(&self, path: &RemotePath, data: Bytes) -> Result<PutOutcome> {
        let full_path = self.resolve_path(path);
        let temp = self.write_temp(path, &full_path, &data).await?;

        // link(2) fails if the target exists, which makes the create exclusive.
        let outcome = match fs::hard_link(&temp, &full_path).await {
            Ok(()) => Ok(PutOutcome::Created),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Ok(PutOutcome::AlreadyExists)
            }
            Err(e) => Err(Self::io_error(path, "failed to publish object", e)),
        };
        let _ = fs::remove_file(&temp).await;
        outcome
    }

    async fn delete(&self, path: &RemotePath) -> Result<()> {
        let full_path = self.resolve_path(path);
        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(path, "failed to delete object", e)),
        }
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
