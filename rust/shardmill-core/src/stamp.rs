// rust/shardmill-core/src/stamp.rs

//! Local stamp store.
//!
//! A stamp is a local file asserting that, as of the last sync, the remote
//! object it mirrors was observed to exist. The mirror is path-isomorphic to
//! the remote layout: the stamp for `bucket/key` lives at
//! `<build_dir>/<bucket>/<key>`.
//!
//! - Content stamps hold the fetched bytes and double as the local input
//!   artifact handed to the annotator.
//! - Marker stamps are empty files whose modification time is the remote
//!   object's last-modified time. Each carries a hidden `.<name>.marker` tag
//!   next to it, so an empty content stamp still reads as content.
//! - Group stamps (`<build_dir>/<bucket>/<group>.last_synced`) record that a
//!   whole group was synced successfully, and gate scheduling for it.
//!
//! Every write goes to a temp file in the target directory and is renamed
//! into place, so concurrent workers never observe a half-written stamp.
//! Deleting the whole build directory only costs a resync.

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{Result, ShardmillError};
use crate::layout::RemotePath;

/// Suffix of group stamp files.
pub const GROUP_STAMP_SUFFIX: &str = ".last_synced";

/// Name of the runners' scratch directory below the build directory.
const WORK_DIR: &str = ".work";

/// Suffix of the tag file that marks a stamp as a marker.
const MARKER_TAG_SUFFIX: &str = ".marker";

/// What a stamp file records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StampKind {
    /// The file mirrors the remote object's bytes.
    Content,
    /// Zero-byte existence witness.
    Marker,
}

/// Content of a group stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStamp {
    pub synced_at: DateTime<Utc>,
    /// Number of remote objects witnessed by the sync.
    pub objects: usize,
}

/// Disk-resident stamps below a build directory.
#[derive(Debug, Clone)]
pub struct StampStore {
    build_dir: PathBuf,
}

impl StampStore {
    /// Opens the stamp store, creating the build directory if needed.
    pub async fn new(build_dir: impl Into<PathBuf>) -> Result<Self> {
        let build_dir = build_dir.into();
        fs::create_dir_all(&build_dir).await.map_err(|e| {
            ShardmillError::stamp_with_source(&build_dir, "failed to create build directory", e)
        })?;
        Ok(Self { build_dir })
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    /// Scratch space for runners; never confused with stamps.
    pub fn work_root(&self) -> PathBuf {
        self.build_dir.join(WORK_DIR)
    }

    /// Scratch space for the items of one collection.
    pub fn scratch_root(&self, collection: &str) -> Result<PathBuf> {
        let mut parts = Path::new(collection).components();
        match (parts.next(), parts.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.work_root().join(collection)),
            _ => Err(ShardmillError::stamp(
                self.work_root(),
                format!("unsafe collection name '{collection}'"),
            )),
        }
    }

    /// Removes the scratch directories of `collection`, leaving those of
    /// other collections alone.
    pub async fn clear_scratch(&self, collection: &str) -> Result<()> {
        let dir = self.scratch_root(collection)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ShardmillError::stamp_with_source(
                &dir,
                "failed to remove scratch directory",
                e,
            )),
        }
    }

    /// Returns the stamp location mirroring `path`.
    ///
    /// # Errors
    ///
    /// Rejects bucket names or keys that would escape the build directory.
    pub fn local_path(&self, path: &RemotePath) -> Result<PathBuf> {
        let mut local = self.build_dir.clone();
        if path.bucket == WORK_DIR {
            return Err(ShardmillError::stamp(
                &local,
                format!("bucket name '{WORK_DIR}' is reserved"),
            ));
        }
        for part in std::iter::once(path.bucket.as_str()).chain(path.key.split('/')) {
            if part.is_empty() {
                continue;
            }
            match Path::new(part).components().next() {
                Some(Component::Normal(_)) => local.push(part),
                _ => {
                    return Err(ShardmillError::stamp(
                        &local,
                        format!("refusing to mirror unsafe remote path '{path}'"),
                    ))
                }
            }
        }
        if local == self.build_dir {
            return Err(ShardmillError::stamp(&local, "empty remote path"));
        }
        Ok(local)
    }

    fn group_stamp_path(&self, group: &RemotePath) -> Result<PathBuf> {
        let dir = self.local_path(group)?;
        let mut name = dir.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(GROUP_STAMP_SUFFIX);
        Ok(dir.with_file_name(name))
    }

    /// Returns true if a stamp (of either kind) exists for `path`.
    pub async fn has_stamp(&self, path: &RemotePath) -> Result<bool> {
        Ok(self.stamp_kind(path).await?.is_some())
    }

    /// Returns the kind of the stamp for `path`, if any.
    ///
    /// The kind comes from the marker tag, never from the file size: an empty
    /// remote object mirrored in content mode is a content stamp.
    pub async fn stamp_kind(&self, path: &RemotePath) -> Result<Option<StampKind>> {
        let local = self.local_path(path)?;
        match fs::metadata(&local).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ShardmillError::stamp_with_source(
                    &local,
                    "failed to read stamp metadata",
                    e,
                ))
            }
        }

        let tag = marker_tag(&local);
        let tagged = fs::try_exists(&tag).await.map_err(|e| {
            ShardmillError::stamp_with_source(&tag, "failed to check marker tag", e)
        })?;
        Ok(Some(if tagged {
            StampKind::Marker
        } else {
            StampKind::Content
        }))
    }

    /// Writes a content stamp holding `data`, replacing a marker if present.
    pub async fn write_content(&self, path: &RemotePath, data: &[u8]) -> Result<PathBuf> {
        let local = self.local_path(path)?;
        let temp = self.temp_for(&local).await?;
        fs::write(&temp, data).await.map_err(|e| {
            ShardmillError::stamp_with_source(&temp, "failed to write stamp", e)
        })?;
        self.commit(&temp, &local).await?;
        remove_file_if_exists(&marker_tag(&local)).await?;
        Ok(local)
    }

    /// Writes a marker stamp dated `last_modified`.
    pub async fn write_marker(
        &self,
        path: &RemotePath,
        last_modified: DateTime<Utc>,
    ) -> Result<()> {
        let local = self.local_path(path)?;
        let temp = self.temp_for(&local).await?;

        // Tag first: a crash in between leaves at worst a marker that a
        // content sync downloads again.
        let tag = marker_tag(&local);
        fs::write(&tag, b"").await.map_err(|e| {
            ShardmillError::stamp_with_source(&tag, "failed to write marker tag", e)
        })?;

        let file = fs::File::create(&temp).await.map_err(|e| {
            ShardmillError::stamp_with_source(&temp, "failed to create marker", e)
        })?;
        let file = file.into_std().await;
        if let Err(e) = file.set_modified(SystemTime::from(last_modified)) {
            let _ = fs::remove_file(&temp).await;
            return Err(ShardmillError::stamp_with_source(
                &temp,
                "failed to set marker time",
                e,
            ));
        }
        drop(file);

        self.commit(&temp, &local).await
    }

    /// Deletes the stamp for `path`. Returns false if there was none.
    pub async fn clear_stamp(&self, path: &RemotePath) -> Result<bool> {
        let local = self.local_path(path)?;
        let removed = remove_file_if_exists(&local).await?;
        remove_file_if_exists(&marker_tag(&local)).await?;
        Ok(removed)
    }

    /// Records a successful sync of the group below `group`.
    pub async fn write_group_stamp(&self, group: &RemotePath, objects: usize) -> Result<()> {
        let local = self.group_stamp_path(group)?;
        let stamp = GroupStamp {
            synced_at: Utc::now(),
            objects,
        };
        let body = toml::to_string(&stamp)
            .map_err(|e| ShardmillError::serialization(format!("group stamp: {e}")))?;

        let temp = self.temp_for(&local).await?;
        fs::write(&temp, body).await.map_err(|e| {
            ShardmillError::stamp_with_source(&temp, "failed to write group stamp", e)
        })?;
        self.commit(&temp, &local).await
    }

    /// Reads the group stamp for `group`, if present.
    pub async fn read_group_stamp(&self, group: &RemotePath) -> Result<Option<GroupStamp>> {
        let local = self.group_stamp_path(group)?;
        let body = match fs::read_to_string(&local).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ShardmillError::stamp_with_source(
                    &local,
                    "failed to read group stamp",
                    e,
                ))
            }
        };
        toml::from_str(&body)
            .map(Some)
            .map_err(|e| ShardmillError::stamp(&local, format!("corrupt group stamp: {e}")))
    }

    pub async fn has_group_stamp(&self, group: &RemotePath) -> Result<bool> {
        let local = self.group_stamp_path(group)?;
        fs::try_exists(&local).await.map_err(|e| {
            ShardmillError::stamp_with_source(&local, "failed to check group stamp", e)
        })
    }

    /// Deletes the group stamp only, forcing a resync before scheduling.
    pub async fn clear_group_stamp(&self, group: &RemotePath) -> Result<bool> {
        let local = self.group_stamp_path(group)?;
        remove_file_if_exists(&local).await
    }

    /// Deletes the group stamp and every stamp below the group.
    pub async fn clear_group(&self, group: &RemotePath) -> Result<()> {
        self.clear_group_stamp(group).await?;
        let dir = self.local_path(group)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ShardmillError::stamp_with_source(
                &dir,
                "failed to remove stamps",
                e,
            )),
        }
    }

    /// Creates the parent directory of `target` and returns a fresh temp path in it.
    async fn temp_for(&self, target: &Path) -> Result<PathBuf> {
        let parent = target
            .parent()
            .ok_or_else(|| ShardmillError::stamp(target, "stamp has no parent directory"))?;
        fs::create_dir_all(parent).await.map_err(|e| {
            ShardmillError::stamp_with_source(parent, "failed to create stamp directory", e)
        })?;
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(parent.join(format!(".{name}.{}.tmp", uuid::Uuid::new_v4())))
    }

    async fn commit(&self, temp: &Path, target: &Path) -> Result<()> {
        if let Err(e) = fs::rename(temp, target).await {
            let _ = fs::remove_file(temp).await;
            return Err(ShardmillError::stamp_with_source(
                target,
                "failed to move stamp into place",
                e,
            ));
        }
        Ok(())
    }
}

/// Tag file marking the stamp at `local` as a marker.
fn marker_tag(local: &Path) -> PathBuf {
    let name = local
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    local.with_file_name(format!(".{name}{MARKER_TAG_SUFFIX}"))
}

async fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ShardmillError::stamp_with_source(
            path,
            "failed to remove stamp",
            e,
        )),
    }
}
