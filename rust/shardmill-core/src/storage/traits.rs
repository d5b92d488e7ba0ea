// rust/shardmill-core/src/storage/traits.rs

//! Remote store abstraction.
//!
//! The remote store is the only shared, durable state of the system. Every
//! backend exposes the same small set of bucket-qualified operations; all of
//! them fail with [`ShardmillError::StoreUnavailable`] on transport or
//! authentication errors and never swallow them.
//!
//! [`ShardmillError::StoreUnavailable`]: crate::error::ShardmillError::StoreUnavailable

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::layout::RemotePath;

/// Metadata about a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Key of the object inside its bucket.
    pub key: String,
    /// Size of the object in bytes.
    pub size: u64,
    /// Last modification time reported by the store.
    pub last_modified: DateTime<Utc>,
}

/// Result of a conditional create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The object did not exist and now holds the uploaded bytes.
    Created,
    /// Another writer got there first; the stored object was left untouched.
    AlreadyExists,
}

/// The core remote store trait.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Lists every object below the directory-like `prefix`, sorted by key.
    ///
    /// An empty key lists the whole bucket. A prefix with no objects yields an
    /// empty list, not an error.
    async fn list(&self, prefix: &RemotePath) -> Result<Vec<ObjectInfo>>;

    /// Lists the names of the first-level "directories" below `prefix`, sorted.
    async fn list_prefixes(&self, prefix: &RemotePath) -> Result<Vec<String>>;

    /// Checks if an object exists at the given path.
    async fn exists(&self, path: &RemotePath) -> Result<bool>;

    /// Retrieves metadata for an object.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the object doesn't exist.
    async fn head(&self, path: &RemotePath) -> Result<ObjectInfo>;

    /// Fetches the full content of an object.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the object doesn't exist.
    async fn get(&self, path: &RemotePath) -> Result<Bytes>;

    /// Uploads an object, replacing any existing one.
    ///
    /// Calling this twice with identical content has the effect of calling it once.
    async fn put(&self, path: &RemotePath, data: Bytes) -> Result<()>;

    /// Uploads an object only if nothing exists at `path` yet.
    ///
    /// This is the publish primitive: among concurrent callers for the same
    /// path at most one observes [`PutOutcome::Created`].
    async fn put_if_absent(&self, path: &RemotePath, data: Bytes) -> Result<PutOutcome>;

    /// Deletes an object. Deleting a missing object succeeds.
    async fn delete(&self, path: &RemotePath) -> Result<()>;

    /// Returns the backend type name (e.g., "local", "s3").
    fn backend_type(&self) -> &'static str;
}
