// rust/shardmill-core/src/storage/mod.rs

//! Remote store clients.
//!
//! The pipeline talks to the shared object store only through the
//! [`RemoteStore`] trait. Three backends are provided:
//!
//! - [`LocalStore`]: a directory tree, for single-host or shared-filesystem runs.
//! - [`S3Store`]: S3-compatible object storage (requires the `s3` feature).
//! - [`MemoryStore`]: in-process, with operation counters and fault injection.
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use shardmill_core::layout::RemotePath;
//! use shardmill_core::storage::{LocalStore, PutOutcome, RemoteStore};
//!
//! # async fn example() -> shardmill_core::Result<()> {
//! let store = LocalStore::new("/srv/corpus").await?;
//! let path = RemotePath::new("processed", "lingproc/run/A/A-1900.jsonl.bz2");
//!
//! match store.put_if_absent(&path, Bytes::from_static(b"...")).await? {
//!     PutOutcome::Created => println!("published"),
//!     PutOutcome::AlreadyExists => println!("someone else was faster"),
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::config::{StoreBackendType, StoreConfig};
use crate::error::{Result, ShardmillError};

mod local;
mod memory;
mod traits;

pub use local::LocalStore;
pub use memory::{MemoryStore, StoreOp, StoreStats};
pub use traits::{ObjectInfo, PutOutcome, RemoteStore};

// S3 storage (requires feature flag)
#[cfg(feature = "s3")]
mod retry;
#[cfg(feature = "s3")]
mod s3;

#[cfg(feature = "s3")]
pub use retry::RetryPolicy;
#[cfg(feature = "s3")]
pub use s3::S3Store;

/// Builds the remote store selected by `config`.
///
/// # Errors
///
/// Returns a configuration error if the backend is unavailable in this build
/// or its section is missing.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn RemoteStore>> {
    match config.backend {
        StoreBackendType::Local => {
            let store = LocalStore::new(&config.local_root).await?;
            tracing::debug!(root = %config.local_root.display(), "opened local store");
            Ok(Arc::new(store))
        }
        #[cfg(feature = "s3")]
        StoreBackendType::S3 => {
            let s3_config = config.s3.as_ref().ok_or_else(|| {
                ShardmillError::config("store.s3 configuration is required when backend is 's3'")
            })?;
            let store = S3Store::new(s3_config)?;
            tracing::debug!(
                region = %s3_config.region,
                endpoint = ?s3_config.endpoint,
                "opened s3 store"
            );
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "s3"))]
        StoreBackendType::S3 => Err(ShardmillError::config(
            "store backend 's3' requires the `s3` feature",
        )),
    }
}
