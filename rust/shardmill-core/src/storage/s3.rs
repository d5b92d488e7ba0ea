// rust/shardmill-core/src/storage/s3.rs

//! S3-compatible remote store using the object_store crate.
//!
//! Works against AWS S3 and the S3-compatible services corpora are usually
//! hosted on (Ceph, MinIO, Switch). One client is built per bucket on first
//! use; every request runs inside the retry loop.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::{AmazonS3, AmazonS3Builder, S3ConditionalPut};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore, PutMode, PutOptions, PutPayload};

use super::retry::RetryPolicy;
use super::traits::{ObjectInfo, PutOutcome, RemoteStore};
use crate::config::S3Config;
use crate::error::{Result, ShardmillError};
use crate::layout::RemotePath;

/// Error text of failures worth retrying.
const TRANSIENT_ERROR_TEXT: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "reset",
    "slow down",
    "throttl",
    "429",
    "500",
    "502",
    "503",
    "504",
];

/// Error text of failures that will not go away by retrying.
const PERMANENT_ERROR_TEXT: &[&str] = &["401", "403", "access denied", "forbidden"];

/// S3-compatible remote store.
pub struct S3Store {
    config: S3Config,
    /// Clients keyed by bucket name.
    clients: Mutex<HashMap<String, Arc<AmazonS3>>>,
    retry: RetryPolicy,
}

impl S3Store {
    /// Creates a new S3Store from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: &S3Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            clients: Mutex::new(HashMap::new()),
            retry: RetryPolicy::from(config),
        })
    }

    fn build_client(&self, bucket: &str) -> Result<AmazonS3> {
        let config = &self.config;
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(bucket)
            .with_region(&config.region);

        // Set endpoint if provided (for MinIO, Ceph, etc.)
        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }

        // Set credentials if provided
        if let Some(access_key) = &config.access_key_id {
            builder = builder.with_access_key_id(access_key);
        }
        if let Some(secret_key) = &config.secret_access_key {
            builder = builder.with_secret_access_key(secret_key);
        }
        if let Some(token) = &config.session_token {
            builder = builder.with_token(token);
        }

        // Configure path style (required for MinIO)
        if config.force_path_style {
            builder = builder.with_virtual_hosted_style_request(false);
        }

        if config.allow_http {
            builder = builder.with_allow_http(true);
        }

        if config.conditional_put {
            builder = builder.with_conditional_put(S3ConditionalPut::ETagMatch);
        }

        builder.build().map_err(|e| {
            ShardmillError::config_with_source(
                format!("failed to build S3 client for bucket '{bucket}'"),
                e,
            )
        })
    }

    fn client(&self, bucket: &str) -> Result<Arc<AmazonS3>> {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(bucket) {
            return Ok(client.clone());
        }
        let client = Arc::new(self.build_client(bucket)?);
        clients.insert(bucket.to_string(), client.clone());
        Ok(client)
    }

    /// Converts a key to an object_store path.
    fn resolve_path(key: &str) -> ObjectPath {
        ObjectPath::from(key.trim_matches('/'))
    }

    fn object_info(meta: ObjectMeta) -> ObjectInfo {
        ObjectInfo {
            key: meta.location.to_string(),
            size: meta.size as u64,
            last_modified: meta.last_modified,
        }
    }

    /// Runs one request against `path` inside the retry loop.
    async fn request<T, F, Fut>(&self, path: &RemotePath, action: &str, request: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = object_store::Result<T>>,
    {
        self.retry
            .run(action, Self::is_retryable_error, request)
            .await
            .map_err(|e| Self::convert_error(path, action, e))
    }

    /// Converts an object_store error to a ShardmillError.
    fn convert_error(
        path: &RemotePath,
        action: &str,
        error: object_store::Error,
    ) -> ShardmillError {
        match error {
            object_store::Error::NotFound { .. } => ShardmillError::not_found(path.to_string()),
            other => ShardmillError::store_with_source(
                path.to_string(),
                format!("failed to {action}"),
                other,
            ),
        }
    }

    /// Determines if an error is retryable: timeouts, dropped connections,
    /// throttling and 5xx responses. Auth and request errors are not.
    fn is_retryable_error(error: &object_store::Error) -> bool {
        if matches!(
            error,
            object_store::Error::NotFound { .. }
                | object_store::Error::AlreadyExists { .. }
                | object_store::Error::Precondition { .. }
                | object_store::Error::NotImplemented
        ) {
            return false;
        }
        let text = error.to_string().to_lowercase();
        if PERMANENT_ERROR_TEXT.iter().any(|t| text.contains(t)) {
            return false;
        }
        TRANSIENT_ERROR_TEXT.iter().any(|t| text.contains(t))
    }
}

/// Settles a conditional create that ended in `AlreadyExists`.
///
/// When an earlier attempt was retried, its PUT may have landed without the
/// response reaching us, and the retry then trips over our own object. The
/// existing object is read back: if it holds exactly the bytes we sent, the
/// create was ours.
async fn settle_create<F, Fut>(
    outcome: PutOutcome,
    attempts: u32,
    ours: &Bytes,
    read_back: F,
) -> Result<PutOutcome>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Bytes>>,
{
    if outcome != PutOutcome::AlreadyExists || attempts < 2 {
        return Ok(outcome);
    }
    if read_back().await? == *ours {
        tracing::info!(attempts, "conditional create landed on an earlier attempt");
        return Ok(PutOutcome::Created);
    }
    Ok(outcome)
}

#[async_trait]
impl RemoteStore for S3Store {
    async fn list(&self, prefix: &RemotePath) -> Result<Vec<ObjectInfo>> {
        let client = self.client(&prefix.bucket)?;
        let store = client.as_ref();
        let location = &Self::resolve_path(&prefix.key);

        let entries = self
            .request(prefix, "list objects", || {
                store.list(Some(location)).try_collect::<Vec<_>>()
            })
            .await?;

        let mut objects: Vec<ObjectInfo> = entries.into_iter().map(Self::object_info).collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn list_prefixes(&self, prefix: &RemotePath) -> Result<Vec<String>> {
        let client = self.client(&prefix.bucket)?;
        let store = client.as_ref();
        let location = &Self::resolve_path(&prefix.key);

        let listing = self
            .request(prefix, "list prefixes", || store.list_with_delimiter(Some(location)))
            .await?;

        let mut names: Vec<String> = listing
            .common_prefixes
            .iter()
            .filter_map(|p| p.filename().map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn exists(&self, path: &RemotePath) -> Result<bool> {
        let client = self.client(&path.bucket)?;
        let store = client.as_ref();
        let location = &Self::resolve_path(&path.key);

        self.request(path, "check existence", || async move {
            match store.head(location).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn head(&self, path: &RemotePath) -> Result<ObjectInfo> {
        let client = self.client(&path.bucket)?;
        let store = client.as_ref();
        let location = &Self::resolve_path(&path.key);

        let meta = self
            .request(path, "read metadata", || store.head(location))
            .await?;
        Ok(Self::object_info(meta))
    }

    async fn get(&self, path: &RemotePath) -> Result<Bytes> {
        let client = self.client(&path.bucket)?;
        let store = client.as_ref();
        let location = &Self::resolve_path(&path.key);

        self.request(path, "download object", || async move {
            store.get(location).await?.bytes().await
        })
        .await
    }

    async fn put(&self, path: &RemotePath, data: Bytes) -> Result<()> {
        let client = self.client(&path.bucket)?;
        let store = client.as_ref();
        let location = &Self::resolve_path(&path.key);

        self.request(path, "upload object", || {
            let payload = PutPayload::from(data.clone());
            async move { store.put(location, payload).await.map(|_| ()) }
        })
        .await
    }

    async fn put_if_absent(&self, path: &RemotePath, data: Bytes) -> Result<PutOutcome> {
        if !self.config.conditional_put {
            // Stores without conditional writes leave a window between the
            // existence check and the upload.
            if self.exists(path).await? {
                return Ok(PutOutcome::AlreadyExists);
            }
            self.put(path, data).await?;
            return Ok(PutOutcome::Created);
        }

        let client = self.client(&path.bucket)?;
        let store = client.as_ref();
        let location = &Self::resolve_path(&path.key);

        let mut attempts = 0u32;
        let outcome = self
            .request(path, "publish object", || {
                attempts += 1;
                let payload = PutPayload::from(data.clone());
                let options = PutOptions {
                    mode: PutMode::Create,
                    ..Default::default()
                };
                async move {
                    match store.put_opts(location, payload, options).await {
                        Ok(_) => Ok(PutOutcome::Created),
                        Err(object_store::Error::AlreadyExists { .. })
                        | Err(object_store::Error::Precondition { .. }) => {
                            Ok(PutOutcome::AlreadyExists)
                        }
                        Err(e) => Err(e),
                    }
                }
            })
            .await?;

        settle_create(outcome, attempts, &data, || self.get(path)).await
    }

    async fn delete(&self, path: &RemotePath) -> Result<()> {
        let client = self.client(&path.bucket)?;
        let store = client.as_ref();
        let location = &Self::resolve_path(&path.key);

        self.request(path, "delete object", || async move {
            match store.delete(location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
