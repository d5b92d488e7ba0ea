// rust/shardmill-core/src/work/runner.rs

//! Processing runner: annotate one work item and publish the result.
//!
//! The runner never locks. At-most-one-published-result-per-key comes from
//! the conditional create used to publish the output: among racing workers
//! exactly one sees `Created`, the others discard their local result and
//! report [`RunResult::SkippedAlreadyPublished`].
//!
//! Every item works in a private scratch directory below its collection's
//! scratch root. The directory is removed when the run ends, whatever the
//! outcome, and also when the run future is dropped mid-flight.
//!
//! Annotators that write plain JSONL get their output compressed with bzip2
//! before it is published.

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use chrono::Utc;

use super::annotator::{AnnotationRequest, AnnotationStatus, Annotator};
use crate::config::OutputCompression;
use crate::error::{Result, ShardmillError};
use crate::layout::{Layout, RemotePath, Role, ShardKey};
use crate::stamp::StampStore;
use crate::storage::{PutOutcome, RemoteStore};

/// Outcome of processing one work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    /// Output and log were published by this run.
    Published,
    /// The output already existed remotely; local work (if any) was discarded.
    SkippedAlreadyPublished,
    /// Nothing was published; the item stays a candidate.
    Failed(String),
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Published => f.write_str("published"),
            Self::SkippedAlreadyPublished => f.write_str("skipped (already published)"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Runs the annotator for single work items and publishes their results.
#[derive(Clone)]
pub struct ProcessingRunner {
    store: Arc<dyn RemoteStore>,
    stamps: StampStore,
    layout: Arc<Layout>,
    annotator: Arc<dyn Annotator>,
    compression: OutputCompression,
    compression_level: u32,
}

impl ProcessingRunner {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        stamps: StampStore,
        layout: Arc<Layout>,
        annotator: Arc<dyn Annotator>,
    ) -> Self {
        Self {
            store,
            stamps,
            layout,
            annotator,
            compression: OutputCompression::None,
            compression_level: 9,
        }
    }

    /// Compresses annotator output with `compression` before publishing.
    pub fn with_compression(mut self, compression: OutputCompression, level: u32) -> Self {
        self.compression = compression;
        self.compression_level = level;
        self
    }

    /// Processes `key` to a terminal [`RunResult`].
    pub async fn run(&self, key: &ShardKey) -> RunResult {
        let result = match self.try_run(key).await {
            Ok(result) => result,
            Err(e) => RunResult::Failed(e.to_string()),
        };
        match &result {
            RunResult::Published => tracing::info!(key = %key, "published"),
            RunResult::SkippedAlreadyPublished => {
                tracing::info!(key = %key, "skipped, output already published")
            }
            RunResult::Failed(reason) => tracing::warn!(key = %key, %reason, "failed"),
        }
        result
    }

    async fn try_run(&self, key: &ShardKey) -> Result<RunResult> {
        let remote_output = self.layout.path(Role::Output, key);
        let remote_log = self.layout.path(Role::Log, key);

        // Cheap short-circuit; the conditional create below is what counts.
        if self.store.exists(&remote_output).await? {
            self.witness_output(&remote_output).await;
            return Ok(RunResult::SkippedAlreadyPublished);
        }

        let input = self.stamps.local_path(&self.layout.path(Role::RawInput, key))?;
        let lid = self.stamps.local_path(&self.layout.path(Role::LanguageId, key))?;

        let work_root = self.stamps.scratch_root(&key.collection)?;
        tokio::fs::create_dir_all(&work_root).await.map_err(|e| {
            ShardmillError::stamp_with_source(&work_root, "failed to create work root", e)
        })?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{key}-"))
            .tempdir_in(&work_root)
            .map_err(|e| {
                ShardmillError::stamp_with_source(
                    &work_root,
                    "failed to create scratch directory",
                    e,
                )
            })?;

        let request = AnnotationRequest {
            key: key.clone(),
            input,
            lid,
            output: scratch.path().join(file_name(&remote_output)),
            log: scratch.path().join(file_name(&remote_log)),
            remote_output: remote_output.clone(),
        };

        let status = self.annotator.annotate(&request).await?;
        tracing::debug!(key = %key, ?status, "annotator finished");

        match status {
            AnnotationStatus::Success => {}
            AnnotationStatus::SkipOutputExists => {
                // Confirm independently; a stale existence check inside the annotator
                // must not make the item disappear.
                if self.store.exists(&remote_output).await? {
                    self.witness_output(&remote_output).await;
                    return Ok(RunResult::SkippedAlreadyPublished);
                }
                return Ok(RunResult::Failed(
                    "annotator reported an existing output that the store does not have"
                        .to_string(),
                ));
            }
            AnnotationStatus::ValidationFailed(reason) => {
                return Ok(RunResult::Failed(format!("validation failed: {reason}")));
            }
            AnnotationStatus::Failed(reason) => return Ok(RunResult::Failed(reason)),
        }

        let output = match tokio::fs::read(&request.output).await {
            Ok(data) => compress(data, self.compression, self.compression_level).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RunResult::Failed(
                    "annotator succeeded without writing an output".to_string(),
                ));
            }
            Err(e) => {
                return Err(ShardmillError::stamp_with_source(
                    &request.output,
                    "failed to read annotator output",
                    e,
                ))
            }
        };
        let log = match tokio::fs::read(&request.log).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Bytes::new(),
            Err(e) => {
                return Err(ShardmillError::stamp_with_source(
                    &request.log,
                    "failed to read annotator log",
                    e,
                ))
            }
        };

        match self.store.put_if_absent(&remote_output, output).await? {
            PutOutcome::AlreadyExists => {
                self.witness_output(&remote_output).await;
                return Ok(RunResult::SkippedAlreadyPublished);
            }
            PutOutcome::Created => {}
        }

        if let Err(e) = self.store.put(&remote_log, log).await {
            // No output may stay published without its log.
            if let Err(rollback) = self.store.delete(&remote_output).await {
                tracing::error!(
                    key = %key,
                    output = %remote_output,
                    error = %rollback,
                    "failed to roll back output after log upload failure"
                );
            }
            return Ok(RunResult::Failed(format!("log upload failed: {e}")));
        }

        self.witness_output(&remote_output).await;
        Ok(RunResult::Published)
    }

    /// Records locally that `remote_output` exists. The store stays
    /// authoritative, so a failure here only costs a later sync.
    async fn witness_output(&self, remote_output: &RemotePath) {
        if let Err(e) = self.stamps.write_marker(remote_output, Utc::now()).await {
            tracing::warn!(output = %remote_output, error = %e, "failed to write output stamp");
        }
    }
}

/// Applies `compression` to annotator output off the async workers.
async fn compress(data: Vec<u8>, compression: OutputCompression, level: u32) -> Result<Bytes> {
    match compression {
        OutputCompression::None => Ok(Bytes::from(data)),
        OutputCompression::Bzip2 => tokio::task::spawn_blocking(move || {
            let capacity = data.len() / 4;
            let mut encoder = BzEncoder::new(Vec::with_capacity(capacity), Compression::new(level));
            encoder.write_all(&data)?;
            encoder.finish()
        })
        .await
        .map_err(|e| ShardmillError::serialization(format!("compression task failed: {e}")))?
        .map(Bytes::from)
        .map_err(|e| ShardmillError::serialization(format!("bzip2 compression failed: {e}"))),
    }
}

fn file_name(path: &RemotePath) -> String {
    path.key
        .rsplit('/')
        .next()
        .unwrap_or(path.key.as_str())
        .to_string()
}
