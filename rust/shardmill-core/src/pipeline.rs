// rust/shardmill-core/src/pipeline.rs

//! Pipeline orchestration.
//!
//! [`Pipeline`] wires the remote store, the stamp store, the sync engine, the
//! scheduler and the processing runner together from one validated
//! [`PipelineConfig`]. A full pass is enumerate, sync, plan, dispatch.
//!
//! # Example
//!
//! ```no_run
//! use shardmill_core::config::PipelineConfig;
//! use shardmill_core::pipeline::Pipeline;
//!
//! # async fn example() -> shardmill_core::Result<()> {
//! let config = PipelineConfig::from_file("shardmill.toml")?.with_env_overrides();
//! let pipeline = Pipeline::from_config(config).await?;
//!
//! let report = pipeline.run().await?;
//! println!(
//!     "published {}, skipped {}, failed {}",
//!     report.batch.published,
//!     report.batch.skipped,
//!     report.batch.failed.len()
//! );
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::layout::{Layout, Role, ShardKey};
use crate::stamp::StampStore;
use crate::storage::{open_store, RemoteStore};
use crate::sync::{SyncEngine, SyncMode};
use crate::work::{
    materialize, order, Annotator, BatchReport, CommandAnnotator, ProcessingRunner, Scheduler,
    ShardEnumerator, WorkItem,
};

/// Number of collections synced concurrently.
const GROUP_SYNC_CONCURRENCY: usize = 4;

/// Roles mirrored by a collection sync, with how each one is stamped.
const SYNCED_ROLES: [(Role, SyncMode); 3] = [
    (Role::RawInput, SyncMode::Content),
    (Role::LanguageId, SyncMode::Content),
    (Role::Output, SyncMode::Marker),
];

/// Result of syncing a set of collections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Collections whose groups are all synced.
    pub synced: Vec<String>,
    /// Collections that stay blocked, with the reason.
    pub failed: Vec<(String, String)>,
    /// Objects stamped during this sync.
    pub fetched: usize,
}

/// Result of one full pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub work_units: usize,
    pub sync: SyncSummary,
    pub candidates: usize,
    pub batch: BatchReport,
}

impl PipelineReport {
    /// No group and no item failed.
    pub fn is_success(&self) -> bool {
        self.sync.failed.is_empty() && self.batch.is_success()
    }
}

/// All components of one configured pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn RemoteStore>,
    stamps: StampStore,
    layout: Arc<Layout>,
    enumerator: ShardEnumerator,
    sync: SyncEngine,
    scheduler: Scheduler,
    runner: ProcessingRunner,
}

impl Pipeline {
    /// Builds a pipeline from a configuration, opening the configured store
    /// and running the configured annotator program.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the configuration is invalid, or a
    /// store error if the store cannot be opened.
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let store = open_store(&config.store).await?;
        let annotator = Arc::new(CommandAnnotator::new(&config.annotator)?);
        Self::with_components(config, store, annotator).await
    }

    /// Builds a pipeline around an existing store and annotator.
    pub async fn with_components(
        config: PipelineConfig,
        store: Arc<dyn RemoteStore>,
        annotator: Arc<dyn Annotator>,
    ) -> Result<Self> {
        config.validate()?;

        let layout = Arc::new(Layout::new(&config.layout)?);
        let stamps = StampStore::new(config.stamps.build_dir.clone()).await?;

        let enumerator = ShardEnumerator::new(store.clone(), layout.clone());
        let sync = SyncEngine::new(store.clone(), stamps.clone(), layout.clone());
        let scheduler = Scheduler::new(stamps.clone(), layout.clone(), &config.scheduler);
        let runner =
            ProcessingRunner::new(store.clone(), stamps.clone(), layout.clone(), annotator)
                .with_compression(
                    config.annotator.compression,
                    config.annotator.compression_level,
                );

        tracing::info!(
            backend = store.backend_type(),
            run_id = %layout.run_id(),
            build_dir = %stamps.build_dir().display(),
            "pipeline ready"
        );

        Ok(Self {
            config,
            store,
            stamps,
            layout,
            enumerator,
            sync,
            scheduler,
            runner,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    pub fn stamps(&self) -> &StampStore {
        &self.stamps
    }

    pub fn layout(&self) -> &Arc<Layout> {
        &self.layout
    }

    pub fn runner(&self) -> &ProcessingRunner {
        &self.runner
    }

    /// Lists the work units, orders them and writes the work list.
    pub async fn enumerate(&self) -> Result<Vec<ShardKey>> {
        let scheduler = &self.config.scheduler;
        let keys = self
            .enumerator
            .list_work_units(&scheduler.collections)
            .await?;
        let keys = order(keys, scheduler.ordering, scheduler.seed);

        let worklist = self.config.stamps.worklist_path();
        materialize(&keys, &worklist).await?;
        tracing::info!(
            work_units = keys.len(),
            ordering = ?scheduler.ordering,
            worklist = %worklist.display(),
            "work list written"
        );
        Ok(keys)
    }

    /// Returns the configured collections, or every raw input collection.
    pub async fn collections(&self) -> Result<Vec<String>> {
        if self.config.scheduler.collections.is_empty() {
            self.enumerator.list_collections(Role::RawInput).await
        } else {
            Ok(self.config.scheduler.collections.clone())
        }
    }

    /// Syncs the raw input, language id and output groups of `collections`.
    ///
    /// A collection whose sync fails stays blocked; the others go on.
    pub async fn sync(&self, collections: &[String]) -> SyncSummary {
        let results: Vec<(String, Result<usize>)> = stream::iter(collections.iter().cloned())
            .map(|collection| async move {
                let result = self.sync_collection(&collection).await;
                (collection, result)
            })
            .buffer_unordered(GROUP_SYNC_CONCURRENCY)
            .collect()
            .await;

        let mut summary = SyncSummary::default();
        for (collection, result) in results {
            match result {
                Ok(fetched) => {
                    summary.fetched += fetched;
                    summary.synced.push(collection);
                }
                Err(e) => {
                    tracing::warn!(
                        collection = %collection,
                        error = %e,
                        "sync failed, group blocked"
                    );
                    summary.failed.push((collection, e.to_string()));
                }
            }
        }
        summary.synced.sort();
        summary.failed.sort();
        summary
    }

    async fn sync_collection(&self, collection: &str) -> Result<usize> {
        let mut fetched = 0;
        for (role, mode) in SYNCED_ROLES {
            fetched += self.sync.sync_group(role, collection, mode).await?.fetched;
        }
        Ok(fetched)
    }

    /// Returns the candidates among `keys` from the current stamps, without
    /// touching the store.
    pub async fn plan(&self, keys: &[ShardKey]) -> Result<Vec<WorkItem>> {
        self.scheduler.candidates(keys).await
    }

    /// Runs one full pass: enumerate, sync, plan, dispatch.
    pub async fn run(&self) -> Result<PipelineReport> {
        let keys = self.enumerate().await?;

        let collections: Vec<String> = if self.config.scheduler.collections.is_empty() {
            let unique: BTreeSet<&str> = keys.iter().map(|k| k.collection.as_str()).collect();
            unique.into_iter().map(str::to_string).collect()
        } else {
            self.config.scheduler.collections.clone()
        };
        let sync = self.sync(&collections).await;

        let items = self.plan(&keys).await?;
        let candidates = items.len();
        let batch = self.scheduler.dispatch(items, &self.runner).await;

        let report = PipelineReport {
            work_units: keys.len(),
            sync,
            candidates,
            batch,
        };
        tracing::info!(
            work_units = report.work_units,
            groups_synced = report.sync.synced.len(),
            groups_failed = report.sync.failed.len(),
            candidates = report.candidates,
            published = report.batch.published,
            skipped = report.batch.skipped,
            failed = report.batch.failed.len(),
            "pass complete"
        );
        Ok(report)
    }

    /// Removes every local stamp of `collection` and its scratch directories.
    ///
    /// The next sync starts the collection from scratch. Scratch directories
    /// left by interrupted runs are removed too; they are never published.
    /// Other collections, including items in flight, are not touched.
    pub async fn clean(&self, collection: &str) -> Result<()> {
        for (role, _) in SYNCED_ROLES {
            self.stamps
                .clear_group(&self.layout.group_prefix(role, collection))
                .await?;
        }
        self.stamps.clear_scratch(collection).await?;

        tracing::info!(collection, "cleaned local state");
        Ok(())
    }
}
