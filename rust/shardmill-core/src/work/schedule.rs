// rust/shardmill-core/src/work/schedule.rs

//! Work scheduler.
//!
//! Candidates are recomputed from the stamp set on every pass; there is no
//! to-do list to persist or roll back. A key is a candidate iff its groups
//! were synced, its raw and language-id inputs are stamped with content, and
//! no output stamp exists for it at the current run identifier.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};

use super::runner::{ProcessingRunner, RunResult};
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::layout::{Layout, Role, ShardKey};
use crate::stamp::{StampKind, StampStore};

/// A key that needs processing. Derived per pass, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub key: ShardKey,
}

/// Tally of one dispatched batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub published: usize,
    pub skipped: usize,
    /// Failed keys with their reasons.
    pub failed: Vec<(ShardKey, String)>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.published + self.skipped + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, key: ShardKey, result: RunResult) {
        match result {
            RunResult::Published => self.published += 1,
            RunResult::SkippedAlreadyPublished => self.skipped += 1,
            RunResult::Failed(reason) => self.failed.push((key, reason)),
        }
    }
}

/// Computes candidates and fans them out to a bounded worker pool.
#[derive(Clone)]
pub struct Scheduler {
    stamps: StampStore,
    layout: Arc<Layout>,
    workers: usize,
    limit: Option<usize>,
}

impl Scheduler {
    pub fn new(stamps: StampStore, layout: Arc<Layout>, config: &SchedulerConfig) -> Self {
        Self {
            stamps,
            layout,
            workers: config.workers.max(1),
            limit: config.limit,
        }
    }

    /// Returns the candidates among `keys`, in the order given.
    pub async fn candidates(&self, keys: &[ShardKey]) -> Result<Vec<WorkItem>> {
        let mut gates: HashMap<&str, bool> = HashMap::new();
        let mut items = Vec::new();

        for key in keys {
            if self.limit.is_some_and(|limit| items.len() >= limit) {
                break;
            }

            let open = match gates.get(key.collection.as_str()) {
                Some(open) => *open,
                None => {
                    let open = self.group_synced(&key.collection).await?;
                    if !open {
                        tracing::debug!(collection = %key.collection, "group not synced, skipping");
                    }
                    gates.insert(key.collection.as_str(), open);
                    open
                }
            };
            if open && self.is_candidate(key).await? {
                items.push(WorkItem { key: key.clone() });
            }
        }

        Ok(items)
    }

    /// Every role of the collection has a group stamp.
    async fn group_synced(&self, collection: &str) -> Result<bool> {
        for role in [Role::RawInput, Role::LanguageId, Role::Output] {
            let group = self.layout.group_prefix(role, collection);
            if !self.stamps.has_group_stamp(&group).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn is_candidate(&self, key: &ShardKey) -> Result<bool> {
        let raw = self.layout.path(Role::RawInput, key);
        let lid = self.layout.path(Role::LanguageId, key);
        let output = self.layout.path(Role::Output, key);

        Ok(
            self.stamps.stamp_kind(&raw).await? == Some(StampKind::Content)
                && self.stamps.stamp_kind(&lid).await? == Some(StampKind::Content)
                && !self.stamps.has_stamp(&output).await?,
        )
    }

    /// Runs `items` with at most `workers` in flight, starting them in order.
    ///
    /// Failures are recorded and never abort sibling items.
    pub async fn dispatch(&self, items: Vec<WorkItem>, runner: &ProcessingRunner) -> BatchReport {
        tracing::info!(items = items.len(), workers = self.workers, "dispatching");

        stream::iter(items)
            .map(|item| async move {
                let result = runner.run(&item.key).await;
                (item.key, result)
            })
            .buffer_unordered(self.workers)
            .fold(BatchReport::default(), |mut report, (key, result)| async move {
                report.record(key, result);
                report
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::work::runner::tests::{test_layout, FakeAnnotator};
    use chrono::Utc;
    use tempfile::TempDir;

    struct Fixture {
        stamps: StampStore,
        layout: Arc<Layout>,
        _temp: TempDir,
    }

    async fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        Fixture {
            stamps: StampStore::new(temp.path().join("build.d")).await.unwrap(),
            layout: test_layout(),
            _temp: temp,
        }
    }

    impl Fixture {
        fn scheduler(&self, workers: usize, limit: Option<usize>) -> Scheduler {
            let config = SchedulerConfig {
                workers,
                limit,
                ..Default::default()
            };
            Scheduler::new(self.stamps.clone(), self.layout.clone(), &config)
        }

        async fn synced(&self, collection: &str) {
            for role in [Role::RawInput, Role::LanguageId, Role::Output] {
                let group = self.layout.group_prefix(role, collection);
                self.stamps.write_group_stamp(&group, 0).await.unwrap();
            }
        }

        async fn inputs(&self, key: &ShardKey) {
            for role in [Role::RawInput, Role::LanguageId] {
                let path = self.layout.path(role, key);
                self.stamps.write_content(&path, b"data").await.unwrap();
            }
        }
    }

    fn key(collection: &str, sub_unit: &str) -> ShardKey {
        ShardKey::new(collection, sub_unit)
    }

    #[tokio::test]
    async fn test_candidates_require_inputs_and_no_output() {
        let f = fixture().await;
        f.synced("A").await;
        let (k1, k2, k3, k4) = (key("A", "1"), key("A", "2"), key("A", "3"), key("A", "4"));

        // k1: both inputs
        f.inputs(&k1).await;
        // k2: already has an output stamp
        f.inputs(&k2).await;
        f.stamps
            .write_marker(&f.layout.path(Role::Output, &k2), Utc::now())
            .await
            .unwrap();
        // k3: missing language id
        f.stamps
            .write_content(&f.layout.path(Role::RawInput, &k3), b"data")
            .await
            .unwrap();
        // k4: language id only witnessed, not downloaded
        f.stamps
            .write_content(&f.layout.path(Role::RawInput, &k4), b"data")
            .await
            .unwrap();
        f.stamps
            .write_marker(&f.layout.path(Role::LanguageId, &k4), Utc::now())
            .await
            .unwrap();

        let items = f
            .scheduler(2, None)
            .candidates(&[k1.clone(), k2, k3, k4])
            .await
            .unwrap();
        assert_eq!(items, vec![WorkItem { key: k1 }]);
    }

    #[tokio::test]
    async fn test_unsynced_group_blocks_candidates() {
        let f = fixture().await;
        let k = key("A", "1");
        f.inputs(&k).await;

        let scheduler = f.scheduler(2, None);
        assert!(scheduler.candidates(&[k.clone()]).await.unwrap().is_empty());

        f.synced("A").await;
        assert_eq!(scheduler.candidates(&[k]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_candidates_keep_order_and_limit() {
        let f = fixture().await;
        f.synced("A").await;
        f.synced("B").await;
        let keys = vec![key("B", "9"), key("A", "1"), key("A", "5")];
        for k in &keys {
            f.inputs(k).await;
        }

        let items = f.scheduler(2, None).candidates(&keys).await.unwrap();
        let got: Vec<_> = items.into_iter().map(|i| i.key).collect();
        assert_eq!(got, keys);

        let limited = f.scheduler(2, Some(2)).candidates(&keys).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].key, keys[0]);
    }

    #[tokio::test]
    async fn test_dispatch_counts_results() {
        let f = fixture().await;
        f.synced("A").await;
        let keys = vec![key("A", "1"), key("A", "2"), key("A", "3")];
        for k in &keys {
            f.inputs(k).await;
        }

        let store = MemoryStore::new();
        // k3 was published elsewhere already
        store.insert(&f.layout.path(Role::Output, &keys[2]), "theirs");
        let runner = ProcessingRunner::new(
            Arc::new(store.clone()),
            f.stamps.clone(),
            f.layout.clone(),
            Arc::new(FakeAnnotator::succeeding()),
        );

        let scheduler = f.scheduler(2, None);
        let items = scheduler.candidates(&keys).await.unwrap();
        let report = scheduler.dispatch(items, &runner).await;

        assert_eq!(report.published, 2);
        assert_eq!(report.skipped, 1);
        assert!(report.is_success());
        assert_eq!(report.total(), 3);

        // Everything is stamped now, nothing left to do
        assert!(scheduler.candidates(&keys).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failures_do_not_abort_siblings() {
        let f = fixture().await;
        f.synced("A").await;
        let keys = vec![key("A", "1"), key("A", "2")];
        for k in &keys {
            f.inputs(k).await;
        }

        let runner = ProcessingRunner::new(
            Arc::new(MemoryStore::new()),
            f.stamps.clone(),
            f.layout.clone(),
            Arc::new(FakeAnnotator::returning(
                crate::work::AnnotationStatus::Failed("boom".to_string()),
            )),
        );
        let scheduler = f.scheduler(1, None);
        let items = scheduler.candidates(&keys).await.unwrap();
        let report = scheduler.dispatch(items, &runner).await;

        assert_eq!(report.failed.len(), 2);
        assert!(!report.is_success());
        // Failed items stay candidates
        assert_eq!(scheduler.candidates(&keys).await.unwrap().len(), 2);
    }
}
