// rust/shardmill-core/src/sync.rs

//! Sync engine: reconciles local stamps against the remote store.
//!
//! Syncing a group lists the remote objects below it and stamps every object
//! that is not stamped locally yet, then writes the group stamp. Sync is
//! additive and re-entrant: a second run only fetches what appeared in
//! between, and stamps of objects that vanished remotely are kept.
//!
//! The group stamp is removed before listing and rewritten only after every
//! object was stamped, so an interrupted or failed sync leaves the group
//! blocked until a later sync succeeds.

use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};

use crate::error::Result;
use crate::layout::{Layout, RemotePath, Role};
use crate::stamp::{StampKind, StampStore};
use crate::storage::{ObjectInfo, RemoteStore};

/// Number of objects fetched concurrently while syncing one group.
const FETCH_CONCURRENCY: usize = 8;

/// How objects are mirrored locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Download the bytes into a content stamp.
    Content,
    /// Only witness existence with a marker stamp.
    Marker,
}

/// Counts from one group sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Objects found below the group prefix.
    pub listed: usize,
    /// Objects stamped by this sync.
    pub fetched: usize,
    /// Objects that already had a sufficient stamp.
    pub already_stamped: usize,
}

/// Pulls remote state into the stamp store.
#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<dyn RemoteStore>,
    stamps: StampStore,
    layout: Arc<Layout>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn RemoteStore>, stamps: StampStore, layout: Arc<Layout>) -> Self {
        Self {
            store,
            stamps,
            layout,
        }
    }

    /// Syncs every object of `collection` in `role`.
    pub async fn sync_group(
        &self,
        role: Role,
        collection: &str,
        mode: SyncMode,
    ) -> Result<SyncReport> {
        let group = self.layout.group_prefix(role, collection);
        let report = self.sync_prefix(&group, mode).await?;
        tracing::info!(
            role = %role,
            collection,
            listed = report.listed,
            fetched = report.fetched,
            "synced group"
        );
        Ok(report)
    }

    /// Syncs every object below `group` and writes its group stamp on success.
    pub async fn sync_prefix(&self, group: &RemotePath, mode: SyncMode) -> Result<SyncReport> {
        self.stamps.clear_group_stamp(group).await?;

        let objects = self.store.list(group).await?;
        let listed = objects.len();

        let fetched: Vec<bool> = stream::iter(objects)
            .map(|object| self.sync_object(group, object, mode))
            .buffer_unordered(FETCH_CONCURRENCY)
            .try_collect()
            .await?;
        let fetched = fetched.into_iter().filter(|f| *f).count();

        self.stamps.write_group_stamp(group, listed).await?;

        Ok(SyncReport {
            listed,
            fetched,
            already_stamped: listed - fetched,
        })
    }

    /// Stamps one object if its local stamp is missing or insufficient.
    /// Returns true if the store was consulted for it.
    async fn sync_object(
        &self,
        group: &RemotePath,
        object: ObjectInfo,
        mode: SyncMode,
    ) -> Result<bool> {
        let path = RemotePath::new(group.bucket.clone(), object.key.clone());

        let sufficient = match (self.stamps.stamp_kind(&path).await?, mode) {
            (None, _) => false,
            (Some(_), SyncMode::Marker) => true,
            (Some(StampKind::Content), SyncMode::Content) => true,
            (Some(StampKind::Marker), SyncMode::Content) => false,
        };
        if sufficient {
            return Ok(false);
        }

        match mode {
            SyncMode::Content => {
                let data = self.store.get(&path).await?;
                self.stamps.write_content(&path, &data).await?;
            }
            SyncMode::Marker => {
                self.stamps.write_marker(&path, object.last_modified).await?;
            }
        }
        tracing::debug!(key = %path, ?mode, "stamped");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayoutConfig;
    use crate::layout::ShardKey;
    use crate::storage::{MemoryStore, StoreOp};
    use tempfile::TempDir;

    struct Fixture {
        store: MemoryStore,
        stamps: StampStore,
        layout: Arc<Layout>,
        engine: SyncEngine,
        _temp: TempDir,
    }

    async fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let stamps = StampStore::new(temp.path().join("build.d")).await.unwrap();
        let layout = Arc::new(
            Layout::new(&LayoutConfig {
                raw_bucket: "raw".to_string(),
                lid_bucket: "lid".to_string(),
                output_bucket: "out".to_string(),
                task: "pos".to_string(),
                model_id: "m".to_string(),
                version: "v1".to_string(),
                ..Default::default()
            })
            .unwrap(),
        );
        let engine = SyncEngine::new(Arc::new(store.clone()), stamps.clone(), layout.clone());
        Fixture {
            store,
            stamps,
            layout,
            engine,
            _temp: temp,
        }
    }

    fn seed(f: &Fixture, role: Role, collection: &str, sub_units: &[&str]) {
        for sub_unit in sub_units {
            let key = ShardKey::new(collection, *sub_unit);
            f.store.insert(&f.layout.path(role, &key), format!("{collection}-{sub_unit}"));
        }
    }

    #[tokio::test]
    async fn test_sync_is_reentrant() {
        let f = fixture().await;
        seed(&f, Role::RawInput, "A", &["1900", "1901", "1902"]);

        let first = f.engine.sync_group(Role::RawInput, "A", SyncMode::Content).await.unwrap();
        assert_eq!(first, SyncReport { listed: 3, fetched: 3, already_stamped: 0 });
        assert_eq!(f.store.stats().gets, 3);

        let second = f.engine.sync_group(Role::RawInput, "A", SyncMode::Content).await.unwrap();
        assert_eq!(second, SyncReport { listed: 3, fetched: 0, already_stamped: 3 });
        assert_eq!(f.store.stats().gets, 3);
    }

    #[tokio::test]
    async fn test_sync_fetches_only_new_objects() {
        let f = fixture().await;
        seed(&f, Role::RawInput, "A", &["1900"]);
        f.engine.sync_group(Role::RawInput, "A", SyncMode::Content).await.unwrap();

        seed(&f, Role::RawInput, "A", &["1901"]);
        let report = f.engine.sync_group(Role::RawInput, "A", SyncMode::Content).await.unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(report.already_stamped, 1);
    }

    #[tokio::test]
    async fn test_content_sync_writes_stamps_and_group_stamp() {
        let f = fixture().await;
        seed(&f, Role::RawInput, "A", &["1900"]);
        f.engine.sync_group(Role::RawInput, "A", SyncMode::Content).await.unwrap();

        let path = f.layout.path(Role::RawInput, &ShardKey::new("A", "1900"));
        assert_eq!(f.stamps.stamp_kind(&path).await.unwrap(), Some(StampKind::Content));
        let group = f.layout.group_prefix(Role::RawInput, "A");
        let group_stamp = f.stamps.read_group_stamp(&group).await.unwrap().unwrap();
        assert_eq!(group_stamp.objects, 1);
    }

    #[tokio::test]
    async fn test_marker_sync_does_not_download() {
        let f = fixture().await;
        seed(&f, Role::Output, "A", &["1900", "1901"]);

        let report = f.engine.sync_group(Role::Output, "A", SyncMode::Marker).await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(f.store.stats().gets, 0);

        let path = f.layout.path(Role::Output, &ShardKey::new("A", "1900"));
        assert_eq!(f.stamps.stamp_kind(&path).await.unwrap(), Some(StampKind::Marker));
    }

    #[tokio::test]
    async fn test_content_sync_upgrades_markers() {
        let f = fixture().await;
        seed(&f, Role::LanguageId, "A", &["1900"]);
        f.engine.sync_group(Role::LanguageId, "A", SyncMode::Marker).await.unwrap();

        let report = f.engine.sync_group(Role::LanguageId, "A", SyncMode::Content).await.unwrap();
        assert_eq!(report.fetched, 1);
        let path = f.layout.path(Role::LanguageId, &ShardKey::new("A", "1900"));
        assert_eq!(f.stamps.stamp_kind(&path).await.unwrap(), Some(StampKind::Content));
    }

    #[tokio::test]
    async fn test_empty_object_is_content_stamped() {
        let f = fixture().await;
        let key = ShardKey::new("A", "1900");
        let path = f.layout.path(Role::RawInput, &key);
        f.store.insert(&path, "");

        // Witnessed as a marker first, then synced for content
        f.engine.sync_group(Role::RawInput, "A", SyncMode::Marker).await.unwrap();
        let report = f.engine.sync_group(Role::RawInput, "A", SyncMode::Content).await.unwrap();

        assert_eq!(report.fetched, 1);
        assert_eq!(f.store.stats().gets, 1);
        assert_eq!(f.stamps.stamp_kind(&path).await.unwrap(), Some(StampKind::Content));

        let again = f.engine.sync_group(Role::RawInput, "A", SyncMode::Content).await.unwrap();
        assert_eq!(again.fetched, 0);
    }

    #[tokio::test]
    async fn test_failed_sync_leaves_group_blocked() {
        let f = fixture().await;
        seed(&f, Role::RawInput, "A", &["1900", "1901"]);
        f.engine.sync_group(Role::RawInput, "A", SyncMode::Content).await.unwrap();
        let group = f.layout.group_prefix(Role::RawInput, "A");
        assert!(f.stamps.has_group_stamp(&group).await.unwrap());

        seed(&f, Role::RawInput, "A", &["1902"]);
        f.store.fail_always(StoreOp::Get, "A-1902");
        let err = f.engine.sync_group(Role::RawInput, "A", SyncMode::Content).await.unwrap_err();
        assert!(err.is_transient());
        assert!(!f.stamps.has_group_stamp(&group).await.unwrap());

        // Recovers once the store does
        f.store.clear_faults();
        let report = f.engine.sync_group(Role::RawInput, "A", SyncMode::Content).await.unwrap();
        assert_eq!(report.fetched, 1);
        assert!(f.stamps.has_group_stamp(&group).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_failure_blocks_group() {
        let f = fixture().await;
        f.store.fail_always(StoreOp::List, "");
        assert!(f.engine.sync_group(Role::RawInput, "A", SyncMode::Content).await.is_err());
        let group = f.layout.group_prefix(Role::RawInput, "A");
        assert!(!f.stamps.has_group_stamp(&group).await.unwrap());
    }

    #[tokio::test]
    async fn test_vanished_objects_keep_their_stamps() {
        let f = fixture().await;
        seed(&f, Role::RawInput, "A", &["1900"]);
        f.engine.sync_group(Role::RawInput, "A", SyncMode::Content).await.unwrap();

        let path = f.layout.path(Role::RawInput, &ShardKey::new("A", "1900"));
        f.store.delete(&path).await.unwrap();
        let report = f.engine.sync_group(Role::RawInput, "A", SyncMode::Content).await.unwrap();

        assert_eq!(report.listed, 0);
        assert!(f.stamps.has_stamp(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_group_gets_group_stamp() {
        let f = fixture().await;
        let report = f.engine.sync_group(Role::Output, "A", SyncMode::Marker).await.unwrap();
        assert_eq!(report, SyncReport::default());
        let group = f.layout.group_prefix(Role::Output, "A");
        assert!(f.stamps.has_group_stamp(&group).await.unwrap());
    }
}
