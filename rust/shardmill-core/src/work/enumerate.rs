// rust/shardmill-core/src/work/enumerate.rs

//! Shard enumeration and work list materialization.
//!
//! Work units are the `(collection, sub_unit)` pairs found below the raw input
//! root. The ordered list is written to a local file so that machines sharing
//! it diverge in selection order rather than in content.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::fs;

use crate::config::OrderingPolicy;
use crate::error::{Result, ShardmillError};
use crate::layout::{Layout, Role, ShardKey};
use crate::storage::RemoteStore;

/// Lists work units available in the raw input store.
#[derive(Clone)]
pub struct ShardEnumerator {
    store: Arc<dyn RemoteStore>,
    layout: Arc<Layout>,
}

impl ShardEnumerator {
    pub fn new(store: Arc<dyn RemoteStore>, layout: Arc<Layout>) -> Self {
        Self { store, layout }
    }

    /// Lists the collections (first-level partitions) present for `role`.
    pub async fn list_collections(&self, role: Role) -> Result<Vec<String>> {
        self.store.list_prefixes(&self.layout.root(role)).await
    }

    /// Lists the unique, sorted work units of `collections`, or of every raw
    /// collection when `collections` is empty.
    ///
    /// Objects whose names do not parse as shard keys are skipped.
    pub async fn list_work_units(&self, collections: &[String]) -> Result<Vec<ShardKey>> {
        let collections = if collections.is_empty() {
            self.list_collections(Role::RawInput).await?
        } else {
            collections.to_vec()
        };

        let mut keys = BTreeSet::new();
        for collection in &collections {
            let group = self.layout.group_prefix(Role::RawInput, collection);
            for object in self.store.list(&group).await? {
                match self.layout.parse_key(Role::RawInput, &object.key) {
                    Ok(key) => {
                        keys.insert(key);
                    }
                    Err(e) => tracing::warn!(key = %object.key, error = %e, "skipping object"),
                }
            }
        }

        tracing::debug!(
            collections = collections.len(),
            work_units = keys.len(),
            "enumerated work units"
        );
        Ok(keys.into_iter().collect())
    }
}

/// Orders work units according to `policy`.
///
/// `Random` shuffles, reproducibly when `seed` is given. `Recency` puts the
/// newest sub-units first, ties broken by collection name.
pub fn order(mut keys: Vec<ShardKey>, policy: OrderingPolicy, seed: Option<u64>) -> Vec<ShardKey> {
    match policy {
        OrderingPolicy::Random => {
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            };
            keys.shuffle(&mut rng);
        }
        OrderingPolicy::Recency => {
            keys.sort_by(|a, b| {
                b.sub_unit
                    .cmp(&a.sub_unit)
                    .then_with(|| a.collection.cmp(&b.collection))
            });
        }
    }
    keys
}

/// Writes the work list, one `collection/sub_unit` per line, atomically.
pub async fn materialize(keys: &[ShardKey], path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await.map_err(|e| {
        ShardmillError::stamp_with_source(parent, "failed to create work list directory", e)
    })?;

    let mut body = String::with_capacity(keys.len() * 24);
    for key in keys {
        body.push_str(&key.to_worklist_line());
        body.push('\n');
    }

    let temp = parent.join(format!(".worklist.{}.tmp", uuid::Uuid::new_v4()));
    fs::write(&temp, body).await.map_err(|e| {
        ShardmillError::stamp_with_source(&temp, "failed to write work list", e)
    })?;
    if let Err(e) = fs::rename(&temp, path).await {
        let _ = fs::remove_file(&temp).await;
        return Err(ShardmillError::stamp_with_source(
            path,
            "failed to move work list into place",
            e,
        ));
    }
    Ok(())
}

/// Reads a work list written by [`materialize`]. Blank lines and `#` comments are ignored.
pub async fn load_worklist(path: &Path) -> Result<Vec<ShardKey>> {
    let body = fs::read_to_string(path)
        .await
        .map_err(|e| ShardmillError::stamp_with_source(path, "failed to read work list", e))?;
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayoutConfig;
    use crate::storage::MemoryStore;
    use tempfile::TempDir;

    fn layout() -> Arc<Layout> {
        Arc::new(
            Layout::new(&LayoutConfig {
                raw_bucket: "raw".to_string(),
                raw_prefix: "final".to_string(),
                lid_bucket: "lid".to_string(),
                output_bucket: "out".to_string(),
                task: "pos".to_string(),
                model_id: "m".to_string(),
                version: "v1".to_string(),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn keys(pairs: &[(&str, &str)]) -> Vec<ShardKey> {
        pairs.iter().map(|(c, s)| ShardKey::new(*c, *s)).collect()
    }

    fn seeded_enumerator() -> ShardEnumerator {
        let store = MemoryStore::new();
        let layout = layout();
        for (c, s) in [("A", "1900"), ("A", "1901"), ("B", "1850")] {
            store.insert(&layout.path(Role::RawInput, &ShardKey::new(c, s)), "x");
        }
        store.insert(&layout.group_prefix(Role::RawInput, "A").child("README.txt"), "x");
        ShardEnumerator::new(Arc::new(store), layout)
    }

    #[tokio::test]
    async fn test_list_collections() {
        let enumerator = seeded_enumerator();
        let collections = enumerator.list_collections(Role::RawInput).await.unwrap();
        assert_eq!(collections, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_list_work_units_skips_unparseable() {
        let enumerator = seeded_enumerator();
        let units = enumerator.list_work_units(&[]).await.unwrap();
        assert_eq!(units, keys(&[("A", "1900"), ("A", "1901"), ("B", "1850")]));
    }

    #[tokio::test]
    async fn test_list_work_units_restricted() {
        let enumerator = seeded_enumerator();
        let units = enumerator.list_work_units(&["B".to_string()]).await.unwrap();
        assert_eq!(units, keys(&[("B", "1850")]));
    }

    #[test]
    fn test_recency_order() {
        let ordered = order(
            keys(&[("A", "1900"), ("B", "1901"), ("A", "1901"), ("C", "1850")]),
            OrderingPolicy::Recency,
            None,
        );
        assert_eq!(
            ordered,
            keys(&[("A", "1901"), ("B", "1901"), ("A", "1900"), ("C", "1850")])
        );
    }

    #[test]
    fn test_random_order_is_a_permutation() {
        let input: Vec<ShardKey> = (1800..1900)
            .map(|year| ShardKey::new("A", year.to_string()))
            .collect();
        let mut shuffled = order(input.clone(), OrderingPolicy::Random, None);
        assert_eq!(shuffled.len(), input.len());
        shuffled.sort();
        assert_eq!(shuffled, input);
    }

    #[test]
    fn test_seeded_random_order_is_reproducible() {
        let input: Vec<ShardKey> = (1800..1900)
            .map(|year| ShardKey::new("A", year.to_string()))
            .collect();
        let a = order(input.clone(), OrderingPolicy::Random, Some(7));
        let b = order(input.clone(), OrderingPolicy::Random, Some(7));
        let c = order(input, OrderingPolicy::Random, Some(8));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_materialize_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/worklist.txt");
        let list = keys(&[("B", "1850"), ("A", "1900")]);

        materialize(&list, &path).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "B/1850\nA/1900\n");
        assert_eq!(load_worklist(&path).await.unwrap(), list);
    }

    #[tokio::test]
    async fn test_load_worklist_ignores_comments_and_rejects_garbage() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("worklist.txt");

        std::fs::write(&path, "# generated\n\nA/1900\n").unwrap();
        assert_eq!(load_worklist(&path).await.unwrap(), keys(&[("A", "1900")]));

        std::fs::write(&path, "A-1900\n").unwrap();
        assert!(load_worklist(&path).await.is_err());
    }
}
