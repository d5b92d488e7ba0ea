// rust/shardmill-core/src/storage/memory.rs

//! In-memory remote store.
//!
//! Counts every operation and can be told to fail selected operations, which
//! is what the pipeline tests use to observe fetch counts, write counts and
//! partial-failure recovery.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::traits::{ObjectInfo, PutOutcome, RemoteStore};
use crate::error::{Result, ShardmillError};
use crate::layout::RemotePath;

/// Store operation, for counting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    /// `list` and `list_prefixes`.
    List,
    /// `head` and `exists`.
    Head,
    Get,
    /// `put` and `put_if_absent`.
    Put,
    Delete,
}

/// Snapshot of the operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub lists: usize,
    pub heads: usize,
    pub gets: usize,
    pub puts: usize,
    pub deletes: usize,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

#[derive(Debug)]
struct Fault {
    op: StoreOp,
    key_contains: String,
    /// Remaining failures; `None` fails forever.
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct Counters {
    lists: AtomicUsize,
    heads: AtomicUsize,
    gets: AtomicUsize,
    puts: AtomicUsize,
    deletes: AtomicUsize,
}

/// Thread-safe in-memory remote store. Clones share the same objects.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Arc<RwLock<BTreeMap<(String, String), StoredObject>>>,
    counters: Arc<Counters>,
    faults: Arc<Mutex<Vec<Fault>>>,
}

impl MemoryStore {
    /// Creates a new empty memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an object without counting a write.
    pub fn insert(&self, path: &RemotePath, data: impl Into<Bytes>) {
        self.insert_with_time(path, data, Utc::now());
    }

    /// Seeds an object with an explicit modification time.
    pub fn insert_with_time(
        &self,
        path: &RemotePath,
        data: impl Into<Bytes>,
        last_modified: DateTime<Utc>,
    ) {
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        objects.insert(
            (path.bucket.clone(), path.key.trim_matches('/').to_string()),
            StoredObject {
                data: data.into(),
                last_modified,
            },
        );
    }

    /// Returns the content of an object without counting a read.
    pub fn object(&self, path: &RemotePath) -> Option<Bytes> {
        self.lookup(path).map(|o| o.data)
    }

    /// Returns every key stored in `bucket`, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            lists: self.counters.lists.load(Ordering::SeqCst),
            heads: self.counters.heads.load(Ordering::SeqCst),
            gets: self.counters.gets.load(Ordering::SeqCst),
            puts: self.counters.puts.load(Ordering::SeqCst),
            deletes: self.counters.deletes.load(Ordering::SeqCst),
        }
    }

    pub fn reset_stats(&self) {
        for counter in [
            &self.counters.lists,
            &self.counters.heads,
            &self.counters.gets,
            &self.counters.puts,
            &self.counters.deletes,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
    }

    /// Makes every `op` on a key containing `key_contains` fail with `StoreUnavailable`.
    pub fn fail_always(&self, op: StoreOp, key_contains: impl Into<String>) {
        self.push_fault(op, key_contains.into(), None);
    }

    /// Makes the next `times` matching operations fail with `StoreUnavailable`.
    pub fn fail_times(&self, op: StoreOp, key_contains: impl Into<String>, times: usize) {
        self.push_fault(op, key_contains.into(), Some(times));
    }

    pub fn clear_faults(&self) {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn push_fault(&self, op: StoreOp, key_contains: String, remaining: Option<usize>) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Fault {
                op,
                key_contains,
                remaining,
            });
    }

    /// Counts `op` and returns the injected failure, if any.
    fn enter(&self, op: StoreOp, path: &RemotePath) -> Result<()> {
        let counter = match op {
            StoreOp::List => &self.counters.lists,
            StoreOp::Head => &self.counters.heads,
            StoreOp::Get => &self.counters.gets,
            StoreOp::Put => &self.counters.puts,
            StoreOp::Delete => &self.counters.deletes,
        };
        counter.fetch_add(1, Ordering::SeqCst);

        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        let hit = faults.iter_mut().find(|f| {
            f.op == op && path.key.contains(&f.key_contains) && f.remaining != Some(0)
        });
        match hit {
            Some(fault) => {
                if let Some(remaining) = fault.remaining.as_mut() {
                    *remaining -= 1;
                }
                Err(ShardmillError::store(
                    path.to_string(),
                    format!("injected {op:?} failure"),
                ))
            }
            None => Ok(()),
        }
    }

    fn lookup(&self, path: &RemotePath) -> Option<StoredObject> {
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        objects
            .get(&(path.bucket.clone(), path.key.trim_matches('/').to_string()))
            .cloned()
    }

    /// Keys of `bucket` below the directory-like `prefix`.
    fn under<'a>(
        objects: &'a BTreeMap<(String, String), StoredObject>,
        prefix: &RemotePath,
    ) -> impl Iterator<Item = (&'a String, &'a StoredObject)> {
        let bucket = prefix.bucket.clone();
        let dir = match prefix.key.trim_matches('/') {
            "" => String::new(),
            key => format!("{key}/"),
        };
        objects
            .iter()
            .filter(move |((b, k), _)| *b == bucket && k.starts_with(&dir))
            .map(|((_, k), o)| (k, o))
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn list(&self, prefix: &RemotePath) -> Result<Vec<ObjectInfo>> {
        self.enter(StoreOp::List, prefix)?;
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        Ok(Self::under(&objects, prefix)
            .map(|(key, object)| ObjectInfo {
                key: key.clone(),
                size: object.data.len() as u64,
                last_modified: object.last_modified,
            })
            .collect())
    }

    async fn list_prefixes(&self, prefix: &RemotePath) -> Result<Vec<String>> {
        self.enter(StoreOp::List, prefix)?;
        let skip = match prefix.key.trim_matches('/') {
            "" => 0,
            key => key.len() + 1,
        };
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = Self::under(&objects, prefix)
            .filter_map(|(key, _)| key[skip..].split_once('/').map(|(dir, _)| dir.to_string()))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn exists(&self, path: &RemotePath) -> Result<bool> {
        self.enter(StoreOp::Head, path)?;
        Ok(self.lookup(path).is_some())
    }

    async fn head(&self, path: &RemotePath) -> Result<ObjectInfo> {
        self.enter(StoreOp::Head, path)?;
        self.lookup(path)
            .map(|object| ObjectInfo {
                key: path.key.clone(),
                size: object.data.len() as u64,
                last_modified: object.last_modified,
            })
            .ok_or_else(|| ShardmillError::not_found(path.to_string()))
    }

    async fn get(&self, path: &RemotePath) -> Result<Bytes> {
        self.enter(StoreOp::Get, path)?;
        self.lookup(path)
            .map(|object| object.data)
            .ok_or_else(|| ShardmillError::not_found(path.to_string()))
    }

    async fn put(&self, path: &RemotePath, data: Bytes) -> Result<()> {
        self.enter(StoreOp::Put, path)?;
        self.insert(path, data);
        Ok(())
    }

    async fn put_if_absent(&self, path: &RemotePath, data: Bytes) -> Result<PutOutcome> {
        self.enter(StoreOp::Put, path)?;
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        let slot = (path.bucket.clone(), path.key.trim_matches('/').to_string());
        if objects.contains_key(&slot) {
            return Ok(PutOutcome::AlreadyExists);
        }
        objects.insert(
            slot,
            StoredObject {
                data,
                last_modified: Utc::now(),
            },
        );
        Ok(PutOutcome::Created)
    }

    async fn delete(&self, path: &RemotePath) -> Result<()> {
        self.enter(StoreOp::Delete, path)?;
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        objects.remove(&(path.bucket.clone(), path.key.trim_matches('/').to_string()));
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
