// rust/shardmill-core/src/lib.rs

//! Shardmill - Core Library
//!
//! Distributed, stamp-based work partitioning and idempotent publishing for
//! annotating a sharded corpus. Independent workers share nothing but the
//! remote object store: each mirrors remote state into local stamps, derives
//! its own candidates, and publishes results with a conditional create so
//! that at most one result per shard ever lands.

pub mod config;
pub mod error;
pub mod layout;
pub mod stamp;
pub mod storage;
pub mod sync;

// Re-export commonly used types for convenience
pub use config::PipelineConfig;
pub use error::{Result, ShardmillError};
pub use layout::{Layout, RemotePath, Role, RunId, ShardKey};
pub use stamp::{StampKind, StampStore};
pub use storage::{LocalStore, MemoryStore, ObjectInfo, PutOutcome, RemoteStore};
pub use sync::{SyncEngine, SyncMode, SyncReport};

pub mod work;
pub use work::{
    AnnotationStatus, Annotator, BatchReport, CommandAnnotator, ProcessingRunner, RunResult,
    Scheduler, ShardEnumerator, WorkItem,
};

pub mod pipeline;
pub use pipeline::{Pipeline, PipelineReport, SyncSummary};
