// rust/shardmill-core/src/work/mod.rs

//! Work partitioning and processing.
//!
//! - [`ShardEnumerator`] lists the work units present in the raw input store.
//! - [`Scheduler`] decides which of them need processing and fans them out.
//! - [`ProcessingRunner`] annotates one unit and publishes the result.

pub mod annotator;
pub mod enumerate;
pub mod runner;
pub mod schedule;

pub use annotator::{AnnotationRequest, AnnotationStatus, Annotator, CommandAnnotator};
pub use enumerate::{load_worklist, materialize, order, ShardEnumerator};
pub use runner::{ProcessingRunner, RunResult};
pub use schedule::{BatchReport, Scheduler, WorkItem};
