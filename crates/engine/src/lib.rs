//! Timeline engine
//!
//! This crate orchestrates the lower layers:
//! - TimelineStore: timeline tree, lifecycle status and snapshot history
//! - ForkManager: the only caller of the storage provider (retry, timeout,
//!   fork ownership, checkout and release)
//! - SnapshotEngine / HistoryService: point-in-time captures and their history
//! - MergeEngine: three-way merge of a timeline into its parent
//! - CompareEngine: schema and row differences between two timelines
//! - Timelines: the façade that takes per-timeline locks and exposes the
//!   operations
//!
//! Configuration comes from `timelines.toml` (see [`TimelinesConfig`]).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compare;
pub mod config;
pub mod fork;
pub mod history;
pub mod merge;
pub mod retry;
pub mod snapshot;
pub mod store;
pub mod timelines;

pub use compare::{
    CompareEngine, Comparison, ComparisonSummary, RowDelta, SchemaDelta, TableComparison,
};
pub use config::{TimelinesConfig, CONFIG_FILE_NAME};
pub use fork::ForkManager;
pub use history::HistoryService;
pub use merge::{plan_merge, MergeConflict, MergeEngine, MergePlan, MergeResult, MergeSide};
pub use retry::RetryConfig;
pub use snapshot::SnapshotEngine;
pub use store::{TimelineStore, METADATA_FILE_NAME};
pub use timelines::{DeleteOptions, Timelines};
