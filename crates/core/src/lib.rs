//! Core types and traits for Timelines
//!
//! This crate defines the foundational types used throughout the system:
//! - TimelineId / SnapshotId: Opaque identifiers allocated by the engine
//! - ForkRef / SnapshotRef / DataRef: Handles into the storage provider
//! - Timeline / Snapshot: The branch and checkpoint entities
//! - Value / Row / SchemaObject: The relational data model forks hold
//! - Query / RawDiff: What the provider executes and reports
//! - Error: Error type hierarchy
//! - Traits: The `StorageProvider` seam

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod relational;
pub mod timeline_types;
pub mod traits;
pub mod types;
pub mod value;

pub use error::{TimelineError, TimelineResult};
pub use relational::{
    ChangeKind, Columns, Query, QueryResult, RawDiff, Row, RowChange, SchemaChange, SchemaKind,
    SchemaObject,
};
pub use timeline_types::{Snapshot, Timeline, TimelineStatus};
pub use traits::{ProviderError, ProviderErrorKind, ProviderResult, StorageProvider};
pub use types::{DataRef, ForkRef, SnapshotId, SnapshotRef, TimelineId};
pub use value::Value;
