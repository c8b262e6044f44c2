//! Timelines - version control for databases
//!
//! A timeline is a named line of database history backed by a fork in a
//! fork-capable storage provider. Timelines form a tree rooted at the
//! production database; each records immutable snapshots, can be merged
//! into its parent with three-way conflict detection, and can be compared
//! with any other timeline.
//!
//! # Quick Start
//!
//! ```ignore
//! use timelines::{Query, Row, SchemaObject, Timelines};
//!
//! let timelines = Timelines::in_memory();
//! let main = timelines.create_timeline("main", "production", None).await?;
//! timelines
//!     .execute(main.id, Query::CreateObject(SchemaObject::table("users", "id TEXT")))
//!     .await?;
//!
//! let feature = timelines.create_timeline("feature", "", Some(main.id)).await?;
//! timelines
//!     .execute(feature.id, Query::Upsert { table: "users".into(), row: Row::new("1") })
//!     .await?;
//!
//! let result = timelines.merge_timeline(feature.id).await?;
//! assert!(result.is_merged());
//! ```
//!
//! # Architecture
//!
//! All operations go through [`Timelines`], which serializes work per
//! timeline and delegates to the store and the snapshot, merge and compare
//! engines. Providers plug in through [`StorageProvider`]; the in-memory
//! [`MemoryProvider`] backs tests and embedded use.

pub use timelines_core::*;
pub use timelines_engine::*;
pub use timelines_storage::{DatabaseState, Fault, FaultPlan, MemoryProvider, ProviderOp};
