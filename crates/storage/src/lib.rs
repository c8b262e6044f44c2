//! Storage layer for Timelines
//!
//! This crate implements an in-process, fork-capable storage provider:
//! - DatabaseState: schema objects + keyed rows, with statement application
//!   and state-to-state diffing
//! - MemoryProvider: `StorageProvider` over copy-on-write states; forks and
//!   snapshots share data until written (zero-copy at creation)
//! - FaultPlan: deterministic fault injection (transient/permanent failures,
//!   delays) for exercising retry, timeout and cleanup paths
//!
//! `MemoryProvider` is the ephemeral backend: embedders use it when no
//! external provider is configured, and the engine's tests run against it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod faults;
pub mod memory;
pub mod state;

pub use faults::{Fault, FaultPlan, ProviderOp};
pub use memory::MemoryProvider;
pub use state::DatabaseState;
