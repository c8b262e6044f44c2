//! Concurrency layer for Timelines
//!
//! This crate implements the per-timeline exclusion the engine relies on:
//! - LockTable: One async mutex per key, created on demand
//! - LockGuard: Holds one or more keys; released on drop, on every exit path
//! - Ordered multi-acquire: keys are always locked in ascending order, so two
//!   operations sharing keys (e.g. concurrent merges into the same parent)
//!   cannot deadlock

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod lock_table;

pub use lock_table::{LockGuard, LockTable};
