//! The storage provider seam
//!
//! The engine never talks to a database directly. Everything it needs from
//! the fork-capable backend goes through [`StorageProvider`], and only the
//! fork manager holds one.
//!
//! Providers are assumed slow (hundreds of milliseconds to seconds per call),
//! consistent within a single fork, and never consistent across forks. No
//! method is assumed idempotent.

use crate::relational::{Query, QueryResult, RawDiff};
use crate::types::{DataRef, ForkRef, SnapshotRef};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Result type for provider calls
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Classification of a provider failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorKind {
    /// Temporary failure; the same call may succeed later
    Transient,
    /// Rejected for good (quota, invalid statement, ...)
    Permanent,
    /// The referenced fork or snapshot does not exist
    NotFound,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderErrorKind::Transient => "transient",
            ProviderErrorKind::Permanent => "permanent",
            ProviderErrorKind::NotFound => "not found",
        })
    }
}

/// Error reported by a storage provider
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    /// Failure class
    pub kind: ProviderErrorKind,
    /// Provider message
    pub message: String,
}

impl ProviderError {
    /// Temporary failure
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Permanent rejection
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// Unknown fork or snapshot
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::NotFound,
            message: message.into(),
        }
    }

    /// Check if retrying may help
    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }

    /// Check if the referenced handle is unknown to the provider
    pub fn is_not_found(&self) -> bool {
        self.kind == ProviderErrorKind::NotFound
    }
}

/// Fork-capable storage backend
///
/// Thread safety: all methods may be called concurrently (requires
/// Send + Sync).
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Create a new logically isolated fork whose initial contents equal
    /// `source`. Zero-copy on the provider side.
    async fn create_fork(&self, source: &DataRef) -> ProviderResult<ForkRef>;

    /// Destroy a fork. Dropping an unknown fork reports `NotFound`.
    async fn drop_fork(&self, fork: &ForkRef) -> ProviderResult<()>;

    /// Capture the committed contents of a fork as an immutable snapshot
    async fn snapshot_fork(&self, fork: &ForkRef) -> ProviderResult<SnapshotRef>;

    /// Execute a statement against a fork
    async fn execute(&self, fork: &ForkRef, query: &Query) -> ProviderResult<QueryResult>;

    /// Compute the difference `from` → `to`
    async fn diff_data(&self, from: &DataRef, to: &DataRef) -> ProviderResult<RawDiff>;

    /// Check whether a fork is still live
    ///
    /// Providers that cannot answer report every fork as live; the engine
    /// then only notices a lost fork when a later call fails.
    async fn fork_exists(&self, _fork: &ForkRef) -> ProviderResult<bool> {
        Ok(true)
    }
}
