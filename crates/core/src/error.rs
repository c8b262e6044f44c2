//! Error types for the timelines engine
//!
//! This module defines all error types surfaced by engine operations.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! | Variant | Retried internally | Meaning |
//! |---------|--------------------|---------|
//! | `NotFound` | never | Unknown timeline or snapshot id |
//! | `InvalidState` | never | Operation not legal for the current status |
//! | `ProviderUnavailable` | yes, before surfacing | Transient provider failure |
//! | `ProviderTimeout` | no | Provider call exceeded the caller's deadline |
//! | `ProviderError` | no | Permanent provider rejection |
//! | `InvariantViolation` | no | Corrupt metadata; the operation is aborted |
//!
//! Merge conflicts are not errors; they are a regular merge outcome.

use crate::types::TimelineId;
use std::io;
use thiserror::Error;

/// Result type alias for timeline operations
pub type TimelineResult<T> = std::result::Result<T, TimelineError>;

/// Error types for timeline operations
#[derive(Debug, Error)]
pub enum TimelineError {
    /// Unknown id
    #[error("{entity} not found: {id}")]
    NotFound {
        /// What was looked up ("timeline", "snapshot", ...)
        entity: &'static str,
        /// The id that was not found
        id: String,
    },

    /// Operation not legal in the timeline's current state
    #[error("invalid state for timeline {id}: {reason}")]
    InvalidState {
        /// Timeline the operation targeted
        id: TimelineId,
        /// Why the operation was refused
        reason: String,
    },

    /// Transient provider failure that outlived the retry budget
    #[error(
        "provider unavailable during {operation} on timeline {timeline} after {attempts} attempt(s): {message}"
    )]
    ProviderUnavailable {
        /// Provider operation
        operation: &'static str,
        /// Timeline the call was made for
        timeline: TimelineId,
        /// Attempts made
        attempts: usize,
        /// Last provider message
        message: String,
    },

    /// Provider call exceeded the caller-supplied timeout
    #[error("provider timed out during {operation} on timeline {timeline} after {timeout_ms}ms")]
    ProviderTimeout {
        /// Provider operation
        operation: &'static str,
        /// Timeline the call was made for
        timeline: TimelineId,
        /// The deadline that elapsed
        timeout_ms: u64,
    },

    /// Permanent provider rejection
    #[error("provider rejected {operation} on timeline {timeline}: {message}")]
    ProviderError {
        /// Provider operation
        operation: &'static str,
        /// Timeline the call was made for
        timeline: TimelineId,
        /// Provider message
        message: String,
    },

    /// Internal invariant violation (dangling parent, cycle, ...)
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error while persisting metadata
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Metadata (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl TimelineError {
    /// Unknown timeline
    pub fn timeline_not_found(id: TimelineId) -> Self {
        TimelineError::NotFound {
            entity: "timeline",
            id: id.to_string(),
        }
    }

    /// Operation refused for the timeline's current state
    pub fn invalid_state(id: TimelineId, reason: impl Into<String>) -> Self {
        TimelineError::InvalidState {
            id,
            reason: reason.into(),
        }
    }

    /// Corrupt metadata
    pub fn invariant(reason: impl Into<String>) -> Self {
        TimelineError::InvariantViolation(reason.into())
    }

    /// Check if the error is `NotFound`
    pub fn is_not_found(&self) -> bool {
        matches!(self, TimelineError::NotFound { .. })
    }

    /// Check if the error is `InvalidState`
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, TimelineError::InvalidState { .. })
    }

    /// Check if the caller may reasonably retry the whole operation later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TimelineError::ProviderUnavailable { .. } | TimelineError::ProviderTimeout { .. }
        )
    }

    /// Check if this is a failure to write metadata (as opposed to a
    /// validation failure)
    pub fn is_metadata_write(&self) -> bool {
        matches!(self, TimelineError::Io(_) | TimelineError::Serialization(_))
    }

    /// Stable machine-readable code
    pub fn error_code(&self) -> &'static str {
        match self {
            TimelineError::NotFound { .. } => "NotFound",
            TimelineError::InvalidState { .. } => "InvalidState",
            TimelineError::ProviderUnavailable { .. } => "ProviderUnavailable",
            TimelineError::ProviderTimeout { .. } => "ProviderTimeout",
            TimelineError::ProviderError { .. } => "ProviderError",
            TimelineError::InvariantViolation(_) => "InvariantViolation",
            TimelineError::Config(_) => "Config",
            TimelineError::Io(_) => "Io",
            TimelineError::Serialization(_) => "Serialization",
        }
    }
}
