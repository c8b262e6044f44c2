//! Timeline and snapshot entities
//!
//! ## Lifecycle
//!
//! ```text
//!            merge (success)
//!   Active ────────────────────► Merged   (terminal)
//!     │
//!     │ delete
//!     └────────────────────────► Deleted  (terminal)
//! ```
//!
//! A timeline's `parent_id` is fixed at creation. Snapshots are immutable
//! once recorded; the owning timeline's `head_snapshot_id` always names the
//! highest-sequence one.

use crate::types::{ForkRef, SnapshotId, SnapshotRef, TimelineId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timeline lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimelineStatus {
    /// Timeline accepts checkouts, writes, snapshots and merges
    Active,
    /// Timeline was merged into its parent; its fork is retired
    Merged,
    /// Timeline was deleted; metadata and history are kept for audit
    Deleted,
}

impl TimelineStatus {
    /// Check if the timeline is still active
    pub fn is_active(&self) -> bool {
        matches!(self, TimelineStatus::Active)
    }

    /// Check if the status is terminal (merged or deleted)
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            TimelineStatus::Active => "active",
            TimelineStatus::Merged => "merged",
            TimelineStatus::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for TimelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named branch of database state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    /// Unique identifier
    pub id: TimelineId,
    /// Human-readable name
    pub name: String,
    /// Free-form description
    pub description: String,
    /// Parent timeline; `None` only for the root
    pub parent_id: Option<TimelineId>,
    /// Live fork, if checked out
    pub fork_ref: Option<ForkRef>,
    /// Highest-sequence snapshot, if any
    pub head_snapshot_id: Option<SnapshotId>,
    /// Lifecycle status
    pub status: TimelineStatus,
    /// Provider snapshot of the parent taken when this timeline was created.
    /// This is the common base for three-way merges back into the parent.
    pub fork_point: Option<SnapshotRef>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last metadata change
    pub updated_at: DateTime<Utc>,
}

impl Timeline {
    /// Create a new active timeline record
    pub fn new(
        id: TimelineId,
        name: impl Into<String>,
        description: impl Into<String>,
        parent_id: Option<TimelineId>,
        fork_point: Option<SnapshotRef>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            description: description.into(),
            parent_id,
            fork_ref: None,
            head_snapshot_id: None,
            status: TimelineStatus::Active,
            fork_point,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if this is the root timeline
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Check if a live fork is recorded
    pub fn is_checked_out(&self) -> bool {
        self.fork_ref.is_some()
    }

    /// Check if the timeline is active
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// An immutable point-in-time capture of a timeline's fork
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Unique identifier
    pub id: SnapshotId,
    /// Owning timeline
    pub timeline_id: TimelineId,
    /// Free-form description
    pub description: String,
    /// Provider handle; never reassigned
    pub provider_ref: SnapshotRef,
    /// Position in the owning timeline's history, starting at 1
    pub sequence: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
}
