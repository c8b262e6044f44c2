//! Read-only access to snapshot history

use crate::snapshot::SnapshotEngine;
use timelines_core::{Snapshot, TimelineError, TimelineId, TimelineResult};

/// Thin read façade over [`SnapshotEngine`]
#[derive(Debug, Clone, Copy)]
pub struct HistoryService<'a> {
    snapshots: SnapshotEngine<'a>,
}

impl<'a> HistoryService<'a> {
    /// Wrap a snapshot engine
    pub fn new(snapshots: SnapshotEngine<'a>) -> Self {
        Self { snapshots }
    }

    /// Snapshots of a timeline, ascending by sequence
    pub fn get_history(&self, id: TimelineId) -> TimelineResult<Vec<Snapshot>> {
        self.snapshots.get_history(id)
    }

    /// Latest snapshot, if any
    pub fn head(&self, id: TimelineId) -> TimelineResult<Option<Snapshot>> {
        self.snapshots.head(id)
    }

    /// Snapshot with the given sequence number
    pub fn snapshot_at(&self, id: TimelineId, sequence: u64) -> TimelineResult<Snapshot> {
        // Sequences are gap-free from 1, so the position is sequence - 1
        let history = self.snapshots.get_history(id)?;
        sequence
            .checked_sub(1)
            .and_then(|i| history.get(i as usize))
            .filter(|s| s.sequence == sequence)
            .cloned()
            .ok_or_else(|| TimelineError::NotFound {
                entity: "snapshot",
                id: format!("{}@{}", id, sequence),
            })
    }
}
