//! Snapshot creation and history
//!
//! A snapshot captures the committed contents of a timeline's live fork.
//! Sequence numbers are allocated by the store under its write lock and
//! the caller holds the timeline's lock, so history stays gap-free.

use crate::fork::ForkManager;
use crate::store::TimelineStore;
use timelines_core::{Snapshot, TimelineId, TimelineResult};
use tracing::{info, warn};

/// Creates snapshots and reads snapshot history
#[derive(Debug, Clone, Copy)]
pub struct SnapshotEngine<'a> {
    store: &'a TimelineStore,
    forks: &'a ForkManager,
}

impl<'a> SnapshotEngine<'a> {
    /// Create a snapshot engine over a store and fork manager
    pub fn new(store: &'a TimelineStore, forks: &'a ForkManager) -> Self {
        Self { store, forks }
    }

    /// Snapshot a timeline's live fork and make it the new head
    ///
    /// `InvalidState` if the timeline is not active or has no live fork.
    pub async fn create_snapshot(
        &self,
        id: TimelineId,
        description: &str,
    ) -> TimelineResult<Snapshot> {
        let timeline = self.store.get(id)?;
        let fork = self.forks.live_fork(&timeline)?;
        let provider_ref = self.forks.snapshot(id, &fork).await?;

        let store = self.store;
        let snapshot = self
            .forks
            .write_metadata(|| store.append_snapshot(id, description, provider_ref.clone()))
            .await
            .map_err(|e| {
                // The provider snapshot is immutable and unreferenced; nothing to undo
                warn!(
                    target: "timelines::snapshot",
                    timeline_id = %id,
                    provider_ref = %provider_ref,
                    error = %e,
                    "Could not record snapshot"
                );
                e
            })?;

        info!(
            target: "timelines::snapshot",
            timeline_id = %id,
            sequence = snapshot.sequence,
            snapshot_id = %snapshot.id,
            "Created snapshot"
        );
        Ok(snapshot)
    }

    /// Snapshots of a timeline, ascending by sequence
    pub fn get_history(&self, id: TimelineId) -> TimelineResult<Vec<Snapshot>> {
        self.store.history(id)
    }

    /// Highest-sequence snapshot, if any
    pub fn head(&self, id: TimelineId) -> TimelineResult<Option<Snapshot>> {
        self.store.head_snapshot(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use std::sync::Arc;
    use std::time::Duration;
    use timelines_core::{Query, Row, SchemaObject, Timeline, TimelineStatus};
    use timelines_storage::MemoryProvider;

    fn setup() -> (Arc<MemoryProvider>, Arc<TimelineStore>, ForkManager, TimelineId) {
        let provider = Arc::new(MemoryProvider::new());
        let store = Arc::new(TimelineStore::ephemeral());
        let root = Timeline::new(TimelineId::new(), "main", "", None, None);
        let id = root.id;
        store.insert(root).unwrap();
        let forks = ForkManager::new(
            provider.clone(),
            store.clone(),
            RetryConfig::new().with_base_delay_ms(1),
            3,
            Duration::from_secs(5),
        );
        (provider, store, forks, id)
    }

    #[tokio::test]
    async fn test_snapshot_requires_live_fork() {
        let (_provider, store, forks, id) = setup();
        let engine = SnapshotEngine::new(&store, &forks);
        let err = engine.create_snapshot(id, "too early").await.unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[tokio::test]
    async fn test_snapshot_of_inactive_timeline_rejected() {
        let (_provider, store, forks, id) = setup();
        forks.checkout(id).await.unwrap();
        store
            .update(id, |t| {
                t.status = TimelineStatus::Deleted;
                Ok(())
            })
            .unwrap();
        let engine = SnapshotEngine::new(&store, &forks);
        assert!(engine
            .create_snapshot(id, "x")
            .await
            .unwrap_err()
            .is_invalid_state());
    }

    #[tokio::test]
    async fn test_snapshots_capture_state_in_sequence() {
        let (provider, store, forks, id) = setup();
        let fork = forks.checkout(id).await.unwrap();
        let engine = SnapshotEngine::new(&store, &forks);

        forks
            .execute(id, &fork, &Query::CreateObject(SchemaObject::table("t", "")))
            .await
            .unwrap();
        let first = engine.create_snapshot(id, "schema").await.unwrap();

        forks
            .execute(
                id,
                &fork,
                &Query::Upsert {
                    table: "t".into(),
                    row: Row::new("1").with("v", 1),
                },
            )
            .await
            .unwrap();
        let second = engine.create_snapshot(id, "data").await.unwrap();

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(engine.head(id).unwrap().unwrap().id, second.id);

        let history = engine.get_history(id).unwrap();
        assert_eq!(history, vec![first.clone(), second.clone()]);

        assert_eq!(
            provider.snapshot_state(&first.provider_ref).unwrap().row_count(),
            0
        );
        assert_eq!(
            provider.snapshot_state(&second.provider_ref).unwrap().row_count(),
            1
        );
    }

    #[tokio::test]
    async fn test_unrecorded_snapshot_leaves_history_untouched() {
        let (_provider, store, forks, id) = setup();
        forks.checkout(id).await.unwrap();
        store.fail_next_writes(3);
        let engine = SnapshotEngine::new(&store, &forks);
        assert!(engine.create_snapshot(id, "x").await.is_err());
        assert!(engine.get_history(id).unwrap().is_empty());
        assert_eq!(store.get(id).unwrap().head_snapshot_id, None);
    }
}
