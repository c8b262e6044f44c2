//! The `Timelines` façade
//!
//! Every public operation goes through here. The façade takes the
//! per-timeline locks an operation needs (in ascending id order, for the
//! whole operation) and then delegates to the store and the engines.
//!
//! ## Example
//!
//! ```ignore
//! let timelines = Timelines::in_memory();
//! let main = timelines.create_timeline("main", "production", None).await?;
//! let feature = timelines.create_timeline("feature", "", Some(main.id)).await?;
//! timelines.execute(feature.id, Query::Upsert { .. }).await?;
//! match timelines.merge_timeline(feature.id).await? {
//!     MergeResult::Merged { merged_snapshot, .. } => { /* main moved ahead */ }
//!     MergeResult::Conflicted { conflicts } => { /* nothing changed */ }
//! }
//! ```

use crate::compare::{CompareEngine, Comparison};
use crate::config::TimelinesConfig;
use crate::fork::ForkManager;
use crate::history::HistoryService;
use crate::merge::{MergeEngine, MergeResult};
use crate::snapshot::SnapshotEngine;
use crate::store::TimelineStore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use timelines_concurrency::LockTable;
use timelines_core::{
    DataRef, ForkRef, Query, QueryResult, Snapshot, StorageProvider, Timeline, TimelineError,
    TimelineId, TimelineResult, TimelineStatus,
};
use timelines_storage::MemoryProvider;
use tracing::info;

/// Options for [`Timelines::delete_timeline_with`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Also delete a Merged timeline
    pub force: bool,
}

impl DeleteOptions {
    /// Allow deleting a Merged timeline
    pub fn force() -> Self {
        Self { force: true }
    }
}

struct Shared {
    store: Arc<TimelineStore>,
    locks: LockTable<TimelineId>,
    config: TimelinesConfig,
}

/// Database version control over a fork-capable storage provider
///
/// Cheap to clone; clones share all state. Operations on different
/// timelines run concurrently, operations on the same timeline are
/// serialized.
#[derive(Clone)]
pub struct Timelines {
    shared: Arc<Shared>,
    forks: ForkManager,
}

impl std::fmt::Debug for Timelines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timelines")
            .field("timelines", &self.shared.store.len())
            .field("persisted", &self.shared.store.path())
            .field("timeout", &self.forks.timeout())
            .finish()
    }
}

impl Timelines {
    // ========================================================================
    // Construction
    // ========================================================================

    fn build(
        provider: Arc<dyn StorageProvider>,
        store: TimelineStore,
        config: TimelinesConfig,
    ) -> Self {
        let store = Arc::new(store);
        let forks = ForkManager::new(
            provider,
            Arc::clone(&store),
            config.retry.clone(),
            config.metadata_write_attempts,
            config.provider_timeout(),
        );
        Self {
            shared: Arc::new(Shared {
                store,
                locks: LockTable::new(),
                config,
            }),
            forks,
        }
    }

    /// Ephemeral engine over the in-memory provider with default config
    pub fn in_memory() -> Self {
        Self::build(
            Arc::new(MemoryProvider::new()),
            TimelineStore::ephemeral(),
            TimelinesConfig::default(),
        )
    }

    /// Ephemeral engine (metadata in memory) over `provider`
    pub fn ephemeral(provider: Arc<dyn StorageProvider>) -> Self {
        Self::build(provider, TimelineStore::ephemeral(), TimelinesConfig::default())
    }

    /// Ephemeral engine with explicit configuration
    pub fn with_config(
        provider: Arc<dyn StorageProvider>,
        config: TimelinesConfig,
    ) -> TimelineResult<Self> {
        config.validate()?;
        Ok(Self::build(provider, TimelineStore::ephemeral(), config))
    }

    /// Open the engine persisted in `dir`
    ///
    /// Creates the directory and a default `timelines.toml` if missing,
    /// then loads the config and the timeline metadata.
    pub fn open(dir: impl AsRef<Path>, provider: Arc<dyn StorageProvider>) -> TimelineResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let config = TimelinesConfig::load_or_init(dir)?;
        let store = TimelineStore::open(dir)?;
        info!(target: "timelines::engine", dir = %dir.display(), "Opened timelines");
        Ok(Self::build(provider, store, config))
    }

    /// Same engine with a different per-provider-call timeout
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            forks: self.forks.with_timeout(timeout),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &TimelinesConfig {
        &self.shared.config
    }

    /// Metadata registry
    pub fn store(&self) -> &TimelineStore {
        &self.shared.store
    }

    fn snapshots(&self) -> SnapshotEngine<'_> {
        SnapshotEngine::new(&self.shared.store, &self.forks)
    }

    /// Read access to snapshot history
    pub fn history(&self) -> HistoryService<'_> {
        HistoryService::new(self.snapshots())
    }

    // ========================================================================
    // Timelines
    // ========================================================================

    /// Create a timeline with a live fork
    ///
    /// Without a parent this creates the root, forked from the fresh base.
    /// With a parent, the parent's current state is snapshotted (the new
    /// timeline's fork point) and the new fork starts from it.
    pub async fn create_timeline(
        &self,
        name: &str,
        description: &str,
        parent_id: Option<TimelineId>,
    ) -> TimelineResult<Timeline> {
        let id = TimelineId::new();
        let store = &self.shared.store;

        let (_guard, fork_point, source) = match parent_id {
            None => {
                if let Some(root) = store.root() {
                    return Err(TimelineError::invalid_state(
                        id,
                        format!("root timeline {} already exists", root.id),
                    ));
                }
                (None, None, DataRef::Base)
            }
            Some(parent) => {
                let guard = self.shared.locks.lock(parent).await;
                let parent_timeline = store.get(parent)?;
                if !parent_timeline.is_active() {
                    return Err(TimelineError::timeline_not_found(parent));
                }
                let parent_fork = self.forks.checkout(parent).await?;
                let fork_point = self.forks.snapshot(parent, &parent_fork).await?;
                let source = DataRef::Snapshot(fork_point.clone());
                (Some(guard), Some(fork_point), source)
            }
        };

        let pending = self.forks.provision(id, &source).await?;
        let (_, timeline) = self
            .forks
            .adopt(id, pending, |fork| {
                let mut timeline =
                    Timeline::new(id, name, description, parent_id, fork_point.clone());
                timeline.fork_ref = Some(fork.clone());
                store.insert(timeline.clone()).map(|_| timeline)
            })
            .await?;

        info!(
            target: "timelines::engine",
            timeline_id = %id,
            timeline_name = name,
            parent_id = ?parent_id,
            "Created timeline"
        );
        Ok(timeline)
    }

    /// All timelines, ordered by creation
    pub fn list_timelines(&self) -> Vec<Timeline> {
        self.shared.store.list()
    }

    /// Get a timeline
    pub fn get_timeline(&self, id: TimelineId) -> TimelineResult<Timeline> {
        self.shared.store.get(id)
    }

    /// Direct children of a timeline
    pub fn children(&self, id: TimelineId) -> TimelineResult<Vec<Timeline>> {
        self.shared.store.children(id)
    }

    /// Parent chain of a timeline, nearest first, ending at the root
    pub fn ancestors(&self, id: TimelineId) -> TimelineResult<Vec<Timeline>> {
        self.shared.store.ancestors(id)
    }

    /// Delete an active timeline
    pub async fn delete_timeline(&self, id: TimelineId) -> TimelineResult<()> {
        self.delete_timeline_with(id, DeleteOptions::default()).await
    }

    /// Delete a timeline
    ///
    /// Drops its fork and marks it Deleted; history is kept unless
    /// `purge_on_delete` is configured. Refused for a Deleted timeline, a
    /// Merged one without `force`, and one with active children.
    pub async fn delete_timeline_with(
        &self,
        id: TimelineId,
        options: DeleteOptions,
    ) -> TimelineResult<()> {
        let guard = self.shared.locks.lock(id).await;
        let store = &self.shared.store;
        let timeline = store.get(id)?;

        match timeline.status {
            TimelineStatus::Deleted => {
                return Err(TimelineError::invalid_state(id, "timeline is already deleted"))
            }
            TimelineStatus::Merged if !options.force => {
                return Err(TimelineError::invalid_state(
                    id,
                    "timeline is merged; deleting it requires force",
                ))
            }
            _ => {}
        }
        let open_children = store.active_children(id)?;
        if !open_children.is_empty() {
            return Err(TimelineError::invalid_state(
                id,
                format!(
                    "{} active child timeline(s) must be merged or deleted first",
                    open_children.len()
                ),
            ));
        }

        self.forks.release(id).await?;
        self.forks
            .write_metadata(|| {
                store.update(id, |t| {
                    t.status = TimelineStatus::Deleted;
                    Ok(())
                })
            })
            .await?;
        info!(target: "timelines::engine", timeline_id = %id, "Deleted timeline");

        if self.shared.config.purge_on_delete {
            if store.children(id)?.is_empty() {
                store.purge(id)?;
                drop(guard);
                self.shared.locks.remove(&id);
            } else {
                info!(
                    target: "timelines::engine",
                    timeline_id = %id,
                    "Not purging deleted timeline: it still has children"
                );
            }
        }
        Ok(())
    }

    /// Remove a Deleted or Merged timeline's metadata and history
    pub async fn purge_timeline(&self, id: TimelineId) -> TimelineResult<()> {
        let guard = self.shared.locks.lock(id).await;
        let timeline = self.shared.store.get(id)?;
        if timeline.is_active() {
            return Err(TimelineError::invalid_state(
                id,
                "an active timeline cannot be purged; delete it first",
            ));
        }
        self.forks.release(id).await?;
        self.shared.store.purge(id)?;
        drop(guard);
        self.shared.locks.remove(&id);
        Ok(())
    }

    // ========================================================================
    // Forks and data
    // ========================================================================

    /// Return the timeline's live fork, provisioning one if needed
    pub async fn checkout(&self, id: TimelineId) -> TimelineResult<ForkRef> {
        let _guard = self.shared.locks.lock(id).await;
        self.forks.checkout(id).await
    }

    /// Drop the timeline's live fork, if any
    pub async fn release(&self, id: TimelineId) -> TimelineResult<()> {
        let _guard = self.shared.locks.lock(id).await;
        self.forks.release(id).await
    }

    /// Execute a statement against a checked-out timeline
    pub async fn execute(&self, id: TimelineId, query: Query) -> TimelineResult<QueryResult> {
        let _guard = self.shared.locks.lock(id).await;
        let timeline = self.shared.store.get(id)?;
        let fork = self.forks.live_fork(&timeline)?;
        self.forks.execute(id, &fork, &query).await
    }

    /// Execute statements against a checked-out timeline, all or nothing
    ///
    /// Returns the total rows affected.
    pub async fn execute_transaction(
        &self,
        id: TimelineId,
        statements: &[Query],
    ) -> TimelineResult<u64> {
        let _guard = self.shared.locks.lock(id).await;
        let timeline = self.shared.store.get(id)?;
        let fork = self.forks.live_fork(&timeline)?;
        self.forks.execute_transaction(id, &fork, statements).await
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Snapshot the timeline's live fork
    pub async fn create_snapshot(&self, id: TimelineId, description: &str) -> TimelineResult<Snapshot> {
        let _guard = self.shared.locks.lock(id).await;
        self.snapshots().create_snapshot(id, description).await
    }

    /// Snapshots of a timeline, ascending by sequence
    pub fn get_history(&self, id: TimelineId) -> TimelineResult<Vec<Snapshot>> {
        self.history().get_history(id)
    }

    // ========================================================================
    // Merge and compare
    // ========================================================================

    /// Merge a timeline into its parent
    pub async fn merge_timeline(&self, source_id: TimelineId) -> TimelineResult<MergeResult> {
        let source = self.shared.store.get(source_id)?;
        let Some(parent_id) = source.parent_id else {
            return Err(TimelineError::invalid_state(
                source_id,
                "the root timeline has no parent to merge into",
            ));
        };
        let _guard = self.shared.locks.lock_many([source_id, parent_id]).await;
        MergeEngine::new(&self.shared.store, &self.forks)
            .merge_timeline(source_id)
            .await
    }

    /// Compare two timelines; "added" means present in `b` only
    pub async fn compare_timelines(&self, a: TimelineId, b: TimelineId) -> TimelineResult<Comparison> {
        self.shared.store.get(a)?;
        self.shared.store.get(b)?;
        let _guard = self.shared.locks.lock_many([a, b]).await;
        CompareEngine::new(&self.shared.store, &self.forks)
            .compare_timelines(a, b)
            .await
    }
}
