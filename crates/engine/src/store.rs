//! Timeline registry
//!
//! The store owns timeline metadata and snapshot history: the tree
//! (parent id per timeline plus a parent → children index), lifecycle
//! status, the recorded fork per timeline, and each timeline's ordered
//! snapshots. It never talks to the provider.
//!
//! ## Persistence
//!
//! An ephemeral store lives in memory only. A store opened on a data
//! directory rewrites `timelines.json` after every mutation (temp file +
//! rename). A mutation whose write fails is rolled back in memory, so the
//! registry and the file never disagree.

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use timelines_core::{
    Snapshot, SnapshotId, SnapshotRef, Timeline, TimelineError, TimelineId, TimelineResult,
};
use tracing::{debug, info};

/// Metadata file name placed in the data directory.
pub const METADATA_FILE_NAME: &str = "timelines.json";

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default)]
struct Registry {
    timelines: HashMap<TimelineId, Timeline>,
    /// Creation sequence
    order: Vec<TimelineId>,
    children: HashMap<TimelineId, Vec<TimelineId>>,
    /// Per timeline, ascending by sequence
    snapshots: HashMap<TimelineId, Vec<Snapshot>>,
}

impl Registry {
    fn get(&self, id: TimelineId) -> TimelineResult<&Timeline> {
        self.timelines
            .get(&id)
            .ok_or_else(|| TimelineError::timeline_not_found(id))
    }

    fn get_mut(&mut self, id: TimelineId) -> TimelineResult<&mut Timeline> {
        self.timelines
            .get_mut(&id)
            .ok_or_else(|| TimelineError::timeline_not_found(id))
    }

    fn root(&self) -> Option<&Timeline> {
        self.order
            .iter()
            .filter_map(|id| self.timelines.get(id))
            .find(|t| t.is_root())
    }

    fn from_persisted(persisted: PersistedRegistry) -> TimelineResult<Self> {
        if persisted.version != FORMAT_VERSION {
            return Err(TimelineError::Serialization(format!(
                "unsupported metadata format version {}",
                persisted.version
            )));
        }

        let mut registry = Registry::default();
        for timeline in persisted.timelines {
            if registry.timelines.contains_key(&timeline.id) {
                return Err(TimelineError::invariant(format!(
                    "timeline {} recorded twice",
                    timeline.id
                )));
            }
            if let Some(parent) = timeline.parent_id {
                registry.children.entry(parent).or_default().push(timeline.id);
            }
            registry.order.push(timeline.id);
            registry.timelines.insert(timeline.id, timeline);
        }

        for (parent, _) in registry.children.iter() {
            if !registry.timelines.contains_key(parent) {
                return Err(TimelineError::invariant(format!(
                    "dangling parent {} in metadata",
                    parent
                )));
            }
        }
        if registry.timelines.values().filter(|t| t.is_root()).count() > 1 {
            return Err(TimelineError::invariant("metadata holds more than one root"));
        }

        for snapshot in persisted.snapshots {
            if !registry.timelines.contains_key(&snapshot.timeline_id) {
                return Err(TimelineError::invariant(format!(
                    "snapshot {} belongs to unknown timeline {}",
                    snapshot.id, snapshot.timeline_id
                )));
            }
            registry
                .snapshots
                .entry(snapshot.timeline_id)
                .or_default()
                .push(snapshot);
        }
        for (id, history) in registry.snapshots.iter_mut() {
            history.sort_by_key(|s| s.sequence);
            let gap_free = history
                .iter()
                .enumerate()
                .all(|(i, s)| s.sequence == i as u64 + 1);
            if !gap_free {
                return Err(TimelineError::invariant(format!(
                    "snapshot sequence of timeline {} has gaps",
                    id
                )));
            }
        }

        // Every chain must end at the root
        for id in registry.order.clone() {
            ancestors_of(&registry, id)?;
        }

        Ok(registry)
    }

    fn to_persisted(&self) -> PersistedRegistry {
        let timelines: Vec<Timeline> = self
            .order
            .iter()
            .filter_map(|id| self.timelines.get(id).cloned())
            .collect();
        let snapshots = self
            .order
            .iter()
            .filter_map(|id| self.snapshots.get(id))
            .flatten()
            .cloned()
            .collect();
        PersistedRegistry {
            version: FORMAT_VERSION,
            timelines,
            snapshots,
        }
    }
}

/// Parent chain of `id`, nearest first, ending at the root
fn ancestors_of(registry: &Registry, id: TimelineId) -> TimelineResult<Vec<Timeline>> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    seen.insert(id);

    let mut current = registry.get(id)?;
    while let Some(parent_id) = current.parent_id {
        if !seen.insert(parent_id) {
            return Err(TimelineError::invariant(format!(
                "cycle in parent chain of timeline {} at {}",
                id, parent_id
            )));
        }
        let parent = registry.timelines.get(&parent_id).ok_or_else(|| {
            TimelineError::invariant(format!(
                "timeline {} has dangling parent {}",
                current.id, parent_id
            ))
        })?;
        chain.push(parent.clone());
        current = parent;
    }
    Ok(chain)
}

/// On-disk form of the registry
#[derive(Debug, Serialize, Deserialize)]
struct PersistedRegistry {
    version: u32,
    timelines: Vec<Timeline>,
    snapshots: Vec<Snapshot>,
}

/// Registry of timelines and their snapshot histories
///
/// Thread safety: reads take a shared lock, mutations an exclusive one.
/// Callers serialize operations on the same timeline through the engine's
/// lock table; the store itself only guarantees each mutation is atomic.
#[derive(Debug)]
pub struct TimelineStore {
    registry: RwLock<Registry>,
    path: Option<PathBuf>,
    failing_writes: AtomicUsize,
}

impl TimelineStore {
    /// Create an in-memory store
    pub fn ephemeral() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            path: None,
            failing_writes: AtomicUsize::new(0),
        }
    }

    /// Open (or create) the store persisted in `dir`
    pub fn open(dir: &Path) -> TimelineResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(METADATA_FILE_NAME);

        let registry = if path.exists() {
            let bytes = std::fs::read(&path)?;
            let persisted: PersistedRegistry = serde_json::from_slice(&bytes)
                .map_err(|e| TimelineError::Serialization(e.to_string()))?;
            Registry::from_persisted(persisted)?
        } else {
            Registry::default()
        };

        info!(
            target: "timelines::store",
            path = %path.display(),
            timelines = registry.timelines.len(),
            "Opened timeline store"
        );

        Ok(Self {
            registry: RwLock::new(registry),
            path: Some(path),
            failing_writes: AtomicUsize::new(0),
        })
    }

    /// Metadata file, if persisted
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Make the next `count` metadata writes fail with an I/O error
    ///
    /// For exercising the fork cleanup paths that follow a failed write.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn persist(&self, registry: &Registry) -> TimelineResult<()> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TimelineError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected metadata write failure",
            )));
        }

        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(&registry.to_persisted())
            .map_err(|e| TimelineError::Serialization(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Apply `f` to the registry and persist, or roll back on any error
    fn mutate<R>(&self, f: impl FnOnce(&mut Registry) -> TimelineResult<R>) -> TimelineResult<R> {
        let mut registry = self.registry.write();
        let backup = registry.clone();
        let result = f(&mut registry).and_then(|r| self.persist(&registry).map(|_| r));
        if result.is_err() {
            *registry = backup;
        }
        result
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Get a timeline
    pub fn get(&self, id: TimelineId) -> TimelineResult<Timeline> {
        self.registry.read().get(id).cloned()
    }

    /// Check if a timeline is known (not purged)
    pub fn contains(&self, id: TimelineId) -> bool {
        self.registry.read().timelines.contains_key(&id)
    }

    /// All timelines, ordered by creation time (ties by creation sequence)
    pub fn list(&self) -> Vec<Timeline> {
        let registry = self.registry.read();
        let mut all: Vec<Timeline> = registry
            .order
            .iter()
            .filter_map(|id| registry.timelines.get(id).cloned())
            .collect();
        // Stable: equal timestamps keep creation sequence
        all.sort_by_key(|t| t.created_at);
        all
    }

    /// Number of timelines
    pub fn len(&self) -> usize {
        self.registry.read().timelines.len()
    }

    /// Check if the store holds no timelines
    pub fn is_empty(&self) -> bool {
        self.registry.read().timelines.is_empty()
    }

    /// The root timeline, if one exists
    pub fn root(&self) -> Option<Timeline> {
        self.registry.read().root().cloned()
    }

    /// Direct children of a timeline, in creation order
    pub fn children(&self, id: TimelineId) -> TimelineResult<Vec<Timeline>> {
        let registry = self.registry.read();
        registry.get(id)?;
        Ok(registry
            .children
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|child| registry.timelines.get(child).cloned())
            .collect())
    }

    /// Active direct children of a timeline
    pub fn active_children(&self, id: TimelineId) -> TimelineResult<Vec<Timeline>> {
        Ok(self
            .children(id)?
            .into_iter()
            .filter(Timeline::is_active)
            .collect())
    }

    /// Parent chain of a timeline, nearest first, ending at the root
    ///
    /// A dangling or cyclic chain is an `InvariantViolation`.
    pub fn ancestors(&self, id: TimelineId) -> TimelineResult<Vec<Timeline>> {
        ancestors_of(&self.registry.read(), id)
    }

    /// Snapshot history, ascending by sequence
    pub fn history(&self, id: TimelineId) -> TimelineResult<Vec<Snapshot>> {
        let registry = self.registry.read();
        registry.get(id)?;
        Ok(registry.snapshots.get(&id).cloned().unwrap_or_default())
    }

    /// Highest-sequence snapshot of a timeline
    pub fn head_snapshot(&self, id: TimelineId) -> TimelineResult<Option<Snapshot>> {
        let registry = self.registry.read();
        let timeline = registry.get(id)?;
        let head = registry.snapshots.get(&id).and_then(|h| h.last()).cloned();
        if head.as_ref().map(|s| s.id) != timeline.head_snapshot_id {
            return Err(TimelineError::invariant(format!(
                "head snapshot of timeline {} does not match its history",
                id
            )));
        }
        Ok(head)
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Register a new timeline
    ///
    /// A child needs an active parent (`NotFound` otherwise); a second root
    /// is `InvalidState`.
    pub fn insert(&self, timeline: Timeline) -> TimelineResult<()> {
        let id = timeline.id;
        self.mutate(|registry| {
            if registry.timelines.contains_key(&id) {
                return Err(TimelineError::invariant(format!(
                    "timeline id {} allocated twice",
                    id
                )));
            }
            match timeline.parent_id {
                Some(parent) => {
                    let active = registry
                        .timelines
                        .get(&parent)
                        .map(Timeline::is_active)
                        .unwrap_or(false);
                    if !active {
                        return Err(TimelineError::timeline_not_found(parent));
                    }
                    registry.children.entry(parent).or_default().push(id);
                }
                None => {
                    if let Some(root) = registry.root() {
                        return Err(TimelineError::invalid_state(
                            id,
                            format!("root timeline {} already exists", root.id),
                        ));
                    }
                }
            }
            registry.order.push(id);
            registry.timelines.insert(id, timeline);
            Ok(())
        })?;
        debug!(target: "timelines::store", timeline_id = %id, "Inserted timeline");
        Ok(())
    }

    /// Modify a timeline record in place
    ///
    /// `id`, `parent_id` and `created_at` cannot change.
    pub fn update(
        &self,
        id: TimelineId,
        f: impl FnOnce(&mut Timeline) -> TimelineResult<()>,
    ) -> TimelineResult<Timeline> {
        self.mutate(|registry| {
            let timeline = registry.get_mut(id)?;
            let (parent, created) = (timeline.parent_id, timeline.created_at);
            f(timeline)?;
            if timeline.id != id || timeline.parent_id != parent || timeline.created_at != created
            {
                return Err(TimelineError::invariant(format!(
                    "immutable field of timeline {} modified",
                    id
                )));
            }
            timeline.updated_at = Utc::now();
            Ok(timeline.clone())
        })
    }

    /// Record a new snapshot as the timeline's head
    ///
    /// The sequence number is allocated here, one past the current head.
    pub fn append_snapshot(
        &self,
        id: TimelineId,
        description: impl Into<String>,
        provider_ref: SnapshotRef,
    ) -> TimelineResult<Snapshot> {
        let description = description.into();
        self.mutate(|registry| {
            registry.get(id)?;
            let history = registry.snapshots.entry(id).or_default();
            let snapshot = Snapshot {
                id: SnapshotId::new(),
                timeline_id: id,
                description,
                provider_ref,
                sequence: history.last().map(|s| s.sequence + 1).unwrap_or(1),
                created_at: Utc::now(),
            };
            history.push(snapshot.clone());

            let timeline = registry.get_mut(id)?;
            timeline.head_snapshot_id = Some(snapshot.id);
            timeline.updated_at = snapshot.created_at;
            Ok(snapshot)
        })
    }

    /// Remove a terminal timeline and its history
    ///
    /// Only Deleted or Merged timelines whose children are all purged can
    /// be purged.
    pub fn purge(&self, id: TimelineId) -> TimelineResult<Timeline> {
        let purged = self.mutate(|registry| {
            let timeline = registry.get(id)?;
            if timeline.is_active() {
                return Err(TimelineError::invalid_state(
                    id,
                    "an active timeline cannot be purged; delete it first",
                ));
            }
            if registry.children.get(&id).map_or(false, |c| !c.is_empty()) {
                return Err(TimelineError::invalid_state(
                    id,
                    "timeline still has children; purge them first",
                ));
            }

            let timeline = registry
                .timelines
                .remove(&id)
                .ok_or_else(|| TimelineError::timeline_not_found(id))?;
            registry.order.retain(|t| *t != id);
            registry.snapshots.remove(&id);
            registry.children.remove(&id);
            if let Some(parent) = timeline.parent_id {
                if let Some(siblings) = registry.children.get_mut(&parent) {
                    siblings.retain(|t| *t != id);
                }
            }
            Ok(timeline)
        })?;
        info!(target: "timelines::store", timeline_id = %id, "Purged timeline");
        Ok(purged)
    }
}
