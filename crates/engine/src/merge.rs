//! Three-way merge of a timeline into its parent
//!
//! The common base is the source's fork point (the parent snapshot taken
//! when the source was created). Both sides are diffed against it:
//!
//! ```text
//!   ours   = diff(base, parent live fork)
//!   theirs = diff(base, source live fork)
//! ```
//!
//! An object changed on both sides is a conflict, unless both sides made
//! the identical change ("converged"), which is neither a conflict nor
//! re-applied. Without conflicts, `theirs` is replayed onto the parent's
//! fork in one transaction.
//!
//! ## Statement order
//!
//! 1. Schema creates and alters (tables before their columns and indexes)
//! 2. Row upserts
//! 3. Row deletes
//! 4. Schema drops (columns, indexes and views before tables)

use crate::fork::ForkManager;
use crate::snapshot::SnapshotEngine;
use crate::store::TimelineStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use timelines_core::{
    DataRef, Query, RawDiff, RowChange, SchemaChange, SchemaKind, Snapshot, TimelineError,
    TimelineId, TimelineResult, TimelineStatus,
};
use tracing::{debug, info, warn};

// ============================================================================
// Result Types
// ============================================================================

/// Which side of a merge made a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeSide {
    /// The merge target (changes since the fork point)
    Parent,
    /// The timeline being merged
    Source,
}

/// An object both sides changed differently
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MergeConflict {
    /// Same schema object name
    Schema {
        /// Object name
        name: String,
        /// Change on the parent
        ours: SchemaChange,
        /// Change on the source
        theirs: SchemaChange,
    },
    /// Same table and primary key
    Row {
        /// Table
        table: String,
        /// Primary key
        key: String,
        /// Change on the parent
        ours: RowChange,
        /// Change on the source
        theirs: RowChange,
    },
    /// One side dropped a table the other side changed rows or columns of
    TableDropped {
        /// Table
        table: String,
        /// Side that dropped it
        dropped_by: MergeSide,
        /// Row and column changes on the other side
        changes_on_other_side: usize,
    },
}

impl MergeConflict {
    /// Table or schema object the conflict is about
    pub fn object(&self) -> &str {
        match self {
            MergeConflict::Schema { name, .. } => name,
            MergeConflict::Row { table, .. } => table,
            MergeConflict::TableDropped { table, .. } => table,
        }
    }
}

/// Outcome of a merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MergeResult {
    /// Changes were applied and the source is now Merged
    Merged {
        /// Parent snapshot taken after applying
        merged_snapshot: Snapshot,
        /// Schema and row changes applied to the parent
        changes_applied: usize,
        /// Changes both sides had already made identically
        converged: usize,
    },
    /// Nothing was changed
    Conflicted {
        /// Every conflicting object
        conflicts: Vec<MergeConflict>,
    },
}

impl MergeResult {
    /// Check if the merge went through
    pub fn is_merged(&self) -> bool {
        matches!(self, MergeResult::Merged { .. })
    }

    /// Conflicts, empty for a successful merge
    pub fn conflicts(&self) -> &[MergeConflict] {
        match self {
            MergeResult::Merged { .. } => &[],
            MergeResult::Conflicted { conflicts } => conflicts,
        }
    }
}

// ============================================================================
// Planning
// ============================================================================

/// What a merge would do, computed from the two diffs alone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    /// Statements replaying the source's changes, in apply order
    pub statements: Vec<Query>,
    /// Conflicts; when non-empty nothing may be applied
    pub conflicts: Vec<MergeConflict>,
    /// Changes the plan applies
    pub changes: usize,
    /// Changes skipped because both sides made them identically
    pub converged: usize,
}

impl MergePlan {
    /// Check if the plan can be applied
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Tables that no longer exist after the diff, including tables replaced
/// by an object of another kind under the same name
fn dropped_tables(diff: &RawDiff) -> BTreeSet<&str> {
    diff.schema
        .iter()
        .filter(|c| c.before.as_ref().map_or(false, |b| b.is_table()))
        .filter(|c| !c.after.as_ref().map_or(false, |a| a.is_table()))
        .map(|c| c.name.as_str())
        .collect()
}

fn replaced_tables(diff: &RawDiff) -> BTreeSet<&str> {
    diff.schema
        .iter()
        .filter(|c| match (&c.before, &c.after) {
            (Some(before), Some(after)) => before.is_table() && !after.is_table(),
            _ => false,
        })
        .map(|c| c.name.as_str())
        .collect()
}

/// Row and column changes per table
fn touched_tables(diff: &RawDiff) -> HashMap<&str, usize> {
    let mut touched: HashMap<&str, usize> = HashMap::new();
    for change in &diff.rows {
        *touched.entry(change.table.as_str()).or_default() += 1;
    }
    for change in &diff.schema {
        if change.object_kind() == SchemaKind::Column {
            if let Some((table, _)) = change.name.split_once('.') {
                *touched.entry(table).or_default() += 1;
            }
        }
    }
    touched
}

/// Decide how to merge `theirs` (source changes) given `ours` (parent
/// changes) since the common base
pub fn plan_merge(ours: &RawDiff, theirs: &RawDiff) -> MergePlan {
    let mut plan = MergePlan::default();

    // Dropped tables first: they subsume row and column conflicts inside
    let ours_dropped = dropped_tables(ours);
    let theirs_dropped = dropped_tables(theirs);
    let theirs_replaced = replaced_tables(theirs);
    let ours_touched = touched_tables(ours);
    let theirs_touched = touched_tables(theirs);
    let mut dropped_conflicts = BTreeSet::new();
    for (dropped, touched, side) in [
        (&ours_dropped, &theirs_touched, MergeSide::Parent),
        (&theirs_dropped, &ours_touched, MergeSide::Source),
    ] {
        for table in dropped.iter() {
            let both_dropped = ours_dropped.contains(table) && theirs_dropped.contains(table);
            match touched.get(table) {
                Some(&n) if !both_dropped => {
                    dropped_conflicts.insert(*table);
                    plan.conflicts.push(MergeConflict::TableDropped {
                        table: table.to_string(),
                        dropped_by: side,
                        changes_on_other_side: n,
                    });
                }
                _ => {}
            }
        }
    }
    let in_dropped_conflict = |table: &str| dropped_conflicts.contains(table);

    // Schema
    let ours_schema: HashMap<&str, &SchemaChange> =
        ours.schema.iter().map(|c| (c.name.as_str(), c)).collect();
    let mut creates = Vec::new();
    let mut drops = Vec::new();
    for change in &theirs.schema {
        let owner = change.name.split_once('.').map_or(change.name.as_str(), |(t, _)| t);
        if in_dropped_conflict(owner) {
            continue;
        }
        if let Some(mine) = ours_schema.get(change.name.as_str()) {
            if mine.after == change.after {
                plan.converged += 1;
            } else {
                plan.conflicts.push(MergeConflict::Schema {
                    name: change.name.clone(),
                    ours: (*mine).clone(),
                    theirs: change.clone(),
                });
            }
            continue;
        }
        // The drop that replaces a table already takes its columns
        if change.object_kind() == SchemaKind::Column && theirs_replaced.contains(owner) {
            continue;
        }

        plan.changes += 1;
        match (&change.before, &change.after) {
            (_, None) => drops.push(change),
            (Some(before), Some(after)) if before.kind != after.kind => {
                creates.push((Some(Query::DropObject {
                    name: change.name.clone(),
                }), Query::CreateObject(after.clone()), after.is_table()));
            }
            (Some(_), Some(after)) => {
                creates.push((None, Query::AlterObject(after.clone()), after.is_table()))
            }
            (None, Some(after)) => {
                creates.push((None, Query::CreateObject(after.clone()), after.is_table()))
            }
        }
    }

    // Rows
    let ours_rows: HashMap<(&str, &str), &RowChange> = ours
        .rows
        .iter()
        .map(|c| ((c.table.as_str(), c.key.as_str()), c))
        .collect();
    let mut upserts = Vec::new();
    let mut deletes = Vec::new();
    for change in &theirs.rows {
        if in_dropped_conflict(&change.table) {
            continue;
        }
        if let Some(mine) = ours_rows.get(&(change.table.as_str(), change.key.as_str())) {
            if mine.after == change.after {
                plan.converged += 1;
            } else {
                plan.conflicts.push(MergeConflict::Row {
                    table: change.table.clone(),
                    key: change.key.clone(),
                    ours: (*mine).clone(),
                    theirs: change.clone(),
                });
            }
            continue;
        }
        // Rows of a table the source dropped go with the table
        if theirs_dropped.contains(change.table.as_str()) {
            continue;
        }

        plan.changes += 1;
        match &change.after {
            Some(row) => upserts.push(Query::Upsert {
                table: change.table.clone(),
                row: row.clone(),
            }),
            None => deletes.push(Query::Delete {
                table: change.table.clone(),
                key: change.key.clone(),
            }),
        }
    }

    if !plan.conflicts.is_empty() {
        return plan;
    }

    // Tables before the objects that depend on them
    creates.sort_by_key(|(_, _, is_table)| !*is_table);
    for (drop, create, _) in creates {
        plan.statements.extend(drop);
        plan.statements.push(create);
    }
    plan.statements.extend(upserts);
    plan.statements.extend(deletes);
    drops.sort_by_key(|c| c.object_kind() == SchemaKind::Table);
    plan.statements.extend(drops.into_iter().map(|c| Query::DropObject {
        name: c.name.clone(),
    }));

    plan
}

// ============================================================================
// MergeEngine
// ============================================================================

/// Merges a timeline into its immediate parent
#[derive(Debug, Clone, Copy)]
pub struct MergeEngine<'a> {
    store: &'a TimelineStore,
    forks: &'a ForkManager,
}

impl<'a> MergeEngine<'a> {
    /// Create a merge engine over a store and fork manager
    pub fn new(store: &'a TimelineStore, forks: &'a ForkManager) -> Self {
        Self { store, forks }
    }

    /// Merge `source_id` into its parent
    ///
    /// The caller holds the locks of both the source and its parent.
    pub async fn merge_timeline(&self, source_id: TimelineId) -> TimelineResult<MergeResult> {
        let source = self.store.get(source_id)?;
        let Some(parent_id) = source.parent_id else {
            return Err(TimelineError::invalid_state(
                source_id,
                "the root timeline has no parent to merge into",
            ));
        };
        if !source.is_active() {
            return Err(TimelineError::invalid_state(
                source_id,
                format!("cannot merge a {} timeline", source.status),
            ));
        }
        let parent = self.store.get(parent_id).map_err(|_| {
            TimelineError::invariant(format!(
                "timeline {} has dangling parent {}",
                source_id, parent_id
            ))
        })?;
        if !parent.is_active() {
            return Err(TimelineError::invalid_state(
                source_id,
                format!("parent {} is {}", parent_id, parent.status),
            ));
        }
        let open_children = self.store.active_children(source_id)?;
        if !open_children.is_empty() {
            return Err(TimelineError::invalid_state(
                source_id,
                format!(
                    "{} active child timeline(s) must be merged or deleted first",
                    open_children.len()
                ),
            ));
        }
        let base = source.fork_point.clone().map(DataRef::Snapshot).ok_or_else(|| {
            TimelineError::invariant(format!("timeline {} has no fork point", source_id))
        })?;

        let source_fork = self.forks.checkout(source_id).await?;
        let parent_fork = self.forks.checkout(parent_id).await?;

        let ours = self
            .forks
            .diff(parent_id, &base, &DataRef::Fork(parent_fork.clone()))
            .await?;
        let theirs = self
            .forks
            .diff(source_id, &base, &DataRef::Fork(source_fork))
            .await?;

        let plan = plan_merge(&ours, &theirs);
        debug!(
            target: "timelines::merge",
            source_id = %source_id,
            parent_id = %parent_id,
            ours = ours.len(),
            theirs = theirs.len(),
            statements = plan.statements.len(),
            conflicts = plan.conflicts.len(),
            "Planned merge"
        );
        if !plan.is_clean() {
            info!(
                target: "timelines::merge",
                source_id = %source_id,
                parent_id = %parent_id,
                conflicts = plan.conflicts.len(),
                "Merge conflicted"
            );
            return Ok(MergeResult::Conflicted {
                conflicts: plan.conflicts,
            });
        }

        if !plan.statements.is_empty() {
            self.forks
                .execute_transaction(parent_id, &parent_fork, &plan.statements)
                .await?;
        }

        let merged_snapshot = SnapshotEngine::new(self.store, self.forks)
            .create_snapshot(parent_id, &format!("merge of {} ({})", source.name, source_id))
            .await?;

        let store = self.store;
        self.forks
            .write_metadata(|| {
                store.update(source_id, |t| {
                    t.status = TimelineStatus::Merged;
                    Ok(())
                })
            })
            .await?;
        // The merge has taken effect; a fork that fails to drop stays
        // recorded on the merged timeline for delete --force or purge
        if let Err(e) = self.forks.release(source_id).await {
            warn!(
                target: "timelines::merge",
                source_id = %source_id,
                error = %e,
                "Failed to release merged timeline's fork"
            );
        }

        info!(
            target: "timelines::merge",
            source_id = %source_id,
            parent_id = %parent_id,
            changes = plan.changes,
            converged = plan.converged,
            sequence = merged_snapshot.sequence,
            "Merged timeline"
        );
        Ok(MergeResult::Merged {
            merged_snapshot,
            changes_applied: plan.changes,
            converged: plan.converged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timelines_core::{Row, SchemaObject};

    fn row_change(table: &str, key: &str, before: Option<i64>, after: Option<i64>) -> RowChange {
        RowChange {
            table: table.into(),
            key: key.into(),
            before: before.map(|v| Row::new(key).with("v", v)),
            after: after.map(|v| Row::new(key).with("v", v)),
        }
    }

    fn schema_change(before: Option<SchemaObject>, after: Option<SchemaObject>) -> SchemaChange {
        let name = after
            .as_ref()
            .or(before.as_ref())
            .map(|o| o.name.clone())
            .unwrap();
        SchemaChange { name, before, after }
    }

    #[test]
    fn test_disjoint_changes_apply_cleanly() {
        let ours = RawDiff {
            schema: vec![],
            rows: vec![row_change("t", "1", Some(1), Some(10))],
        };
        let theirs = RawDiff {
            schema: vec![],
            rows: vec![row_change("t", "2", Some(2), Some(20))],
        };
        let plan = plan_merge(&ours, &theirs);
        assert!(plan.is_clean());
        assert_eq!(plan.changes, 1);
        assert_eq!(
            plan.statements,
            vec![Query::Upsert {
                table: "t".into(),
                row: Row::new("2").with("v", 20),
            }]
        );
    }

    #[test]
    fn test_same_row_changed_differently_conflicts() {
        let ours = RawDiff {
            schema: vec![],
            rows: vec![row_change("t", "1", Some(1), Some(10))],
        };
        let theirs = RawDiff {
            schema: vec![],
            rows: vec![row_change("t", "1", Some(1), Some(99))],
        };
        let plan = plan_merge(&ours, &theirs);
        assert!(plan.statements.is_empty());
        assert_eq!(plan.conflicts.len(), 1);
        assert!(matches!(
            &plan.conflicts[0],
            MergeConflict::Row { table, key, .. } if table == "t" && key == "1"
        ));
    }

    #[test]
    fn test_delete_versus_update_conflicts() {
        let ours = RawDiff {
            schema: vec![],
            rows: vec![row_change("t", "1", Some(1), None)],
        };
        let theirs = RawDiff {
            schema: vec![],
            rows: vec![row_change("t", "1", Some(1), Some(2))],
        };
        assert_eq!(plan_merge(&ours, &theirs).conflicts.len(), 1);
    }

    #[test]
    fn test_identical_changes_converge() {
        let change = row_change("t", "1", Some(1), Some(5));
        let ours = RawDiff {
            schema: vec![],
            rows: vec![change.clone()],
        };
        let theirs = RawDiff {
            schema: vec![],
            rows: vec![change],
        };
        let plan = plan_merge(&ours, &theirs);
        assert!(plan.is_clean());
        assert_eq!(plan.converged, 1);
        assert_eq!(plan.changes, 0);
        assert!(plan.statements.is_empty());
    }

    #[test]
    fn test_schema_conflict_on_same_name() {
        let ours = RawDiff {
            schema: vec![schema_change(None, Some(SchemaObject::index("idx", "t(a)")))],
            rows: vec![],
        };
        let theirs = RawDiff {
            schema: vec![schema_change(None, Some(SchemaObject::index("idx", "t(b)")))],
            rows: vec![],
        };
        let plan = plan_merge(&ours, &theirs);
        assert!(matches!(
            &plan.conflicts[..],
            [MergeConflict::Schema { name, .. }] if name == "idx"
        ));
    }

    #[test]
    fn test_table_dropped_while_other_side_wrote_rows() {
        let table = SchemaObject::table("t", "");
        let ours = RawDiff {
            schema: vec![],
            rows: vec![row_change("t", "9", None, Some(9))],
        };
        let theirs = RawDiff {
            schema: vec![schema_change(Some(table), None)],
            rows: vec![row_change("t", "1", Some(1), None)],
        };
        let plan = plan_merge(&ours, &theirs);
        assert_eq!(
            plan.conflicts,
            vec![MergeConflict::TableDropped {
                table: "t".into(),
                dropped_by: MergeSide::Source,
                changes_on_other_side: 1,
            }]
        );
    }

    #[test]
    fn test_table_dropped_on_parent_blocks_source_rows() {
        let ours = RawDiff {
            schema: vec![schema_change(Some(SchemaObject::table("t", "")), None)],
            rows: vec![],
        };
        let theirs = RawDiff {
            schema: vec![],
            rows: vec![row_change("t", "1", Some(1), Some(2))],
        };
        let plan = plan_merge(&ours, &theirs);
        assert!(matches!(
            &plan.conflicts[..],
            [MergeConflict::TableDropped { dropped_by: MergeSide::Parent, .. }]
        ));
    }

    #[test]
    fn test_statement_order() {
        let theirs = RawDiff {
            schema: vec![
                schema_change(None, Some(SchemaObject::column("users", "email", "TEXT"))),
                schema_change(Some(SchemaObject::view("v_old", "SELECT 1")), None),
                schema_change(None, Some(SchemaObject::table("users", "id"))),
                schema_change(Some(SchemaObject::table("legacy", "")), None),
                schema_change(Some(SchemaObject::column("legacy", "x", "INT")), None),
            ],
            rows: vec![
                row_change("legacy", "1", Some(1), None),
                row_change("users", "1", None, Some(1)),
                row_change("orders", "7", Some(7), None),
            ],
        };
        let plan = plan_merge(&RawDiff::default(), &theirs);
        let kinds: Vec<(&str, String)> = plan
            .statements
            .iter()
            .map(|q| {
                let target = match q {
                    Query::CreateObject(o) | Query::AlterObject(o) => o.name.clone(),
                    Query::DropObject { name } => name.clone(),
                    Query::Upsert { table, row } => format!("{}/{}", table, row.key),
                    Query::Delete { table, key } => format!("{}/{}", table, key),
                    other => other.kind().to_string(),
                };
                (q.kind(), target)
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("create", "users".to_string()),
                ("create", "users.email".to_string()),
                ("upsert", "users/1".to_string()),
                ("delete", "orders/7".to_string()),
                ("drop", "v_old".to_string()),
                ("drop", "legacy.x".to_string()),
                ("drop", "legacy".to_string()),
            ]
        );
    }

    #[test]
    fn test_table_replaced_by_view_takes_rows_and_columns() {
        let theirs = RawDiff {
            schema: vec![
                schema_change(
                    Some(SchemaObject::table("report", "id")),
                    Some(SchemaObject::view("report", "SELECT 1")),
                ),
                schema_change(Some(SchemaObject::column("report", "x", "INT")), None),
            ],
            rows: vec![row_change("report", "1", Some(1), None)],
        };
        let plan = plan_merge(&RawDiff::default(), &theirs);
        assert!(plan.is_clean());
        assert_eq!(
            plan.statements,
            vec![
                Query::DropObject {
                    name: "report".into()
                },
                Query::CreateObject(SchemaObject::view("report", "SELECT 1")),
            ]
        );
    }

    #[test]
    fn test_table_replaced_on_parent_blocks_source_rows() {
        let ours = RawDiff {
            schema: vec![schema_change(
                Some(SchemaObject::table("report", "id")),
                Some(SchemaObject::view("report", "SELECT 1")),
            )],
            rows: vec![],
        };
        let theirs = RawDiff {
            schema: vec![],
            rows: vec![row_change("report", "2", None, Some(2))],
        };
        let plan = plan_merge(&ours, &theirs);
        assert!(matches!(
            plan.conflicts.as_slice(),
            [MergeConflict::TableDropped {
                dropped_by: MergeSide::Parent,
                changes_on_other_side: 1,
                ..
            }]
        ));
    }

    #[test]
    fn test_kind_change_becomes_drop_and_create() {
        let theirs = RawDiff {
            schema: vec![schema_change(
                Some(SchemaObject::view("report", "SELECT 1")),
                Some(SchemaObject::table("report", "id")),
            )],
            rows: vec![],
        };
        let plan = plan_merge(&RawDiff::default(), &theirs);
        assert_eq!(
            plan.statements,
            vec![
                Query::DropObject {
                    name: "report".into()
                },
                Query::CreateObject(SchemaObject::table("report", "id")),
            ]
        );
    }
}
