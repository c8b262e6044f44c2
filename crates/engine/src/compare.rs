//! Structured comparison of two timelines
//!
//! Read-only: each side is read from what it already has (live fork, head
//! snapshot, fork point, or the fresh base) and no fork is ever created.
//! Polarity is always `a` → `b`: "added" means present in `b` only.

use crate::fork::ForkManager;
use crate::store::TimelineStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use timelines_core::{
    ChangeKind, RawDiff, Row, RowChange, SchemaChange, SchemaKind, SchemaObject, TimelineId,
    TimelineResult,
};
use tracing::debug;

// ============================================================================
// Result Types
// ============================================================================

/// A schema object that differs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDelta {
    /// Object name
    pub name: String,
    /// Object kind
    pub object_kind: SchemaKind,
    /// Added, removed or modified
    pub change: ChangeKind,
    /// Object on side `a`
    pub before: Option<SchemaObject>,
    /// Object on side `b`
    pub after: Option<SchemaObject>,
}

/// A row that differs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowDelta {
    /// Primary key
    pub key: String,
    /// Added, removed or modified
    pub change: ChangeKind,
    /// Row on side `a`
    pub before: Option<Row>,
    /// Row on side `b`
    pub after: Option<Row>,
}

/// Row differences within one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableComparison {
    /// Table name
    pub table: String,
    /// Differing rows, ordered by key
    pub rows: Vec<RowDelta>,
}

impl TableComparison {
    fn count(&self, kind: ChangeKind) -> usize {
        self.rows.iter().filter(|r| r.change == kind).count()
    }

    /// Rows only in `b`
    pub fn added(&self) -> usize {
        self.count(ChangeKind::Added)
    }

    /// Rows only in `a`
    pub fn removed(&self) -> usize {
        self.count(ChangeKind::Removed)
    }

    /// Rows in both with different values
    pub fn modified(&self) -> usize {
        self.count(ChangeKind::Modified)
    }
}

/// Totals over a comparison
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonSummary {
    /// Schema objects only in `b`
    pub schema_added: usize,
    /// Schema objects only in `a`
    pub schema_removed: usize,
    /// Schema objects in both with different definitions
    pub schema_modified: usize,
    /// Rows only in `b`
    pub rows_added: usize,
    /// Rows only in `a`
    pub rows_removed: usize,
    /// Rows in both with different values
    pub rows_modified: usize,
    /// Tables that exist only in `a`
    pub tables_only_in_a: Vec<String>,
    /// Tables that exist only in `b`
    pub tables_only_in_b: Vec<String>,
}

/// Schema and data differences between timeline `a` and timeline `b`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// Left side
    pub a: TimelineId,
    /// Right side
    pub b: TimelineId,
    /// Differing schema objects, ordered by name
    pub schema: Vec<SchemaDelta>,
    /// Tables with differing rows, ordered by name
    pub tables: Vec<TableComparison>,
    /// Totals
    pub summary: ComparisonSummary,
}

impl Comparison {
    /// A comparison reporting no differences
    pub fn identical(a: TimelineId, b: TimelineId) -> Self {
        Self::from_raw(a, b, &RawDiff::default())
    }

    /// Build from a provider diff `a` → `b`
    pub fn from_raw(a: TimelineId, b: TimelineId, raw: &RawDiff) -> Self {
        let mut schema: Vec<SchemaDelta> = raw
            .schema
            .iter()
            .map(|c| SchemaDelta {
                name: c.name.clone(),
                object_kind: c.object_kind(),
                change: c.kind(),
                before: c.before.clone(),
                after: c.after.clone(),
            })
            .collect();
        schema.sort_by(|x, y| x.name.cmp(&y.name));

        let mut by_table: BTreeMap<&str, Vec<RowDelta>> = BTreeMap::new();
        for c in &raw.rows {
            by_table.entry(c.table.as_str()).or_default().push(RowDelta {
                key: c.key.clone(),
                change: c.kind(),
                before: c.before.clone(),
                after: c.after.clone(),
            });
        }
        let tables: Vec<TableComparison> = by_table
            .into_iter()
            .map(|(table, mut rows)| {
                rows.sort_by(|x, y| x.key.cmp(&y.key));
                TableComparison {
                    table: table.to_string(),
                    rows,
                }
            })
            .collect();

        let mut summary = ComparisonSummary::default();
        for delta in &schema {
            match delta.change {
                ChangeKind::Added => summary.schema_added += 1,
                ChangeKind::Removed => summary.schema_removed += 1,
                ChangeKind::Modified => summary.schema_modified += 1,
            }
            if delta.object_kind == SchemaKind::Table {
                match delta.change {
                    ChangeKind::Added => summary.tables_only_in_b.push(delta.name.clone()),
                    ChangeKind::Removed => summary.tables_only_in_a.push(delta.name.clone()),
                    ChangeKind::Modified => {}
                }
            }
        }
        for table in &tables {
            summary.rows_added += table.added();
            summary.rows_removed += table.removed();
            summary.rows_modified += table.modified();
        }

        Self {
            a,
            b,
            schema,
            tables,
            summary,
        }
    }

    /// The same comparison seen from `b`
    pub fn inverted(&self) -> Self {
        let raw = RawDiff {
            schema: self
                .schema
                .iter()
                .map(|d| SchemaChange {
                    name: d.name.clone(),
                    before: d.after.clone(),
                    after: d.before.clone(),
                })
                .collect(),
            rows: self
                .tables
                .iter()
                .flat_map(|t| {
                    t.rows.iter().map(move |r| RowChange {
                        table: t.table.clone(),
                        key: r.key.clone(),
                        before: r.after.clone(),
                        after: r.before.clone(),
                    })
                })
                .collect(),
        };
        Self::from_raw(self.b, self.a, &raw)
    }

    /// Check if the two sides are identical
    pub fn is_identical(&self) -> bool {
        self.schema.is_empty() && self.tables.is_empty()
    }

    /// Rows of one table that differ
    pub fn table(&self, name: &str) -> Option<&TableComparison> {
        self.tables.iter().find(|t| t.table == name)
    }
}

// ============================================================================
// CompareEngine
// ============================================================================

/// Compares two timelines
#[derive(Debug, Clone, Copy)]
pub struct CompareEngine<'a> {
    store: &'a TimelineStore,
    forks: &'a ForkManager,
}

impl<'a> CompareEngine<'a> {
    /// Create a compare engine over a store and fork manager
    pub fn new(store: &'a TimelineStore, forks: &'a ForkManager) -> Self {
        Self { store, forks }
    }

    /// Compare timeline `a` with timeline `b`
    ///
    /// The caller holds the locks of both timelines.
    pub async fn compare_timelines(&self, a: TimelineId, b: TimelineId) -> TimelineResult<Comparison> {
        let left = self.store.get(a)?;
        let right = self.store.get(b)?;
        if a == b {
            return Ok(Comparison::identical(a, b));
        }

        let from = self.forks.read_ref(&left).await?;
        let to = self.forks.read_ref(&right).await?;
        if from == to {
            debug!(target: "timelines::compare", a = %a, b = %b, source = %from, "Both sides read the same data");
            return Ok(Comparison::identical(a, b));
        }

        let raw = self.forks.diff(a, &from, &to).await?;
        let comparison = Comparison::from_raw(a, b, &raw);
        debug!(
            target: "timelines::compare",
            a = %a,
            b = %b,
            from = %from,
            to = %to,
            schema = comparison.schema.len(),
            tables = comparison.tables.len(),
            "Compared timelines"
        );
        Ok(comparison)
    }
}
